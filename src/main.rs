mod cli;
mod formatting;
mod logger;
mod sanitize;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use rehome::clock::{SystemClock, to_rfc3339};
use rehome::config::MigrationConfig;
use rehome::migration::{MigrationCoordinator, MigrationOutcome, MigrationReport};
use rehome::paths::RehomePaths;
use rehome::storage::{DirStore, LegacyJsonStore};

use crate::cli::{Cli, Commands, ConfigCommands, SnapshotCommands};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logger::init(cli.debug);
    let paths = RehomePaths::new(cli.data_dir.as_deref(), cli.legacy.as_deref())?;

    match cli.command {
        Commands::Migrate(args) => cmd_migrate(&paths, args),
        Commands::Retry => cmd_retry(&paths),
        Commands::Status(args) => cmd_status(&paths, args),
        Commands::Snapshots(args) => match args.command {
            SnapshotCommands::List => cmd_snapshots_list(&paths),
            SnapshotCommands::Restore { id, yes } => cmd_snapshots_restore(&paths, &id, yes),
            SnapshotCommands::Prune { id, yes } => cmd_snapshots_prune(&paths, &id, yes),
        },
        Commands::Resolve => cmd_resolve(&paths),
        Commands::Config(args) => match args.command {
            ConfigCommands::Show => cmd_config_show(&paths),
            ConfigCommands::Init { force } => cmd_config_init(&paths, force),
        },
    }
}

fn open_coordinator(paths: &RehomePaths) -> Result<MigrationCoordinator> {
    paths.ensure_base_dir()?;
    let config = MigrationConfig::load(paths)?;
    let source = Arc::new(LegacyJsonStore::new(paths.legacy_path.clone()));
    let destination = Arc::new(
        DirStore::open(paths.store_dir.clone())
            .with_context(|| format!("Cannot open store at {}", paths.store_dir.display()))?,
    );
    let coordinator =
        MigrationCoordinator::new(source, destination, Arc::new(SystemClock::new()), config)?;
    Ok(coordinator)
}

fn cmd_migrate(paths: &RehomePaths, args: cli::MigrateArgs) -> Result<()> {
    let coordinator = open_coordinator(paths)?;
    let outcome = coordinator.start_migration()?;
    report_outcome(&coordinator, outcome, args.wait)
}

fn cmd_retry(paths: &RehomePaths) -> Result<()> {
    let coordinator = open_coordinator(paths)?;
    let outcome = coordinator.retry_migration()?;
    report_outcome(&coordinator, outcome, None)
}

fn report_outcome(
    coordinator: &MigrationCoordinator,
    outcome: MigrationOutcome,
    wait: Option<u64>,
) -> Result<()> {
    match outcome {
        MigrationOutcome::AlreadyCurrent { version } => {
            println!("✅ Already at version {version}; nothing to do");
        }
        MigrationOutcome::FreshInstall { version } => {
            println!("✅ No legacy data found; store initialised at version {version}");
        }
        MigrationOutcome::Completed(report) => {
            println!("✅ Migration complete");
            print_report(&report);
        }
        MigrationOutcome::CompletedWithWarnings(report) => {
            println!("⚠️  Migration complete with warnings");
            print_report(&report);
            println!("  Unreadable keys left in the legacy store:");
            for failure in &report.failed_keys {
                println!("    - {}: {}", failure.key, failure.reason);
            }
        }
        MigrationOutcome::Deferred { holder } => {
            println!("⏳ Migration is running in another process ({holder})");
            let Some(secs) = wait else {
                return Ok(());
            };
            let progress = Arc::new(|status: &rehome::MigrationStatus| {
                log::debug!("{}", formatting::format_progress(status));
            });
            coordinator.subscribe(progress);
            let status = coordinator.wait_for_completion(Duration::from_secs(secs))?;
            println!("  {}", formatting::format_progress(&status));
            if !status.phase.is_terminal() && status.deferred_to.is_some() {
                return Err(anyhow!("Timed out waiting for {holder}"));
            }
            if let Some(error) = status.last_error {
                println!("  Last error: {error}");
            }
        }
    }
    Ok(())
}

fn print_report(report: &MigrationReport) {
    println!(
        "  Version: {} -> {}",
        report.version_from, report.version_to
    );
    println!(
        "  Copied: {} key(s), {} byte(s) in {}ms",
        report.copied_keys, report.bytes_copied, report.duration_ms
    );
}

fn cmd_status(paths: &RehomePaths, args: cli::StatusArgs) -> Result<()> {
    let coordinator = open_coordinator(paths)?;
    let version = coordinator.stored_version()?;
    let lock = coordinator.current_lock()?;
    let attempts = coordinator.attempts()?;
    let progress = coordinator.published_progress();
    let history = coordinator.history()?;
    let target = coordinator.config().target_version;

    if args.json {
        let value = serde_json::json!({
            "migration_id": coordinator.config().migration_id,
            "stored_version": version,
            "target_version": target,
            "lock": lock,
            "attempts": attempts,
            "progress": progress,
            "history": history,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match version {
        Some(v) if v >= target => println!("✅ Store at version {v} (target {target})"),
        Some(v) => println!("⚠️  Store at version {v}, target {target}"),
        None => println!("⚠️  No version marker yet (target {target})"),
    }
    match lock {
        Some(record) => println!(
            "  Lease: held by {} until {}",
            record.holder_id,
            to_rfc3339(record.expires_at_ms())
        ),
        None => println!("  Lease: free"),
    }
    if let Some(progress) = progress {
        println!("  Progress: {}", formatting::format_progress(&progress));
        if let Some(error) = progress.last_error {
            println!("  Last error: {error}");
        }
    }
    if attempts.total_attempts > 0 {
        println!(
            "  Attempts: {} total, {} consecutive failure(s)",
            attempts.total_attempts, attempts.consecutive_failures
        );
    }
    if let Some(reason) = attempts.stuck {
        println!("❌ Stuck: {reason}");
        println!("   Fix the cause, then run `rehome resolve`.");
    }
    println!("{}", formatting::format_history_table(history));
    Ok(())
}

fn cmd_snapshots_list(paths: &RehomePaths) -> Result<()> {
    let coordinator = open_coordinator(paths)?;
    let summaries = coordinator
        .snapshots()
        .list_snapshots(None)?
        .iter()
        .map(|snapshot| snapshot.summary())
        .collect();
    println!("{}", formatting::format_snapshots_table(summaries));
    Ok(())
}

fn cmd_snapshots_restore(paths: &RehomePaths, id: &str, yes: bool) -> Result<()> {
    let coordinator = open_coordinator(paths)?;
    let namespace = &coordinator.config().namespace;
    let existing = coordinator
        .snapshots()
        .load_snapshot(namespace, id)?
        .ok_or_else(|| anyhow!("Snapshot {id} not found"))?;
    if !yes
        && !confirm(&format!(
            "Replace the contents of {} with snapshot {id} ({} key(s))? Type YES to continue: ",
            formatting::display_namespace(namespace),
            existing.key_count()
        ))?
    {
        println!("Aborted");
        return Ok(());
    }
    let snapshot = coordinator.restore_snapshot(id)?;
    println!(
        "✅ Restored snapshot {} ({} key(s))",
        snapshot.id,
        snapshot.key_count()
    );
    Ok(())
}

fn cmd_snapshots_prune(paths: &RehomePaths, id: &str, yes: bool) -> Result<()> {
    let coordinator = open_coordinator(paths)?;
    if !yes && !confirm(&format!("Delete snapshot {id}? Type YES to continue: "))? {
        println!("Aborted");
        return Ok(());
    }
    coordinator.prune_snapshot(id)?;
    println!("✅ Pruned snapshot {id}");
    Ok(())
}

fn cmd_resolve(paths: &RehomePaths) -> Result<()> {
    let coordinator = open_coordinator(paths)?;
    if coordinator.resolve_stuck()? {
        println!("✅ Cleared failure history; the next start will migrate again");
    } else {
        println!("Nothing to resolve");
    }
    Ok(())
}

fn cmd_config_show(paths: &RehomePaths) -> Result<()> {
    let config = MigrationConfig::load(paths)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_config_init(paths: &RehomePaths, force: bool) -> Result<()> {
    if paths.config_path.exists() && !force {
        return Err(anyhow!(
            "Config already exists at {} (use --force to overwrite)",
            paths.config_path.display()
        ));
    }
    paths.ensure_base_dir()?;
    MigrationConfig::default().save(paths)?;
    println!("✅ Wrote {}", paths.config_path.display());
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    use std::io::Write;
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim() == "YES")
}
