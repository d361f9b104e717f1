use rehome::clock::to_rfc3339;
use rehome::migration::{MigrationRecord, MigrationStatus, SnapshotSummary};
use tabled::Tabled;

pub fn format_snapshots_table(snapshots: Vec<SnapshotSummary>) -> String {
    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Namespace")]
        namespace: String,
        #[tabled(rename = "Created")]
        created: String,
        #[tabled(rename = "Version")]
        version: u32,
        #[tabled(rename = "Keys")]
        keys: usize,
        #[tabled(rename = "Bytes")]
        bytes: u64,
        #[tabled(rename = "Verified")]
        verified: String,
    }

    let rows: Vec<Row> = snapshots
        .into_iter()
        .map(|snapshot| Row {
            id: snapshot.id,
            namespace: display_namespace(&snapshot.namespace),
            created: snapshot.created_at,
            version: snapshot.target_version,
            keys: snapshot.key_count,
            bytes: snapshot.byte_len,
            verified: if snapshot.verified { "yes" } else { "NO" }.to_string(),
        })
        .collect();

    if rows.is_empty() {
        return "(no snapshots)".to_string();
    }
    tabled::Table::new(rows).to_string()
}

pub fn format_history_table(records: Vec<MigrationRecord>) -> String {
    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "Started")]
        started: String,
        #[tabled(rename = "Versions")]
        versions: String,
        #[tabled(rename = "Holder")]
        holder: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Copied")]
        copied: usize,
        #[tabled(rename = "Failed")]
        failed: usize,
        #[tabled(rename = "Snapshot")]
        snapshot: String,
    }

    let rows: Vec<Row> = records
        .into_iter()
        .rev()
        .map(|record| Row {
            started: to_rfc3339(record.started_at_ms),
            versions: format!("{} -> {}", record.version_from, record.version_to),
            holder: record.holder_id,
            status: format!("{:?}", record.status),
            copied: record.copied_keys,
            failed: record.failed_keys.len(),
            snapshot: record.snapshot_id.unwrap_or_default(),
        })
        .collect();

    if rows.is_empty() {
        return "(no runs recorded)".to_string();
    }
    tabled::Table::new(rows).to_string()
}

pub fn format_progress(status: &MigrationStatus) -> String {
    let mut line = format!(
        "{} {}/{} key(s) ({:.0}%), {} verified, {} byte(s)",
        status.phase,
        status.processed_keys,
        status.total_keys,
        status.percent(),
        status.verified_keys,
        status.bytes_copied
    );
    if !status.failed_keys.is_empty() {
        line.push_str(&format!(", {} unreadable", status.failed_keys.len()));
    }
    if let Some(holder) = &status.holder_id {
        line.push_str(&format!(" [{holder}]"));
    }
    line
}

pub fn display_namespace(namespace: &str) -> String {
    if namespace.is_empty() {
        "(all)".to_string()
    } else {
        namespace.to_string()
    }
}
