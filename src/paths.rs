use anyhow::{Result, anyhow};
use directories::BaseDirs;
use std::path::{Path, PathBuf};

/// On-disk layout of a rehome data directory.
pub struct RehomePaths {
    pub base_dir: PathBuf,
    /// Legacy backend: a single JSON object file.
    pub legacy_path: PathBuf,
    /// New backend: one file per key.
    pub store_dir: PathBuf,
    pub config_path: PathBuf,
}

impl RehomePaths {
    pub fn new(data_dir: Option<&Path>, legacy: Option<&Path>) -> Result<Self> {
        let base_dir = match data_dir {
            Some(path) => absolutize(path)?,
            None => {
                let base_dirs =
                    BaseDirs::new().ok_or_else(|| anyhow!("Unable to resolve home directory"))?;
                base_dirs.home_dir().join(".rehome")
            }
        };
        let legacy_path = match legacy {
            Some(path) => absolutize(path)?,
            None => base_dir.join("legacy.json"),
        };
        Ok(Self {
            legacy_path,
            store_dir: base_dir.join("store"),
            config_path: base_dir.join("config.json"),
            base_dir,
        })
    }

    pub fn ensure_base_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(&self.store_dir)?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let perms = Permissions::from_mode(0o700);
            std::fs::set_permissions(&self.base_dir, perms.clone())?;
            std::fs::set_permissions(&self.store_dir, perms)?;
        }
        Ok(())
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
