use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "sealmsg";
pub const APP_NAME: &str = "sealmsg";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("SEALMSG_DATA_DIR") {
        if !override_path.is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn state_dir(data: &Path) -> PathBuf {
    data.join("state")
}

pub fn log_dir(data: &Path) -> PathBuf {
    data.join("logs")
}

pub fn identity_path(data: &Path) -> PathBuf {
    data.join("identity.json")
}
