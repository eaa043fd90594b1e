use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "lockdown";
pub const APP_NAME: &str = "lockdown";

pub const CONFIG_FILE_NAME: &str = "template.tbl";
pub const LOG_FILE_NAME: &str = "file_protection.log";
pub const JOURNAL_FILE_NAME: &str = "journal.jsonl";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn journal_path() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("LOCKDOWN_JOURNAL") {
        return Ok(PathBuf::from(override_path));
    }
    Ok(data_dir()?.join(JOURNAL_FILE_NAME))
}
