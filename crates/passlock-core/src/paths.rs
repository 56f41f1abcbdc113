//! Well-known file locations, per the platform's conventions.

use directories::ProjectDirs;
use std::path::PathBuf;

pub const STORE_FILE_NAME: &str = "store.plock";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "passlock", "Passlock")
}

/// Application data directory, created on first use.
pub fn data_dir() -> Option<PathBuf> {
    let dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

/// Default location of the credential store file.
pub fn store_file_path() -> Option<PathBuf> {
    Some(data_dir()?.join(STORE_FILE_NAME))
}
