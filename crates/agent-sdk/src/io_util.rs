use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::{fs, thread, time::Duration};

/// The executable file extension for the current platform.
#[cfg(target_os = "windows")]
pub const EXE_EXTENSION: &str = ".exe";
#[cfg(not(target_os = "windows"))]
pub const EXE_EXTENSION: &str = "";

/// File-system helpers shared across the agent crates.
pub struct IOUtil;

impl IOUtil {
    /// Load a JSON file into a value of type `T`.
    pub fn load_object<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read '{}'", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse '{}'", path.display()))?;
        Ok(value)
    }

    /// Save a value as pretty-printed JSON, creating parent directories as needed.
    pub fn save_object<T: Serialize>(value: &T, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(value)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write '{}'", path.display()))?;
        Ok(())
    }

    /// Delete a file if it exists.
    pub fn delete_file(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to delete '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Recursively delete a directory with retry logic.
    ///
    /// Transient locks can make the first removal attempt fail; retry up to
    /// 3 times with a growing delay before giving up.
    pub fn delete_directory(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        // A symlink is removed as a link, never followed.
        if path.symlink_metadata()?.file_type().is_symlink() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove symlink '{}'", path.display()))?;
            return Ok(());
        }

        let max_retries = 3;
        let mut last_err = None;

        for attempt in 0..max_retries {
            match fs::remove_dir_all(path) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < max_retries - 1 {
                        thread::sleep(Duration::from_millis(100 * (attempt as u64 + 1)));
                    }
                }
            }
        }

        Err(last_err.unwrap()).with_context(|| {
            format!(
                "Failed to delete directory '{}' after {} retries",
                path.display(),
                max_retries
            )
        })
    }

    /// Create a directory (and parents) if it does not already exist.
    pub fn create_directory(path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory '{}'", path.display()))
    }
}
