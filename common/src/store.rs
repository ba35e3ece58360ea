//! Small JSON record store used for every piece of persisted state.
//!
//! A record is a single JSON document at a fixed path. Loading never fails:
//! an absent or malformed file yields `None` (and the caller falls back to its
//! default). Saving goes through a sibling temp file that is synced and then
//! renamed over the target, so a reader only ever sees the previous complete
//! record or the new complete record.

use crate::error::{CommonError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct JsonStore<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonStore<T> {
    fn clone(&self) -> Self {
        Self::new(self.path.clone())
    }
}

impl<T> JsonStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Delete the record. Removing a record that is already gone succeeds.
    pub fn remove(&self) -> Result<()> {
        remove_if_present(&self.path)?;
        let tmp = temp_path(&self.path)?;
        remove_if_present(&tmp)?;
        Ok(())
    }
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn load(&self) -> Option<T> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No record at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    "Ignoring malformed record {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    pub fn load_or_default(&self) -> T
    where
        T: Default,
    {
        self.load().unwrap_or_default()
    }

    pub fn save(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = temp_path(&self.path)?;
        let content = serde_json::to_vec_pretty(value)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        sync_parent_dir(&self.path);
        Ok(())
    }
}

fn temp_path(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| CommonError::InvalidPath(path.to_path_buf()))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".tmp");
    Ok(path.with_file_name(tmp_name))
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
