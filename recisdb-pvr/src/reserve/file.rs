//! Reservation list persistence.
//!
//! The whole list is written as one flat JSON array on every mutation and
//! read once at startup.

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use pvr_types::Reservation;
use thiserror::Error;

/// Reservation file errors.
#[derive(Debug, Error)]
pub enum ReserveFileError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file exists but is not a valid reservation list.
    #[error("Corrupt reservation file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize reservations: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Handle to the reservation file on disk.
#[derive(Debug, Clone)]
pub struct ReserveFile {
    path: PathBuf,
}

impl ReserveFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the list. A missing file yields an empty list; an unparsable
    /// one is an error the caller must treat as fatal.
    pub fn load(&self) -> Result<Vec<Reservation>, ReserveFileError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("ReserveFile: {:?} not found, starting empty", self.path);
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ReserveFileError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        let reserves: Vec<Reservation> =
            serde_json::from_str(&contents).map_err(|source| ReserveFileError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        info!(
            "ReserveFile: loaded {} reservation(s) from {:?}",
            reserves.len(),
            self.path
        );
        Ok(reserves)
    }

    /// Replace the file contents with `reserves`.
    ///
    /// Written to a temporary sibling first and renamed into place so a
    /// crash never leaves a truncated file behind.
    pub async fn save(&self, reserves: &[Reservation]) -> Result<(), ReserveFileError> {
        let json = serde_json::to_vec_pretty(reserves)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| self.io_error(source))?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|source| self.io_error(source))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.io_error(source))?;

        debug!("ReserveFile: wrote {} reservation(s)", reserves.len());
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> ReserveFileError {
        ReserveFileError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
