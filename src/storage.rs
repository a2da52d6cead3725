//! Persistent volume lifecycle.
//!
//! The platform reports attachment through `storage-attached` and
//! `storage-detaching` events; [`StorageManager::ensure_ready`] turns an
//! attached volume into an initialized data directory for Grafana. The
//! resulting [`StorageState`] is persisted by the controller, so an operator
//! restart resumes with the volume already known.

use std::path::Path;

use grafana_operator_core::models::StorageState;

use crate::config::StorageConfig;
use crate::error::StorageError;

/// Written once into a freshly initialized volume.
pub const MARKER_FILE: &str = ".grafana-operator";

/// Subdirectories Grafana expects under its data path.
const DATA_DIRS: &[&str] = &["plugins", "png", "csv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Attachment {
    size_bytes: Option<u64>,
}

#[derive(Debug)]
pub struct StorageManager {
    name: String,
    min_size_bytes: u64,
    attachment: Option<Attachment>,
    state: Option<StorageState>,
}

impl StorageManager {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            name: config.name.clone(),
            min_size_bytes: config.min_size_bytes(),
            attachment: None,
            state: None,
        }
    }

    /// Resume from a persisted state. A persisted state implies the volume
    /// was attached when it was recorded.
    pub fn restore(&mut self, state: StorageState) {
        self.attachment = Some(Attachment {
            size_bytes: state.size_bytes,
        });
        self.state = Some(state);
    }

    pub fn attach(&mut self, size_bytes: Option<u64>) {
        let attachment = Attachment { size_bytes };
        if self.attachment != Some(attachment) {
            self.state = None;
        }
        self.attachment = Some(attachment);
    }

    /// Forget the volume. Returns the state it had, if initialized.
    pub fn detach(&mut self) -> Option<StorageState> {
        self.attachment = None;
        self.state.take()
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn state(&self) -> Option<&StorageState> {
        self.state.as_ref()
    }

    /// Make the attached volume usable at `mount_path`.
    ///
    /// Idempotent: once initialized at the same path, returns the current
    /// state without touching the filesystem.
    pub fn ensure_ready(&mut self, mount_path: &Path) -> Result<StorageState, StorageError> {
        let Some(attachment) = self.attachment else {
            return Err(StorageError::NotAttached {
                name: self.name.clone(),
            });
        };

        if let Some(size) = attachment.size_bytes {
            if size < self.min_size_bytes {
                return Err(StorageError::TooSmall {
                    name: self.name.clone(),
                    size_mb: size / (1024 * 1024),
                    min_mb: self.min_size_bytes / (1024 * 1024),
                });
            }
        }

        if let Some(state) = &self.state {
            if state.initialized && state.mount_path == mount_path {
                return Ok(state.clone());
            }
        }

        initialize(mount_path)?;

        let state = StorageState {
            mount_path: mount_path.to_path_buf(),
            initialized: true,
            size_bytes: attachment.size_bytes,
        };
        self.state = Some(state.clone());
        Ok(state)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn initialize(mount_path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(mount_path).map_err(io_error(mount_path))?;
    for dir in DATA_DIRS {
        let p = mount_path.join(dir);
        std::fs::create_dir_all(&p).map_err(io_error(&p))?;
    }

    // An existing marker means a previous unit lifetime initialized this
    // volume; its contents are kept.
    let marker = mount_path.join(MARKER_FILE);
    if !marker.exists() {
        std::fs::write(&marker, b"initialized\n").map_err(io_error(&marker))?;
    }
    Ok(())
}
