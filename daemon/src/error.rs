/// Domain error types for the dash subsystem.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Conditions that abort an activation attempt outright.
///
/// Recoverable outcomes (lock conflicts, length mismatches, missing variants)
/// are reported through [`crate::activation::ActivationResult`] instead.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("failed to stop dependent process {name}")]
    StopProcess {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to acquire the dash directory lock")]
    Lock(#[source] io::Error),
}

impl ActivationError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures talking to the remote release feed.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("release {repo}/{project} has no asset named {asset}")]
    AssetNotFound {
        repo: String,
        project: String,
        asset: String,
    },

    #[error("download of {asset} stopped at {written} of {expected} bytes")]
    Incomplete {
        asset: String,
        expected: u64,
        written: u64,
    },

    #[error("I/O error while downloading: {0}")]
    Io(#[from] io::Error),
}

/// Failures from the Windows service control manager.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service {0} is not registered")]
    NotRegistered(String),

    #[error("service {name} could not be opened: {message}")]
    Open { name: String, message: String },

    #[error("service {name}: {operation} failed: {message}")]
    Control {
        name: String,
        operation: &'static str,
        message: String,
    },

    #[error("service control is not supported on this platform")]
    Unsupported,
}

/// Windows error codes for sharing and lock violations.
#[cfg(windows)]
const LOCK_CONFLICT_CODES: &[i32] = &[32, 33];
/// EBUSY and ETXTBSY.
#[cfg(not(windows))]
const LOCK_CONFLICT_CODES: &[i32] = &[16, 26];

/// True when `err` means another process holds the file open.
///
/// Decided by OS error code so it is independent of the message locale.
pub fn is_lock_conflict(err: &io::Error) -> bool {
    err.raw_os_error()
        .is_some_and(|code| LOCK_CONFLICT_CODES.contains(&code))
}
