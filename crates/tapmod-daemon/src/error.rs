//! Error types for the daemon

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors. Every variant ends the daemon after an orderly teardown.
///
/// Conditions the daemon recovers from (a read finding nothing, a kernel
/// buffer overflow) never appear here.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The source device could not be opened or queried
    #[error("Input device {path} is unavailable: {source}")]
    UnavailableDevice {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Exclusive access was refused
    #[error(
        "Failed to grab {path} for exclusive access. \
         Is another application grabbing it, or are permissions missing? ({source})"
    )]
    GrabDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The uinput virtual device could not be created
    #[error("Failed to create virtual device (is /dev/uinput writable?): {0}")]
    SinkCreationFailed(#[source] io::Error),

    /// Reading from the source device failed
    #[error("Failed to read events from input device: {0}")]
    ReadFailed(#[source] io::Error),

    /// Writing to the virtual device failed; nothing can be retried safely
    #[error("Failed to write to virtual device: {0}")]
    SinkWriteFailed(#[source] io::Error),

    #[error(transparent)]
    InvalidConfig(#[from] tapmod_config::ConfigError),
}
