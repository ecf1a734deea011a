//! Error types for the system access layer.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised inside the access layer.
///
/// These never cross the facade: `SystemAccess` turns every failure into an
/// unavailable value.
#[derive(Error, Debug)]
pub enum Error {
    /// The privileged shell process could not be spawned.
    #[error("Failed to spawn privileged shell '{program}': {source}")]
    ShellSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The shell was configured with an empty command line.
    #[error("Privileged shell command is empty")]
    EmptyShellCommand,

    /// Reading from or writing to the shell failed.
    #[error("Shell I/O error: {0}")]
    ShellIo(#[from] std::io::Error),

    /// The shell closed its output before the sentinel was seen.
    #[error("Shell closed its output stream")]
    ShellClosed,

    /// The echo round-trip after spawning did not return the expected text.
    #[error("Shell validation failed: expected '{expected}', got '{actual}'")]
    ShellValidation { expected: String, actual: String },

    /// A command did not complete in time.
    #[error("Shell command timed out after {0} ms")]
    Timeout(u64),
}
