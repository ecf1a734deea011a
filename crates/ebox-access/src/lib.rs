//! Extension Box system access library.
//!
//! Provides tiered access to protected system files: unprivileged reads,
//! a persistent privileged shell session, and a secondary privileged channel,
//! behind a caching facade with graceful degradation.

pub mod cache;
pub mod channel;
pub mod error;
pub mod facade;
pub mod provider;
pub mod readers;
pub mod shell;
pub mod tier;

pub use cache::AccessCache;
pub use channel::{CommandChannel, FileSource, FsSource, SecondaryChannel};
pub use error::{Error, Result};
pub use facade::{AccessConfig, SystemAccess};
pub use provider::CapabilityProvider;
pub use shell::{ShellOutput, ShellSession};
pub use tier::{CapabilityTier, RootProvider};
