//! Privilege tiers.

use std::str::FromStr;

/// Privilege-management product behind a root shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootProvider {
    Magisk,
    KernelSu,
    APatch,
    /// Root shell opened but no known product answered.
    #[default]
    Unknown,
}

impl RootProvider {
    /// Version-query commands tried in priority order during detection.
    pub const PROBES: [(RootProvider, &'static str); 3] = [
        (RootProvider::Magisk, "magisk -v"),
        (RootProvider::KernelSu, "ksud -V"),
        (RootProvider::APatch, "apd -V"),
    ];
}

impl FromStr for RootProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "magisk" => Ok(RootProvider::Magisk),
            "kernelsu" | "ksu" => Ok(RootProvider::KernelSu),
            "apatch" => Ok(RootProvider::APatch),
            "unknown" | "root" => Ok(RootProvider::Unknown),
            _ => Err(format!("Unknown root provider: {}", s)),
        }
    }
}

impl std::fmt::Display for RootProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootProvider::Magisk => write!(f, "Magisk"),
            RootProvider::KernelSu => write!(f, "KernelSU"),
            RootProvider::APatch => write!(f, "APatch"),
            RootProvider::Unknown => write!(f, "Root"),
        }
    }
}

/// Privilege level available for reading protected data.
///
/// Immutable once probed. Re-probing is an explicit operation on the facade.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CapabilityTier {
    /// Unprivileged reads only.
    #[default]
    None,
    /// A secondary IPC channel answered and was authorized at probe time.
    SecondaryChannel { provider: String },
    /// A persistent privileged shell is open.
    RootShell { provider: RootProvider },
}

impl CapabilityTier {
    /// Short tier name for display.
    pub fn name(&self) -> &'static str {
        match self {
            CapabilityTier::None => "Normal",
            CapabilityTier::SecondaryChannel { .. } => "Secondary",
            CapabilityTier::RootShell { .. } => "Root",
        }
    }

    /// Tier name with the detected provider, e.g. "Root (Magisk)".
    pub fn label(&self) -> String {
        match self {
            CapabilityTier::None => self.name().to_string(),
            CapabilityTier::SecondaryChannel { provider } => {
                format!("{} ({})", self.name(), provider)
            }
            CapabilityTier::RootShell { provider } => format!("{} ({})", self.name(), provider),
        }
    }

    /// Returns true for the root shell tier.
    pub fn is_root(&self) -> bool {
        matches!(self, CapabilityTier::RootShell { .. })
    }
}

impl std::fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}
