//! Capability detection.

use std::sync::Arc;

use tracing::{debug, info};

use crate::channel::SecondaryChannel;
use crate::shell::{ShellOutput, ShellSession};
use crate::tier::{CapabilityTier, RootProvider};

/// Detects which privilege tier is available.
pub struct CapabilityProvider {
    shell: Arc<ShellSession>,
    secondary: Option<Arc<dyn SecondaryChannel>>,
}

impl CapabilityProvider {
    /// Creates a provider over the given shell and optional secondary channel.
    pub fn new(shell: Arc<ShellSession>, secondary: Option<Arc<dyn SecondaryChannel>>) -> Self {
        Self { shell, secondary }
    }

    /// Probes the tiers in order: root shell, then secondary channel.
    ///
    /// Every failed check only means "not available" for that check.
    pub async fn probe(&self) -> CapabilityTier {
        if self.shell.open().await {
            let provider = self.classify_root().await;
            info!("Root shell available (provider: {})", provider);
            return CapabilityTier::RootShell { provider };
        }

        if let Some(secondary) = &self.secondary {
            if secondary.is_authorized().await {
                info!("Secondary channel available ({})", secondary.provider());
                return CapabilityTier::SecondaryChannel {
                    provider: secondary.provider().to_string(),
                };
            }
        }

        info!("No privileged access available");
        CapabilityTier::None
    }

    /// Returns true when the probed tier still grants privileged access.
    ///
    /// The secondary channel is asked again on every call.
    pub async fn is_enhanced(&self, probed: &CapabilityTier) -> bool {
        if probed.is_root() {
            return true;
        }
        self.secondary_authorized().await
    }

    /// Returns true when a secondary channel exists and is authorized now.
    pub async fn secondary_authorized(&self) -> bool {
        match &self.secondary {
            Some(secondary) => secondary.is_authorized().await,
            None => false,
        }
    }

    async fn classify_root(&self) -> RootProvider {
        for (provider, command) in RootProvider::PROBES {
            match self.shell.exec_status(command).await {
                Some(reply) if is_version_reply(&reply) => {
                    debug!("Root provider {} answered: {}", provider, reply.output);
                    return provider;
                }
                Some(reply) => {
                    debug!("Root provider {} not present: {}", provider, reply.output)
                }
                None => debug!("Root provider probe '{}' failed", command),
            }
        }
        RootProvider::Unknown
    }
}

/// A version query counts when it exited cleanly with a plausible answer.
fn is_version_reply(reply: &ShellOutput) -> bool {
    let text = reply.output.to_lowercase();
    reply.success()
        && !text.is_empty()
        && !text.contains("not found")
        && !text.contains("inaccessible")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct FakeChannel {
        authorized: AtomicBool,
    }

    #[async_trait]
    impl SecondaryChannel for FakeChannel {
        fn provider(&self) -> &str {
            "fake"
        }

        async fn is_authorized(&self) -> bool {
            self.authorized.load(Ordering::SeqCst)
        }

        async fn run(&self, _command: &str) -> Option<String> {
            None
        }
    }

    fn missing_shell() -> Arc<ShellSession> {
        Arc::new(ShellSession::new(
            vec!["/nonexistent/ebox-su".to_string()],
            Duration::from_secs(1),
        ))
    }

    #[test]
    fn test_is_version_reply() {
        let ok = ShellOutput {
            output: "27.0:MAGISK".to_string(),
            status: 0,
        };
        let missing = ShellOutput {
            output: "sh: magisk: not found".to_string(),
            status: 127,
        };
        let garbled = ShellOutput {
            output: "magisk: inaccessible or not found".to_string(),
            status: 0,
        };
        let empty = ShellOutput {
            output: String::new(),
            status: 0,
        };
        assert!(is_version_reply(&ok));
        assert!(!is_version_reply(&missing));
        assert!(!is_version_reply(&garbled));
        assert!(!is_version_reply(&empty));
    }

    #[tokio::test]
    async fn test_plain_shell_is_unknown_root() {
        let shell = Arc::new(ShellSession::new(
            vec!["sh".to_string()],
            Duration::from_secs(5),
        ));
        let provider = CapabilityProvider::new(shell.clone(), None);
        let tier = provider.probe().await;
        // No root product is installed on a build host.
        assert_eq!(
            tier,
            CapabilityTier::RootShell {
                provider: RootProvider::Unknown
            }
        );
        assert!(provider.is_enhanced(&tier).await);
        shell.close().await;
    }

    #[tokio::test]
    async fn test_secondary_when_shell_fails() {
        let channel = Arc::new(FakeChannel {
            authorized: AtomicBool::new(true),
        });
        let provider = CapabilityProvider::new(missing_shell(), Some(channel.clone()));
        let tier = provider.probe().await;
        assert_eq!(
            tier,
            CapabilityTier::SecondaryChannel {
                provider: "fake".to_string()
            }
        );
        assert!(provider.is_enhanced(&tier).await);

        channel.authorized.store(false, Ordering::SeqCst);
        assert!(!provider.is_enhanced(&tier).await);
    }

    #[tokio::test]
    async fn test_nothing_available() {
        let provider = CapabilityProvider::new(missing_shell(), None);
        let tier = provider.probe().await;
        assert_eq!(tier, CapabilityTier::None);
        assert!(!provider.is_enhanced(&tier).await);
    }
}
