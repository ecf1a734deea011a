//! System access facade.
//!
//! Unifies capability probing, per-path caching and the fallback chain
//! (direct read, root shell, secondary channel) behind `read_path` and
//! `run_command`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{AccessCache, DEFAULT_TTL};
use crate::channel::{
    non_empty, run_unprivileged, shell_quote, FileSource, FsSource, SecondaryChannel,
};
use crate::provider::CapabilityProvider;
use crate::shell::ShellSession;
use crate::tier::CapabilityTier;

/// Access layer settings.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Command line of the privileged shell (e.g. `["su"]`).
    pub shell: Vec<String>,
    /// How long a read result stays cached.
    pub cache_ttl: Duration,
    /// Per-command timeout for shell and channel commands.
    pub command_timeout: Duration,
    /// Upper bound for closing the shell on shutdown.
    pub close_timeout: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            shell: vec!["su".to_string()],
            cache_ttl: DEFAULT_TTL,
            command_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Tiered system access shared by all modules.
pub struct SystemAccess {
    files: Arc<dyn FileSource>,
    shell: Arc<ShellSession>,
    secondary: Option<Arc<dyn SecondaryChannel>>,
    provider: CapabilityProvider,
    probed: RwLock<CapabilityTier>,
    cache: AccessCache,
    command_timeout: Duration,
    close_timeout: Duration,
}

impl SystemAccess {
    /// Creates an unprobed facade reading files from the local filesystem.
    pub fn new(config: &AccessConfig, secondary: Option<Arc<dyn SecondaryChannel>>) -> Self {
        Self::with_file_source(config, Arc::new(FsSource), secondary)
    }

    /// Creates an unprobed facade with a custom unprivileged file source.
    pub fn with_file_source(
        config: &AccessConfig,
        files: Arc<dyn FileSource>,
        secondary: Option<Arc<dyn SecondaryChannel>>,
    ) -> Self {
        let shell = Arc::new(ShellSession::new(
            config.shell.clone(),
            config.command_timeout,
        ));
        let provider = CapabilityProvider::new(shell.clone(), secondary.clone());
        Self {
            files,
            shell,
            secondary,
            provider,
            probed: RwLock::new(CapabilityTier::None),
            cache: AccessCache::new(config.cache_ttl),
            command_timeout: config.command_timeout,
            close_timeout: config.close_timeout,
        }
    }

    /// Creates a facade and probes the available tier.
    pub async fn connect(
        config: &AccessConfig,
        secondary: Option<Arc<dyn SecondaryChannel>>,
    ) -> Self {
        let access = Self::new(config, secondary);
        access.probe().await;
        access
    }

    /// Probes capabilities and records the result.
    pub async fn probe(&self) -> CapabilityTier {
        let tier = self.provider.probe().await;
        *self.probed.write() = tier.clone();
        tier
    }

    /// Closes the shell, clears the cache and probes again.
    pub async fn reprobe(&self) -> CapabilityTier {
        info!("Re-probing system access");
        self.shell.close().await;
        self.cache.clear();
        self.probe().await
    }

    /// Current tier. The secondary channel is re-checked live.
    pub async fn tier(&self) -> CapabilityTier {
        let probed = self.probed.read().clone();
        if probed.is_root() {
            return probed;
        }
        match &self.secondary {
            Some(secondary) if secondary.is_authorized().await => {
                CapabilityTier::SecondaryChannel {
                    provider: secondary.provider().to_string(),
                }
            }
            _ => CapabilityTier::None,
        }
    }

    /// Tier label for display, e.g. "Root (Magisk)".
    pub async fn tier_label(&self) -> String {
        self.tier().await.label()
    }

    /// Returns true when privileged reads are possible right now.
    pub async fn is_enhanced(&self) -> bool {
        let probed = self.probed.read().clone();
        self.provider.is_enhanced(&probed).await
    }

    /// Returns the persistent shell session.
    pub fn shell(&self) -> &Arc<ShellSession> {
        &self.shell
    }

    /// Returns the read cache.
    pub fn cache(&self) -> &AccessCache {
        &self.cache
    }

    /// Reads a path through the cache and the fallback chain.
    ///
    /// Failures are cached too, so an unreadable path is not hammered within
    /// the TTL window.
    pub async fn read_path(&self, path: &str) -> Option<String> {
        if let Some(hit) = self.cache.get(path) {
            return hit;
        }
        let value = self.resolve(path).await;
        self.cache.put(path, value.clone());
        value
    }

    async fn resolve(&self, path: &str) -> Option<String> {
        if let Some(value) = self.files.read(Path::new(path)).await {
            return Some(value);
        }

        let command = format!("cat {}", shell_quote(path));
        let root = self.probed.read().is_root();
        if root {
            if let Some(reply) = self.shell.exec_status(&command).await {
                if reply.success() {
                    if let Some(value) = non_empty(reply.output) {
                        return Some(value);
                    }
                }
            }
        }

        if let Some(secondary) = &self.secondary {
            if secondary.is_authorized().await {
                if let Some(value) = secondary.run(&command).await {
                    return Some(value);
                }
            }
        }

        debug!("Path unavailable: {}", path);
        None
    }

    /// Runs a command with the highest privilege available.
    ///
    /// Falls back from the root shell to the secondary channel to an
    /// unprivileged `sh -c`. Results are not cached.
    pub async fn run_command(&self, command: &str) -> Option<String> {
        let root = self.probed.read().is_root();
        if root {
            if let Some(reply) = self.shell.exec_status(command).await {
                if reply.success() {
                    return non_empty(reply.output);
                }
            }
        }

        if let Some(secondary) = &self.secondary {
            if secondary.is_authorized().await {
                if let Some(out) = secondary.run(command).await {
                    return Some(out);
                }
            }
        }

        run_unprivileged(command, self.command_timeout).await
    }

    /// Closes the privileged shell, waiting at most the configured bound.
    pub async fn shutdown(&self) {
        if tokio::time::timeout(self.close_timeout, self.shell.close())
            .await
            .is_err()
        {
            warn!(
                "Privileged shell did not close within {:?}",
                self.close_timeout
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// File source backed by a map, counting every lookup.
    #[derive(Default)]
    pub(crate) struct SpySource {
        pub files: parking_lot::Mutex<HashMap<String, String>>,
        pub calls: AtomicUsize,
    }

    impl SpySource {
        pub fn with(files: &[(&str, &str)]) -> Arc<Self> {
            let spy = Self::default();
            for (path, value) in files {
                spy.files.lock().insert(path.to_string(), value.to_string());
            }
            Arc::new(spy)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FileSource for SpySource {
        async fn read(&self, path: &Path) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.files
                .lock()
                .get(path.to_string_lossy().as_ref())
                .cloned()
        }
    }

    struct FakeChannel {
        authorized: AtomicBool,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl SecondaryChannel for FakeChannel {
        fn provider(&self) -> &str {
            "fake"
        }

        async fn is_authorized(&self) -> bool {
            self.authorized.load(Ordering::SeqCst)
        }

        async fn run(&self, command: &str) -> Option<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Some(format!("secondary:{}", command))
        }
    }

    pub(crate) fn unprivileged_config() -> AccessConfig {
        AccessConfig {
            shell: vec!["/nonexistent/ebox-su".to_string()],
            ..AccessConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_providers() {
        let spy = SpySource::with(&[("/sys/x", "42")]);
        let access = SystemAccess::with_file_source(&unprivileged_config(), spy.clone(), None);

        assert_eq!(access.read_path("/sys/x").await.as_deref(), Some("42"));
        tokio::time::advance(Duration::from_millis(500)).await;
        spy.files.lock().insert("/sys/x".to_string(), "43".to_string());
        assert_eq!(access.read_path("/sys/x").await.as_deref(), Some("42"));
        assert_eq!(spy.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_resolves_once() {
        let spy = SpySource::with(&[("/sys/x", "42")]);
        let access = SystemAccess::with_file_source(&unprivileged_config(), spy.clone(), None);

        access.read_path("/sys/x").await;
        tokio::time::advance(Duration::from_millis(1001)).await;
        spy.files.lock().insert("/sys/x".to_string(), "43".to_string());
        assert_eq!(access.read_path("/sys/x").await.as_deref(), Some("43"));
        assert_eq!(access.read_path("/sys/x").await.as_deref(), Some("43"));
        assert_eq!(spy.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_cached() {
        let spy = SpySource::with(&[]);
        let access = SystemAccess::with_file_source(&unprivileged_config(), spy.clone(), None);
        assert_eq!(access.read_path("/sys/missing").await, None);
        assert_eq!(access.read_path("/sys/missing").await, None);
        assert_eq!(spy.calls(), 1);
    }

    #[tokio::test]
    async fn test_secondary_fallback_is_live() {
        let spy = SpySource::with(&[]);
        let channel = Arc::new(FakeChannel {
            authorized: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
        });
        let access = SystemAccess::with_file_source(
            &unprivileged_config(),
            spy,
            Some(channel.clone()),
        );
        assert_eq!(access.probe().await, CapabilityTier::None);
        assert!(!access.is_enhanced().await);
        assert_eq!(access.read_path("/a").await, None);
        assert_eq!(channel.runs.load(Ordering::SeqCst), 0);

        channel.authorized.store(true, Ordering::SeqCst);
        assert!(access.is_enhanced().await);
        assert_eq!(access.tier_label().await, "Secondary (fake)");
        assert_eq!(
            access.read_path("/b").await.as_deref(),
            Some("secondary:cat '/b'")
        );
        assert_eq!(channel.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_root_shell_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("charge_full");
        std::fs::write(&path, "4100000\n").unwrap();
        let path = path.to_string_lossy().to_string();

        // The spy never returns anything, so the value must come from the shell.
        let spy = SpySource::with(&[]);
        let config = AccessConfig {
            shell: vec!["sh".to_string()],
            ..AccessConfig::default()
        };
        let access = SystemAccess::with_file_source(&config, spy, None);
        assert!(access.probe().await.is_root());
        assert_eq!(access.read_path(&path).await.as_deref(), Some("4100000"));
        assert_eq!(access.read_path("/nonexistent/ebox").await, None);
        access.shutdown().await;
        assert!(!access.shell().is_alive());
    }

    #[tokio::test]
    async fn test_run_command_unprivileged() {
        let access = SystemAccess::new(&unprivileged_config(), None);
        access.probe().await;
        assert_eq!(access.run_command("echo 7").await.as_deref(), Some("7"));
    }
}
