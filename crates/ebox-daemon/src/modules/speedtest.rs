//! Periodic speed test module.
//!
//! Tests run on their own task so a slow transfer never delays the engine.
//! Results land in shared state and are published on the next tick.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::network::{default_route_interface, has_prefix, NET_ROUTE};
use super::{Module, ModuleContext, ModuleKey};
use crate::snapshot::{Readouts, UNAVAILABLE};

const AUTO_TEST_KEY: &str = "spd_auto_test";
const FREQ_KEY: &str = "spd_test_freq";
const WIFI_ONLY_KEY: &str = "spd_wifi_only";
const DAILY_LIMIT_KEY: &str = "spd_daily_limit";
const SHOW_PING_KEY: &str = "spd_show_ping";
const TESTS_TODAY_KEY: &str = "spd_tests_today";

const FIRST_RUN_DELAY: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
const TRANSFER_CAP: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_SIZE: usize = 1024 * 1024;

/// Limits at or above this are treated as unlimited.
const UNLIMITED: i64 = 9999;

#[derive(Debug)]
struct SpeedState {
    download: String,
    upload: String,
    ping: String,
    last_test: Option<Instant>,
    testing: bool,
}

impl Default for SpeedState {
    fn default() -> Self {
        Self {
            download: "Waiting...".to_string(),
            upload: UNAVAILABLE.to_string(),
            ping: UNAVAILABLE.to_string(),
            last_test: None,
            testing: false,
        }
    }
}

/// Why a scheduled test does not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    Busy,
    NotWifi,
    LimitReached,
}

fn gate(
    testing: bool,
    wifi_only: bool,
    on_wifi: bool,
    limit: i64,
    tests_today: i64,
) -> Option<Skip> {
    if testing {
        Some(Skip::Busy)
    } else if wifi_only && !on_wifi {
        Some(Skip::NotWifi)
    } else if (1..UNLIMITED).contains(&limit) && tests_today >= limit {
        Some(Skip::LimitReached)
    } else {
        None
    }
}

fn mbps(bytes: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    (bytes > 0 && secs > 0.0).then(|| bytes as f64 * 8.0 / secs / 1_000_000.0)
}

fn format_mbps(value: f64) -> String {
    format!("{:.1} Mbps", value)
}

async fn on_wifi(ctx: &ModuleContext) -> bool {
    ctx.access
        .read_path(NET_ROUTE)
        .await
        .as_deref()
        .and_then(default_route_interface)
        .map(|iface| has_prefix(&iface, &ctx.config.network.wifi_prefixes))
        .unwrap_or(false)
}

async fn ping(host: &str) -> Option<Duration> {
    let start = Instant::now();
    match tokio::time::timeout(PING_TIMEOUT, TcpStream::connect(host)).await {
        Ok(Ok(_)) => Some(start.elapsed()),
        Ok(Err(e)) => {
            debug!("Ping to {} failed: {}", host, e);
            None
        }
        Err(_) => {
            debug!("Ping to {} timed out", host);
            None
        }
    }
}

async fn download_one(client: &reqwest::Client, url: &str) -> reqwest::Result<Option<f64>> {
    let start = Instant::now();
    let mut response = client.get(url).send().await?.error_for_status()?;
    let mut total = 0u64;
    while let Some(chunk) = response.chunk().await? {
        total += chunk.len() as u64;
        if start.elapsed() > TRANSFER_CAP {
            break;
        }
    }
    Ok(mbps(total, start.elapsed()))
}

/// Throughput of the first URL that yields data.
async fn download(client: &reqwest::Client, urls: &[String]) -> Option<f64> {
    for url in urls {
        match download_one(client, url).await {
            Ok(Some(speed)) => return Some(speed),
            Ok(None) => debug!("Download from {} returned no data", url),
            Err(e) => debug!("Download from {} failed: {}", url, e),
        }
    }
    None
}

async fn upload(client: &reqwest::Client, url: &str) -> Option<f64> {
    let body: Vec<u8> = (0..UPLOAD_SIZE).map(|i| (i & 0xFF) as u8).collect();
    let start = Instant::now();
    let result = client
        .post(url)
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(body)
        .send()
        .await
        .and_then(|r| r.error_for_status());
    match result {
        Ok(_) => mbps(UPLOAD_SIZE as u64, start.elapsed()),
        Err(e) => {
            debug!("Upload to {} failed: {}", url, e);
            None
        }
    }
}

/// Runs one test unless gated, writing results into `state`.
async fn run_test(ctx: &ModuleContext, state: &Mutex<SpeedState>, client: &reqwest::Client) {
    let settings = &ctx.settings;
    let wifi_only = settings.get_bool(WIFI_ONLY_KEY, true);
    let wifi = !wifi_only || on_wifi(ctx).await;
    let limit = settings.get_i64(DAILY_LIMIT_KEY, 10);
    let tests_today = settings.get_i64(TESTS_TODAY_KEY, 0);

    {
        let mut s = state.lock();
        match gate(s.testing, wifi_only, wifi, limit, tests_today) {
            Some(Skip::Busy) => return,
            Some(Skip::NotWifi) => {
                s.download = "Skipped (not WiFi)".to_string();
                s.last_test = Some(Instant::now());
                return;
            }
            Some(Skip::LimitReached) => {
                s.download = "Daily limit reached".to_string();
                s.last_test = Some(Instant::now());
                return;
            }
            None => {
                s.testing = true;
                s.download = "Testing...".to_string();
                s.upload = "...".to_string();
            }
        }
    }

    let cfg = &ctx.config.speedtest;
    if settings.get_bool(SHOW_PING_KEY, true) {
        let result = ping(&cfg.ping_host)
            .await
            .map(|d| format!("{}ms", d.as_millis()))
            .unwrap_or_else(|| UNAVAILABLE.to_string());
        state.lock().ping = result;
    }

    let dl = download(client, &cfg.download_urls).await;
    let ul = upload(client, &cfg.upload_url).await;
    settings.batch(|b| b.add_i64(TESTS_TODAY_KEY, 1));

    let mut s = state.lock();
    s.download = dl.map(format_mbps).unwrap_or_else(|| "Failed".to_string());
    s.upload = ul
        .map(format_mbps)
        .unwrap_or_else(|| UNAVAILABLE.to_string());
    s.last_test = Some(Instant::now());
    s.testing = false;
    info!("Speed test: down {}, up {}, ping {}", s.download, s.upload, s.ping);
}

/// Measures download, upload and latency on a schedule.
pub struct SpeedTestModule {
    ctx: Option<ModuleContext>,
    state: Arc<Mutex<SpeedState>>,
    cancel: Option<CancellationToken>,
    running: bool,
}

impl Default for SpeedTestModule {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedTestModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            state: Arc::new(Mutex::new(SpeedState::default())),
            cancel: None,
            running: false,
        }
    }

    fn tests_today(&self) -> i64 {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.settings.get_i64(TESTS_TODAY_KEY, 0))
            .unwrap_or(0)
    }

    fn show_ping(&self) -> bool {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.settings.get_bool(SHOW_PING_KEY, true))
            .unwrap_or(true)
    }

    fn spawn_auto_test(&mut self, ctx: ModuleContext, client: reqwest::Client) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(FIRST_RUN_DELAY) => {}
            }
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = run_test(&ctx, &state, &client) => {}
                }
                let minutes = ctx.settings.get_i64(FREQ_KEY, 60).max(1) as u64;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {}
                }
            }
            // A test interrupted by cancellation leaves no partial result.
            let mut s = state.lock();
            if s.testing {
                s.testing = false;
                s.download = "Cancelled".to_string();
                s.upload = UNAVAILABLE.to_string();
            }
        });
        self.cancel = Some(cancel);
    }
}

#[async_trait]
impl Module for SpeedTestModule {
    fn key(&self) -> ModuleKey {
        ModuleKey::SpeedTest
    }

    fn tick_interval_ms(&self) -> u64 {
        match &self.ctx {
            Some(ctx) => self.key().interval_ms(&ctx.settings),
            None => self.key().interval_setting().1 as u64,
        }
    }

    async fn start(&mut self, ctx: ModuleContext) -> Result<()> {
        if self.running {
            return Ok(());
        }
        if ctx.settings.get_bool(AUTO_TEST_KEY, true) {
            let client = reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT)
                .user_agent(concat!("ebox/", env!("CARGO_PKG_VERSION")))
                .build()
                .context("Failed to build HTTP client")?;
            self.spawn_auto_test(ctx.clone(), client);
        }
        self.ctx = Some(ctx);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.running = false;
    }

    async fn tick(&mut self) {}

    fn compact(&self) -> String {
        format!("↓{}", self.state.lock().download)
    }

    fn detail(&self) -> String {
        let s = self.state.lock();
        let ping = if self.show_ping() {
            format!(" • Ping: {}", s.ping)
        } else {
            String::new()
        };
        let ago = match s.last_test.map(|t| t.elapsed().as_secs() / 60) {
            None => String::new(),
            Some(0) => " (just now)".to_string(),
            Some(m) => format!(" ({}m ago)", m),
        };
        format!(
            "DL: {} • UL: {}{}{}\nTests today: {}",
            s.download,
            s.upload,
            ping,
            ago,
            self.tests_today()
        )
    }

    fn data_points(&self) -> Readouts {
        let s = self.state.lock();
        let mut d = Readouts::new();
        d.insert("speedtest.download", s.download.clone());
        d.insert("speedtest.upload", s.upload.clone());
        d.insert("speedtest.ping", s.ping.clone());
        d.insert("speedtest.tests_today", self.tests_today().to_string());
        d
    }

    fn alive(&self) -> bool {
        self.running
    }
}
