//! Connection type, Wi-Fi link and VPN status.
//!
//! The link carrying the default route decides the connection type. Wi-Fi
//! details come from `iw dev <iface> link`, with the signal level preferably
//! taken from `/proc/net/wireless`. A VPN counts as active when it carries a
//! default route or when any VPN interface is up.

use anyhow::Result;
use async_trait::async_trait;

use super::network::{default_route_interfaces, has_prefix, parse_net_dev, NET_DEV, NET_ROUTE};
use super::{Module, ModuleContext, ModuleKey};
use crate::snapshot::{Readouts, UNAVAILABLE};

const NET_WIRELESS: &str = "/proc/net/wireless";

/// Kind of link carrying the default route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    None,
    Wifi,
    Mobile,
    Other,
}

impl LinkKind {
    fn label(&self) -> &'static str {
        match self {
            LinkKind::None => "None",
            LinkKind::Wifi => "WiFi",
            LinkKind::Mobile => "Mobile",
            LinkKind::Other => "Other",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct WifiLink {
    ssid: Option<String>,
    signal_dbm: Option<i32>,
    bitrate_mbps: Option<f64>,
    freq_mhz: Option<u32>,
}

impl WifiLink {
    fn rssi(&self) -> String {
        self.signal_dbm
            .map(|s| format!("{} dBm", s))
            .unwrap_or_else(|| UNAVAILABLE.to_string())
    }

    fn speed(&self) -> String {
        self.bitrate_mbps
            .map(|r| format!("{} Mbps", r.round() as u64))
            .unwrap_or_else(|| UNAVAILABLE.to_string())
    }

    fn band(&self) -> String {
        match self.freq_mhz {
            Some(f) if f >= 5925 => "6 GHz".to_string(),
            Some(f) if f > 4900 => "5 GHz".to_string(),
            Some(_) => "2.4 GHz".to_string(),
            None => UNAVAILABLE.to_string(),
        }
    }

    fn ssid(&self) -> String {
        match &self.ssid {
            Some(s) if s.is_empty() => "Hidden".to_string(),
            Some(s) => s.clone(),
            None => UNAVAILABLE.to_string(),
        }
    }
}

/// Parses the output of `iw dev <iface> link`.
fn parse_iw_link(output: &str) -> WifiLink {
    let mut link = WifiLink::default();
    for line in output.lines().map(str::trim) {
        if let Some(ssid) = line.strip_prefix("SSID:") {
            link.ssid = Some(ssid.trim().to_string());
        } else if let Some(freq) = line.strip_prefix("freq:") {
            link.freq_mhz = freq.trim().parse::<f64>().ok().map(|f| f as u32);
        } else if let Some(signal) = line.strip_prefix("signal:") {
            link.signal_dbm = signal
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok());
        } else if let Some(rate) = line.strip_prefix("tx bitrate:") {
            link.bitrate_mbps = rate
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok());
        }
    }
    link
}

/// Signal level of `iface` in dBm from `/proc/net/wireless`.
fn parse_wireless_signal(content: &str, iface: &str) -> Option<i32> {
    content.lines().skip(2).find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != iface {
            return None;
        }
        // status, link quality, signal level, noise
        let level: f64 = rest
            .split_whitespace()
            .nth(2)?
            .trim_end_matches('.')
            .parse()
            .ok()?;
        // Older drivers report the level as an unsigned byte.
        let level = if level > 0.0 { level - 256.0 } else { level };
        Some(level as i32)
    })
}

fn is_plain_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Reports how the device is connected.
pub struct ConnectionModule {
    ctx: Option<ModuleContext>,
    kind: LinkKind,
    interface: Option<String>,
    wifi: WifiLink,
    vpn: bool,
    running: bool,
}

impl Default for ConnectionModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            kind: LinkKind::None,
            interface: None,
            wifi: WifiLink::default(),
            vpn: false,
            running: false,
        }
    }

    /// `operstate` of a tunnel is usually "unknown" while it is in use.
    async fn is_up(ctx: &ModuleContext, iface: &str) -> bool {
        let path = format!("/sys/class/net/{}/operstate", iface);
        matches!(
            ctx.access.read_path(&path).await.as_deref(),
            Some("up") | Some("unknown")
        )
    }

    async fn read_wifi(ctx: &ModuleContext, iface: &str) -> WifiLink {
        let mut link = WifiLink::default();
        if is_plain_interface_name(iface) {
            if let Some(output) = ctx
                .access
                .run_command(&format!("iw dev {} link", iface))
                .await
            {
                link = parse_iw_link(&output);
            }
        }
        if let Some(dbm) = ctx
            .access
            .read_path(NET_WIRELESS)
            .await
            .as_deref()
            .and_then(|c| parse_wireless_signal(c, iface))
        {
            link.signal_dbm = Some(dbm);
        }
        link
    }
}

#[async_trait]
impl Module for ConnectionModule {
    fn key(&self) -> ModuleKey {
        ModuleKey::Connection
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
        self.ctx = Some(ctx);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    async fn tick(&mut self) {
        let Some(ctx) = self.ctx.clone() else {
            return;
        };
        let net = &ctx.config.network;

        let routes = ctx
            .access
            .read_path(NET_ROUTE)
            .await
            .map(|c| default_route_interfaces(&c))
            .unwrap_or_default();
        let vpn_routed = routes.iter().any(|i| has_prefix(i, &net.vpn_prefixes));

        let mut vpn = vpn_routed;
        if !vpn {
            let interfaces = ctx
                .access
                .read_path(NET_DEV)
                .await
                .map(|c| parse_net_dev(&c))
                .unwrap_or_default();
            for iface in interfaces
                .iter()
                .filter(|i| has_prefix(&i.name, &net.vpn_prefixes))
            {
                if Self::is_up(&ctx, &iface.name).await {
                    vpn = true;
                    break;
                }
            }
        }
        self.vpn = vpn;

        self.interface = routes
            .into_iter()
            .find(|i| !has_prefix(i, &net.vpn_prefixes));
        self.kind = match &self.interface {
            Some(i) if has_prefix(i, &net.wifi_prefixes) => LinkKind::Wifi,
            Some(i) if has_prefix(i, &net.mobile_prefixes) => LinkKind::Mobile,
            Some(_) => LinkKind::Other,
            None if vpn_routed => LinkKind::Other,
            None => LinkKind::None,
        };

        self.wifi = match (&self.kind, &self.interface) {
            (LinkKind::Wifi, Some(iface)) => Self::read_wifi(&ctx, iface).await,
            _ => WifiLink::default(),
        };
    }

    fn compact(&self) -> String {
        match self.kind {
            LinkKind::Wifi => format!("WiFi {}", self.wifi.rssi()),
            LinkKind::Mobile => format!(
                "Mobile {}",
                self.interface.as_deref().unwrap_or(UNAVAILABLE)
            ),
            kind => kind.label().to_string(),
        }
    }

    fn detail(&self) -> String {
        let mut s = match self.kind {
            LinkKind::Wifi => format!(
                "WiFi: {} ({})\n{} • {}",
                self.wifi.ssid(),
                self.wifi.rssi(),
                self.wifi.speed(),
                self.wifi.band()
            ),
            kind => match &self.interface {
                Some(iface) => format!("{}: {}", kind.label(), iface),
                None => kind.label().to_string(),
            },
        };
        if self.vpn {
            s.push_str("\nVPN: Active");
        }
        s
    }

    fn data_points(&self) -> Readouts {
        let mut d = Readouts::new();
        d.insert("conn.type", self.kind.label());
        d.insert(
            "conn.interface",
            self.interface.as_deref().unwrap_or(UNAVAILABLE),
        );
        if self.kind == LinkKind::Wifi {
            d.insert("conn.ssid", self.wifi.ssid());
            d.insert("conn.rssi", self.wifi.rssi());
            d.insert("conn.speed", self.wifi.speed());
            d.insert("conn.freq", self.wifi.band());
        }
        d.insert("conn.vpn", if self.vpn { "Active" } else { "None" });
        d
    }

    fn alive(&self) -> bool {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::tests::{context_with_files, MapFiles};
    use std::sync::Arc;

    const ROUTE_HEADER: &str =
        "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\tMTU\tWindow\tIRTT";

    const NET_DEV_SAMPLE: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  100 1 0 0 0 0 0 0  100 1 0 0 0 0 0 0
 wlan0: 5000 10 0 0 0 0 0 0 3000 8 0 0 0 0 0 0
  tun0:  700 3 0 0 0 0 0 0  300 2 0 0 0 0 0 0";

    const WIRELESS_SAMPLE: &str = "\
Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
 face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
 wlan0: 0000   58.  -52.  -256        0      0      0      0      0        0";

    fn route(ifaces: &[&str]) -> String {
        let mut s = ROUTE_HEADER.to_string();
        for iface in ifaces {
            s.push_str(&format!(
                "\n{}\t00000000\t0100A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0",
                iface
            ));
        }
        s.push_str("\nwlan0\t0000A8C0\t00000000\t0001\t0\t0\t600\t00FFFFFF\t0\t0\t0");
        s
    }

    #[test]
    fn test_parse_iw_link() {
        let output = "Connected to aa:bb:cc:dd:ee:ff (on wlan0)
\tSSID: HomeNet
\tfreq: 5180.0
\tRX: 123456 bytes (900 packets)
\tsignal: -61 dBm
\ttx bitrate: 866.7 MBit/s VHT-MCS 9 80MHz short GI VHT-NSS 2";
        let link = parse_iw_link(output);
        assert_eq!(link.ssid.as_deref(), Some("HomeNet"));
        assert_eq!(link.freq_mhz, Some(5180));
        assert_eq!(link.signal_dbm, Some(-61));
        assert_eq!(link.speed(), "867 Mbps");
        assert_eq!(link.band(), "5 GHz");

        assert_eq!(parse_iw_link("Not connected."), WifiLink::default());
    }

    #[test]
    fn test_parse_wireless_signal() {
        assert_eq!(parse_wireless_signal(WIRELESS_SAMPLE, "wlan0"), Some(-52));
        assert_eq!(parse_wireless_signal(WIRELESS_SAMPLE, "wlan1"), None);
        let unsigned = "h1\nh2\n wlan0: 0000   58.  204.  0";
        assert_eq!(parse_wireless_signal(unsigned, "wlan0"), Some(-52));
    }

    #[test]
    fn test_band_labels() {
        let band = |f| {
            WifiLink {
                freq_mhz: Some(f),
                ..WifiLink::default()
            }
            .band()
        };
        assert_eq!(band(2437), "2.4 GHz");
        assert_eq!(band(5500), "5 GHz");
        assert_eq!(band(5955), "6 GHz");
    }

    #[test]
    fn test_interface_name_filter() {
        assert!(is_plain_interface_name("wlp2s0"));
        assert!(is_plain_interface_name("rmnet_data0"));
        assert!(!is_plain_interface_name("wlan0;reboot"));
        assert!(!is_plain_interface_name(""));
    }

    #[tokio::test]
    async fn test_wifi_connection() {
        let files = Arc::new(MapFiles::default());
        files.insert(NET_ROUTE, &route(&["wlan0"]));
        files.insert(NET_DEV, NET_DEV_SAMPLE);
        files.insert(NET_WIRELESS, WIRELESS_SAMPLE);
        files.insert("/sys/class/net/tun0/operstate", "down");

        let mut module = ConnectionModule::new();
        module.start(context_with_files(files)).await.unwrap();
        module.tick().await;

        let d = module.data_points();
        assert_eq!(d.get("conn.type"), Some("WiFi"));
        assert_eq!(d.get("conn.interface"), Some("wlan0"));
        assert_eq!(d.get("conn.rssi"), Some("-52 dBm"));
        assert_eq!(d.get("conn.vpn"), Some("None"));
        assert_eq!(module.compact(), "WiFi -52 dBm");
    }

    #[tokio::test]
    async fn test_mobile_with_vpn_route() {
        let files = Arc::new(MapFiles::default());
        files.insert(NET_ROUTE, &route(&["tun0", "rmnet_data0"]));

        let mut module = ConnectionModule::new();
        module.start(context_with_files(files)).await.unwrap();
        module.tick().await;

        let d = module.data_points();
        assert_eq!(d.get("conn.type"), Some("Mobile"));
        assert_eq!(d.get("conn.interface"), Some("rmnet_data0"));
        assert_eq!(d.get("conn.vpn"), Some("Active"));
        assert!(d.get("conn.ssid").is_none());
        assert!(module.detail().ends_with("VPN: Active"));
    }

    #[tokio::test]
    async fn test_vpn_interface_up_without_route() {
        let files = Arc::new(MapFiles::default());
        files.insert(NET_ROUTE, &route(&["eth0"]));
        files.insert(NET_DEV, NET_DEV_SAMPLE);
        files.insert("/sys/class/net/tun0/operstate", "unknown");

        let mut module = ConnectionModule::new();
        module.start(context_with_files(files.clone())).await.unwrap();
        module.tick().await;
        assert_eq!(module.data_points().get("conn.type"), Some("Other"));
        assert!(module.vpn);

        files.insert("/sys/class/net/tun0/operstate", "down");
        module.tick().await;
        assert!(!module.vpn);
    }

    #[tokio::test]
    async fn test_no_route_is_none() {
        let files = Arc::new(MapFiles::default());
        let mut module = ConnectionModule::new();
        module.start(context_with_files(files.clone())).await.unwrap();
        module.tick().await;
        assert_eq!(module.compact(), "None");
        assert_eq!(module.data_points().get("conn.interface"), Some(UNAVAILABLE));

        files.insert(NET_ROUTE, &route(&["wlan0"]));
        module.tick().await;
        assert_eq!(module.data_points().get("conn.type"), Some("WiFi"));
        files.remove(NET_ROUTE);
        module.tick().await;
        assert_eq!(module.data_points().get("conn.type"), Some("None"));
        assert!(module.data_points().get("conn.rssi").is_none());

        module.stop();
        module.stop();
        assert!(!module.alive());
    }
}
