//! Startup configuration.
//!
//! One TOML file declares the datalink catalog, the client profiles, the
//! traffic-class definitions and the policy rulesets, plus transport
//! endpoints and timer values. Configuration is read once at startup;
//! there is no runtime reload.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use magic_mih::transport::{DEFAULT_DGRAM_SOCKET, DEFAULT_HEARTBEAT_PORT, DEFAULT_STREAM_SOCKET};
use magic_mih::LinkType;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub core: CoreSection,
    #[serde(default)]
    pub north: NorthSection,
    #[serde(default)]
    pub south: SouthSection,
    #[serde(default)]
    pub push: PushSection,
    #[serde(default)]
    pub switching: SwitchingSection,
    #[serde(default)]
    pub datalinks: Vec<DatalinkConfig>,
    #[serde(default)]
    pub clients: Vec<ClientProfile>,
    #[serde(default)]
    pub traffic_classes: Vec<TrafficClassDef>,
    #[serde(default)]
    pub rulesets: Vec<PolicyRuleset>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreSection {
    /// MIHF identity announced to DLMs.
    #[serde(default = "default_mihf_id")]
    pub mihf_id: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_dlm_clients")]
    pub max_dlm_clients: usize,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_sec: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NorthSection {
    #[serde(default = "default_north_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_origin_host")]
    pub origin_host: String,
    #[serde(default = "default_origin_realm")]
    pub origin_realm: String,
    /// DNS handed to clients in the MCAA network block.
    pub dns_primary: Option<std::net::Ipv4Addr>,
    pub dns_secondary: Option<std::net::Ipv4Addr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SouthSection {
    #[serde(default = "default_stream_socket")]
    pub stream_socket: PathBuf,
    #[serde(default = "default_dgram_socket")]
    pub dgram_socket: PathBuf,
    #[serde(default = "default_heartbeat_port")]
    pub heartbeat_port: u16,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_sec: u64,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushSection {
    /// Minimum spacing between MNTRs on one session.
    #[serde(default = "default_mntr_min_interval")]
    pub mntr_min_interval_sec: u64,
    /// Bandwidth delta below which an MNTR is suppressed, percent.
    #[serde(default = "default_mntr_change_threshold")]
    pub mntr_change_threshold_percent: u32,
    #[serde(default = "default_mntr_ack_timeout")]
    pub mntr_ack_timeout_sec: u64,
    #[serde(default = "default_ack_sweep_interval")]
    pub ack_sweep_interval_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchingSection {
    #[serde(default = "default_min_dwell")]
    pub min_dwell_time_sec: u64,
    #[serde(default = "default_hysteresis")]
    pub hysteresis_percent: u32,
}

/// One entry of the datalink catalog. A DLM may only register links that
/// are declared here.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatalinkConfig {
    pub name: String,
    /// Parsed against the MIH link-type names, e.g. `satcom-ku`, `lte`.
    pub link_type: String,
    pub max_forward_bw_kbps: u32,
    #[serde(default)]
    pub max_return_bw_kbps: u32,
    pub latency_ms: u32,
    /// Relative cost index used in operator reporting.
    #[serde(default)]
    pub cost_factor: f64,
    #[serde(default)]
    pub coverage: CoverageConfig,
}

impl DatalinkConfig {
    pub fn parsed_link_type(&self) -> Result<LinkType, String> {
        self.link_type.parse()
    }
}

/// Geographic usability box for a link.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CoverageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_lat")]
    pub min_latitude: f64,
    #[serde(default = "default_max_lat")]
    pub max_latitude: f64,
    #[serde(default = "default_min_lon")]
    pub min_longitude: f64,
    #[serde(default = "default_max_lon")]
    pub max_longitude: f64,
    #[serde(default)]
    pub min_altitude_ft: u32,
    #[serde(default = "default_max_alt")]
    pub max_altitude_ft: u32,
}

/// A provisioned client and its limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientProfile {
    pub client_id: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_client_bw_cap")]
    pub max_forward_kbps: u32,
    #[serde(default)]
    pub max_return_kbps: u32,
    /// IP handed out in the MCAA network block.
    pub assigned_ip: Option<std::net::Ipv4Addr>,
    #[serde(default)]
    pub priority_class: u32,
    /// Links this client may use. Empty = all.
    #[serde(default)]
    pub allowed_links: Vec<String>,
    pub preferred_link: Option<String>,
}

impl ClientProfile {
    pub fn is_link_allowed(&self, link: &str) -> bool {
        self.allowed_links.is_empty() || self.allowed_links.iter().any(|l| l == link)
    }
}

/// Dynamic traffic classification entry. First explicit match wins; the
/// entry flagged `default` is the fallback.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrafficClassDef {
    pub id: String,
    #[serde(default)]
    pub default: bool,
    pub priority_class: Option<u32>,
    pub qos_level: Option<u32>,
    /// Profile-name patterns; a trailing `*` matches any suffix.
    #[serde(default)]
    pub profile_patterns: Vec<String>,
}

/// Ruleset selected by flight phase.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRuleset {
    pub flight_phase: String,
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    pub traffic_class: String,
    pub preferences: Vec<PathPreference>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathPreference {
    pub link_name: String,
    /// 1 = best.
    pub ranking: u8,
    #[serde(default)]
    pub action: PreferenceAction,
    pub max_latency_ms: Option<u32>,
    #[serde(default)]
    pub on_ground_only: bool,
    #[serde(default)]
    pub airborne_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceAction {
    #[default]
    Permit,
    Prohibit,
}

impl Config {
    /// Load and validate. Any failure here is fatal at daemon init.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for dl in &self.datalinks {
            if let Err(e) = dl.parsed_link_type() {
                bail!("datalink {}: {e}", dl.name);
            }
            if dl.max_forward_bw_kbps == 0 {
                bail!("datalink {}: max_forward_bw_kbps must be non-zero", dl.name);
            }
        }
        let mut names: Vec<&str> = self.datalinks.iter().map(|d| d.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.datalinks.len() {
            bail!("duplicate datalink names in catalog");
        }
        for ruleset in &self.rulesets {
            for rule in &ruleset.rules {
                for pref in &rule.preferences {
                    if !self.datalinks.iter().any(|d| d.name == pref.link_name) {
                        bail!(
                            "ruleset {}: rule {} references unknown link {}",
                            ruleset.flight_phase,
                            rule.traffic_class,
                            pref.link_name
                        );
                    }
                    if pref.ranking == 0 || pref.ranking > 10 {
                        bail!(
                            "ruleset {}: rule {}: ranking must be 1..=10",
                            ruleset.flight_phase,
                            rule.traffic_class
                        );
                    }
                }
            }
        }
        for client in &self.clients {
            if client.client_id.is_empty() {
                bail!("client with empty client_id");
            }
        }
        Ok(())
    }

    pub fn find_datalink(&self, name: &str) -> Option<&DatalinkConfig> {
        self.datalinks.iter().find(|d| d.name == name)
    }

    pub fn find_client(&self, client_id: &str) -> Option<&ClientProfile> {
        self.clients.iter().find(|c| c.client_id == client_id)
    }

    /// Ruleset for the flight phase, falling back to the first ruleset.
    pub fn ruleset_for_phase(&self, phase: Option<&str>) -> Option<&PolicyRuleset> {
        phase
            .and_then(|p| {
                self.rulesets
                    .iter()
                    .find(|r| r.flight_phase.eq_ignore_ascii_case(p))
            })
            .or_else(|| self.rulesets.first())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.south.heartbeat_timeout_sec)
    }

    pub fn mntr_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.push.mntr_ack_timeout_sec)
    }

    pub fn mntr_min_interval(&self) -> Duration {
        Duration::from_secs(self.push.mntr_min_interval_sec)
    }
}

impl Default for CoreSection {
    fn default() -> Self {
        CoreSection {
            mihf_id: default_mihf_id(),
            max_sessions: default_max_sessions(),
            max_dlm_clients: default_max_dlm_clients(),
            session_timeout_sec: default_session_timeout(),
        }
    }
}

impl Default for NorthSection {
    fn default() -> Self {
        NorthSection {
            listen: default_north_listen(),
            origin_host: default_origin_host(),
            origin_realm: default_origin_realm(),
            dns_primary: None,
            dns_secondary: None,
        }
    }
}

impl Default for SouthSection {
    fn default() -> Self {
        SouthSection {
            stream_socket: default_stream_socket(),
            dgram_socket: default_dgram_socket(),
            heartbeat_port: default_heartbeat_port(),
            heartbeat_timeout_sec: default_heartbeat_timeout(),
            monitor_interval_sec: default_monitor_interval(),
        }
    }
}

impl Default for PushSection {
    fn default() -> Self {
        PushSection {
            mntr_min_interval_sec: default_mntr_min_interval(),
            mntr_change_threshold_percent: default_mntr_change_threshold(),
            mntr_ack_timeout_sec: default_mntr_ack_timeout(),
            ack_sweep_interval_sec: default_ack_sweep_interval(),
        }
    }
}

impl Default for SwitchingSection {
    fn default() -> Self {
        SwitchingSection {
            min_dwell_time_sec: default_min_dwell(),
            hysteresis_percent: default_hysteresis(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            core: CoreSection::default(),
            north: NorthSection::default(),
            south: SouthSection::default(),
            push: PushSection::default(),
            switching: SwitchingSection::default(),
            datalinks: Vec::new(),
            clients: Vec::new(),
            traffic_classes: Vec::new(),
            rulesets: Vec::new(),
        }
    }
}

fn default_mihf_id() -> String {
    "CM_CORE_1".into()
}
fn default_max_sessions() -> usize {
    64
}
fn default_max_dlm_clients() -> usize {
    10
}
fn default_session_timeout() -> u32 {
    3600
}
fn default_north_listen() -> SocketAddr {
    "127.0.0.1:3868".parse().expect("static address")
}
fn default_origin_host() -> String {
    "cm-core.magic.aero".into()
}
fn default_origin_realm() -> String {
    "magic.aero".into()
}
fn default_stream_socket() -> PathBuf {
    DEFAULT_STREAM_SOCKET.into()
}
fn default_dgram_socket() -> PathBuf {
    DEFAULT_DGRAM_SOCKET.into()
}
fn default_heartbeat_port() -> u16 {
    DEFAULT_HEARTBEAT_PORT
}
fn default_heartbeat_timeout() -> u64 {
    30
}
fn default_monitor_interval() -> u64 {
    5
}
fn default_mntr_min_interval() -> u64 {
    1
}
fn default_mntr_change_threshold() -> u32 {
    10
}
fn default_mntr_ack_timeout() -> u64 {
    5
}
fn default_ack_sweep_interval() -> u64 {
    1
}
fn default_min_dwell() -> u64 {
    30
}
fn default_hysteresis() -> u32 {
    20
}
fn default_true() -> bool {
    true
}
fn default_client_bw_cap() -> u32 {
    10_000
}
fn default_min_lat() -> f64 {
    -90.0
}
fn default_max_lat() -> f64 {
    90.0
}
fn default_min_lon() -> f64 {
    -180.0
}
fn default_max_lon() -> f64 {
    180.0
}
fn default_max_alt() -> u32 {
    60_000
}
