//! `ingest.toml` configuration for tbbingest.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;
use tbb_ingest::{AttrValue, CorrectionProfile, ReceiverConfig, SessionConfig, TimestampProfiles};

/// Top-level ingest configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub session: SessionConfig,
    /// Session-level attributes written to the store root. Keys are stored
    /// upper-cased.
    #[serde(default = "IngestConfig::default_attributes")]
    pub attributes: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub listen: ListenConfig,
}

/// UDP receive settings for `tbbingest listen`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// One receiver is bound per port; all of them feed the same store.
    #[serde(default = "ListenConfig::default_ports")]
    pub ports: Vec<u16>,
    #[serde(default = "ListenConfig::default_bind")]
    pub bind: Ipv4Addr,
    /// Seconds to wait for the first frame; 0 or less waits forever.
    #[serde(default)]
    pub start_timeout_secs: f64,
    /// Seconds of silence after which the event ends.
    #[serde(default = "ListenConfig::default_read_timeout")]
    pub read_timeout_secs: f64,
    /// Capacity of the receiver→writer channel, in frames.
    #[serde(default = "ListenConfig::default_buffer_frames")]
    pub buffer_frames: usize,
    /// Keep waiting on ports that have not sent anything yet once the
    /// others went quiet. Otherwise those ports are stopped with the rest.
    #[serde(default)]
    pub wait_for_all: bool,
    /// After an event is stored, wait for the next one in a new store.
    #[serde(default)]
    pub keep_running: bool,
}

impl ListenConfig {
    fn default_ports() -> Vec<u16> { vec![31664] }
    fn default_bind() -> Ipv4Addr { Ipv4Addr::UNSPECIFIED }
    fn default_read_timeout() -> f64 { 0.5 }
    fn default_buffer_frames() -> usize { 50_000 }

    pub fn read_timeout(&self) -> Duration {
        secs(self.read_timeout_secs).unwrap_or(Duration::from_millis(1))
    }

    /// One receiver config per listed port.
    pub fn receiver_configs(&self) -> Vec<ReceiverConfig> {
        self.ports
            .iter()
            .map(|&port| ReceiverConfig {
                bind: SocketAddrV4::new(self.bind, port),
                start_timeout: secs(self.start_timeout_secs),
                read_timeout: self.read_timeout(),
            })
            .collect()
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ports: Self::default_ports(),
            bind: Self::default_bind(),
            start_timeout_secs: 0.0,
            read_timeout_secs: Self::default_read_timeout(),
            buffer_frames: Self::default_buffer_frames(),
            wait_for_all: false,
            keep_running: false,
        }
    }
}

/// Positive, finite seconds as a Duration.
fn secs(s: f64) -> Option<Duration> {
    (s.is_finite() && s > 0.0).then(|| Duration::from_secs_f64(s))
}

impl IngestConfig {
    fn default_attributes() -> BTreeMap<String, AttrValue> {
        [
            ("observer", "UNDEFINED"),
            ("project", "UNDEFINED"),
            ("observation_id", "UNDEFINED"),
            ("filter_selection", "UNDEFINED"),
            ("telescope", "LOFAR"),
            ("antenna_set", "UNDEFINED"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), AttrValue::from(v)))
        .collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// Default config with the built-in correction profiles spelled out, so
    /// they can be edited in place.
    pub fn default_example() -> Self {
        Self {
            session: SessionConfig {
                timestamp_profiles: TimestampProfiles {
                    legacy: Some(CorrectionProfile::legacy()),
                    modern: Some(CorrectionProfile::modern()),
                },
                ..SessionConfig::default()
            },
            attributes: Self::default_attributes(),
            listen: ListenConfig::default(),
        }
    }

    /// Attributes for the store root, keys upper-cased.
    pub fn root_attributes(&self) -> BTreeMap<String, AttrValue> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.to_uppercase(), v.clone()))
            .collect()
    }
}
