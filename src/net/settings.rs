//! Peer settings loaded from JSON.
//!
//! Every field has a default, so a settings file only needs the values it
//! changes:
//!
//! ```json
//! {
//!   "recon_addr": "0.0.0.0:11370",
//!   "partners": {
//!     "alpha": { "http_addr": "alpha.example:11371", "recon_addr": "alpha.example:11370" }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::messages::Config;
use crate::ptree::PTreeConfig;

/// Default protocol version advertised to partners.
pub const DEFAULT_VERSION: &str = "1.1.6";

/// Which halves of the protocol a peer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerMode {
    /// Accept inbound sessions and gossip with partners.
    #[default]
    Both,
    /// Only initiate sessions.
    GossipOnly,
    /// Only accept sessions.
    ServeOnly,
}

/// A configured reconciliation partner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Partner {
    /// HKP address used to fetch recovered keys.
    pub http_addr: String,
    /// Recon address dialled for gossip.
    pub recon_addr: String,
    /// Relative selection weight; `0` means the default of 100 and negative
    /// weights disable the partner.
    pub weight: i32,
}

impl Partner {
    fn effective_weight(&self) -> u32 {
        match self.weight {
            0 => 100,
            w if w < 0 => 0,
            w => w as u32,
        }
    }
}

/// Peer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Version string sent in the config handshake.
    pub version: String,
    /// HKP port advertised to partners.
    pub http_port: u32,
    /// Listen address for inbound recon sessions.
    pub recon_addr: String,
    /// Merge filters advertised to partners.
    pub filters: Vec<String>,
    /// Partners keyed by name.
    pub partners: BTreeMap<String, Partner>,
    /// Mean delay between gossip rounds.
    pub gossip_interval_ms: u64,
    /// Requests the responder may have in flight before it flushes.
    pub max_outstanding_recon_requests: usize,
    /// Dial timeout.
    pub conn_timeout_secs: u64,
    /// Per-read timeout inside a session.
    pub read_timeout_secs: u64,
    /// Extra networks allowed to connect.
    pub allow_cidrs: Vec<String>,
    /// Which protocol halves to run.
    pub mode: PeerMode,
    /// Tree shape, which must match every partner.
    pub ptree: PTreeConfig,
    /// Elements an initiator accepts in one session before it stops.
    pub max_recover_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            version: DEFAULT_VERSION.to_string(),
            http_port: 11371,
            recon_addr: "0.0.0.0:11370".to_string(),
            filters: vec!["yminsky.dedup".to_string(), "yminsky.merge".to_string()],
            partners: BTreeMap::new(),
            gossip_interval_ms: 60_000,
            max_outstanding_recon_requests: 100,
            conn_timeout_secs: 30,
            read_timeout_secs: 300,
            allow_cidrs: Vec::new(),
            mode: PeerMode::Both,
            ptree: PTreeConfig::default(),
            max_recover_size: 15_000,
        }
    }
}

/// Failure to load a settings file.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    /// The file could not be read.
    Read {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    #[error("invalid settings JSON: {0}")]
    /// The file was not valid settings JSON.
    Parse(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    /// A value is out of range.
    Invalid(String),
}

impl Settings {
    /// Parses settings from a JSON document.
    pub fn from_json(data: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_json::from_str(data)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&data)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let tree = &self.ptree;
        if tree.bit_quantum == 0 || tree.bit_quantum > 8 {
            return Err(SettingsError::Invalid(format!(
                "bit_quantum {} out of range 1..=8",
                tree.bit_quantum
            )));
        }
        if tree.mbar == 0 || tree.thresh_mult < 2 {
            return Err(SettingsError::Invalid(
                "mbar must be positive and thresh_mult at least 2".into(),
            ));
        }
        Ok(())
    }

    /// The config message this peer advertises.
    pub fn config(&self) -> Config {
        Config {
            version: self.version.clone(),
            http_port: self.http_port,
            bit_quantum: self.ptree.bit_quantum,
            mbar: self.ptree.mbar,
            filters: self.filters.join(","),
            custom: BTreeMap::new(),
        }
    }

    /// Gossip delay drawn uniformly from 90% to 110% of the interval.
    pub fn skewed_gossip_interval<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let interval = self.gossip_interval_ms;
        let base = interval - interval / 10;
        let skew = rng.gen_range(0..=interval / 5);
        Duration::from_millis(base + skew)
    }

    /// Picks a partner at random, weighted by [`Partner::weight`].
    pub fn random_partner<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(&str, &Partner)> {
        let candidates: Vec<(&String, &Partner)> = self
            .partners
            .iter()
            .filter(|(_, p)| p.effective_weight() > 0 && !p.recon_addr.is_empty())
            .collect();
        let dist = WeightedIndex::new(candidates.iter().map(|(_, p)| p.effective_weight())).ok()?;
        let (name, partner) = candidates[dist.sample(rng)];
        Some((name.as_str(), partner))
    }

    /// Configured HKP address of the partner whose recon address has `ip`.
    /// Only partners listed by IP literal are matched.
    pub fn partner_http_addr(&self, ip: IpAddr) -> Option<&str> {
        self.partners
            .values()
            .filter(|p| !p.http_addr.is_empty())
            .find(|p| {
                p.recon_addr
                    .parse::<SocketAddr>()
                    .is_ok_and(|addr| addr.ip() == ip)
            })
            .map(|p| p.http_addr.as_str())
    }

    /// Dial timeout.
    pub fn conn_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_timeout_secs)
    }

    /// Per-read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_defaults() {
        let s = Settings::from_json("{}").unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.ptree.split_threshold(), 50);
        assert_eq!(s.config().filters, "yminsky.dedup,yminsky.merge");
        assert_eq!(s.config().http_port, 11371);
    }

    #[test]
    fn test_parse_partners_and_mode() {
        let s = Settings::from_json(
            r#"{
                "mode": "serve_only",
                "ptree": { "mbar": 7 },
                "partners": {
                    "a": { "http_addr": "10.0.0.1:11371", "recon_addr": "10.0.0.1:11370" },
                    "b": { "recon_addr": "10.0.0.2:11370", "weight": 3 }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(s.mode, PeerMode::ServeOnly);
        assert_eq!(s.ptree.mbar, 7);
        assert_eq!(s.ptree.bit_quantum, 2);
        assert_eq!(s.partners["b"].weight, 3);
        assert_eq!(s.partners["a"].effective_weight(), 100);
    }

    #[test]
    fn test_partner_http_addr_by_recon_ip() {
        let s = Settings::from_json(
            r#"{
                "partners": {
                    "a": { "http_addr": "keys.a.example:11371", "recon_addr": "10.0.0.1:11370" },
                    "b": { "recon_addr": "10.0.0.2:11370" }
                }
            }"#,
        )
        .unwrap();
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();
        assert_eq!(s.partner_http_addr(ip("10.0.0.1")), Some("keys.a.example:11371"));
        assert_eq!(s.partner_http_addr(ip("10.0.0.2")), None);
        assert_eq!(s.partner_http_addr(ip("10.0.0.3")), None);
    }

    #[test]
    fn test_rejects_bad_quantum() {
        assert!(matches!(
            Settings::from_json(r#"{ "ptree": { "bit_quantum": 0 } }"#),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_json("not json"),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_skewed_interval_bounds() {
        let s = Settings {
            gossip_interval_ms: 1000,
            ..Settings::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let d = s.skewed_gossip_interval(&mut rng).as_millis();
            assert!((900..=1100).contains(&d), "{d}");
        }
    }

    #[test]
    fn test_random_partner_respects_weights() {
        let mut s = Settings::default();
        assert!(s.random_partner(&mut StdRng::seed_from_u64(0)).is_none());
        s.partners.insert(
            "off".into(),
            Partner {
                recon_addr: "10.0.0.9:11370".into(),
                weight: -1,
                ..Partner::default()
            },
        );
        s.partners.insert(
            "on".into(),
            Partner {
                recon_addr: "10.0.0.8:11370".into(),
                ..Partner::default()
            },
        );
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..50 {
            assert_eq!(s.random_partner(&mut rng).unwrap().0, "on");
        }
    }
}
