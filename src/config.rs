//! Daemon configuration.
//!
//! Parsed from a TOML file with a mandatory `[lsoe]` section. Every key has
//! a default, so an absent file yields a working configuration. Timer values
//! are expressed in seconds (floats allowed, so `0.1` is 100 ms).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::wire::{MacAddr, ETH_P_LSOE, HELLO_MACADDR_DEFAULT};

#[derive(Debug, Deserialize)]
struct ConfigFile {
    lsoe: Config,
}

/// `[lsoe]` section contents.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// 10-byte router identifier as hex, with optional `:`/`-` separators.
    /// Derived from the machine id when absent.
    #[serde(default)]
    pub local_id: Option<String>,

    /// EtherType for all LSOE frames.
    #[serde(default = "default_ethertype")]
    pub ethertype: u16,

    /// Destination MAC for HELLO beacons.
    #[serde(default = "default_hello_macaddr")]
    pub hello_multicast_macaddr: String,

    /// How frequently to multicast HELLO PDUs.
    #[serde(default = "default_hello_interval")]
    pub hello_interval: f64,

    /// Send a KEEPALIVE after this much sending silence.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: f64,

    /// Tear the session down after this much receiving silence. Advertised
    /// in OPEN; the minimum of the two sides wins.
    #[serde(default = "default_hold_time")]
    pub hold_time: f64,

    /// Initial retransmission timeout.
    #[serde(default = "default_retransmit_base")]
    pub retransmit_base: f64,

    /// Ceiling for the exponential retransmission backoff.
    #[serde(default = "default_retransmit_cap")]
    pub retransmit_cap: f64,

    /// Retransmission attempts before the session is considered dead.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Give up on reassembling a multi-frame PDU after this long.
    #[serde(default = "default_reassembly_ttl")]
    pub reassembly_ttl: f64,

    /// Purge idle entries from the MAC address cache after this long.
    #[serde(default = "default_mac_cache_timeout")]
    pub mac_cache_timeout: f64,

    /// Northbound POST target for RFC 7752-shaped snapshots.
    #[serde(default)]
    pub report_rfc7752_url: Option<String>,

    /// Interface allowlist; empty means every non-loopback interface.
    #[serde(default)]
    pub interfaces: Vec<String>,

    /// Run the protocol on loopback interfaces too.
    #[serde(default)]
    pub include_loopback: bool,
}

fn default_ethertype() -> u16 {
    ETH_P_LSOE
}
fn default_hello_macaddr() -> String {
    HELLO_MACADDR_DEFAULT.to_string()
}
fn default_hello_interval() -> f64 {
    15.0
}
fn default_keepalive_interval() -> f64 {
    10.0
}
fn default_hold_time() -> f64 {
    40.0
}
fn default_retransmit_base() -> f64 {
    1.0
}
fn default_retransmit_cap() -> f64 {
    30.0
}
fn default_max_attempts() -> u32 {
    5
}
fn default_reassembly_ttl() -> f64 {
    5.0
}
fn default_mac_cache_timeout() -> f64 {
    300.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_id: None,
            ethertype: default_ethertype(),
            hello_multicast_macaddr: default_hello_macaddr(),
            hello_interval: default_hello_interval(),
            keepalive_interval: default_keepalive_interval(),
            hold_time: default_hold_time(),
            retransmit_base: default_retransmit_base(),
            retransmit_cap: default_retransmit_cap(),
            max_attempts: default_max_attempts(),
            reassembly_ttl: default_reassembly_ttl(),
            mac_cache_timeout: default_mac_cache_timeout(),
            report_rfc7752_url: None,
            interfaces: Vec::new(),
            include_loopback: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        let parsed: ConfigFile =
            toml::from_str(&content).context("failed to parse TOML config")?;
        parsed.lsoe.validate()?;
        Ok(parsed.lsoe)
    }

    /// Load from default paths or fall back to defaults.
    pub fn load_or_default() -> Result<Self> {
        let paths = ["/etc/lsoe/config.toml", "~/.lsoe/config.toml", "./lsoe.toml"];
        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                return Self::load(&expanded);
            }
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("hello-interval", self.hello_interval),
            ("keepalive-interval", self.keepalive_interval),
            ("hold-time", self.hold_time),
            ("retransmit-base", self.retransmit_base),
            ("retransmit-cap", self.retransmit_cap),
            ("reassembly-ttl", self.reassembly_ttl),
            ("mac-cache-timeout", self.mac_cache_timeout),
        ] {
            if !value.is_finite() || value <= 0.0 {
                bail!("{name} must be positive, got {value}");
            }
        }
        if self.hold_time <= self.keepalive_interval {
            bail!(
                "hold-time ({}) must exceed keepalive-interval ({})",
                self.hold_time,
                self.keepalive_interval
            );
        }
        if self.hold_time > u16::MAX as f64 {
            bail!("hold-time does not fit the OPEN hold-time field");
        }
        if self.retransmit_cap < self.retransmit_base {
            bail!("retransmit-cap must be at least retransmit-base");
        }
        if self.max_attempts == 0 {
            bail!("max-attempts must be at least 1");
        }
        self.hello_macaddr()?;
        if let Some(id) = &self.local_id {
            parse_local_id(id)?;
        }
        Ok(())
    }

    pub fn hello_macaddr(&self) -> Result<MacAddr> {
        let mac: MacAddr = self
            .hello_multicast_macaddr
            .parse()
            .with_context(|| format!("bad hello-multicast-macaddr {:?}", self.hello_multicast_macaddr))?;
        if !mac.is_multicast() {
            bail!("hello-multicast-macaddr {mac} is not a multicast address");
        }
        Ok(mac)
    }

    /// Resolve the 10-byte local id: configured value, else derived from
    /// `/etc/machine-id`, else random.
    pub fn resolve_local_id(&self) -> Result<[u8; 10]> {
        if let Some(text) = &self.local_id {
            return parse_local_id(text);
        }
        match fs::read_to_string("/etc/machine-id") {
            Ok(text) => {
                let bytes = hex::decode(text.trim())
                    .context("failed to decode /etc/machine-id as hex")?;
                if bytes.len() < 10 {
                    bail!("/etc/machine-id too short to derive a local id");
                }
                Ok(bytes[..10].try_into().unwrap())
            }
            Err(e) => {
                log::warn!("no local-id configured and /etc/machine-id unreadable ({e}); using a random id");
                Ok(rand::random())
            }
        }
    }

    /// Whether the daemon should run on the named interface.
    pub fn interface_allowed(&self, name: &str, loopback: bool) -> bool {
        if loopback && !self.include_loopback {
            return false;
        }
        self.interfaces.is_empty() || self.interfaces.iter().any(|i| i == name)
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::from_secs_f64(self.hello_interval)
    }
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs_f64(self.keepalive_interval)
    }
    pub fn hold_time(&self) -> Duration {
        Duration::from_secs_f64(self.hold_time)
    }
    pub fn retransmit_base(&self) -> Duration {
        Duration::from_secs_f64(self.retransmit_base)
    }
    pub fn retransmit_cap(&self) -> Duration {
        Duration::from_secs_f64(self.retransmit_cap)
    }
    pub fn reassembly_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.reassembly_ttl)
    }
    pub fn mac_cache_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.mac_cache_timeout)
    }
}

fn parse_local_id(text: &str) -> Result<[u8; 10]> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | ' '))
        .collect();
    let bytes = hex::decode(&cleaned).with_context(|| format!("bad local-id {text:?}"))?;
    if bytes.len() != 10 {
        bail!("local-id must be 10 bytes, got {}", bytes.len());
    }
    Ok(bytes.try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.ethertype, 0x88B5);
        assert_eq!(config.hello_interval(), Duration::from_secs(15));
        assert_eq!(config.keepalive_interval(), Duration::from_secs(10));
        assert_eq!(config.hold_time(), Duration::from_secs(40));
        assert_eq!(config.hello_macaddr().unwrap(), HELLO_MACADDR_DEFAULT);
        assert!(!config.include_loopback);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [lsoe]
            local-id = "00:01:02:03:04:05:06:07:08:09"
            ethertype = 0x8886
            hello-multicast-macaddr = "01-80-C2-00-00-03"
            hello-interval = 5.0
            keepalive-interval = 2.0
            hold-time = 9.0
            retransmit-base = 0.5
            retransmit-cap = 8.0
            max-attempts = 3
            reassembly-ttl = 2.5
            report-rfc7752-url = "http://127.0.0.1:8080/push"
            interfaces = ["eth0", "eth1"]
        "#;
        let parsed: ConfigFile = toml::from_str(toml).unwrap();
        let config = parsed.lsoe;
        config.validate().unwrap();
        assert_eq!(config.ethertype, 0x8886);
        assert_eq!(
            config.resolve_local_id().unwrap(),
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]
        );
        assert!(config.interface_allowed("eth0", false));
        assert!(!config.interface_allowed("eth2", false));
    }

    #[test]
    fn test_loopback_excluded_by_default() {
        let config = Config::default();
        assert!(config.interface_allowed("eth0", false));
        assert!(!config.interface_allowed("lo", true));

        let config = Config {
            include_loopback: true,
            ..Config::default()
        };
        assert!(config.interface_allowed("lo", true));
    }

    #[test]
    fn test_validation_failures() {
        let config = Config {
            hold_time: 5.0,
            keepalive_interval: 10.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            retransmit_cap: 0.1,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_attempts: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            hello_multicast_macaddr: "02:00:00:00:00:01".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            local_id: Some("0102".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let toml = r#"
            [lsoe]
            no-such-option = true
        "#;
        assert!(toml::from_str::<ConfigFile>(toml).is_err());
    }
}
