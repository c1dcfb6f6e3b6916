// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration file types and parsing for mgproxyd.
//!
//! JSON5 configuration format supporting comments and trailing commas:
//!
//! ```json5
//! {
//!     protocol: "igmp",
//!     instances: [
//!         { table: 0, upstream: "eth0", downstreams: ["eth1", "eth2"] },
//!     ],
//!     timers: { query_interval: 125, robustness: 2 },
//! }
//! ```
//!
//! Configuration is read once at startup; runtime reconfiguration arrives
//! at the instances as discrete add/del messages, never by re-parsing.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocols::{ProtocolFamily, QuerierConfig};
use crate::RouteTableId;

/// Startup configuration (JSON5 file format).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Membership protocol family for every instance.
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolFamily,

    /// One entry per kernel routing table.
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    /// Protocol timer overrides. Anything unset keeps the RFC default.
    #[serde(default)]
    pub timers: TimerConfig,
}

fn default_protocol() -> ProtocolFamily {
    ProtocolFamily::Igmp
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            instances: Vec::new(),
            timers: TimerConfig::default(),
        }
    }
}

/// One proxy instance: an upstream interface and its downstream set,
/// bound to a kernel routing table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    /// Kernel routing table id. Defaults to table 0.
    #[serde(default)]
    pub table: u32,

    /// Interface facing the multicast source network.
    pub upstream: String,

    /// Interfaces facing receiver networks.
    pub downstreams: Vec<String>,
}

impl InstanceConfig {
    pub fn table_id(&self) -> RouteTableId {
        RouteTableId(self.table)
    }
}

/// Timer overrides, in whole seconds except where noted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_response_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robustness: Option<u8>,
    /// Tenths of a second; last-member queries are sub-second affairs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_member_query_interval_tenths: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_member_query_count: Option<u8>,
}

impl TimerConfig {
    /// Materialize the protocol parameter set, filling gaps with the RFC
    /// defaults and deriving the startup values.
    pub fn querier_config(&self) -> QuerierConfig {
        let defaults = QuerierConfig::default();
        let query_interval = self
            .query_interval
            .map(Duration::from_secs)
            .unwrap_or(defaults.query_interval);
        let robustness = self.robustness.unwrap_or(defaults.robustness);
        QuerierConfig {
            query_interval,
            query_response_interval: self
                .query_response_interval
                .map(Duration::from_secs)
                .unwrap_or(defaults.query_response_interval),
            robustness,
            startup_query_count: robustness,
            startup_query_interval: query_interval / 4,
            last_member_query_interval: self
                .last_member_query_interval_tenths
                .map(|t| Duration::from_millis(t * 100))
                .unwrap_or(defaults.last_member_query_interval),
            last_member_query_count: self.last_member_query_count.unwrap_or(robustness),
            unsolicited_report_interval: defaults.unsolicited_report_interval,
        }
    }
}

/// Configuration errors. All of these are startup failures; (c)-class
/// per-instance inconsistencies are reported against the named table so
/// the orchestrator can skip just that instance.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("no proxy instances configured")]
    NoInstances,

    #[error("table {table}: invalid interface name '{name}': {reason}")]
    InvalidInterfaceName {
        table: u32,
        name: String,
        reason: String,
    },

    #[error("table {table}: upstream '{name}' is also listed downstream")]
    UpstreamIsDownstream { table: u32, name: String },

    #[error("table {table}: no downstream interfaces")]
    NoDownstreams { table: u32 },

    #[error("table {table} configured twice")]
    DuplicateTable { table: u32 },

    #[error("interface '{name}' claimed by tables {first} and {second}")]
    InterfaceReuse {
        name: String,
        first: u32,
        second: u32,
    },

    #[error("robustness must be at least 1")]
    ZeroRobustness,
}

impl Config {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize for display. JSON5 accepts plain JSON, so pretty JSON out
    /// and JSON5 in keeps round-trips working.
    pub fn to_json5(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Validate the whole file: global checks plus every instance.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_global()?;
        for instance in &self.instances {
            instance.validate()?;
        }
        Ok(())
    }

    /// Cross-instance checks only. Per-instance inconsistencies are left to
    /// [`InstanceConfig::validate`] so a bad instance can be skipped while
    /// the rest of the process continues.
    pub fn validate_global(&self) -> Result<(), ConfigError> {
        if self.instances.is_empty() {
            return Err(ConfigError::NoInstances);
        }
        if self.timers.robustness == Some(0) {
            return Err(ConfigError::ZeroRobustness);
        }

        let mut seen_tables: HashSet<u32> = HashSet::new();
        let mut claimed: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();

        for instance in &self.instances {
            if !seen_tables.insert(instance.table) {
                return Err(ConfigError::DuplicateTable {
                    table: instance.table,
                });
            }
            for name in std::iter::once(&instance.upstream).chain(instance.downstreams.iter()) {
                if let Some(first) = claimed.insert(name.as_str(), instance.table) {
                    if first != instance.table {
                        return Err(ConfigError::InterfaceReuse {
                            name: name.clone(),
                            first,
                            second: instance.table,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

impl InstanceConfig {
    /// Instance-local consistency checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_interface_name(self.table, &self.upstream)?;
        for name in &self.downstreams {
            validate_interface_name(self.table, name)?;
        }
        if self.downstreams.is_empty() {
            return Err(ConfigError::NoDownstreams { table: self.table });
        }
        if self.downstreams.contains(&self.upstream) {
            return Err(ConfigError::UpstreamIsDownstream {
                table: self.table,
                name: self.upstream.clone(),
            });
        }
        Ok(())
    }
}

/// Maximum interface name length (Linux IFNAMSIZ - 1).
const MAX_INTERFACE_NAME_LEN: usize = 15;

fn validate_interface_name(table: u32, name: &str) -> Result<(), ConfigError> {
    let fail = |reason: &str| ConfigError::InvalidInterfaceName {
        table,
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(fail("interface name cannot be empty"));
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(fail("interface name too long (max 15 chars)"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(fail("interface name contains invalid characters"));
    }
    if name.chars().next().map(|c| c.is_ascii_digit()) == Some(true) {
        return Err(fail("interface name cannot start with a digit"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"{
            instances: [
                { upstream: "eth0", downstreams: ["eth1"] },
            ],
        }"#
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::parse(minimal()).unwrap();
        assert_eq!(config.protocol, ProtocolFamily::Igmp);
        assert_eq!(config.instances.len(), 1);
        assert_eq!(config.instances[0].table, 0);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"{
            // proxy both tables
            protocol: "mld",
            instances: [
                { table: 1, upstream: "wan0", downstreams: ["lan0", "lan1"] },
                { table: 2, upstream: "wan1", downstreams: ["lan2"] },
            ],
            timers: { query_interval: 60, robustness: 3 },
        }"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.protocol, ProtocolFamily::Mld);
        assert_eq!(config.instances.len(), 2);

        let querier = config.timers.querier_config();
        assert_eq!(querier.query_interval, Duration::from_secs(60));
        assert_eq!(querier.robustness, 3);
        assert_eq!(querier.startup_query_count, 3);
        assert_eq!(querier.startup_query_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_timer_defaults_fill_gaps() {
        let config = Config::parse(minimal()).unwrap();
        let querier = config.timers.querier_config();
        assert_eq!(querier.query_interval, Duration::from_secs(125));
        assert_eq!(querier.group_membership_interval(), Duration::from_secs(260));
    }

    #[test]
    fn test_empty_config_fails_validation() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.validate(), Err(ConfigError::NoInstances));
    }

    #[test]
    fn test_upstream_in_downstreams_rejected() {
        let config = Config::parse(
            r#"{ instances: [ { upstream: "eth0", downstreams: ["eth0", "eth1"] } ] }"#,
        )
        .unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UpstreamIsDownstream {
                table: 0,
                name: "eth0".to_string()
            })
        );
    }

    #[test]
    fn test_no_downstreams_rejected() {
        let config =
            Config::parse(r#"{ instances: [ { upstream: "eth0", downstreams: [] } ] }"#).unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::NoDownstreams { table: 0 })
        );
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let config = Config::parse(
            r#"{ instances: [
                { table: 3, upstream: "eth0", downstreams: ["eth1"] },
                { table: 3, upstream: "eth2", downstreams: ["eth3"] },
            ] }"#,
        )
        .unwrap();
        assert_eq!(config.validate(), Err(ConfigError::DuplicateTable { table: 3 }));
    }

    #[test]
    fn test_interface_reuse_across_tables_rejected() {
        let config = Config::parse(
            r#"{ instances: [
                { table: 1, upstream: "eth0", downstreams: ["eth1"] },
                { table: 2, upstream: "eth2", downstreams: ["eth1"] },
            ] }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InterfaceReuse { .. })
        ));
    }

    #[test]
    fn test_bad_interface_names_rejected() {
        for bad in ["", "0eth", "way-too-long-interface-name", "eth$0"] {
            let config = Config {
                instances: vec![InstanceConfig {
                    table: 0,
                    upstream: bad.to_string(),
                    downstreams: vec!["eth1".to_string()],
                }],
                ..Default::default()
            };
            assert!(
                matches!(
                    config.validate(),
                    Err(ConfigError::InvalidInterfaceName { .. })
                ),
                "expected rejection for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_roundtrip_through_json5() {
        let config = Config::parse(minimal()).unwrap();
        let reparsed = Config::parse(&config.to_json5()).unwrap();
        assert_eq!(config, reparsed);
    }
}
