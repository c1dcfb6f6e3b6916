// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Wire codecs for the two group-membership protocol families.
//!
//! The proxy speaks IGMP on IPv4 interfaces and MLD on IPv6 interfaces.
//! Both families are decoded into the same semantic [`MembershipEvent`] so
//! the querier and host state machines stay family-neutral; only the codecs
//! in [`igmp`] and [`mld`] know about wire layouts.
//!
//! ## Message types handled
//!
//! | Family | Message | Handling |
//! |--------|---------|----------|
//! | IGMP | Membership Query (0x11, v2 and v3 layout) | querier election / report |
//! | IGMP | V2 Membership Report (0x16) | wildcard join |
//! | IGMP | Leave Group (0x17) | leave |
//! | IGMP | V3 Membership Report (0x22) | source-filter records |
//! | MLD | Query (130) | querier election / report |
//! | MLD | V1 Report (131) | wildcard join |
//! | MLD | Done (132) | leave |
//! | MLD | V2 Report (143) | source-filter records |
//!
//! V1-style reports are accepted for compatibility and treated as a join
//! with no source restriction.

pub mod igmp;
pub mod mld;

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The two membership protocol families an interface can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    /// IPv4 / IGMP
    Igmp,
    /// IPv6 / MLD
    Mld,
}

impl ProtocolFamily {
    /// Whether an address belongs to this family.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (ProtocolFamily::Igmp, IpAddr::V4(_)) | (ProtocolFamily::Mld, IpAddr::V6(_))
        )
    }

    /// Destination for general queries (all hosts / all nodes).
    pub fn all_hosts(&self) -> IpAddr {
        match self {
            ProtocolFamily::Igmp => IpAddr::V4(igmp::ALL_HOSTS_GROUP),
            ProtocolFamily::Mld => IpAddr::V6(mld::ALL_NODES_GROUP),
        }
    }

    /// Destination for membership reports sent in the host role.
    pub fn report_destination(&self) -> IpAddr {
        match self {
            ProtocolFamily::Igmp => IpAddr::V4(igmp::V3_REPORT_GROUP),
            ProtocolFamily::Mld => IpAddr::V6(mld::V2_REPORT_GROUP),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolFamily::Igmp => "IGMP",
            ProtocolFamily::Mld => "MLD",
        }
    }
}

impl std::fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Receiver source-filter mode (RFC 3376 / RFC 3810).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Traffic wanted only from the listed sources.
    Include,
    /// Traffic wanted from all but the listed sources.
    Exclude,
}

impl std::fmt::Display for FilterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterMode::Include => write!(f, "INCLUDE"),
            FilterMode::Exclude => write!(f, "EXCLUDE"),
        }
    }
}

/// Group record types carried in v3-style reports (RFC 3376 section 4.2.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    ModeIsInclude,
    ModeIsExclude,
    ChangeToInclude,
    ChangeToExclude,
    AllowNewSources,
    BlockOldSources,
}

impl RecordType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(RecordType::ModeIsInclude),
            0x02 => Some(RecordType::ModeIsExclude),
            0x03 => Some(RecordType::ChangeToInclude),
            0x04 => Some(RecordType::ChangeToExclude),
            0x05 => Some(RecordType::AllowNewSources),
            0x06 => Some(RecordType::BlockOldSources),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            RecordType::ModeIsInclude => 0x01,
            RecordType::ModeIsExclude => 0x02,
            RecordType::ChangeToInclude => 0x03,
            RecordType::ChangeToExclude => 0x04,
            RecordType::AllowNewSources => 0x05,
            RecordType::BlockOldSources => 0x06,
        }
    }
}

/// One group record from a membership report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    pub record_type: RecordType,
    pub group: IpAddr,
    pub sources: Vec<IpAddr>,
}

/// A membership protocol message decoded to its semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Membership query. `group` is None for a general query.
    Query {
        src: IpAddr,
        group: Option<IpAddr>,
        sources: Vec<IpAddr>,
    },
    /// Membership report carrying one or more group records.
    Report {
        src: IpAddr,
        records: Vec<ReportRecord>,
    },
    /// Explicit leave (IGMPv2 Leave Group / MLDv1 Done).
    Leave { src: IpAddr, group: IpAddr },
}

/// Packet decoding failures. All of these result in a logged drop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("unknown group record type {0:#04x}")]
    UnknownRecordType(u8),

    #[error("source address family does not match {family} interface")]
    FamilyMismatch { family: ProtocolFamily },

    #[error("group address {0} is not multicast")]
    NotMulticast(IpAddr),
}

/// Decode a raw membership protocol payload for the given family.
///
/// `src` is the network-layer source address of the packet; the caller has
/// already stripped the IP header.
pub fn parse_packet(
    family: ProtocolFamily,
    src: IpAddr,
    data: &[u8],
) -> Result<MembershipEvent, PacketError> {
    if !family.contains(&src) {
        return Err(PacketError::FamilyMismatch { family });
    }
    match family {
        ProtocolFamily::Igmp => igmp::parse(src, data),
        ProtocolFamily::Mld => mld::parse(src, data),
    }
}

/// Common trait for protocol packet builders.
pub trait PacketBuilder {
    /// Build a packet for transmission.
    fn build(&self) -> Vec<u8>;

    /// RFC 1071 ones-complement checksum over `data`.
    fn calculate_checksum(&self, data: &[u8]) -> u16 {
        rfc1071_checksum(data)
    }
}

/// RFC 1071 ones-complement checksum.
///
/// Over a packet whose checksum field is zeroed this produces the value to
/// store; over a packet with a valid stored checksum it produces zero.
pub(crate) fn rfc1071_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for i in (0..data.len()).step_by(2) {
        if i + 1 < data.len() {
            let word = u16::from_be_bytes([data[i], data[i + 1]]);
            sum = sum.wrapping_add(word as u32);
        } else {
            sum = sum.wrapping_add((data[i] as u32) << 8);
        }
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Timer parameters of the membership protocol, per interface.
///
/// Defaults follow RFC 3376 section 8 (identical values in RFC 3810 for
/// MLD). The state machines treat every one of these as a parameter; the
/// values can be overridden from configuration to support both families and
/// tuned deployments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerierConfig {
    /// Time between general queries when we are the querier.
    pub query_interval: Duration,
    /// Maximum response time advertised in general queries.
    pub query_response_interval: Duration,
    /// Expected packet-loss tolerance (retransmission count).
    pub robustness: u8,
    /// Number of general queries sent on startup, at the startup interval.
    pub startup_query_count: u8,
    /// Interval between startup general queries.
    pub startup_query_interval: Duration,
    /// Interval between group-specific queries after a leave.
    pub last_member_query_interval: Duration,
    /// Number of group-specific queries sent after a leave.
    pub last_member_query_count: u8,
    /// Delay between unsolicited host-role report retransmissions.
    pub unsolicited_report_interval: Duration,
}

pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(125);
pub const DEFAULT_QUERY_RESPONSE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_ROBUSTNESS: u8 = 2;
pub const DEFAULT_LAST_MEMBER_QUERY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_UNSOLICITED_REPORT_INTERVAL: Duration = Duration::from_secs(1);

impl Default for QuerierConfig {
    fn default() -> Self {
        Self {
            query_interval: DEFAULT_QUERY_INTERVAL,
            query_response_interval: DEFAULT_QUERY_RESPONSE_INTERVAL,
            robustness: DEFAULT_ROBUSTNESS,
            // Startup values derive from the base values (RFC 3376 8.6/8.7).
            startup_query_count: DEFAULT_ROBUSTNESS,
            startup_query_interval: Duration::from_secs(125 / 4),
            last_member_query_interval: DEFAULT_LAST_MEMBER_QUERY_INTERVAL,
            last_member_query_count: DEFAULT_ROBUSTNESS,
            unsolicited_report_interval: DEFAULT_UNSOLICITED_REPORT_INTERVAL,
        }
    }
}

impl QuerierConfig {
    /// Group Membership Interval: how long membership stays valid without a
    /// refresh. GMI = robustness * query_interval + query_response_interval.
    pub fn group_membership_interval(&self) -> Duration {
        self.query_interval * self.robustness as u32 + self.query_response_interval
    }

    /// Other Querier Present Interval: how long after hearing a lower
    /// address querier before we reclaim the role.
    pub fn other_querier_present_interval(&self) -> Duration {
        self.query_interval * self.robustness as u32 + self.query_response_interval / 2
    }

    /// Time a group stays in the checking state after the last group
    /// specific query before membership is declared gone.
    pub fn last_member_query_time(&self) -> Duration {
        self.last_member_query_interval * self.last_member_query_count as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_intervals() {
        let config = QuerierConfig::default();
        assert_eq!(config.query_interval, Duration::from_secs(125));
        assert_eq!(config.robustness, 2);
        // GMI = 2*125 + 10 = 260s
        assert_eq!(
            config.group_membership_interval(),
            Duration::from_secs(260)
        );
        // OQPI = 2*125 + 5 = 255s
        assert_eq!(
            config.other_querier_present_interval(),
            Duration::from_secs(255)
        );
    }

    #[test]
    fn test_family_contains() {
        let v4: IpAddr = "239.1.1.1".parse().unwrap();
        let v6: IpAddr = "ff05::1".parse().unwrap();
        assert!(ProtocolFamily::Igmp.contains(&v4));
        assert!(!ProtocolFamily::Igmp.contains(&v6));
        assert!(ProtocolFamily::Mld.contains(&v6));
        assert!(!ProtocolFamily::Mld.contains(&v4));
    }

    #[test]
    fn test_record_type_roundtrip() {
        for value in 1..=6u8 {
            let rt = RecordType::from_u8(value).unwrap();
            assert_eq!(rt.as_u8(), value);
        }
        assert_eq!(RecordType::from_u8(0), None);
        assert_eq!(RecordType::from_u8(7), None);
    }

    #[test]
    fn test_parse_rejects_family_mismatch() {
        let err = parse_packet(
            ProtocolFamily::Igmp,
            "fe80::1".parse().unwrap(),
            &[0x16, 0, 0, 0, 239, 1, 1, 1],
        )
        .unwrap_err();
        assert!(matches!(err, PacketError::FamilyMismatch { .. }));
    }
}
