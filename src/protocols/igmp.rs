// SPDX-License-Identifier: Apache-2.0 OR MIT
//! IGMP wire codec (RFC 2236 / RFC 3376).
//!
//! Parses v2 and v3 messages into [`MembershipEvent`]s and builds the v3
//! queries and reports the proxy emits. The caller hands in the IGMP
//! payload with the IPv4 header already stripped.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use super::{
    rfc1071_checksum, MembershipEvent, PacketBuilder, PacketError, RecordType, ReportRecord,
};

// IGMP message types
pub const IGMP_MEMBERSHIP_QUERY: u8 = 0x11;
pub const IGMP_V1_MEMBERSHIP_REPORT: u8 = 0x12;
pub const IGMP_V2_MEMBERSHIP_REPORT: u8 = 0x16;
pub const IGMP_LEAVE_GROUP: u8 = 0x17;
pub const IGMP_V3_MEMBERSHIP_REPORT: u8 = 0x22;

/// All hosts on this subnet (224.0.0.1), general query destination.
pub const ALL_HOSTS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// All multicast routers (224.0.0.2), v2 Leave destination.
pub const ALL_ROUTERS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);

/// All IGMPv3-capable routers (224.0.0.22), v3 report destination.
pub const V3_REPORT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

const HEADER_LEN: usize = 8;
const V3_QUERY_LEN: usize = 12;
const V3_REPORT_HEADER_LEN: usize = 8;
const GROUP_RECORD_HEADER_LEN: usize = 8;

/// Parse an IGMP payload into its semantic event.
pub fn parse(src: IpAddr, data: &[u8]) -> Result<MembershipEvent, PacketError> {
    if data.len() < HEADER_LEN {
        return Err(PacketError::Truncated {
            expected: HEADER_LEN,
            actual: data.len(),
        });
    }

    // A packet with a valid stored checksum sums to zero.
    let residue = rfc1071_checksum(data);
    if residue != 0 {
        let stored = u16::from_be_bytes([data[2], data[3]]);
        return Err(PacketError::ChecksumMismatch {
            expected: stored.wrapping_add(residue),
            actual: stored,
        });
    }

    match data[0] {
        IGMP_MEMBERSHIP_QUERY => parse_query(src, data),
        IGMP_V1_MEMBERSHIP_REPORT | IGMP_V2_MEMBERSHIP_REPORT => {
            let group = read_group(data, 4)?;
            // A v1/v2 report is a join with no source restriction.
            Ok(MembershipEvent::Report {
                src,
                records: vec![ReportRecord {
                    record_type: RecordType::ModeIsExclude,
                    group: IpAddr::V4(group),
                    sources: Vec::new(),
                }],
            })
        }
        IGMP_LEAVE_GROUP => {
            let group = read_group(data, 4)?;
            Ok(MembershipEvent::Leave {
                src,
                group: IpAddr::V4(group),
            })
        }
        IGMP_V3_MEMBERSHIP_REPORT => parse_v3_report(src, data),
        other => Err(PacketError::UnknownType(other)),
    }
}

fn parse_query(src: IpAddr, data: &[u8]) -> Result<MembershipEvent, PacketError> {
    let group_addr = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
    let group = if group_addr.is_unspecified() {
        None
    } else if group_addr.is_multicast() {
        Some(IpAddr::V4(group_addr))
    } else {
        return Err(PacketError::NotMulticast(IpAddr::V4(group_addr)));
    };

    // 8 bytes is the v2 layout; v3 queries append QRV/QQIC and sources.
    let mut sources = Vec::new();
    if data.len() >= V3_QUERY_LEN {
        let num_sources = u16::from_be_bytes([data[10], data[11]]) as usize;
        let needed = V3_QUERY_LEN + num_sources * 4;
        if data.len() < needed {
            return Err(PacketError::Truncated {
                expected: needed,
                actual: data.len(),
            });
        }
        for i in 0..num_sources {
            let off = V3_QUERY_LEN + i * 4;
            sources.push(IpAddr::V4(Ipv4Addr::new(
                data[off],
                data[off + 1],
                data[off + 2],
                data[off + 3],
            )));
        }
    }

    Ok(MembershipEvent::Query {
        src,
        group,
        sources,
    })
}

fn parse_v3_report(src: IpAddr, data: &[u8]) -> Result<MembershipEvent, PacketError> {
    let num_records = u16::from_be_bytes([data[6], data[7]]) as usize;
    let mut records = Vec::with_capacity(num_records);
    let mut off = V3_REPORT_HEADER_LEN;

    for _ in 0..num_records {
        if data.len() < off + GROUP_RECORD_HEADER_LEN {
            return Err(PacketError::Truncated {
                expected: off + GROUP_RECORD_HEADER_LEN,
                actual: data.len(),
            });
        }
        let record_type =
            RecordType::from_u8(data[off]).ok_or(PacketError::UnknownRecordType(data[off]))?;
        let aux_len = data[off + 1] as usize * 4;
        let num_sources = u16::from_be_bytes([data[off + 2], data[off + 3]]) as usize;
        let group = read_group(data, off + 4)?;

        let sources_off = off + GROUP_RECORD_HEADER_LEN;
        let record_end = sources_off + num_sources * 4 + aux_len;
        if data.len() < record_end {
            return Err(PacketError::Truncated {
                expected: record_end,
                actual: data.len(),
            });
        }

        let mut sources = Vec::with_capacity(num_sources);
        for i in 0..num_sources {
            let s = sources_off + i * 4;
            sources.push(IpAddr::V4(Ipv4Addr::new(
                data[s],
                data[s + 1],
                data[s + 2],
                data[s + 3],
            )));
        }

        records.push(ReportRecord {
            record_type,
            group: IpAddr::V4(group),
            sources,
        });
        off = record_end;
    }

    Ok(MembershipEvent::Report { src, records })
}

fn read_group(data: &[u8], off: usize) -> Result<Ipv4Addr, PacketError> {
    let group = Ipv4Addr::new(data[off], data[off + 1], data[off + 2], data[off + 3]);
    if !group.is_multicast() {
        return Err(PacketError::NotMulticast(IpAddr::V4(group)));
    }
    Ok(group)
}

/// Encode a duration as a v3 Max Resp Code / QQIC byte (RFC 3376 4.1.1).
///
/// Values below 128 are literal; larger values use the exponent/mantissa
/// form and lose precision.
pub fn encode_code(value: u32) -> u8 {
    if value < 128 {
        value as u8
    } else {
        let mut exp = 0u32;
        let mut mant = value >> 3;
        while mant > 0x1F {
            mant >>= 1;
            exp += 1;
        }
        // Clamp at the largest representable value.
        if exp > 7 {
            0xFF
        } else {
            0x80 | ((exp as u8) << 4) | (mant as u8 & 0x0F)
        }
    }
}

/// Decode a v3 Max Resp Code byte to tenths of a second.
pub fn decode_max_resp_code(code: u8) -> Duration {
    let tenths = if code < 128 {
        code as u32
    } else {
        let mant = (code & 0x0F) as u32;
        let exp = ((code >> 4) & 0x07) as u32;
        (mant | 0x10) << (exp + 3)
    };
    Duration::from_millis(tenths as u64 * 100)
}

/// Builder for IGMPv3 Membership Query packets.
#[derive(Debug)]
pub struct IgmpQueryBuilder {
    /// None for a general query.
    pub group: Option<Ipv4Addr>,
    /// Sources for a group-and-source specific query.
    pub sources: Vec<Ipv4Addr>,
    /// Max response time in tenths of a second.
    pub max_resp_tenths: u32,
    /// Querier's robustness variable, advertised in QRV.
    pub robustness: u8,
    /// Querier's query interval in seconds, advertised as QQIC.
    pub query_interval_secs: u32,
}

impl IgmpQueryBuilder {
    pub fn general(max_resp_tenths: u32, robustness: u8, query_interval_secs: u32) -> Self {
        Self {
            group: None,
            sources: Vec::new(),
            max_resp_tenths,
            robustness,
            query_interval_secs,
        }
    }

    pub fn group_specific(
        group: Ipv4Addr,
        max_resp_tenths: u32,
        robustness: u8,
        query_interval_secs: u32,
    ) -> Self {
        Self {
            group: Some(group),
            sources: Vec::new(),
            max_resp_tenths,
            robustness,
            query_interval_secs,
        }
    }
}

impl PacketBuilder for IgmpQueryBuilder {
    fn build(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(V3_QUERY_LEN + self.sources.len() * 4);

        packet.push(IGMP_MEMBERSHIP_QUERY);
        packet.push(encode_code(self.max_resp_tenths));
        packet.extend_from_slice(&[0, 0]); // checksum placeholder
        packet.extend_from_slice(&self.group.unwrap_or(Ipv4Addr::UNSPECIFIED).octets());
        // Resv | S | QRV
        packet.push(self.robustness & 0x07);
        packet.push(encode_code(self.query_interval_secs));
        packet.extend_from_slice(&(self.sources.len() as u16).to_be_bytes());
        for source in &self.sources {
            packet.extend_from_slice(&source.octets());
        }

        let checksum = self.calculate_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
        packet
    }
}

/// Builder for IGMPv3 Membership Report packets.
#[derive(Debug, Default)]
pub struct IgmpReportBuilder {
    pub records: Vec<(RecordType, Ipv4Addr, Vec<Ipv4Addr>)>,
}

impl IgmpReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        mut self,
        record_type: RecordType,
        group: Ipv4Addr,
        sources: Vec<Ipv4Addr>,
    ) -> Self {
        self.records.push((record_type, group, sources));
        self
    }
}

impl PacketBuilder for IgmpReportBuilder {
    fn build(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(
            V3_REPORT_HEADER_LEN
                + self
                    .records
                    .iter()
                    .map(|(_, _, s)| GROUP_RECORD_HEADER_LEN + s.len() * 4)
                    .sum::<usize>(),
        );

        packet.push(IGMP_V3_MEMBERSHIP_REPORT);
        packet.push(0); // reserved
        packet.extend_from_slice(&[0, 0]); // checksum placeholder
        packet.extend_from_slice(&[0, 0]); // reserved
        packet.extend_from_slice(&(self.records.len() as u16).to_be_bytes());

        for (record_type, group, sources) in &self.records {
            packet.push(record_type.as_u8());
            packet.push(0); // aux data len
            packet.extend_from_slice(&(sources.len() as u16).to_be_bytes());
            packet.extend_from_slice(&group.octets());
            for source in sources {
                packet.extend_from_slice(&source.octets());
            }
        }

        let checksum = self.calculate_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn checksummed(mut packet: Vec<u8>) -> Vec<u8> {
        packet[2] = 0;
        packet[3] = 0;
        let sum = rfc1071_checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
        packet
    }

    #[test]
    fn test_parse_v2_general_query() {
        let data = checksummed(vec![0x11, 100, 0, 0, 0, 0, 0, 0]);
        let event = parse("192.168.1.1".parse().unwrap(), &data).unwrap();
        assert_eq!(
            event,
            MembershipEvent::Query {
                src: "192.168.1.1".parse().unwrap(),
                group: None,
                sources: vec![],
            }
        );
    }

    #[test]
    fn test_parse_v3_group_and_source_query() {
        let data = checksummed(vec![
            0x11, 100, 0, 0, 239, 1, 1, 1, 0x02, 125, 0, 1, 10, 0, 0, 5,
        ]);
        let event = parse("192.168.1.1".parse().unwrap(), &data).unwrap();
        match event {
            MembershipEvent::Query { group, sources, .. } => {
                assert_eq!(group, Some(IpAddr::V4(v4("239.1.1.1"))));
                assert_eq!(sources, vec![IpAddr::V4(v4("10.0.0.5"))]);
            }
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_v2_report_is_wildcard_join() {
        let data = checksummed(vec![0x16, 0, 0, 0, 239, 1, 1, 1]);
        let event = parse("192.168.1.100".parse().unwrap(), &data).unwrap();
        match event {
            MembershipEvent::Report { records, .. } => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].record_type, RecordType::ModeIsExclude);
                assert_eq!(records[0].group, IpAddr::V4(v4("239.1.1.1")));
                assert!(records[0].sources.is_empty());
            }
            other => panic!("expected report, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_leave() {
        let data = checksummed(vec![0x17, 0, 0, 0, 239, 1, 1, 1]);
        let event = parse("192.168.1.100".parse().unwrap(), &data).unwrap();
        assert_eq!(
            event,
            MembershipEvent::Leave {
                src: "192.168.1.100".parse().unwrap(),
                group: IpAddr::V4(v4("239.1.1.1")),
            }
        );
    }

    #[test]
    fn test_parse_v3_report_multiple_records() {
        let data = checksummed(vec![
            0x22, 0, 0, 0, 0, 0, 0, 2, // header, 2 records
            0x01, 0, 0, 1, 239, 1, 1, 1, 10, 0, 0, 1, // IS_IN {10.0.0.1}
            0x04, 0, 0, 0, 239, 2, 2, 2, // TO_EX {}
        ]);
        let event = parse("192.168.1.100".parse().unwrap(), &data).unwrap();
        match event {
            MembershipEvent::Report { records, .. } => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].record_type, RecordType::ModeIsInclude);
                assert_eq!(records[0].sources, vec![IpAddr::V4(v4("10.0.0.1"))]);
                assert_eq!(records[1].record_type, RecordType::ChangeToExclude);
                assert!(records[1].sources.is_empty());
            }
            other => panic!("expected report, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let mut data = checksummed(vec![0x16, 0, 0, 0, 239, 1, 1, 1]);
        data[3] ^= 0xFF;
        let err = parse("192.168.1.100".parse().unwrap(), &data).unwrap_err();
        assert!(matches!(err, PacketError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let err = parse("192.168.1.100".parse().unwrap(), &[0x16, 0, 0]).unwrap_err();
        assert!(matches!(err, PacketError::Truncated { .. }));
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let data = checksummed(vec![0x42, 0, 0, 0, 239, 1, 1, 1]);
        let err = parse("192.168.1.100".parse().unwrap(), &data).unwrap_err();
        assert_eq!(err, PacketError::UnknownType(0x42));
    }

    #[test]
    fn test_query_builder_output_parses() {
        let packet = IgmpQueryBuilder::group_specific(v4("239.2.2.2"), 10, 2, 125).build();
        let event = parse("192.168.1.1".parse().unwrap(), &packet).unwrap();
        match event {
            MembershipEvent::Query { group, .. } => {
                assert_eq!(group, Some(IpAddr::V4(v4("239.2.2.2"))));
            }
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_report_builder_output_parses() {
        let packet = IgmpReportBuilder::new()
            .record(RecordType::ModeIsExclude, v4("239.3.3.3"), vec![])
            .record(
                RecordType::ModeIsInclude,
                v4("239.4.4.4"),
                vec![v4("10.0.0.9")],
            )
            .build();
        assert_eq!(packet[0], IGMP_V3_MEMBERSHIP_REPORT);
        let event = parse("192.168.1.1".parse().unwrap(), &packet).unwrap();
        match event {
            MembershipEvent::Report { records, .. } => assert_eq!(records.len(), 2),
            other => panic!("expected report, got {:?}", other),
        }
    }

    #[test]
    fn test_max_resp_code_encoding() {
        assert_eq!(encode_code(100), 100);
        assert_eq!(decode_max_resp_code(100), Duration::from_secs(10));
        // Exponential range survives with bounded precision.
        let decoded = decode_max_resp_code(encode_code(1280));
        assert!(decoded >= Duration::from_secs(100) && decoded <= Duration::from_secs(140));
    }
}
