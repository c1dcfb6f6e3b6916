// SPDX-License-Identifier: Apache-2.0 OR MIT
//! MLD wire codec (RFC 2710 / RFC 3810).
//!
//! MLD rides on ICMPv6. The checksum covers an IPv6 pseudo-header, and the
//! kernel both verifies it on receive and fills it on send for raw ICMPv6
//! sockets with `IPV6_CHECKSUM` set, so this codec leaves the field zero
//! and does not re-verify it.

use std::net::{IpAddr, Ipv6Addr};

use super::{MembershipEvent, PacketBuilder, PacketError, RecordType, ReportRecord};

// ICMPv6 types used by MLD
pub const MLD_QUERY: u8 = 130;
pub const MLD_V1_REPORT: u8 = 131;
pub const MLD_V1_DONE: u8 = 132;
pub const MLD_V2_REPORT: u8 = 143;

/// All nodes on the link (ff02::1), general query destination.
pub const ALL_NODES_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// All routers on the link (ff02::2), Done destination.
pub const ALL_ROUTERS_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// All MLDv2-capable routers (ff02::16), v2 report destination.
pub const V2_REPORT_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x16);

const V1_LEN: usize = 24;
const V2_QUERY_LEN: usize = 28;
const V2_REPORT_HEADER_LEN: usize = 8;
const GROUP_RECORD_HEADER_LEN: usize = 20;

/// Parse an MLD payload (ICMPv6 message body, header included).
pub fn parse(src: IpAddr, data: &[u8]) -> Result<MembershipEvent, PacketError> {
    if data.len() < V2_REPORT_HEADER_LEN {
        return Err(PacketError::Truncated {
            expected: V2_REPORT_HEADER_LEN,
            actual: data.len(),
        });
    }

    match data[0] {
        MLD_QUERY => parse_query(src, data),
        MLD_V1_REPORT => {
            let group = read_group(data, 8)?;
            Ok(MembershipEvent::Report {
                src,
                records: vec![ReportRecord {
                    record_type: RecordType::ModeIsExclude,
                    group: IpAddr::V6(group),
                    sources: Vec::new(),
                }],
            })
        }
        MLD_V1_DONE => {
            let group = read_group(data, 8)?;
            Ok(MembershipEvent::Leave {
                src,
                group: IpAddr::V6(group),
            })
        }
        MLD_V2_REPORT => parse_v2_report(src, data),
        other => Err(PacketError::UnknownType(other)),
    }
}

fn parse_query(src: IpAddr, data: &[u8]) -> Result<MembershipEvent, PacketError> {
    if data.len() < V1_LEN {
        return Err(PacketError::Truncated {
            expected: V1_LEN,
            actual: data.len(),
        });
    }

    let group_addr = read_addr(data, 8);
    let group = if group_addr.is_unspecified() {
        None
    } else if group_addr.is_multicast() {
        Some(IpAddr::V6(group_addr))
    } else {
        return Err(PacketError::NotMulticast(IpAddr::V6(group_addr)));
    };

    // 24 bytes is the v1 layout; v2 queries append QRV/QQIC and sources.
    let mut sources = Vec::new();
    if data.len() >= V2_QUERY_LEN {
        let num_sources = u16::from_be_bytes([data[26], data[27]]) as usize;
        let needed = V2_QUERY_LEN + num_sources * 16;
        if data.len() < needed {
            return Err(PacketError::Truncated {
                expected: needed,
                actual: data.len(),
            });
        }
        for i in 0..num_sources {
            sources.push(IpAddr::V6(read_addr(data, V2_QUERY_LEN + i * 16)));
        }
    }

    Ok(MembershipEvent::Query {
        src,
        group,
        sources,
    })
}

fn parse_v2_report(src: IpAddr, data: &[u8]) -> Result<MembershipEvent, PacketError> {
    let num_records = u16::from_be_bytes([data[6], data[7]]) as usize;
    let mut records = Vec::with_capacity(num_records);
    let mut off = V2_REPORT_HEADER_LEN;

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
        let record_end = sources_off + num_sources * 16 + aux_len;
        if data.len() < record_end {
            return Err(PacketError::Truncated {
                expected: record_end,
                actual: data.len(),
            });
        }

        let mut sources = Vec::with_capacity(num_sources);
        for i in 0..num_sources {
            sources.push(IpAddr::V6(read_addr(data, sources_off + i * 16)));
        }

        records.push(ReportRecord {
            record_type,
            group: IpAddr::V6(group),
            sources,
        });
        off = record_end;
    }

    Ok(MembershipEvent::Report { src, records })
}

fn read_addr(data: &[u8], off: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[off..off + 16]);
    Ipv6Addr::from(octets)
}

fn read_group(data: &[u8], off: usize) -> Result<Ipv6Addr, PacketError> {
    if data.len() < off + 16 {
        return Err(PacketError::Truncated {
            expected: off + 16,
            actual: data.len(),
        });
    }
    let group = read_addr(data, off);
    if !group.is_multicast() {
        return Err(PacketError::NotMulticast(IpAddr::V6(group)));
    }
    Ok(group)
}

/// Builder for MLDv2 Query packets.
#[derive(Debug)]
pub struct MldQueryBuilder {
    /// None for a general query.
    pub group: Option<Ipv6Addr>,
    pub sources: Vec<Ipv6Addr>,
    /// Max response delay in milliseconds.
    pub max_resp_ms: u16,
    pub robustness: u8,
    pub query_interval_secs: u32,
}

impl MldQueryBuilder {
    pub fn general(max_resp_ms: u16, robustness: u8, query_interval_secs: u32) -> Self {
        Self {
            group: None,
            sources: Vec::new(),
            max_resp_ms,
            robustness,
            query_interval_secs,
        }
    }

    pub fn group_specific(
        group: Ipv6Addr,
        max_resp_ms: u16,
        robustness: u8,
        query_interval_secs: u32,
    ) -> Self {
        Self {
            group: Some(group),
            sources: Vec::new(),
            max_resp_ms,
            robustness,
            query_interval_secs,
        }
    }
}

impl PacketBuilder for MldQueryBuilder {
    fn build(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(V2_QUERY_LEN + self.sources.len() * 16);

        packet.push(MLD_QUERY);
        packet.push(0); // code
        packet.extend_from_slice(&[0, 0]); // checksum, kernel fills
        packet.extend_from_slice(&self.max_resp_ms.to_be_bytes());
        packet.extend_from_slice(&[0, 0]); // reserved
        packet.extend_from_slice(&self.group.unwrap_or(Ipv6Addr::UNSPECIFIED).octets());
        packet.push(self.robustness & 0x07);
        packet.push(super::igmp::encode_code(self.query_interval_secs));
        packet.extend_from_slice(&(self.sources.len() as u16).to_be_bytes());
        for source in &self.sources {
            packet.extend_from_slice(&source.octets());
        }

        packet
    }
}

/// Builder for MLDv2 Report packets.
#[derive(Debug, Default)]
pub struct MldReportBuilder {
    pub records: Vec<(RecordType, Ipv6Addr, Vec<Ipv6Addr>)>,
}

impl MldReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        mut self,
        record_type: RecordType,
        group: Ipv6Addr,
        sources: Vec<Ipv6Addr>,
    ) -> Self {
        self.records.push((record_type, group, sources));
        self
    }
}

impl PacketBuilder for MldReportBuilder {
    fn build(&self) -> Vec<u8> {
        let mut packet = Vec::new();

        packet.push(MLD_V2_REPORT);
        packet.push(0); // reserved
        packet.extend_from_slice(&[0, 0]); // checksum, kernel fills
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

        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v6(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn src() -> IpAddr {
        "fe80::1".parse().unwrap()
    }

    #[test]
    fn test_parse_v1_report() {
        let mut data = vec![MLD_V1_REPORT, 0, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&v6("ff05::99").octets());
        let event = parse(src(), &data).unwrap();
        match event {
            MembershipEvent::Report { records, .. } => {
                assert_eq!(records[0].record_type, RecordType::ModeIsExclude);
                assert_eq!(records[0].group, IpAddr::V6(v6("ff05::99")));
            }
            other => panic!("expected report, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_done() {
        let mut data = vec![MLD_V1_DONE, 0, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&v6("ff05::99").octets());
        let event = parse(src(), &data).unwrap();
        assert_eq!(
            event,
            MembershipEvent::Leave {
                src: src(),
                group: IpAddr::V6(v6("ff05::99")),
            }
        );
    }

    #[test]
    fn test_parse_general_query() {
        let data = MldQueryBuilder::general(10_000, 2, 125).build();
        let event = parse(src(), &data).unwrap();
        match event {
            MembershipEvent::Query { group, sources, .. } => {
                assert_eq!(group, None);
                assert!(sources.is_empty());
            }
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_v2_report_with_sources() {
        let packet = MldReportBuilder::new()
            .record(
                RecordType::ChangeToInclude,
                v6("ff05::1"),
                vec![v6("2001:db8::5")],
            )
            .build();
        let event = parse(src(), &packet).unwrap();
        match event {
            MembershipEvent::Report { records, .. } => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].record_type, RecordType::ChangeToInclude);
                assert_eq!(records[0].sources, vec![IpAddr::V6(v6("2001:db8::5"))]);
            }
            other => panic!("expected report, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_non_multicast_group() {
        let mut data = vec![MLD_V1_REPORT, 0, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&v6("2001:db8::1").octets());
        let err = parse(src(), &data).unwrap_err();
        assert!(matches!(err, PacketError::NotMulticast(_)));
    }

    #[test]
    fn test_parse_rejects_truncated_record() {
        // Claims one record but carries no record body.
        let data = vec![MLD_V2_REPORT, 0, 0, 0, 0, 0, 0, 1];
        let err = parse(src(), &data).unwrap_err();
        assert!(matches!(err, PacketError::Truncated { .. }));
    }
}
