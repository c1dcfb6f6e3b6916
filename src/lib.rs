// SPDX-License-Identifier: Apache-2.0 OR MIT
//! mgproxy: an IGMP/MLD group-membership proxy.
//!
//! The proxy acts as a multicast host toward one upstream network and as a
//! querier toward any number of downstream networks, keeping a kernel
//! multicast routing table in sync so traffic for wanted groups flows from
//! upstream to exactly the downstream interfaces that asked for it.
//!
//! Each kernel routing table is driven by one [`proxy::ProxyInstance`]: a
//! message-driven engine fed by packet readers, the shared
//! [`timing::TimingService`], and the orchestrator, all through a single
//! ordered queue.

use std::collections::BTreeSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod kernel;
pub mod logging;
pub mod orchestrator;
pub mod protocols;
pub mod proxy;
pub mod shutdown;
pub mod timing;

/// Kernel multicast routing table identifier. One proxy instance per table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RouteTableId(pub u32);

impl std::fmt::Display for RouteTableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "table {}", self.0)
    }
}

/// Virtual-interface slot inside one kernel routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vif(pub u16);

impl std::fmt::Display for Vif {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vif {}", self.0)
    }
}

/// One kernel forwarding-cache entry, derived from membership state.
///
/// `source` is `None` for a wildcard (any-source) entry. Entries are value
/// objects: the instance recomputes the full desired set after every state
/// change and diffs it against what is applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForwardingEntry {
    pub group: IpAddr,
    pub source: Option<IpAddr>,
    pub input: Vif,
    pub outputs: BTreeSet<Vif>,
}

impl std::fmt::Display for ForwardingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.source {
            Some(source) => write!(f, "({}, {})", source, self.group)?,
            None => write!(f, "(*, {})", self.group)?,
        }
        write!(f, " in={}", self.input.0)?;
        let outputs: Vec<String> = self.outputs.iter().map(|v| v.0.to_string()).collect();
        write!(f, " out=[{}]", outputs.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_entry_display() {
        let entry = ForwardingEntry {
            group: "239.1.1.1".parse().unwrap(),
            source: None,
            input: Vif(0),
            outputs: [Vif(1), Vif(2)].into_iter().collect(),
        };
        assert_eq!(format!("{}", entry), "(*, 239.1.1.1) in=0 out=[1,2]");

        let entry = ForwardingEntry {
            source: Some("10.0.0.5".parse().unwrap()),
            ..entry
        };
        assert_eq!(
            format!("{}", entry),
            "(10.0.0.5, 239.1.1.1) in=0 out=[1,2]"
        );
    }
}
