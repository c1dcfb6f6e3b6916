// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Upstream host-role advertisement.
//!
//! Toward the upstream network the proxy behaves as an ordinary multicast
//! host whose membership equals the union of everything the downstream
//! tables want. Any change to that union is advertised with a state-change
//! report, retransmitted robustness-many times, and queries from the
//! upstream querier are answered with current-state reports.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::protocols::{QuerierConfig, RecordType};
use crate::Vif;

use super::membership::FilterState;
use super::message::InterfaceSpec;

/// Report records as (type, group, sources) triples, family-neutral.
pub type ReportRecords = Vec<(RecordType, IpAddr, Vec<IpAddr>)>;

/// Timers owned by the upstream role.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpstreamTimer {
    /// Unsolicited retransmission of the last state-change report.
    Readvertise,
    /// Periodic current-state refresh, so membership survives an upstream
    /// querier that never asks.
    PeriodicRefresh,
}

/// Side effects requested by the upstream role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAction {
    Schedule { timer: UpstreamTimer, delay: Duration },
    SendReport { records: ReportRecords },
    /// Kernel-level join so the interface accepts the group's traffic.
    JoinGroup(IpAddr),
    LeaveGroup(IpAddr),
}

/// Host-role state for the upstream interface.
#[derive(Debug)]
pub struct UpstreamState {
    pub iface: InterfaceSpec,
    pub vif: Vif,
    config: QuerierConfig,
    /// The union most recently advertised upstream.
    advertised: BTreeMap<IpAddr, FilterState>,
    /// State-change records pending retransmission.
    pending: ReportRecords,
    retransmits_left: u8,
}

impl UpstreamState {
    pub fn new(iface: InterfaceSpec, vif: Vif, config: QuerierConfig) -> Self {
        Self {
            iface,
            vif,
            config,
            advertised: BTreeMap::new(),
            pending: Vec::new(),
            retransmits_left: 0,
        }
    }

    pub fn advertised(&self) -> &BTreeMap<IpAddr, FilterState> {
        &self.advertised
    }

    /// Bring the advertisement in line with a new downstream union.
    /// Produces nothing when the union is unchanged.
    pub fn sync(&mut self, union: &BTreeMap<IpAddr, FilterState>) -> Vec<UpstreamAction> {
        if *union == self.advertised {
            return Vec::new();
        }

        let mut actions = Vec::new();
        let mut records: ReportRecords = Vec::new();

        for (group, filter) in union {
            if self.advertised.get(group) != Some(filter) {
                if !self.advertised.contains_key(group) {
                    actions.push(UpstreamAction::JoinGroup(*group));
                }
                records.push(filter_change_record(*group, filter));
            }
        }
        for group in self.advertised.keys() {
            if !union.contains_key(group) {
                // Gone entirely: advertise the empty INCLUDE and release
                // the kernel join.
                records.push((RecordType::ChangeToInclude, *group, Vec::new()));
                actions.push(UpstreamAction::LeaveGroup(*group));
            }
        }

        self.pending = records.clone();
        self.retransmits_left = self.config.robustness.saturating_sub(1);
        actions.push(UpstreamAction::SendReport { records });
        if self.retransmits_left > 0 {
            actions.push(UpstreamAction::Schedule {
                timer: UpstreamTimer::Readvertise,
                delay: self.config.unsolicited_report_interval,
            });
        }
        if !union.is_empty() {
            // Re-arm the periodic refresh alongside every state change.
            actions.push(UpstreamAction::Schedule {
                timer: UpstreamTimer::PeriodicRefresh,
                delay: self.config.query_interval,
            });
        }

        self.advertised = union.clone();
        actions
    }

    /// Retransmission and refresh timers.
    pub fn handle_timer(&mut self, timer: &UpstreamTimer) -> Vec<UpstreamAction> {
        match timer {
            UpstreamTimer::Readvertise => {
                if self.retransmits_left == 0 || self.pending.is_empty() {
                    return Vec::new();
                }
                self.retransmits_left -= 1;
                let mut actions = vec![UpstreamAction::SendReport {
                    records: self.pending.clone(),
                }];
                if self.retransmits_left > 0 {
                    actions.push(UpstreamAction::Schedule {
                        timer: UpstreamTimer::Readvertise,
                        delay: self.config.unsolicited_report_interval,
                    });
                }
                actions
            }
            UpstreamTimer::PeriodicRefresh => {
                if self.advertised.is_empty() {
                    return Vec::new();
                }
                let mut actions = self.handle_query(None);
                actions.push(UpstreamAction::Schedule {
                    timer: UpstreamTimer::PeriodicRefresh,
                    delay: self.config.query_interval,
                });
                actions
            }
        }
    }

    /// Answer a query from the upstream querier with current state.
    pub fn handle_query(&self, group: Option<IpAddr>) -> Vec<UpstreamAction> {
        let records: ReportRecords = match group {
            Some(group) => match self.advertised.get(&group) {
                Some(filter) => vec![current_state_record(group, filter)],
                None => Vec::new(),
            },
            None => self
                .advertised
                .iter()
                .map(|(group, filter)| current_state_record(*group, filter))
                .collect(),
        };

        if records.is_empty() {
            Vec::new()
        } else {
            vec![UpstreamAction::SendReport { records }]
        }
    }
}

fn filter_change_record(group: IpAddr, filter: &FilterState) -> (RecordType, IpAddr, Vec<IpAddr>) {
    match filter {
        FilterState::Include { sources } => (
            RecordType::ChangeToInclude,
            group,
            sources.iter().copied().collect(),
        ),
        FilterState::Exclude { blocked } => (
            RecordType::ChangeToExclude,
            group,
            blocked.iter().copied().collect(),
        ),
    }
}

fn current_state_record(group: IpAddr, filter: &FilterState) -> (RecordType, IpAddr, Vec<IpAddr>) {
    match filter {
        FilterState::Include { sources } => (
            RecordType::ModeIsInclude,
            group,
            sources.iter().copied().collect(),
        ),
        FilterState::Exclude { blocked } => (
            RecordType::ModeIsExclude,
            group,
            blocked.iter().copied().collect(),
        ),
    }
}
