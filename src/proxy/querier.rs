// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Downstream querier state machine.
//!
//! Pure transition logic: every handler maps (current state, event) to a
//! new state plus a list of [`QuerierAction`]s, and reports whether the
//! interface's wanted-set changed. The proxy instance owns the side
//! effects: registering the timers, building packets, and recomputing
//! forwarding state when `changed` comes back true.
//!
//! Per group the protocol walks NO_MEMBERS (absent from the table),
//! MEMBERS_PRESENT, and CHECKING_MEMBERSHIP: a report creates or refreshes
//! membership, a leave or an expired member timer triggers specific
//! queries, and an unanswered last-member query removes the record.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use crate::protocols::{QuerierConfig, RecordType, ReportRecord};
use crate::Vif;

use super::membership::{FilterState, MembershipState, MembershipTable};
use super::message::InterfaceSpec;

/// Timers a downstream interface keeps with the timing service. One timer
/// per value; re-scheduling replaces the previous registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QuerierTimer {
    /// Periodic general query (we are querier).
    GeneralQuery,
    /// Initial query cycle at the shorter startup interval.
    StartupQuery,
    /// Another querier with a lower address holds the role.
    OtherQuerierPresent,
    /// Member timer for an EXCLUDE-mode group.
    GroupExpiry { group: IpAddr },
    /// Member timer for one INCLUDE-mode source.
    SourceExpiry { group: IpAddr, source: IpAddr },
    /// Retransmit timer for last-member specific queries.
    LastMemberQuery { group: IpAddr },
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerierAction {
    Schedule { timer: QuerierTimer, delay: Duration },
    Cancel { timer: QuerierTimer },
    SendGeneralQuery,
    SendGroupQuery {
        group: IpAddr,
        sources: Vec<IpAddr>,
    },
}

/// Querier-role state for one downstream interface.
#[derive(Debug)]
pub struct DownstreamState {
    pub iface: InterfaceSpec,
    pub vif: Vif,
    pub table: MembershipTable,
    config: QuerierConfig,
    /// We assume the querier role until a lower address shows up.
    is_querier: bool,
    other_querier: Option<IpAddr>,
    startup_queries_left: u8,
}

impl DownstreamState {
    pub fn new(iface: InterfaceSpec, vif: Vif, config: QuerierConfig) -> Self {
        Self {
            iface,
            vif,
            table: MembershipTable::new(),
            config,
            is_querier: true,
            other_querier: None,
            startup_queries_left: 0,
        }
    }

    pub fn is_querier(&self) -> bool {
        self.is_querier
    }

    pub fn other_querier(&self) -> Option<IpAddr> {
        self.other_querier
    }

    pub fn config(&self) -> &QuerierConfig {
        &self.config
    }

    /// Begin the initial query cycle: one general query now, the rest at
    /// the startup interval.
    pub fn start(&mut self) -> Vec<QuerierAction> {
        self.startup_queries_left = self.config.startup_query_count.saturating_sub(1);
        vec![
            QuerierAction::SendGeneralQuery,
            QuerierAction::Schedule {
                timer: QuerierTimer::StartupQuery,
                delay: self.config.startup_query_interval,
            },
        ]
    }

    /// Election on a received query: the lower source address wins.
    pub fn handle_query(&mut self, src: IpAddr) -> Vec<QuerierAction> {
        if src == self.iface.addr {
            return Vec::new();
        }
        if src < self.iface.addr {
            let was_querier = self.is_querier;
            self.is_querier = false;
            self.other_querier = Some(src);
            let mut actions = vec![QuerierAction::Schedule {
                timer: QuerierTimer::OtherQuerierPresent,
                delay: self.config.other_querier_present_interval(),
            }];
            if was_querier {
                actions.push(QuerierAction::Cancel {
                    timer: QuerierTimer::GeneralQuery,
                });
                actions.push(QuerierAction::Cancel {
                    timer: QuerierTimer::StartupQuery,
                });
            }
            actions
        } else {
            Vec::new()
        }
    }

    /// Apply one group record from a membership report. `src` is the
    /// reporting host's address.
    pub fn handle_report(
        &mut self,
        src: IpAddr,
        record: &ReportRecord,
    ) -> (bool, Vec<QuerierAction>) {
        let group = record.group;
        let reporter = Some(src);
        let reporter_sources: BTreeSet<IpAddr> = record.sources.iter().copied().collect();
        let gmi = self.config.group_membership_interval();
        let mut actions = Vec::new();

        let changed = match record.record_type {
            RecordType::ModeIsExclude | RecordType::ChangeToExclude => {
                let changed = self.table.set_exclude(group, reporter_sources, reporter);
                actions.push(QuerierAction::Cancel {
                    timer: QuerierTimer::LastMemberQuery { group },
                });
                actions.push(QuerierAction::Schedule {
                    timer: QuerierTimer::GroupExpiry { group },
                    delay: gmi,
                });
                changed
            }
            RecordType::ModeIsInclude | RecordType::AllowNewSources => {
                let changed = self.table.allow_sources(group, &record.sources, reporter);
                for source in &record.sources {
                    actions.push(QuerierAction::Schedule {
                        timer: QuerierTimer::SourceExpiry {
                            group,
                            source: *source,
                        },
                        delay: gmi,
                    });
                }
                // A report during checking means members remain.
                if let Some(rec) = self.table.get_mut(&group) {
                    if rec.state == MembershipState::Checking {
                        rec.state = MembershipState::MembersPresent;
                        rec.queries_left = 0;
                        actions.push(QuerierAction::Cancel {
                            timer: QuerierTimer::LastMemberQuery { group },
                        });
                        if matches!(rec.filter, FilterState::Exclude { .. }) {
                            actions.push(QuerierAction::Schedule {
                                timer: QuerierTimer::GroupExpiry { group },
                                delay: gmi,
                            });
                        }
                    }
                }
                changed
            }
            RecordType::ChangeToInclude => {
                if record.sources.is_empty() {
                    // TO_IN({}) is the v3 leave.
                    let (changed, mut leave_actions) = self.handle_leave(group);
                    actions.append(&mut leave_actions);
                    changed
                } else {
                    let changed = self.table.set_include(group, reporter_sources, reporter);
                    for source in &record.sources {
                        actions.push(QuerierAction::Schedule {
                            timer: QuerierTimer::SourceExpiry {
                                group,
                                source: *source,
                            },
                            delay: gmi,
                        });
                    }
                    actions.push(QuerierAction::Cancel {
                        timer: QuerierTimer::GroupExpiry { group },
                    });
                    changed
                }
            }
            RecordType::BlockOldSources => {
                let changed = self.table.block_sources(&group, &record.sources);
                if self.is_querier {
                    // Verify the blocked sources really have no listeners
                    // left: specific query plus shortened source timers.
                    let still_wanted: Vec<IpAddr> = record
                        .sources
                        .iter()
                        .filter(|s| {
                            self.table
                                .get(&group)
                                .is_some_and(|r| r.filter.wants(s))
                        })
                        .copied()
                        .collect();
                    if !still_wanted.is_empty() {
                        for source in &still_wanted {
                            actions.push(QuerierAction::Schedule {
                                timer: QuerierTimer::SourceExpiry {
                                    group,
                                    source: *source,
                                },
                                delay: self.config.last_member_query_time(),
                            });
                        }
                        actions.push(QuerierAction::SendGroupQuery {
                            group,
                            sources: still_wanted,
                        });
                    }
                }
                changed
            }
        };

        (changed, actions)
    }

    /// Explicit leave (v2 Leave Group / MLDv1 Done / TO_IN with no sources).
    ///
    /// Membership is not dropped yet: the group moves to CHECKING and the
    /// last-member query cycle decides. Non-queriers leave that to the
    /// elected querier.
    pub fn handle_leave(&mut self, group: IpAddr) -> (bool, Vec<QuerierAction>) {
        if self.table.get(&group).is_none() || !self.is_querier {
            return (false, Vec::new());
        }

        let count = self.config.last_member_query_count;
        if let Some(record) = self.table.get_mut(&group) {
            record.state = MembershipState::Checking;
            record.queries_left = count.saturating_sub(1);
        }

        (
            false,
            vec![
                QuerierAction::SendGroupQuery {
                    group,
                    sources: Vec::new(),
                },
                QuerierAction::Schedule {
                    timer: QuerierTimer::LastMemberQuery { group },
                    delay: self.config.last_member_query_interval,
                },
            ],
        )
    }

    /// Apply a fired timer.
    pub fn handle_timer(&mut self, timer: &QuerierTimer) -> (bool, Vec<QuerierAction>) {
        match timer {
            QuerierTimer::GeneralQuery => {
                if !self.is_querier {
                    return (false, Vec::new());
                }
                (
                    false,
                    vec![
                        QuerierAction::SendGeneralQuery,
                        QuerierAction::Schedule {
                            timer: QuerierTimer::GeneralQuery,
                            delay: self.config.query_interval,
                        },
                    ],
                )
            }
            QuerierTimer::StartupQuery => {
                if !self.is_querier {
                    return (false, Vec::new());
                }
                if self.startup_queries_left > 0 {
                    self.startup_queries_left -= 1;
                    (
                        false,
                        vec![
                            QuerierAction::SendGeneralQuery,
                            QuerierAction::Schedule {
                                timer: QuerierTimer::StartupQuery,
                                delay: self.config.startup_query_interval,
                            },
                        ],
                    )
                } else {
                    // Startup cycle over; fall into the periodic cadence.
                    (
                        false,
                        vec![
                            QuerierAction::SendGeneralQuery,
                            QuerierAction::Schedule {
                                timer: QuerierTimer::GeneralQuery,
                                delay: self.config.query_interval,
                            },
                        ],
                    )
                }
            }
            QuerierTimer::OtherQuerierPresent => {
                // The other querier went silent; reclaim the role.
                self.is_querier = true;
                self.other_querier = None;
                (
                    false,
                    vec![
                        QuerierAction::SendGeneralQuery,
                        QuerierAction::Schedule {
                            timer: QuerierTimer::GeneralQuery,
                            delay: self.config.query_interval,
                        },
                    ],
                )
            }
            QuerierTimer::GroupExpiry { group } => {
                // Member timer ran out without a refresh.
                let was_checking = self
                    .table
                    .get(group)
                    .map(|r| r.state == MembershipState::Checking)
                    .unwrap_or(false);
                if was_checking {
                    // Removal is owned by the last-member cycle.
                    return (false, Vec::new());
                }
                if self.table.get(group).is_none() {
                    return (false, Vec::new());
                }
                if self.is_querier {
                    // Expiry first verifies with specific queries.
                    let (_, actions) = self.handle_leave(*group);
                    (false, actions)
                } else {
                    (self.table.expire_group(group), Vec::new())
                }
            }
            QuerierTimer::SourceExpiry { group, source } => {
                (self.table.expire_source(group, source), Vec::new())
            }
            QuerierTimer::LastMemberQuery { group } => {
                let Some(record) = self.table.get_mut(group) else {
                    return (false, Vec::new());
                };
                if record.state != MembershipState::Checking {
                    return (false, Vec::new());
                }
                if record.queries_left > 0 {
                    record.queries_left -= 1;
                    (
                        false,
                        vec![
                            QuerierAction::SendGroupQuery {
                                group: *group,
                                sources: Vec::new(),
                            },
                            QuerierAction::Schedule {
                                timer: QuerierTimer::LastMemberQuery { group: *group },
                                delay: self.config.last_member_query_interval,
                            },
                        ],
                    )
                } else {
                    // No member answered: NO_MEMBERS.
                    let changed = self.table.expire_group(group);
                    (
                        changed,
                        vec![QuerierAction::Cancel {
                            timer: QuerierTimer::GroupExpiry { group: *group },
                        }],
                    )
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::membership::WantedSources;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn downstream() -> DownstreamState {
        DownstreamState::new(
            InterfaceSpec {
                ifindex: 7,
                name: "eth1".into(),
                addr: ip("192.168.1.1"),
            },
            Vif(1),
            QuerierConfig::default(),
        )
    }

    fn wildcard_join(group: &str) -> ReportRecord {
        ReportRecord {
            record_type: RecordType::ModeIsExclude,
            group: ip(group),
            sources: Vec::new(),
        }
    }

    #[test]
    fn test_start_sends_initial_query_cycle() {
        let mut ds = downstream();
        let actions = ds.start();
        assert!(actions.contains(&QuerierAction::SendGeneralQuery));
        assert!(actions.iter().any(|a| matches!(
            a,
            QuerierAction::Schedule {
                timer: QuerierTimer::StartupQuery,
                ..
            }
        )));
    }

    #[test]
    fn test_report_creates_membership() {
        let mut ds = downstream();
        let (changed, actions) = ds.handle_report(ip("192.168.1.50"), &wildcard_join("239.1.1.1"));
        assert!(changed);
        assert_eq!(
            ds.table.wanted(&ip("239.1.1.1")),
            WantedSources::AllBut(Default::default())
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            QuerierAction::Schedule {
                timer: QuerierTimer::GroupExpiry { .. },
                ..
            }
        )));
    }

    #[test]
    fn test_refresh_does_not_change_wanted_set() {
        let mut ds = downstream();
        ds.handle_report(ip("192.168.1.50"), &wildcard_join("239.1.1.1"));
        let (changed, actions) = ds.handle_report(ip("192.168.1.50"), &wildcard_join("239.1.1.1"));
        assert!(!changed);
        // Timer still re-armed on refresh.
        assert!(actions.iter().any(|a| matches!(
            a,
            QuerierAction::Schedule {
                timer: QuerierTimer::GroupExpiry { .. },
                ..
            }
        )));
    }

    #[test]
    fn test_leave_starts_checking_not_removal() {
        let mut ds = downstream();
        ds.handle_report(ip("192.168.1.50"), &wildcard_join("239.1.1.1"));
        let (changed, actions) = ds.handle_leave(ip("239.1.1.1"));
        assert!(!changed, "leave alone must not change forwarding");
        assert_eq!(
            ds.table.get(&ip("239.1.1.1")).unwrap().state,
            MembershipState::Checking
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            QuerierAction::SendGroupQuery { .. }
        )));
    }

    #[test]
    fn test_unanswered_last_member_queries_remove_group() {
        let mut ds = downstream();
        ds.handle_report(ip("192.168.1.50"), &wildcard_join("239.1.1.1"));
        ds.handle_leave(ip("239.1.1.1"));

        // Default count is 2: one sent at leave, one on the first timer.
        let (changed, _) = ds.handle_timer(&QuerierTimer::LastMemberQuery {
            group: ip("239.1.1.1"),
        });
        assert!(!changed);
        let (changed, _) = ds.handle_timer(&QuerierTimer::LastMemberQuery {
            group: ip("239.1.1.1"),
        });
        assert!(changed);
        assert!(ds.table.get(&ip("239.1.1.1")).is_none());
    }

    #[test]
    fn test_report_during_checking_rescues_membership() {
        let mut ds = downstream();
        ds.handle_report(ip("192.168.1.50"), &wildcard_join("239.1.1.1"));
        ds.handle_leave(ip("239.1.1.1"));

        let (changed, _) = ds.handle_report(ip("192.168.1.50"), &wildcard_join("239.1.1.1"));
        assert!(!changed);
        assert_eq!(
            ds.table.get(&ip("239.1.1.1")).unwrap().state,
            MembershipState::MembersPresent
        );

        // The stale retransmit timer is now a no-op.
        let (changed, actions) = ds.handle_timer(&QuerierTimer::LastMemberQuery {
            group: ip("239.1.1.1"),
        });
        assert!(!changed);
        assert!(actions.is_empty());
        assert!(ds.table.get(&ip("239.1.1.1")).is_some());
    }

    #[test]
    fn test_querier_election_lower_address_wins() {
        let mut ds = downstream();
        let actions = ds.handle_query(ip("192.168.1.2"));
        assert!(ds.is_querier(), "higher address must not take the role");
        assert!(actions.is_empty());

        let actions = ds.handle_query(ip("192.168.1.0"));
        assert!(!ds.is_querier());
        assert_eq!(ds.other_querier(), Some(ip("192.168.1.0")));
        assert!(actions.iter().any(|a| matches!(
            a,
            QuerierAction::Schedule {
                timer: QuerierTimer::OtherQuerierPresent,
                ..
            }
        )));
    }

    #[test]
    fn test_other_querier_timeout_reclaims_role() {
        let mut ds = downstream();
        ds.handle_query(ip("192.168.1.0"));
        assert!(!ds.is_querier());

        let (_, actions) = ds.handle_timer(&QuerierTimer::OtherQuerierPresent);
        assert!(ds.is_querier());
        assert!(actions.contains(&QuerierAction::SendGeneralQuery));
    }

    #[test]
    fn test_non_querier_ignores_leave() {
        let mut ds = downstream();
        ds.handle_report(ip("192.168.1.50"), &wildcard_join("239.1.1.1"));
        ds.handle_query(ip("192.168.1.0"));

        let (changed, actions) = ds.handle_leave(ip("239.1.1.1"));
        assert!(!changed);
        assert!(actions.is_empty());
        assert_eq!(
            ds.table.get(&ip("239.1.1.1")).unwrap().state,
            MembershipState::MembersPresent
        );
    }

    #[test]
    fn test_source_expiry_changes_wanted_set() {
        let mut ds = downstream();
        ds.handle_report(ip("192.168.1.50"), &ReportRecord {
            record_type: RecordType::ModeIsInclude,
            group: ip("239.1.1.1"),
            sources: vec![ip("10.0.0.1")],
        });

        let (changed, _) = ds.handle_timer(&QuerierTimer::SourceExpiry {
            group: ip("239.1.1.1"),
            source: ip("10.0.0.1"),
        });
        assert!(changed);
        assert!(ds.table.is_empty());
    }

    #[test]
    fn test_block_triggers_specific_query() {
        let mut ds = downstream();
        ds.handle_report(ip("192.168.1.50"), &ReportRecord {
            record_type: RecordType::ModeIsInclude,
            group: ip("239.1.1.1"),
            sources: vec![ip("10.0.0.1")],
        });

        let (changed, actions) = ds.handle_report(ip("192.168.1.50"), &ReportRecord {
            record_type: RecordType::BlockOldSources,
            group: ip("239.1.1.1"),
            sources: vec![ip("10.0.0.1")],
        });
        // INCLUDE membership is kept until the shortened timer decides.
        assert!(!changed);
        assert!(actions.iter().any(|a| matches!(
            a,
            QuerierAction::SendGroupQuery { sources, .. } if !sources.is_empty()
        )));
    }
}
