// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Membership state: who wants what, per downstream interface.
//!
//! A [`MembershipTable`] holds one [`GroupRecord`] per group with active
//! members. Absence from the table is the NO_MEMBERS state; a record with
//! an INCLUDE filter and an empty source set is never stored. Derived
//! views, kernel forwarding entries and the upstream advertisement union,
//! are pure functions of the tables and recomputed after every change,
//! never cached across changes.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::protocols::FilterMode;
use crate::{ForwardingEntry, Vif};

/// Source filter of one group record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterState {
    /// Only the listed sources are wanted.
    Include { sources: BTreeSet<IpAddr> },
    /// Everything but the listed sources is wanted.
    Exclude { blocked: BTreeSet<IpAddr> },
}

impl FilterState {
    pub fn mode(&self) -> FilterMode {
        match self {
            FilterState::Include { .. } => FilterMode::Include,
            FilterState::Exclude { .. } => FilterMode::Exclude,
        }
    }

    /// Whether traffic from `source` is wanted under this filter.
    pub fn wants(&self, source: &IpAddr) -> bool {
        match self {
            FilterState::Include { sources } => sources.contains(source),
            FilterState::Exclude { blocked } => !blocked.contains(source),
        }
    }

    /// Sources named by the filter, whichever mode.
    pub fn listed_sources(&self) -> &BTreeSet<IpAddr> {
        match self {
            FilterState::Include { sources } => sources,
            FilterState::Exclude { blocked } => blocked,
        }
    }
}

/// Per-group membership protocol state. NO_MEMBERS is represented by the
/// record's absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    /// Members reported recently; expiry timer running.
    MembersPresent,
    /// A leave was seen or the timer ran out; specific queries in flight.
    Checking,
}

/// Membership record for one group on one downstream interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub filter: FilterState,
    pub state: MembershipState,
    /// Specific queries still to send while in Checking.
    pub queries_left: u8,
    /// Last host seen reporting this group.
    pub last_reporter: Option<IpAddr>,
}

impl GroupRecord {
    fn new_exclude(blocked: BTreeSet<IpAddr>, reporter: Option<IpAddr>) -> Self {
        Self {
            filter: FilterState::Exclude { blocked },
            state: MembershipState::MembersPresent,
            queries_left: 0,
            last_reporter: reporter,
        }
    }

    fn new_include(sources: BTreeSet<IpAddr>, reporter: Option<IpAddr>) -> Self {
        Self {
            filter: FilterState::Include { sources },
            state: MembershipState::MembersPresent,
            queries_left: 0,
            last_reporter: reporter,
        }
    }
}

/// The effective wanted-set of a group on one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WantedSources {
    /// No membership at all.
    None,
    /// Only these sources.
    Some(BTreeSet<IpAddr>),
    /// Everything except these sources.
    AllBut(BTreeSet<IpAddr>),
}

impl WantedSources {
    pub fn is_none(&self) -> bool {
        matches!(self, WantedSources::None)
    }
}

/// Group membership on one downstream interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipTable {
    groups: BTreeMap<IpAddr, GroupRecord>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, group: &IpAddr) -> Option<&GroupRecord> {
        self.groups.get(group)
    }

    pub fn get_mut(&mut self, group: &IpAddr) -> Option<&mut GroupRecord> {
        self.groups.get_mut(group)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IpAddr, &GroupRecord)> {
        self.groups.iter()
    }

    pub fn groups(&self) -> impl Iterator<Item = &IpAddr> {
        self.groups.keys()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The effective wanted-set for a group.
    pub fn wanted(&self, group: &IpAddr) -> WantedSources {
        match self.groups.get(group) {
            None => WantedSources::None,
            Some(record) => match &record.filter {
                FilterState::Include { sources } => WantedSources::Some(sources.clone()),
                FilterState::Exclude { blocked } => WantedSources::AllBut(blocked.clone()),
            },
        }
    }

    /// Add sources to a group's wanted set (IS_IN / ALLOW arithmetic).
    /// Creates an INCLUDE record when the group is new. Returns whether the
    /// wanted-set changed.
    pub fn allow_sources(
        &mut self,
        group: IpAddr,
        sources: &[IpAddr],
        reporter: Option<IpAddr>,
    ) -> bool {
        let before = self.wanted(&group);
        match self.groups.get_mut(&group) {
            None => {
                if sources.is_empty() {
                    // An empty INCLUDE carries no membership; never store it.
                    return false;
                }
                self.groups.insert(
                    group,
                    GroupRecord::new_include(sources.iter().copied().collect(), reporter),
                );
            }
            Some(record) => {
                record.last_reporter = reporter.or(record.last_reporter);
                match &mut record.filter {
                    FilterState::Include { sources: current } => {
                        current.extend(sources.iter().copied());
                    }
                    FilterState::Exclude { blocked } => {
                        for source in sources {
                            blocked.remove(source);
                        }
                    }
                }
            }
        }
        self.wanted(&group) != before
    }

    /// Replace a group's filter with EXCLUDE(blocked) (IS_EX / TO_EX). The
    /// mode switch and the source set apply in one step.
    pub fn set_exclude(
        &mut self,
        group: IpAddr,
        blocked: BTreeSet<IpAddr>,
        reporter: Option<IpAddr>,
    ) -> bool {
        let before = self.wanted(&group);
        match self.groups.get_mut(&group) {
            None => {
                self.groups
                    .insert(group, GroupRecord::new_exclude(blocked, reporter));
            }
            Some(record) => {
                record.filter = FilterState::Exclude { blocked };
                record.state = MembershipState::MembersPresent;
                record.queries_left = 0;
                record.last_reporter = reporter.or(record.last_reporter);
            }
        }
        self.wanted(&group) != before
    }

    /// Replace a group's filter with INCLUDE(sources) (TO_IN). An empty
    /// source set removes the record entirely.
    pub fn set_include(
        &mut self,
        group: IpAddr,
        sources: BTreeSet<IpAddr>,
        reporter: Option<IpAddr>,
    ) -> bool {
        let before = self.wanted(&group);
        if sources.is_empty() {
            self.groups.remove(&group);
        } else {
            match self.groups.get_mut(&group) {
                None => {
                    self.groups
                        .insert(group, GroupRecord::new_include(sources, reporter));
                }
                Some(record) => {
                    record.filter = FilterState::Include { sources };
                    record.state = MembershipState::MembersPresent;
                    record.queries_left = 0;
                    record.last_reporter = reporter.or(record.last_reporter);
                }
            }
        }
        self.wanted(&group) != before
    }

    /// Add sources to an EXCLUDE record's blocked set (BLOCK arithmetic).
    /// INCLUDE records are untouched here; for them a block only shortens
    /// source timers, which the caller drives.
    pub fn block_sources(&mut self, group: &IpAddr, sources: &[IpAddr]) -> bool {
        let before = self.wanted(group);
        if let Some(record) = self.groups.get_mut(group) {
            if let FilterState::Exclude { blocked } = &mut record.filter {
                blocked.extend(sources.iter().copied());
            }
        }
        self.wanted(group) != before
    }

    /// Remove one INCLUDE source whose timer expired. Drops the record when
    /// the last source goes.
    pub fn expire_source(&mut self, group: &IpAddr, source: &IpAddr) -> bool {
        let before = self.wanted(group);
        let mut drop_record = false;
        if let Some(record) = self.groups.get_mut(group) {
            if let FilterState::Include { sources } = &mut record.filter {
                sources.remove(source);
                drop_record = sources.is_empty();
            }
        }
        if drop_record {
            self.groups.remove(group);
        }
        self.wanted(group) != before
    }

    /// Remove a whole group record (member timer ran out with no refresh).
    pub fn expire_group(&mut self, group: &IpAddr) -> bool {
        self.groups.remove(group).is_some()
    }
}

/// Compute the kernel forwarding entries implied by the downstream tables.
///
/// Deterministic in its inputs. Wildcard entries carry the interfaces in
/// EXCLUDE mode; a per-source entry is emitted wherever the per-source
/// output set differs from the wildcard output set, including empty-output
/// drop entries for sources every member blocks.
pub fn compute_forwarding(
    upstream: Vif,
    downstreams: &BTreeMap<Vif, &MembershipTable>,
) -> BTreeSet<ForwardingEntry> {
    let mut entries = BTreeSet::new();

    let mut all_groups: BTreeSet<IpAddr> = BTreeSet::new();
    for table in downstreams.values() {
        all_groups.extend(table.groups().copied());
    }

    for group in all_groups {
        let mut wildcard_outputs: BTreeSet<Vif> = BTreeSet::new();
        let mut mentioned_sources: BTreeSet<IpAddr> = BTreeSet::new();

        for (vif, table) in downstreams {
            match table.wanted(&group) {
                WantedSources::None => {}
                WantedSources::Some(sources) => {
                    mentioned_sources.extend(sources);
                }
                WantedSources::AllBut(blocked) => {
                    wildcard_outputs.insert(*vif);
                    mentioned_sources.extend(blocked);
                }
            }
        }

        if !wildcard_outputs.is_empty() {
            entries.insert(ForwardingEntry {
                group,
                source: None,
                input: upstream,
                outputs: wildcard_outputs.clone(),
            });
        }

        for source in mentioned_sources {
            let outputs: BTreeSet<Vif> = downstreams
                .iter()
                .filter(|(_, table)| {
                    table
                        .get(&group)
                        .is_some_and(|record| record.filter.wants(&source))
                })
                .map(|(vif, _)| *vif)
                .collect();

            if outputs != wildcard_outputs {
                entries.insert(ForwardingEntry {
                    group,
                    source: Some(source),
                    input: upstream,
                    outputs,
                });
            }
        }
    }

    entries
}

/// Merge the downstream tables into the filter state the upstream host
/// role advertises, one entry per wanted group.
///
/// Any EXCLUDE membership forces EXCLUDE upstream; its blocked set is the
/// intersection of all blocked sets minus every source some INCLUDE member
/// wants. With only INCLUDE members the union of their sources is used.
pub fn compute_union(
    downstreams: &BTreeMap<Vif, &MembershipTable>,
) -> BTreeMap<IpAddr, FilterState> {
    let mut union: BTreeMap<IpAddr, FilterState> = BTreeMap::new();

    let mut all_groups: BTreeSet<IpAddr> = BTreeSet::new();
    for table in downstreams.values() {
        all_groups.extend(table.groups().copied());
    }

    for group in all_groups {
        let mut blocked_intersection: Option<BTreeSet<IpAddr>> = None;
        let mut included_union: BTreeSet<IpAddr> = BTreeSet::new();

        for table in downstreams.values() {
            match table.wanted(&group) {
                WantedSources::None => {}
                WantedSources::Some(sources) => included_union.extend(sources),
                WantedSources::AllBut(blocked) => {
                    blocked_intersection = Some(match blocked_intersection {
                        None => blocked,
                        Some(current) => current.intersection(&blocked).copied().collect(),
                    });
                }
            }
        }

        let filter = match blocked_intersection {
            Some(mut blocked) => {
                for source in &included_union {
                    blocked.remove(source);
                }
                FilterState::Exclude { blocked }
            }
            None => FilterState::Include {
                sources: included_union,
            },
        };
        union.insert(group, filter);
    }

    union
}
