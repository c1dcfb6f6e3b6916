// SPDX-License-Identifier: Apache-2.0 OR MIT
//! The proxy instance: one message-driven engine per kernel routing table.
//!
//! An instance owns the upstream host role, the downstream querier state
//! machines, and the kernel gateway for its table. Every event source
//! (packet readers, the timing service, the orchestrator) funnels into one
//! queue; the single loop in [`ProxyInstance::run`] is the only mutator of
//! membership state, so no locking is needed anywhere in the core.
//!
//! After any state-changing message the instance recomputes the desired
//! forwarding entries and the upstream advertisement union from scratch and
//! diffs them against what is applied. Failed kernel mutations simply stay
//! out of the applied set and are retried by the next change that still
//! wants them.

pub mod membership;
pub mod message;
pub mod querier;
pub mod upstream;

pub use message::{InstanceGone, InterfaceSpec, ProxyHandle, ProxyMessage, StatusDetail};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::kernel::ForwardingGateway;
use crate::logging::{Facility, Logger};
use crate::protocols::{
    self, igmp, mld, MembershipEvent, PacketBuilder, ProtocolFamily, QuerierConfig,
};
use crate::shutdown::ShutdownFlag;
use crate::timing::{TimerId, TimerSink, TimingService};
use crate::{log_debug, log_error, log_info, log_notice, log_warning};
use crate::{ForwardingEntry, RouteTableId, Vif};

use membership::{compute_forwarding, compute_union, MembershipState};
use querier::{DownstreamState, QuerierAction, QuerierTimer};
use upstream::{ReportRecords, UpstreamAction, UpstreamState, UpstreamTimer};

/// What a registered timer belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    Querier { ifindex: u32, timer: QuerierTimer },
    Upstream { timer: UpstreamTimer },
}

/// Message-driven proxy engine for one routing table.
pub struct ProxyInstance {
    table: RouteTableId,
    family: ProtocolFamily,
    querier_config: QuerierConfig,
    gateway: Box<dyn ForwardingGateway>,
    timing: TimingService,
    shutdown: ShutdownFlag,
    logger: Logger,

    rx: mpsc::UnboundedReceiver<ProxyMessage>,
    handle: ProxyHandle,
    timer_sink: Arc<dyn TimerSink>,

    upstream: Option<UpstreamState>,
    downstreams: BTreeMap<u32, DownstreamState>,

    next_vif: u16,
    free_vifs: BTreeSet<u16>,

    timers_by_id: HashMap<TimerId, TimerKey>,
    timers_by_key: HashMap<TimerKey, TimerId>,

    /// Forwarding entries we believe the kernel holds, keyed by
    /// (group, source).
    applied: BTreeMap<(IpAddr, Option<IpAddr>), ForwardingEntry>,
}

impl ProxyInstance {
    pub fn new(
        table: RouteTableId,
        family: ProtocolFamily,
        querier_config: QuerierConfig,
        gateway: Box<dyn ForwardingGateway>,
        timing: TimingService,
        shutdown: ShutdownFlag,
        logger: Logger,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ProxyHandle::new(tx);
        let timer_sink: Arc<dyn TimerSink> = Arc::new(handle.clone());
        Self {
            table,
            family,
            querier_config,
            gateway,
            timing,
            shutdown,
            logger,
            rx,
            handle,
            timer_sink,
            upstream: None,
            downstreams: BTreeMap::new(),
            next_vif: 0,
            free_vifs: BTreeSet::new(),
            timers_by_id: HashMap::new(),
            timers_by_key: HashMap::new(),
            applied: BTreeMap::new(),
        }
    }

    /// Submission handle for readers, the orchestrator and timers.
    pub fn handle(&self) -> ProxyHandle {
        self.handle.clone()
    }

    pub fn table(&self) -> RouteTableId {
        self.table
    }

    /// The instance event loop. Processes one message at a time until the
    /// process-wide shutdown flag is raised. A message that fails to apply
    /// never terminates the loop.
    pub async fn run(mut self) {
        log_info!(
            self.logger,
            Facility::Instance,
            &format!("{} ({}): instance started", self.table, self.family)
        );

        loop {
            if self.shutdown.is_shutdown() {
                break;
            }
            tokio::select! {
                _ = self.shutdown.wait() => break,
                message = self.rx.recv() => {
                    match message {
                        Some(message) => {
                            if self.dispatch(message) {
                                self.sync_kernel();
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        log_notice!(
            self.logger,
            Facility::Instance,
            &format!("{}: instance stopped", self.table)
        );
    }

    /// Apply one message. Returns whether membership or interface state
    /// changed in a way that requires a kernel/advertisement resync.
    fn dispatch(&mut self, message: ProxyMessage) -> bool {
        match message {
            ProxyMessage::AddUpstream(spec) => self.handle_add_upstream(spec),
            ProxyMessage::AddDownstream(spec) => self.handle_add_downstream(spec),
            ProxyMessage::DelDownstream(ifindex) => self.handle_del_downstream(ifindex),
            ProxyMessage::Packet { ifindex, src, data } => self.handle_packet(ifindex, src, &data),
            ProxyMessage::TimerFired(id) => self.handle_timer(id),
            ProxyMessage::StatusQuery { detail, reply } => {
                let _ = reply.send(self.render_status(detail));
                false
            }
        }
    }

    fn handle_add_upstream(&mut self, spec: InterfaceSpec) -> bool {
        if let Some(up) = &self.upstream {
            if up.iface.ifindex == spec.ifindex {
                return false;
            }
            log_error!(
                self.logger,
                Facility::Instance,
                &format!(
                    "{}: upstream already bound to {}, ignoring {}",
                    self.table, up.iface, spec
                )
            );
            return false;
        }
        if self.downstreams.contains_key(&spec.ifindex) {
            log_error!(
                self.logger,
                Facility::Instance,
                &format!(
                    "{}: {} is configured downstream, cannot also be upstream",
                    self.table, spec
                )
            );
            return false;
        }
        if !self.family.contains(&spec.addr) {
            log_error!(
                self.logger,
                Facility::Instance,
                &format!("{}: {} address is not {}", self.table, spec, self.family)
            );
            return false;
        }

        let vif = self.alloc_vif();
        log_notice!(
            self.logger,
            Facility::Instance,
            &format!("{}: upstream {} on {}", self.table, spec, vif)
        );
        self.upstream = Some(UpstreamState::new(spec, vif, self.querier_config.clone()));
        true
    }

    fn handle_add_downstream(&mut self, spec: InterfaceSpec) -> bool {
        if self.downstreams.contains_key(&spec.ifindex) {
            // Idempotent: a second add of the same interface is a no-op.
            return false;
        }
        if self
            .upstream
            .as_ref()
            .is_some_and(|up| up.iface.ifindex == spec.ifindex)
        {
            log_error!(
                self.logger,
                Facility::Instance,
                &format!(
                    "{}: {} is the upstream, cannot also be downstream",
                    self.table, spec
                )
            );
            return false;
        }
        if !self.family.contains(&spec.addr) {
            log_error!(
                self.logger,
                Facility::Instance,
                &format!("{}: {} address is not {}", self.table, spec, self.family)
            );
            return false;
        }

        let vif = self.alloc_vif();
        let ifindex = spec.ifindex;
        log_notice!(
            self.logger,
            Facility::Instance,
            &format!("{}: downstream {} on {}", self.table, spec, vif)
        );
        let mut state = DownstreamState::new(spec, vif, self.querier_config.clone());
        let actions = state.start();
        self.downstreams.insert(ifindex, state);
        self.apply_querier_actions(ifindex, actions);
        true
    }

    fn handle_del_downstream(&mut self, ifindex: u32) -> bool {
        let Some(state) = self.downstreams.remove(&ifindex) else {
            // Idempotent: removing an absent interface is a no-op.
            return false;
        };
        self.cancel_downstream_timers(ifindex);
        if let Err(e) = self.gateway.del_vif(state.vif) {
            log_warning!(
                self.logger,
                Facility::Kernel,
                &format!("{}: del_vif {} failed: {}", self.table, state.vif, e)
            );
        }
        self.free_vif(state.vif);
        log_notice!(
            self.logger,
            Facility::Instance,
            &format!("{}: removed downstream {}", self.table, state.iface)
        );
        true
    }

    fn handle_packet(&mut self, ifindex: u32, src: IpAddr, data: &[u8]) -> bool {
        let event = match protocols::parse_packet(self.family, src, data) {
            Ok(event) => event,
            Err(e) => {
                // Malformed input is dropped and logged, never fatal.
                log_info!(
                    self.logger,
                    Facility::Instance,
                    &format!(
                        "{}: dropped packet from {} on ifindex {}: {}",
                        self.table, src, ifindex, e
                    )
                );
                return false;
            }
        };

        if self
            .upstream
            .as_ref()
            .is_some_and(|up| up.iface.ifindex == ifindex)
        {
            return self.handle_upstream_event(event);
        }

        if self.downstreams.contains_key(&ifindex) {
            return self.handle_downstream_event(ifindex, event);
        }

        log_debug!(
            self.logger,
            Facility::Instance,
            &format!(
                "{}: packet on unmanaged ifindex {}, dropped",
                self.table, ifindex
            )
        );
        false
    }

    fn handle_upstream_event(&mut self, event: MembershipEvent) -> bool {
        match event {
            MembershipEvent::Query { group, .. } => {
                let actions = match &self.upstream {
                    Some(up) => up.handle_query(group),
                    None => Vec::new(),
                };
                self.apply_upstream_actions(actions);
            }
            // Reports and leaves from other hosts on the upstream segment
            // are not membership input for this proxy.
            MembershipEvent::Report { .. } | MembershipEvent::Leave { .. } => {
                log_debug!(
                    self.logger,
                    Facility::Upstream,
                    &format!("{}: ignoring host report on upstream", self.table)
                );
            }
        }
        false
    }

    fn handle_downstream_event(&mut self, ifindex: u32, event: MembershipEvent) -> bool {
        let Some(state) = self.downstreams.get_mut(&ifindex) else {
            return false;
        };
        match event {
            MembershipEvent::Query { src, .. } => {
                let actions = state.handle_query(src);
                self.apply_querier_actions(ifindex, actions);
                false
            }
            MembershipEvent::Report { src, records } => {
                let mut changed = false;
                let mut all_actions = Vec::new();
                for record in &records {
                    let (record_changed, mut actions) = state.handle_report(src, record);
                    changed |= record_changed;
                    all_actions.append(&mut actions);
                }
                self.apply_querier_actions(ifindex, all_actions);
                changed
            }
            MembershipEvent::Leave { group, .. } => {
                let (changed, actions) = state.handle_leave(group);
                self.apply_querier_actions(ifindex, actions);
                changed
            }
        }
    }

    fn handle_timer(&mut self, id: TimerId) -> bool {
        let Some(key) = self.timers_by_id.remove(&id) else {
            // Cancelled or superseded while the expiry was in flight.
            return false;
        };
        if self.timers_by_key.get(&key) == Some(&id) {
            self.timers_by_key.remove(&key);
        }

        match key {
            TimerKey::Querier { ifindex, timer } => {
                let Some(state) = self.downstreams.get_mut(&ifindex) else {
                    return false;
                };
                let (changed, actions) = state.handle_timer(&timer);
                self.apply_querier_actions(ifindex, actions);
                changed
            }
            TimerKey::Upstream { timer } => {
                let actions = match &mut self.upstream {
                    Some(up) => up.handle_timer(&timer),
                    None => Vec::new(),
                };
                self.apply_upstream_actions(actions);
                false
            }
        }
    }

    // --- side effects ---------------------------------------------------

    fn apply_querier_actions(&mut self, ifindex: u32, actions: Vec<QuerierAction>) {
        for action in actions {
            match action {
                QuerierAction::Schedule { timer, delay } => {
                    self.schedule(TimerKey::Querier { ifindex, timer }, delay);
                }
                QuerierAction::Cancel { timer } => {
                    self.cancel(&TimerKey::Querier { ifindex, timer });
                }
                QuerierAction::SendGeneralQuery => self.send_general_query(ifindex),
                QuerierAction::SendGroupQuery { group, sources } => {
                    self.send_group_query(ifindex, group, &sources);
                }
            }
        }
    }

    fn apply_upstream_actions(&mut self, actions: Vec<UpstreamAction>) {
        let Some((ifindex, _vif)) = self
            .upstream
            .as_ref()
            .map(|up| (up.iface.ifindex, up.vif))
        else {
            return;
        };
        for action in actions {
            match action {
                UpstreamAction::Schedule { timer, delay } => {
                    self.schedule(TimerKey::Upstream { timer }, delay);
                }
                UpstreamAction::SendReport { records } => self.send_report(ifindex, &records),
                UpstreamAction::JoinGroup(group) => {
                    if let Err(e) = self.gateway.join_group(ifindex, group) {
                        log_warning!(
                            self.logger,
                            Facility::Upstream,
                            &format!("{}: join {} failed: {}", self.table, group, e)
                        );
                    }
                }
                UpstreamAction::LeaveGroup(group) => {
                    if let Err(e) = self.gateway.leave_group(ifindex, group) {
                        log_warning!(
                            self.logger,
                            Facility::Upstream,
                            &format!("{}: leave {} failed: {}", self.table, group, e)
                        );
                    }
                }
            }
        }
    }

    fn schedule(&mut self, key: TimerKey, delay: std::time::Duration) {
        // Re-registration replaces the previous timer of the same key.
        if let Some(old) = self.timers_by_key.remove(&key) {
            self.timing.cancel(old);
            self.timers_by_id.remove(&old);
        }
        let id = self.timing.register(delay, Arc::clone(&self.timer_sink));
        self.timers_by_id.insert(id, key.clone());
        self.timers_by_key.insert(key, id);
    }

    fn cancel(&mut self, key: &TimerKey) {
        if let Some(id) = self.timers_by_key.remove(key) {
            self.timing.cancel(id);
            self.timers_by_id.remove(&id);
        }
    }

    fn cancel_downstream_timers(&mut self, ifindex: u32) {
        let keys: Vec<TimerKey> = self
            .timers_by_key
            .keys()
            .filter(|key| matches!(key, TimerKey::Querier { ifindex: i, .. } if *i == ifindex))
            .cloned()
            .collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    fn send_general_query(&mut self, ifindex: u32) {
        let Some(state) = self.downstreams.get(&ifindex) else {
            return;
        };
        let config = state.config();
        let packet = match self.family {
            ProtocolFamily::Igmp => igmp::IgmpQueryBuilder::general(
                (config.query_response_interval.as_millis() / 100) as u32,
                config.robustness,
                config.query_interval.as_secs() as u32,
            )
            .build(),
            ProtocolFamily::Mld => mld::MldQueryBuilder::general(
                config.query_response_interval.as_millis() as u16,
                config.robustness,
                config.query_interval.as_secs() as u32,
            )
            .build(),
        };
        let dst = self.family.all_hosts();
        if let Err(e) = self.gateway.send_packet(ifindex, dst, &packet) {
            log_warning!(
                self.logger,
                Facility::Querier,
                &format!(
                    "{}: general query on ifindex {} failed: {}",
                    self.table, ifindex, e
                )
            );
        }
    }

    fn send_group_query(&mut self, ifindex: u32, group: IpAddr, sources: &[IpAddr]) {
        let Some(state) = self.downstreams.get(&ifindex) else {
            return;
        };
        let config = state.config();
        let max_resp_tenths = (config.last_member_query_interval.as_millis() / 100) as u32;
        let packet = match (self.family, group) {
            (ProtocolFamily::Igmp, IpAddr::V4(group_v4)) => {
                let mut builder = igmp::IgmpQueryBuilder::group_specific(
                    group_v4,
                    max_resp_tenths,
                    config.robustness,
                    config.query_interval.as_secs() as u32,
                );
                builder.sources = sources
                    .iter()
                    .filter_map(|s| match s {
                        IpAddr::V4(v4) => Some(*v4),
                        IpAddr::V6(_) => None,
                    })
                    .collect();
                builder.build()
            }
            (ProtocolFamily::Mld, IpAddr::V6(group_v6)) => {
                let mut builder = mld::MldQueryBuilder::group_specific(
                    group_v6,
                    config.last_member_query_interval.as_millis() as u16,
                    config.robustness,
                    config.query_interval.as_secs() as u32,
                );
                builder.sources = sources
                    .iter()
                    .filter_map(|s| match s {
                        IpAddr::V6(v6) => Some(*v6),
                        IpAddr::V4(_) => None,
                    })
                    .collect();
                builder.build()
            }
            _ => return,
        };
        // Specific queries go to the group itself.
        if let Err(e) = self.gateway.send_packet(ifindex, group, &packet) {
            log_warning!(
                self.logger,
                Facility::Querier,
                &format!(
                    "{}: group query for {} on ifindex {} failed: {}",
                    self.table, group, ifindex, e
                )
            );
        }
    }

    fn send_report(&mut self, ifindex: u32, records: &ReportRecords) {
        let packet = match self.family {
            ProtocolFamily::Igmp => {
                let mut builder = igmp::IgmpReportBuilder::new();
                for (record_type, group, sources) in records {
                    let IpAddr::V4(group_v4) = group else { continue };
                    let sources_v4: Vec<Ipv4Addr> = sources
                        .iter()
                        .filter_map(|s| match s {
                            IpAddr::V4(v4) => Some(*v4),
                            IpAddr::V6(_) => None,
                        })
                        .collect();
                    builder = builder.record(*record_type, *group_v4, sources_v4);
                }
                builder.build()
            }
            ProtocolFamily::Mld => {
                let mut builder = mld::MldReportBuilder::new();
                for (record_type, group, sources) in records {
                    let IpAddr::V6(group_v6) = group else { continue };
                    let sources_v6: Vec<Ipv6Addr> = sources
                        .iter()
                        .filter_map(|s| match s {
                            IpAddr::V6(v6) => Some(*v6),
                            IpAddr::V4(_) => None,
                        })
                        .collect();
                    builder = builder.record(*record_type, *group_v6, sources_v6);
                }
                builder.build()
            }
        };
        let dst = self.family.report_destination();
        if let Err(e) = self.gateway.send_packet(ifindex, dst, &packet) {
            log_warning!(
                self.logger,
                Facility::Upstream,
                &format!("{}: membership report failed: {}", self.table, e)
            );
        }
    }

    // --- derived-state sync ----------------------------------------------

    /// Recompute everything derived from the membership tables and push the
    /// difference to the kernel and the upstream network.
    fn sync_kernel(&mut self) {
        self.ensure_vifs();

        // Forwarding entries are a pure function of current membership.
        let desired: BTreeMap<(IpAddr, Option<IpAddr>), ForwardingEntry> = match &self.upstream {
            Some(up) => {
                let tables: BTreeMap<Vif, &membership::MembershipTable> = self
                    .downstreams
                    .values()
                    .map(|d| (d.vif, &d.table))
                    .collect();
                compute_forwarding(up.vif, &tables)
                    .into_iter()
                    .map(|entry| ((entry.group, entry.source), entry))
                    .collect()
            }
            None => BTreeMap::new(),
        };

        let stale: Vec<ForwardingEntry> = self
            .applied
            .iter()
            .filter(|(key, _)| !desired.contains_key(*key))
            .map(|(_, entry)| entry.clone())
            .collect();
        for entry in stale {
            match self.gateway.del_forwarding_entry(&entry) {
                Ok(()) => {
                    self.applied.remove(&(entry.group, entry.source));
                    log_info!(
                        self.logger,
                        Facility::Kernel,
                        &format!("{}: removed {}", self.table, entry)
                    );
                }
                // Still applied as far as we know; retried next sync.
                Err(e) => log_error!(
                    self.logger,
                    Facility::Kernel,
                    &format!("{}: failed to remove {}: {}", self.table, entry, e)
                ),
            }
        }

        for (key, entry) in &desired {
            if self.applied.get(key) == Some(entry) {
                continue;
            }
            match self.gateway.add_forwarding_entry(entry) {
                Ok(()) => {
                    self.applied.insert(*key, entry.clone());
                    log_info!(
                        self.logger,
                        Facility::Kernel,
                        &format!("{}: installed {}", self.table, entry)
                    );
                }
                // Not recorded as applied; retried on the next change.
                Err(e) => log_error!(
                    self.logger,
                    Facility::Kernel,
                    &format!("{}: failed to install {}: {}", self.table, entry, e)
                ),
            }
        }

        // Upstream advertisement follows the same recompute-and-diff shape.
        let union = {
            let tables: BTreeMap<Vif, &membership::MembershipTable> = self
                .downstreams
                .values()
                .map(|d| (d.vif, &d.table))
                .collect();
            compute_union(&tables)
        };
        let actions = match &mut self.upstream {
            Some(up) => up.sync(&union),
            None => Vec::new(),
        };
        self.apply_upstream_actions(actions);
    }

    /// Re-register every VIF we want; the gateway treats repeats as no-ops,
    /// so this doubles as the retry path after a failed registration.
    fn ensure_vifs(&mut self) {
        let mut wanted: Vec<(Vif, u32)> = Vec::new();
        if let Some(up) = &self.upstream {
            wanted.push((up.vif, up.iface.ifindex));
        }
        for state in self.downstreams.values() {
            wanted.push((state.vif, state.iface.ifindex));
        }
        for (vif, ifindex) in wanted {
            if let Err(e) = self.gateway.add_vif(vif, ifindex) {
                log_error!(
                    self.logger,
                    Facility::Kernel,
                    &format!(
                        "{}: add_vif {} (ifindex {}) failed: {}",
                        self.table, vif, ifindex, e
                    )
                );
            }
        }
    }

    fn alloc_vif(&mut self) -> Vif {
        if let Some(first) = self.free_vifs.iter().next().copied() {
            self.free_vifs.remove(&first);
            return Vif(first);
        }
        let vif = Vif(self.next_vif);
        self.next_vif += 1;
        vif
    }

    fn free_vif(&mut self, vif: Vif) {
        self.free_vifs.insert(vif.0);
    }

    // --- status ----------------------------------------------------------

    /// Render a read-only status snapshot, mirroring the classic
    /// `to_string` status dump.
    fn render_status(&self, detail: StatusDetail) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "##-- proxy instance {} ({}) --##",
            self.table, self.family
        );
        match &self.upstream {
            Some(up) => {
                let _ = writeln!(out, "upstream: {} on {}", up.iface, up.vif);
            }
            None => {
                let _ = writeln!(out, "upstream: (none)");
            }
        }
        for state in self.downstreams.values() {
            let _ = writeln!(
                out,
                "downstream: {} on {} querier={} groups={}",
                state.iface,
                state.vif,
                state.is_querier(),
                state.table.len()
            );
            if detail == StatusDetail::Summary {
                continue;
            }
            for (group, record) in state.table.iter() {
                let state_str = match record.state {
                    MembershipState::MembersPresent => "members-present",
                    MembershipState::Checking => "checking",
                };
                match detail {
                    StatusDetail::Groups => {
                        let _ = writeln!(out, "  {} {}", group, state_str);
                    }
                    StatusDetail::Full => {
                        let sources: Vec<String> = record
                            .filter
                            .listed_sources()
                            .iter()
                            .map(|s| s.to_string())
                            .collect();
                        let _ = writeln!(
                            out,
                            "  {} {} {} {{{}}} reporter={}",
                            group,
                            state_str,
                            record.filter.mode(),
                            sources.join(","),
                            record
                                .last_reporter
                                .map(|r| r.to_string())
                                .unwrap_or_else(|| "-".to_string()),
                        );
                    }
                    StatusDetail::Summary => unreachable!(),
                }
            }
        }
        if detail == StatusDetail::Full {
            let _ = writeln!(out, "forwarding entries: {}", self.applied.len());
            for entry in self.applied.values() {
                let _ = writeln!(out, "  {}", entry);
            }
            if let Some(up) = &self.upstream {
                let _ = writeln!(out, "advertised upstream: {}", up.advertised().len());
                for (group, filter) in up.advertised() {
                    let _ = writeln!(out, "  {} {}", group, filter.mode());
                }
            }
        }
        out
    }
}
