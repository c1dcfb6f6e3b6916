// SPDX-License-Identifier: Apache-2.0 OR MIT
//! End-to-end scenarios through a full proxy instance: message loop, timer
//! service, and mock kernel wired together. Tests run on tokio's paused
//! clock so protocol timers (260s membership intervals, second-scale
//! last-member queries) play out instantly and deterministically.

use std::net::IpAddr;
use std::time::Duration;

use tokio::time::sleep;

use mgproxy::kernel::mock::{MockGateway, MockHandle};
use mgproxy::logging::Logger;
use mgproxy::protocols::{
    self, igmp::IgmpReportBuilder, MembershipEvent, PacketBuilder, ProtocolFamily, QuerierConfig,
    RecordType,
};
use mgproxy::proxy::{InterfaceSpec, ProxyHandle, ProxyInstance, ProxyMessage, StatusDetail};
use mgproxy::shutdown::ShutdownFlag;
use mgproxy::timing::TimingService;
use mgproxy::{RouteTableId, Vif};

const UPSTREAM_IFINDEX: u32 = 2;
const D1_IFINDEX: u32 = 7;
const D2_IFINDEX: u32 = 8;

struct Proxy {
    handle: ProxyHandle,
    kernel: MockHandle,
    shutdown: ShutdownFlag,
}

impl Proxy {
    /// Wait until every message submitted so far has been processed. The
    /// queue is FIFO, so an answered status query is a barrier.
    async fn settle(&self) {
        self.handle
            .status(StatusDetail::Summary)
            .await
            .expect("instance alive");
    }

    fn submit(&self, message: ProxyMessage) {
        self.handle.submit(message).expect("instance alive");
    }

    fn join(&self, ifindex: u32, reporter: &str, group: &str) {
        self.submit(report_packet(
            ifindex,
            reporter,
            RecordType::ModeIsExclude,
            group,
        ));
    }

    fn leave(&self, ifindex: u32, reporter: &str, group: &str) {
        self.submit(report_packet(
            ifindex,
            reporter,
            RecordType::ChangeToInclude,
            group,
        ));
    }

    /// Membership reports the instance sent out the upstream interface,
    /// decoded back through the wire codec.
    fn upstream_reports(&self) -> Vec<MembershipEvent> {
        let kernel = self.kernel.lock().unwrap();
        kernel
            .sent
            .iter()
            .filter(|(ifindex, _, _)| *ifindex == UPSTREAM_IFINDEX)
            .filter_map(|(_, _, payload)| {
                protocols::parse_packet(
                    ProtocolFamily::Igmp,
                    "10.1.0.2".parse().unwrap(),
                    payload,
                )
                .ok()
            })
            .collect()
    }

    fn wildcard_outputs(&self, group: &str) -> Option<Vec<u16>> {
        let group: IpAddr = group.parse().unwrap();
        let kernel = self.kernel.lock().unwrap();
        kernel
            .entries
            .get(&(group, None))
            .map(|entry| entry.outputs.iter().map(|vif| vif.0).collect())
    }

    fn advertises(&self, group: &str) -> bool {
        let group: IpAddr = group.parse().unwrap();
        self.kernel
            .lock()
            .unwrap()
            .joined
            .contains(&(UPSTREAM_IFINDEX, group))
    }
}

fn iface(ifindex: u32, name: &str, addr: &str) -> InterfaceSpec {
    InterfaceSpec {
        ifindex,
        name: name.to_string(),
        addr: addr.parse().unwrap(),
    }
}

fn report_packet(
    ifindex: u32,
    reporter: &str,
    record_type: RecordType,
    group: &str,
) -> ProxyMessage {
    let packet = IgmpReportBuilder::new()
        .record(record_type, group.parse().unwrap(), vec![])
        .build();
    ProxyMessage::Packet {
        ifindex,
        src: reporter.parse().unwrap(),
        data: packet.into(),
    }
}

/// Start an instance with upstream eth0 and downstream d1 attached.
async fn start_proxy() -> Proxy {
    let (gateway, kernel) = MockGateway::new();
    let (timing, timing_worker) = TimingService::new(Logger::discard());
    tokio::spawn(timing_worker.run());
    let shutdown = ShutdownFlag::new();

    let instance = ProxyInstance::new(
        RouteTableId(0),
        ProtocolFamily::Igmp,
        QuerierConfig::default(),
        Box::new(gateway),
        timing,
        shutdown.clone(),
        Logger::discard(),
    );
    let handle = instance.handle();
    tokio::spawn(instance.run());

    let proxy = Proxy {
        handle,
        kernel,
        shutdown,
    };
    proxy.submit(ProxyMessage::AddUpstream(iface(
        UPSTREAM_IFINDEX,
        "eth0",
        "10.1.0.2",
    )));
    proxy.submit(ProxyMessage::AddDownstream(iface(
        D1_IFINDEX,
        "d1",
        "192.168.1.1",
    )));
    proxy.settle().await;
    proxy
}

#[tokio::test(start_paused = true)]
async fn scenario_a_join_creates_wildcard_route_and_advertisement() {
    let proxy = start_proxy().await;

    proxy.join(D1_IFINDEX, "192.168.1.50", "239.1.1.1");
    proxy.settle().await;

    // Forwarding: (G, *, out = {D1}) with the upstream as input.
    assert_eq!(proxy.wildcard_outputs("239.1.1.1"), Some(vec![1]));
    {
        let kernel = proxy.kernel.lock().unwrap();
        let entry = kernel
            .entries
            .get(&("239.1.1.1".parse().unwrap(), None))
            .unwrap();
        assert_eq!(entry.input, Vif(0));
    }

    // Upstream advertises G: kernel join plus a state-change report.
    assert!(proxy.advertises("239.1.1.1"));
    let reports = proxy.upstream_reports();
    assert!(reports.iter().any(|event| matches!(
        event,
        MembershipEvent::Report { records, .. }
            if records.iter().any(|r| r.record_type == RecordType::ModeIsExclude
                || r.record_type == RecordType::ChangeToExclude)
    )));

    proxy.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn scenario_b_second_downstream_extends_output_set() {
    let proxy = start_proxy().await;
    proxy.join(D1_IFINDEX, "192.168.1.50", "239.1.1.1");
    proxy.settle().await;

    proxy.submit(ProxyMessage::AddDownstream(iface(
        D2_IFINDEX,
        "d2",
        "192.168.2.1",
    )));
    proxy.join(D2_IFINDEX, "192.168.2.50", "239.1.1.1");
    proxy.settle().await;

    // Same entry, wider output set.
    assert_eq!(proxy.wildcard_outputs("239.1.1.1"), Some(vec![1, 2]));
    assert!(proxy.advertises("239.1.1.1"));

    proxy.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn scenario_c_expiry_narrows_then_removes_forwarding() {
    let proxy = start_proxy().await;
    proxy.submit(ProxyMessage::AddDownstream(iface(
        D2_IFINDEX,
        "d2",
        "192.168.2.1",
    )));
    proxy.join(D1_IFINDEX, "192.168.1.50", "239.1.1.1");
    proxy.join(D2_IFINDEX, "192.168.2.50", "239.1.1.1");
    proxy.settle().await;
    assert_eq!(proxy.wildcard_outputs("239.1.1.1"), Some(vec![1, 2]));

    // D1 leaves and never answers the specific queries; D2 keeps
    // refreshing. D1's membership runs down through CHECKING to removal.
    proxy.leave(D1_IFINDEX, "192.168.1.50", "239.1.1.1");
    for _ in 0..10 {
        sleep(Duration::from_secs(1)).await;
        proxy.join(D2_IFINDEX, "192.168.2.50", "239.1.1.1");
        proxy.settle().await;
    }

    assert_eq!(
        proxy.wildcard_outputs("239.1.1.1"),
        Some(vec![2]),
        "only D2 still wants the group"
    );
    assert!(proxy.advertises("239.1.1.1"), "upstream still advertises");

    // Now D2 goes silent; the member timer expires, specific queries go
    // unanswered, and the route disappears entirely.
    sleep(Duration::from_secs(400)).await;
    proxy.settle().await;

    assert_eq!(proxy.wildcard_outputs("239.1.1.1"), None);
    assert!(
        !proxy.advertises("239.1.1.1"),
        "upstream stops advertising when nobody wants the group"
    );
    let reports = proxy.upstream_reports();
    assert!(
        reports.iter().any(|event| matches!(
            event,
            MembershipEvent::Report { records, .. }
                if records.iter().any(|r| r.record_type == RecordType::ChangeToInclude
                    && r.sources.is_empty())
        )),
        "an empty TO_IN retracts the advertisement"
    );

    proxy.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn scenario_d_malformed_packets_drop_without_state_change() {
    let proxy = start_proxy().await;

    // Wrong family: an MLD-style source on an IGMP instance.
    proxy.submit(ProxyMessage::Packet {
        ifindex: D1_IFINDEX,
        src: "fe80::1".parse().unwrap(),
        data: vec![0x16, 0, 0, 0, 239, 1, 1, 1].into(),
    });
    // Truncated garbage.
    proxy.submit(ProxyMessage::Packet {
        ifindex: D1_IFINDEX,
        src: "192.168.1.50".parse().unwrap(),
        data: vec![0xff, 0x01].into(),
    });
    proxy.settle().await;

    assert!(proxy.kernel.lock().unwrap().entries.is_empty());
    let status = proxy.handle.status(StatusDetail::Groups).await.unwrap();
    assert!(!status.contains("239."), "no group state from bad packets");

    // The instance keeps processing subsequent messages.
    proxy.join(D1_IFINDEX, "192.168.1.50", "239.1.1.1");
    proxy.settle().await;
    assert_eq!(proxy.wildcard_outputs("239.1.1.1"), Some(vec![1]));

    proxy.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn add_downstream_twice_is_a_noop() {
    let proxy = start_proxy().await;
    proxy.join(D1_IFINDEX, "192.168.1.50", "239.1.1.1");
    proxy.settle().await;

    let before_status = proxy.handle.status(StatusDetail::Full).await.unwrap();
    let (before_vifs, before_entries) = {
        let kernel = proxy.kernel.lock().unwrap();
        (kernel.vifs.clone(), kernel.entries.clone())
    };

    proxy.submit(ProxyMessage::AddDownstream(iface(
        D1_IFINDEX,
        "d1",
        "192.168.1.1",
    )));
    proxy.settle().await;

    assert_eq!(
        proxy.handle.status(StatusDetail::Full).await.unwrap(),
        before_status
    );
    let kernel = proxy.kernel.lock().unwrap();
    assert_eq!(kernel.vifs, before_vifs);
    assert_eq!(kernel.entries, before_entries);

    proxy.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn del_downstream_twice_is_a_noop_and_cleans_up() {
    let proxy = start_proxy().await;
    proxy.join(D1_IFINDEX, "192.168.1.50", "239.1.1.1");
    proxy.settle().await;

    proxy.submit(ProxyMessage::DelDownstream(D1_IFINDEX));
    proxy.submit(ProxyMessage::DelDownstream(D1_IFINDEX));
    proxy.settle().await;

    let (vifs, entries) = {
        let kernel = proxy.kernel.lock().unwrap();
        (kernel.vifs.clone(), kernel.entries.clone())
    };
    assert!(!vifs.contains_key(&Vif(1)));
    assert!(entries.is_empty());
    assert!(!proxy.advertises("239.1.1.1"));

    // Timers for the removed interface were cancelled; nothing fires later
    // that would resurrect state or crash the loop.
    sleep(Duration::from_secs(600)).await;
    proxy.settle().await;
    assert!(proxy.kernel.lock().unwrap().entries.is_empty());

    proxy.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn union_tracks_any_sequence_of_joins_and_leaves() {
    let proxy = start_proxy().await;
    proxy.submit(ProxyMessage::AddDownstream(iface(
        D2_IFINDEX,
        "d2",
        "192.168.2.1",
    )));

    proxy.join(D1_IFINDEX, "192.168.1.50", "239.1.1.1");
    proxy.join(D2_IFINDEX, "192.168.2.50", "239.2.2.2");
    proxy.settle().await;
    assert!(proxy.advertises("239.1.1.1"));
    assert!(proxy.advertises("239.2.2.2"));

    // Removing one downstream must retract exactly its contribution.
    proxy.submit(ProxyMessage::DelDownstream(D2_IFINDEX));
    proxy.settle().await;
    assert!(proxy.advertises("239.1.1.1"));
    assert!(!proxy.advertises("239.2.2.2"));
    assert_eq!(proxy.wildcard_outputs("239.2.2.2"), None);

    proxy.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn downstream_queries_are_emitted_on_attach() {
    let proxy = start_proxy().await;
    proxy.settle().await;

    // The initial query cycle sends a general query to all-hosts on the
    // downstream interface.
    let kernel = proxy.kernel.lock().unwrap();
    let all_hosts: IpAddr = "224.0.0.1".parse().unwrap();
    assert!(kernel
        .sent
        .iter()
        .any(|(ifindex, dst, _)| *ifindex == D1_IFINDEX && *dst == all_hosts));

    drop(kernel);
    proxy.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_instance_loop() {
    let proxy = start_proxy().await;
    proxy.shutdown.trigger();

    // Give the loop a moment to observe the flag, then expect submissions
    // to keep succeeding (queue exists) but status to go unanswered.
    sleep(Duration::from_millis(100)).await;
    assert!(proxy
        .handle
        .status(StatusDetail::Summary)
        .await
        .is_err());
}
