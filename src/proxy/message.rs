// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Messages feeding a proxy instance.
//!
//! Everything that can happen to an instance arrives through one tagged
//! enum: administrative reconfiguration from the orchestrator, raw protocol
//! packets from the readers, timer expirations from the timing service, and
//! status queries. The sender moves the message by value; the instance loop
//! is the sole consumer.

use std::net::IpAddr;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::timing::{TimerId, TimerSink};

/// Identity of an OS interface as the orchestrator hands it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    /// OS interface index.
    pub ifindex: u32,
    /// Interface name, for logging and status output.
    pub name: String,
    /// Our address on the interface, used as the query source.
    pub addr: IpAddr,
}

impl std::fmt::Display for InterfaceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(#{})", self.name, self.ifindex)
    }
}

/// Detail level for status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDetail {
    /// Interface roles and counts only.
    Summary,
    /// Plus per-group membership state.
    Groups,
    /// Plus filter modes, sources and applied forwarding entries.
    Full,
}

/// The closed set of messages an instance processes.
#[derive(Debug)]
pub enum ProxyMessage {
    /// Attach the upstream interface. Sent once at startup.
    AddUpstream(InterfaceSpec),
    /// Attach a downstream interface and start its query cycle.
    AddDownstream(InterfaceSpec),
    /// Detach a downstream interface and drop its membership state.
    DelDownstream(u32),
    /// A raw membership protocol packet received on an interface.
    Packet {
        ifindex: u32,
        src: IpAddr,
        data: Bytes,
    },
    /// A previously registered timer fired.
    TimerFired(TimerId),
    /// Read-only status snapshot request.
    StatusQuery {
        detail: StatusDetail,
        reply: oneshot::Sender<String>,
    },
}

/// Error returned when submitting to an instance that has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceGone;

impl std::fmt::Display for InstanceGone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proxy instance is no longer running")
    }
}

impl std::error::Error for InstanceGone {}

/// Cloneable submission handle for one proxy instance.
///
/// `submit` never blocks and preserves per-producer FIFO order; ordering
/// across producers is admission order into the queue.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    tx: mpsc::UnboundedSender<ProxyMessage>,
}

impl ProxyHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ProxyMessage>) -> Self {
        Self { tx }
    }

    pub fn submit(&self, message: ProxyMessage) -> Result<(), InstanceGone> {
        self.tx.send(message).map_err(|_| InstanceGone)
    }

    /// Request a status snapshot. Resolves once the instance's loop reaches
    /// the query; read-only with respect to instance state.
    pub async fn status(&self, detail: StatusDetail) -> Result<String, InstanceGone> {
        let (reply, rx) = oneshot::channel();
        self.submit(ProxyMessage::StatusQuery { detail, reply })?;
        rx.await.map_err(|_| InstanceGone)
    }
}

/// Timers notify instances by enqueuing a message like any other producer.
impl TimerSink for ProxyHandle {
    fn timer_fired(&self, id: TimerId) {
        let _ = self.submit(ProxyMessage::TimerFired(id));
    }
}
