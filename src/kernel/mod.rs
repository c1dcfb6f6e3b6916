// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Kernel multicast forwarding gateway.
//!
//! The proxy core talks to the kernel through the [`ForwardingGateway`]
//! trait: virtual-interface registration, forwarding-cache mutation, group
//! membership on the upstream, and protocol packet transmission. Receive is
//! handled by a separate reader component that turns raw packets into
//! instance messages.
//!
//! Every operation is idempotent from the core's point of view: repeating
//! an add for an applied entry or a delete for an absent one is a no-op.
//! Implementations guarantee this by tracking what they have applied.

pub mod mock;
pub mod mrt;
pub mod reader;

use std::net::IpAddr;

use thiserror::Error;

use crate::{ForwardingEntry, Vif};

/// Failures from the kernel control surface.
///
/// None of these are fatal to a proxy instance; failed mutations are logged
/// and retried by the next state change that reproduces the entry.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel forwarding table is full")]
    TableFull,

    #[error("address {addr} does not match the gateway's family")]
    FamilyMismatch { addr: IpAddr },

    #[error("multicast routing not available: {0}")]
    NotSupported(String),
}

impl GatewayError {
    pub(crate) fn syscall(op: &'static str) -> Self {
        let source = std::io::Error::last_os_error();
        if source.raw_os_error() == Some(libc::ENOBUFS) {
            GatewayError::TableFull
        } else {
            GatewayError::Syscall { op, source }
        }
    }
}

/// Control surface of one kernel multicast routing table.
///
/// All calls are synchronous and non-blocking: the underlying sockets are
/// opened non-blocking, so a congested kernel path surfaces as an error
/// instead of stalling the instance's message loop.
pub trait ForwardingGateway: Send {
    /// Register a virtual interface slot backed by an OS interface.
    fn add_vif(&mut self, vif: Vif, ifindex: u32) -> Result<(), GatewayError>;

    /// Release a virtual interface slot.
    fn del_vif(&mut self, vif: Vif) -> Result<(), GatewayError>;

    /// Install a forwarding-cache entry.
    fn add_forwarding_entry(&mut self, entry: &ForwardingEntry) -> Result<(), GatewayError>;

    /// Remove a forwarding-cache entry.
    fn del_forwarding_entry(&mut self, entry: &ForwardingEntry) -> Result<(), GatewayError>;

    /// Join a multicast group on an interface (host role).
    fn join_group(&mut self, ifindex: u32, group: IpAddr) -> Result<(), GatewayError>;

    /// Leave a multicast group on an interface.
    fn leave_group(&mut self, ifindex: u32, group: IpAddr) -> Result<(), GatewayError>;

    /// Transmit a membership protocol packet out of an interface.
    fn send_packet(
        &mut self,
        ifindex: u32,
        dst: IpAddr,
        payload: &[u8],
    ) -> Result<(), GatewayError>;
}
