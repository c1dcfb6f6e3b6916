// SPDX-License-Identifier: Apache-2.0 OR MIT
//! In-memory forwarding gateway for tests.
//!
//! Mirrors the idempotence contract of the real gateway and exposes its
//! applied state through a shared handle so tests can assert on the kernel
//! view. Individual operations can be made to fail to exercise the retry
//! path.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::{ForwardingEntry, Vif};

use super::{ForwardingGateway, GatewayError};

/// Observable state of the mock kernel.
#[derive(Debug, Default)]
pub struct MockState {
    /// Registered VIF slots and their backing interfaces.
    pub vifs: BTreeMap<Vif, u32>,
    /// Applied forwarding entries keyed by (group, source).
    pub entries: BTreeMap<(IpAddr, Option<IpAddr>), ForwardingEntry>,
    /// Applied group joins (host role).
    pub joined: BTreeSet<(u32, IpAddr)>,
    /// Transmitted packets: (ifindex, destination, payload).
    pub sent: Vec<(u32, IpAddr, Vec<u8>)>,
    /// Operations that fail on their next invocation.
    pub fail_ops: HashSet<&'static str>,
    /// Every mutation attempt, in order.
    pub call_log: Vec<String>,
}

impl MockState {
    fn check_fail(&mut self, op: &'static str) -> Result<(), GatewayError> {
        if self.fail_ops.remove(op) {
            Err(GatewayError::Syscall {
                op,
                source: std::io::Error::from_raw_os_error(libc::ENOBUFS),
            })
        } else {
            Ok(())
        }
    }
}

/// Shared view over the mock kernel state.
pub type MockHandle = Arc<Mutex<MockState>>;

/// Test double for [`ForwardingGateway`].
pub struct MockGateway {
    state: MockHandle,
}

impl MockGateway {
    pub fn new() -> (Self, MockHandle) {
        let state: MockHandle = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl ForwardingGateway for MockGateway {
    fn add_vif(&mut self, vif: Vif, ifindex: u32) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.call_log.push(format!("add_vif {} if{}", vif, ifindex));
        if state.vifs.get(&vif) == Some(&ifindex) {
            return Ok(());
        }
        state.check_fail("add_vif")?;
        state.vifs.insert(vif, ifindex);
        Ok(())
    }

    fn del_vif(&mut self, vif: Vif) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.call_log.push(format!("del_vif {}", vif));
        if !state.vifs.contains_key(&vif) {
            return Ok(());
        }
        state.check_fail("del_vif")?;
        state.vifs.remove(&vif);
        Ok(())
    }

    fn add_forwarding_entry(&mut self, entry: &ForwardingEntry) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.call_log.push(format!("add_mfc {}", entry));
        let key = (entry.group, entry.source);
        if state.entries.get(&key) == Some(entry) {
            return Ok(());
        }
        state.check_fail("add_forwarding_entry")?;
        state.entries.insert(key, entry.clone());
        Ok(())
    }

    fn del_forwarding_entry(&mut self, entry: &ForwardingEntry) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.call_log.push(format!("del_mfc {}", entry));
        let key = (entry.group, entry.source);
        if !state.entries.contains_key(&key) {
            return Ok(());
        }
        state.check_fail("del_forwarding_entry")?;
        state.entries.remove(&key);
        Ok(())
    }

    fn join_group(&mut self, ifindex: u32, group: IpAddr) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.call_log.push(format!("join if{} {}", ifindex, group));
        if state.joined.contains(&(ifindex, group)) {
            return Ok(());
        }
        state.check_fail("join_group")?;
        state.joined.insert((ifindex, group));
        Ok(())
    }

    fn leave_group(&mut self, ifindex: u32, group: IpAddr) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.call_log.push(format!("leave if{} {}", ifindex, group));
        if !state.joined.contains(&(ifindex, group)) {
            return Ok(());
        }
        state.check_fail("leave_group")?;
        state.joined.remove(&(ifindex, group));
        Ok(())
    }

    fn send_packet(
        &mut self,
        ifindex: u32,
        dst: IpAddr,
        payload: &[u8],
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("send_packet")?;
        state.sent.push((ifindex, dst, payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn entry(group: &str, outputs: &[u16]) -> ForwardingEntry {
        ForwardingEntry {
            group: group.parse().unwrap(),
            source: None,
            input: Vif(0),
            outputs: outputs.iter().map(|v| Vif(*v)).collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn test_repeated_add_is_noop() {
        let (mut gateway, handle) = MockGateway::new();
        let e = entry("239.1.1.1", &[1]);
        gateway.add_forwarding_entry(&e).unwrap();
        gateway.add_forwarding_entry(&e).unwrap();
        assert_eq!(handle.lock().unwrap().entries.len(), 1);
    }

    #[test]
    fn test_del_absent_is_noop() {
        let (mut gateway, _handle) = MockGateway::new();
        gateway.del_forwarding_entry(&entry("239.1.1.1", &[1])).unwrap();
        gateway.del_vif(Vif(3)).unwrap();
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let (mut gateway, handle) = MockGateway::new();
        handle.lock().unwrap().fail_ops.insert("add_forwarding_entry");

        let e = entry("239.1.1.1", &[1]);
        assert!(gateway.add_forwarding_entry(&e).is_err());
        assert!(handle.lock().unwrap().entries.is_empty());

        // Retry succeeds.
        gateway.add_forwarding_entry(&e).unwrap();
        assert_eq!(handle.lock().unwrap().entries.len(), 1);
    }
}
