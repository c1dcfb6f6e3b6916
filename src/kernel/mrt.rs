// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Linux multicast routing gateway (MRT / MRT6 control surface).
//!
//! One raw socket per routing table carries the whole control surface: the
//! `MRT_*` socket options for VIF and forwarding-cache mutation, group
//! membership joins for the host role, and protocol packet transmission.
//! IGMP tables use a raw IGMP socket at the `IPPROTO_IP` level; MLD tables
//! use a raw ICMPv6 socket at the `IPPROTO_IPV6` level with the `MRT6_*`
//! option numbers.
//!
//! The same socket also receives membership protocol packets; a duplicate
//! of its fd is handed to [`super::reader::PacketReader`].

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::logging::{Facility, Logger};
use crate::protocols::ProtocolFamily;
use crate::{log_debug, log_info, log_warning, ForwardingEntry, RouteTableId, Vif};

use super::{ForwardingGateway, GatewayError};

// MRT socket options (IPPROTO_IP level), from <linux/mroute.h>
const MRT_INIT: libc::c_int = 200;
const MRT_DONE: libc::c_int = 201;
const MRT_ADD_VIF: libc::c_int = 202;
const MRT_DEL_VIF: libc::c_int = 203;
const MRT_ADD_MFC: libc::c_int = 204;
const MRT_DEL_MFC: libc::c_int = 205;
const MRT_TABLE: libc::c_int = 209;
const MRT_ADD_MFC_PROXY: libc::c_int = 210;
const MRT_DEL_MFC_PROXY: libc::c_int = 211;

// MRT6 socket options (IPPROTO_IPV6 level), from <linux/mroute6.h>
const MRT6_INIT: libc::c_int = 200;
const MRT6_DONE: libc::c_int = 201;
const MRT6_ADD_MIF: libc::c_int = 202;
const MRT6_DEL_MIF: libc::c_int = 203;
const MRT6_ADD_MFC: libc::c_int = 204;
const MRT6_DEL_MFC: libc::c_int = 205;
const MRT6_TABLE: libc::c_int = 209;
const MRT6_ADD_MFC_PROXY: libc::c_int = 210;
const MRT6_DEL_MFC_PROXY: libc::c_int = 211;

const MAXVIFS: usize = 32;
const VIFF_USE_IFINDEX: u8 = 0x8;

/// struct vifctl with the local-address union taken as an ifindex.
#[repr(C)]
struct VifCtl {
    vifc_vifi: u16,
    vifc_flags: u8,
    vifc_threshold: u8,
    vifc_rate_limit: u32,
    vifc_lcl_ifindex: u32,
    vifc_rmt_addr: libc::in_addr,
}

/// struct mfcctl, the IPv4 forwarding-cache entry.
#[repr(C)]
struct MfcCtl {
    mfcc_origin: libc::in_addr,
    mfcc_mcastgrp: libc::in_addr,
    mfcc_parent: u16,
    mfcc_ttls: [u8; MAXVIFS],
    mfcc_pkt_cnt: libc::c_uint,
    mfcc_byte_cnt: libc::c_uint,
    mfcc_wrong_if: libc::c_uint,
    mfcc_expire: libc::c_int,
}

/// struct mif6ctl, the IPv6 virtual-interface registration.
#[repr(C)]
struct Mif6Ctl {
    mif6c_mifi: u16,
    mif6c_flags: u8,
    vifc_threshold: u8,
    mif6c_pifi: u16,
    vifc_rate_limit: u32,
}

/// struct mf6cctl, the IPv6 forwarding-cache entry.
#[repr(C)]
struct Mf6cCtl {
    mf6cc_origin: libc::sockaddr_in6,
    mf6cc_mcastgrp: libc::sockaddr_in6,
    mf6cc_parent: u16,
    mf6cc_ifset: [u32; 8],
}

/// Gateway over one kernel multicast routing table.
pub struct MrtGateway {
    family: ProtocolFamily,
    table: RouteTableId,
    socket: OwnedFd,
    /// Applied VIF registrations, for idempotent add/del.
    vifs: HashMap<Vif, u32>,
    /// Applied forwarding entries keyed by (group, source).
    entries: HashMap<(IpAddr, Option<IpAddr>), ForwardingEntry>,
    /// Applied group joins.
    joined: std::collections::HashSet<(u32, IpAddr)>,
    logger: Logger,
}

impl MrtGateway {
    /// Open the routing table. Fails when the kernel lacks multicast
    /// routing support or another daemon already owns the table.
    pub fn new(
        family: ProtocolFamily,
        table: RouteTableId,
        logger: Logger,
    ) -> Result<Self, GatewayError> {
        let socket = create_control_socket(family)?;

        let level = mrt_level(family);
        let (table_opt, init_opt) = match family {
            ProtocolFamily::Igmp => (MRT_TABLE, MRT_INIT),
            ProtocolFamily::Mld => (MRT6_TABLE, MRT6_INIT),
        };

        // Table selection must precede MRT_INIT.
        if table.0 != 0 {
            setsockopt_int(&socket, level, table_opt, table.0 as libc::c_int)
                .map_err(|_| GatewayError::syscall("MRT_TABLE"))?;
        }

        if setsockopt_int(&socket, level, init_opt, 1).is_err() {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOPROTOOPT) => GatewayError::NotSupported(
                    "kernel has no multicast routing support".to_string(),
                ),
                Some(libc::EADDRINUSE) => GatewayError::NotSupported(format!(
                    "{} already claimed by another routing daemon",
                    table
                )),
                _ => GatewayError::Syscall {
                    op: "MRT_INIT",
                    source: err,
                },
            });
        }

        configure_send_path(&socket, family, &logger);

        log_info!(
            logger,
            Facility::Kernel,
            &format!("{} gateway opened on {}", family, table)
        );

        Ok(Self {
            family,
            table,
            socket,
            vifs: HashMap::new(),
            entries: HashMap::new(),
            joined: std::collections::HashSet::new(),
            logger,
        })
    }

    /// Duplicate the control socket fd for a packet reader.
    pub fn clone_fd(&self) -> std::io::Result<OwnedFd> {
        self.socket.try_clone()
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    fn check_family(&self, addr: IpAddr) -> Result<(), GatewayError> {
        if self.family.contains(&addr) {
            Ok(())
        } else {
            Err(GatewayError::FamilyMismatch { addr })
        }
    }

    fn set_mfc(&self, entry: &ForwardingEntry, add: bool) -> Result<(), GatewayError> {
        let level = mrt_level(self.family);
        match self.family {
            ProtocolFamily::Igmp => {
                let origin = match entry.source {
                    Some(IpAddr::V4(v4)) => v4,
                    None => Ipv4Addr::UNSPECIFIED,
                    Some(other) => return Err(GatewayError::FamilyMismatch { addr: other }),
                };
                let group = match entry.group {
                    IpAddr::V4(v4) => v4,
                    other => return Err(GatewayError::FamilyMismatch { addr: other }),
                };
                let mut ttls = [0u8; MAXVIFS];
                for vif in &entry.outputs {
                    if (vif.0 as usize) < MAXVIFS {
                        ttls[vif.0 as usize] = 1;
                    }
                }
                let req = MfcCtl {
                    mfcc_origin: in_addr(origin),
                    mfcc_mcastgrp: in_addr(group),
                    mfcc_parent: entry.input.0,
                    mfcc_ttls: ttls,
                    mfcc_pkt_cnt: 0,
                    mfcc_byte_cnt: 0,
                    mfcc_wrong_if: 0,
                    mfcc_expire: 0,
                };
                // Wildcard-source entries use the proxy variants.
                let opt = match (add, entry.source.is_some()) {
                    (true, true) => MRT_ADD_MFC,
                    (true, false) => MRT_ADD_MFC_PROXY,
                    (false, true) => MRT_DEL_MFC,
                    (false, false) => MRT_DEL_MFC_PROXY,
                };
                setsockopt_struct(&self.socket, level, opt, &req)
                    .map_err(|_| GatewayError::syscall("MRT_ADD_MFC"))
            }
            ProtocolFamily::Mld => {
                let origin = match entry.source {
                    Some(IpAddr::V6(v6)) => v6,
                    None => Ipv6Addr::UNSPECIFIED,
                    Some(other) => return Err(GatewayError::FamilyMismatch { addr: other }),
                };
                let group = match entry.group {
                    IpAddr::V6(v6) => v6,
                    other => return Err(GatewayError::FamilyMismatch { addr: other }),
                };
                let mut ifset = [0u32; 8];
                for vif in &entry.outputs {
                    let bit = vif.0 as usize;
                    if bit < 256 {
                        ifset[bit / 32] |= 1 << (bit % 32);
                    }
                }
                let req = Mf6cCtl {
                    mf6cc_origin: sockaddr_in6(origin, 0),
                    mf6cc_mcastgrp: sockaddr_in6(group, 0),
                    mf6cc_parent: entry.input.0,
                    mf6cc_ifset: ifset,
                };
                let opt = match (add, entry.source.is_some()) {
                    (true, true) => MRT6_ADD_MFC,
                    (true, false) => MRT6_ADD_MFC_PROXY,
                    (false, true) => MRT6_DEL_MFC,
                    (false, false) => MRT6_DEL_MFC_PROXY,
                };
                setsockopt_struct(&self.socket, level, opt, &req)
                    .map_err(|_| GatewayError::syscall("MRT6_ADD_MFC"))
            }
        }
    }
}

impl ForwardingGateway for MrtGateway {
    fn add_vif(&mut self, vif: Vif, ifindex: u32) -> Result<(), GatewayError> {
        if self.vifs.get(&vif) == Some(&ifindex) {
            return Ok(());
        }
        if vif.0 as usize >= MAXVIFS {
            return Err(GatewayError::TableFull);
        }
        match self.family {
            ProtocolFamily::Igmp => {
                let req = VifCtl {
                    vifc_vifi: vif.0,
                    vifc_flags: VIFF_USE_IFINDEX,
                    vifc_threshold: 1,
                    vifc_rate_limit: 0,
                    vifc_lcl_ifindex: ifindex,
                    vifc_rmt_addr: in_addr(Ipv4Addr::UNSPECIFIED),
                };
                setsockopt_struct(&self.socket, libc::IPPROTO_IP, MRT_ADD_VIF, &req)
                    .map_err(|_| GatewayError::syscall("MRT_ADD_VIF"))?;
            }
            ProtocolFamily::Mld => {
                let req = Mif6Ctl {
                    mif6c_mifi: vif.0,
                    mif6c_flags: 0,
                    vifc_threshold: 1,
                    mif6c_pifi: ifindex as u16,
                    vifc_rate_limit: 0,
                };
                setsockopt_struct(&self.socket, libc::IPPROTO_IPV6, MRT6_ADD_MIF, &req)
                    .map_err(|_| GatewayError::syscall("MRT6_ADD_MIF"))?;
            }
        }
        self.vifs.insert(vif, ifindex);
        log_debug!(
            self.logger,
            Facility::Kernel,
            &format!("{}: registered {} for ifindex {}", self.table, vif, ifindex)
        );
        Ok(())
    }

    fn del_vif(&mut self, vif: Vif) -> Result<(), GatewayError> {
        if !self.vifs.contains_key(&vif) {
            return Ok(());
        }
        match self.family {
            ProtocolFamily::Igmp => {
                let req = VifCtl {
                    vifc_vifi: vif.0,
                    vifc_flags: 0,
                    vifc_threshold: 0,
                    vifc_rate_limit: 0,
                    vifc_lcl_ifindex: 0,
                    vifc_rmt_addr: in_addr(Ipv4Addr::UNSPECIFIED),
                };
                setsockopt_struct(&self.socket, libc::IPPROTO_IP, MRT_DEL_VIF, &req)
                    .map_err(|_| GatewayError::syscall("MRT_DEL_VIF"))?;
            }
            ProtocolFamily::Mld => {
                let req = Mif6Ctl {
                    mif6c_mifi: vif.0,
                    mif6c_flags: 0,
                    vifc_threshold: 0,
                    mif6c_pifi: 0,
                    vifc_rate_limit: 0,
                };
                setsockopt_struct(&self.socket, libc::IPPROTO_IPV6, MRT6_DEL_MIF, &req)
                    .map_err(|_| GatewayError::syscall("MRT6_DEL_MIF"))?;
            }
        }
        self.vifs.remove(&vif);
        Ok(())
    }

    fn add_forwarding_entry(&mut self, entry: &ForwardingEntry) -> Result<(), GatewayError> {
        let key = (entry.group, entry.source);
        if self.entries.get(&key) == Some(entry) {
            return Ok(());
        }
        self.set_mfc(entry, true)?;
        self.entries.insert(key, entry.clone());
        log_debug!(
            self.logger,
            Facility::Kernel,
            &format!("{}: installed {}", self.table, entry)
        );
        Ok(())
    }

    fn del_forwarding_entry(&mut self, entry: &ForwardingEntry) -> Result<(), GatewayError> {
        let key = (entry.group, entry.source);
        if !self.entries.contains_key(&key) {
            return Ok(());
        }
        self.set_mfc(entry, false)?;
        self.entries.remove(&key);
        log_debug!(
            self.logger,
            Facility::Kernel,
            &format!("{}: removed {}", self.table, entry)
        );
        Ok(())
    }

    fn join_group(&mut self, ifindex: u32, group: IpAddr) -> Result<(), GatewayError> {
        self.check_family(group)?;
        if !self.joined.insert((ifindex, group)) {
            return Ok(());
        }
        let result = match group {
            IpAddr::V4(v4) => {
                let req = libc::ip_mreqn {
                    imr_multiaddr: in_addr(v4),
                    imr_address: in_addr(Ipv4Addr::UNSPECIFIED),
                    imr_ifindex: ifindex as libc::c_int,
                };
                setsockopt_struct(
                    &self.socket,
                    libc::IPPROTO_IP,
                    libc::IP_ADD_MEMBERSHIP,
                    &req,
                )
            }
            IpAddr::V6(v6) => {
                let req = libc::ipv6_mreq {
                    ipv6mr_multiaddr: libc::in6_addr {
                        s6_addr: v6.octets(),
                    },
                    ipv6mr_interface: ifindex,
                };
                setsockopt_struct(
                    &self.socket,
                    libc::IPPROTO_IPV6,
                    libc::IPV6_ADD_MEMBERSHIP,
                    &req,
                )
            }
        };
        result.map_err(|_| {
            self.joined.remove(&(ifindex, group));
            GatewayError::syscall("ADD_MEMBERSHIP")
        })
    }

    fn leave_group(&mut self, ifindex: u32, group: IpAddr) -> Result<(), GatewayError> {
        self.check_family(group)?;
        if !self.joined.remove(&(ifindex, group)) {
            return Ok(());
        }
        let result = match group {
            IpAddr::V4(v4) => {
                let req = libc::ip_mreqn {
                    imr_multiaddr: in_addr(v4),
                    imr_address: in_addr(Ipv4Addr::UNSPECIFIED),
                    imr_ifindex: ifindex as libc::c_int,
                };
                setsockopt_struct(
                    &self.socket,
                    libc::IPPROTO_IP,
                    libc::IP_DROP_MEMBERSHIP,
                    &req,
                )
            }
            IpAddr::V6(v6) => {
                let req = libc::ipv6_mreq {
                    ipv6mr_multiaddr: libc::in6_addr {
                        s6_addr: v6.octets(),
                    },
                    ipv6mr_interface: ifindex,
                };
                setsockopt_struct(
                    &self.socket,
                    libc::IPPROTO_IPV6,
                    libc::IPV6_DROP_MEMBERSHIP,
                    &req,
                )
            }
        };
        result.map_err(|_| GatewayError::syscall("DROP_MEMBERSHIP"))
    }

    fn send_packet(
        &mut self,
        ifindex: u32,
        dst: IpAddr,
        payload: &[u8],
    ) -> Result<(), GatewayError> {
        self.check_family(dst)?;
        let sent = match dst {
            IpAddr::V4(v4) => {
                // Select the egress interface for this transmission.
                let mreqn = libc::ip_mreqn {
                    imr_multiaddr: in_addr(Ipv4Addr::UNSPECIFIED),
                    imr_address: in_addr(Ipv4Addr::UNSPECIFIED),
                    imr_ifindex: ifindex as libc::c_int,
                };
                setsockopt_struct(
                    &self.socket,
                    libc::IPPROTO_IP,
                    libc::IP_MULTICAST_IF,
                    &mreqn,
                )
                .map_err(|_| GatewayError::syscall("IP_MULTICAST_IF"))?;

                let addr = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: 0,
                    sin_addr: in_addr(v4),
                    sin_zero: [0; 8],
                };
                unsafe {
                    libc::sendto(
                        self.socket.as_raw_fd(),
                        payload.as_ptr() as *const libc::c_void,
                        payload.len(),
                        0,
                        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
            }
            IpAddr::V6(v6) => {
                let addr = sockaddr_in6(v6, ifindex);
                unsafe {
                    libc::sendto(
                        self.socket.as_raw_fd(),
                        payload.as_ptr() as *const libc::c_void,
                        payload.len(),
                        0,
                        &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    )
                }
            }
        };
        if sent < 0 {
            return Err(GatewayError::syscall("sendto"));
        }
        Ok(())
    }
}

impl Drop for MrtGateway {
    fn drop(&mut self) {
        let (level, done) = match self.family {
            ProtocolFamily::Igmp => (libc::IPPROTO_IP, MRT_DONE),
            ProtocolFamily::Mld => (libc::IPPROTO_IPV6, MRT6_DONE),
        };
        if setsockopt_int(&self.socket, level, done, 1).is_err() {
            log_warning!(
                self.logger,
                Facility::Kernel,
                &format!("{}: MRT_DONE failed on close", self.table)
            );
        }
    }
}

fn mrt_level(family: ProtocolFamily) -> libc::c_int {
    match family {
        ProtocolFamily::Igmp => libc::IPPROTO_IP,
        ProtocolFamily::Mld => libc::IPPROTO_IPV6,
    }
}

fn create_control_socket(family: ProtocolFamily) -> Result<OwnedFd, GatewayError> {
    let (domain, proto) = match family {
        ProtocolFamily::Igmp => (libc::AF_INET, libc::IPPROTO_IGMP),
        ProtocolFamily::Mld => (libc::AF_INET6, libc::IPPROTO_ICMPV6),
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            proto,
        )
    };
    if fd < 0 {
        return Err(GatewayError::syscall("socket"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Transmit-side socket options. Failures here degrade interoperability but
/// are not fatal, so they are logged and ignored.
fn configure_send_path(socket: &OwnedFd, family: ProtocolFamily, logger: &Logger) {
    match family {
        ProtocolFamily::Igmp => {
            if setsockopt_int(socket, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, 1).is_err() {
                log_warning!(logger, Facility::Kernel, "failed to set IP_MULTICAST_TTL");
            }
            if setsockopt_int(socket, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, 0).is_err() {
                log_warning!(logger, Facility::Kernel, "failed to clear IP_MULTICAST_LOOP");
            }
            // IGMP messages carry the Router Alert IP option.
            let router_alert: [u8; 4] = [0x94, 0x04, 0x00, 0x00];
            let rc = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::IPPROTO_IP,
                    libc::IP_OPTIONS,
                    router_alert.as_ptr() as *const libc::c_void,
                    router_alert.len() as libc::socklen_t,
                )
            };
            if rc < 0 {
                log_warning!(logger, Facility::Kernel, "failed to set Router Alert option");
            }
        }
        ProtocolFamily::Mld => {
            if setsockopt_int(socket, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, 1).is_err() {
                log_warning!(
                    logger,
                    Facility::Kernel,
                    "failed to set IPV6_MULTICAST_HOPS"
                );
            }
            if setsockopt_int(socket, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, 0).is_err() {
                log_warning!(
                    logger,
                    Facility::Kernel,
                    "failed to clear IPV6_MULTICAST_LOOP"
                );
            }
            // Hop-by-hop header with Router Alert (MLD), per RFC 2711.
            let hbh: [u8; 8] = [0, 0, 5, 2, 0, 0, 1, 0];
            let rc = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::IPPROTO_IPV6,
                    libc::IPV6_HOPOPTS,
                    hbh.as_ptr() as *const libc::c_void,
                    hbh.len() as libc::socklen_t,
                )
            };
            if rc < 0 {
                log_warning!(
                    logger,
                    Facility::Kernel,
                    "failed to set hop-by-hop Router Alert"
                );
            }
        }
    }
}

fn in_addr(addr: Ipv4Addr) -> libc::in_addr {
    libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.octets()),
    }
}

fn sockaddr_in6(addr: Ipv6Addr, scope_id: u32) -> libc::sockaddr_in6 {
    libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: 0,
        sin6_flowinfo: 0,
        sin6_addr: libc::in6_addr {
            s6_addr: addr.octets(),
        },
        sin6_scope_id: scope_id,
    }
}

fn setsockopt_int(
    socket: &OwnedFd,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
) -> Result<(), ()> {
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(())
    } else {
        Ok(())
    }
}

fn setsockopt_struct<T>(
    socket: &OwnedFd,
    level: libc::c_int,
    option: libc::c_int,
    value: &T,
) -> Result<(), ()> {
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(())
    } else {
        Ok(())
    }
}
