// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Membership packet reader.
//!
//! Owns a duplicate of the gateway's raw socket and turns received protocol
//! packets into [`ProxyMessage::Packet`] submissions. The reader never
//! touches instance state; validation and dispatch happen inside the
//! instance's own loop.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use bytes::Bytes;
use tokio::io::unix::AsyncFd;

use crate::logging::{Facility, Logger};
use crate::protocols::ProtocolFamily;
use crate::proxy::{ProxyHandle, ProxyMessage};
use crate::shutdown::ShutdownFlag;
use crate::{log_debug, log_info, log_warning};

/// Receive buffer: maximum IP datagram.
const RECV_BUF_LEN: usize = 65536;

struct RawMembershipSocket {
    fd: OwnedFd,
    family: ProtocolFamily,
}

/// One received protocol packet with its arrival metadata.
struct RawPacket {
    ifindex: u32,
    src: IpAddr,
    payload: Bytes,
}

impl AsRawFd for RawMembershipSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl RawMembershipSocket {
    /// Non-blocking read of one packet with ancillary interface data.
    ///
    /// Returns Ok(None) when the packet should be skipped (not an error);
    /// WouldBlock surfaces as Err for the async loop to wait on.
    fn try_read(&self, buf: &mut [u8]) -> std::io::Result<Option<RawPacket>> {
        let mut cmsg_buf = [0u8; 64];
        let mut name: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut name as *mut libc::sockaddr_storage as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len();

        let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let len = n as usize;

        let ifindex = self.ifindex_from_cmsg(&msg);

        match self.family {
            ProtocolFamily::Igmp => {
                // Raw IPv4 sockets deliver the IP header; strip it here.
                if len < 20 || buf[0] >> 4 != 4 {
                    return Ok(None);
                }
                let ihl = (buf[0] & 0x0F) as usize * 4;
                if ihl < 20 || len < ihl {
                    return Ok(None);
                }
                let src = IpAddr::V4(Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]));
                Ok(Some(RawPacket {
                    ifindex,
                    src,
                    payload: Bytes::copy_from_slice(&buf[ihl..len]),
                }))
            }
            ProtocolFamily::Mld => {
                // Raw ICMPv6 sockets deliver the ICMPv6 message directly;
                // the source comes from the msghdr name.
                if msg.msg_namelen as usize >= std::mem::size_of::<libc::sockaddr_in6>()
                    && name.ss_family == libc::AF_INET6 as libc::sa_family_t
                {
                    let sin6 =
                        unsafe { &*(&name as *const libc::sockaddr_storage as *const libc::sockaddr_in6) };
                    let src = IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr));
                    Ok(Some(RawPacket {
                        ifindex,
                        src,
                        payload: Bytes::copy_from_slice(&buf[..len]),
                    }))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Pull the arrival interface index out of the pktinfo control message.
    fn ifindex_from_cmsg(&self, msg: &libc::msghdr) -> u32 {
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
        while !cmsg.is_null() {
            let cmsg_ref = unsafe { &*cmsg };
            match self.family {
                ProtocolFamily::Igmp => {
                    if cmsg_ref.cmsg_level == libc::IPPROTO_IP
                        && cmsg_ref.cmsg_type == libc::IP_PKTINFO
                    {
                        // struct in_pktinfo starts with int ipi_ifindex.
                        let data = unsafe { libc::CMSG_DATA(cmsg) };
                        return unsafe { *(data as *const libc::c_int) } as u32;
                    }
                }
                ProtocolFamily::Mld => {
                    if cmsg_ref.cmsg_level == libc::IPPROTO_IPV6
                        && cmsg_ref.cmsg_type == libc::IPV6_PKTINFO
                    {
                        let data = unsafe { libc::CMSG_DATA(cmsg) };
                        let pktinfo = unsafe { &*(data as *const libc::in6_pktinfo) };
                        return pktinfo.ipi6_ifindex;
                    }
                }
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
        }
        0
    }
}

/// Async packet reader feeding one proxy instance.
pub struct PacketReader {
    inner: AsyncFd<RawMembershipSocket>,
    handle: ProxyHandle,
    logger: Logger,
}

impl PacketReader {
    /// Wrap a duplicated gateway fd. Enables the pktinfo ancillary data the
    /// reader needs to attribute packets to interfaces.
    pub fn new(
        fd: OwnedFd,
        family: ProtocolFamily,
        handle: ProxyHandle,
        logger: Logger,
    ) -> std::io::Result<Self> {
        let (level, option) = match family {
            ProtocolFamily::Igmp => (libc::IPPROTO_IP, libc::IP_PKTINFO),
            ProtocolFamily::Mld => (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO),
        };
        let enable: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                level,
                option,
                &enable as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(Self {
            inner: AsyncFd::new(RawMembershipSocket { fd, family })?,
            handle,
            logger,
        })
    }

    /// Read until shutdown or until the owning instance goes away.
    pub async fn run(self, shutdown: ShutdownFlag) {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        log_info!(self.logger, Facility::Network, "packet reader started");

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    log_info!(self.logger, Facility::Network, "packet reader stopping");
                    return;
                }
                guard = self.inner.readable() => {
                    let mut guard = match guard {
                        Ok(guard) => guard,
                        Err(e) => {
                            log_warning!(
                                self.logger,
                                Facility::Network,
                                &format!("packet reader poll failed: {}", e)
                            );
                            return;
                        }
                    };

                    loop {
                        match guard.get_inner().try_read(&mut buf) {
                            Ok(Some(packet)) => {
                                let message = ProxyMessage::Packet {
                                    ifindex: packet.ifindex,
                                    src: packet.src,
                                    data: packet.payload,
                                };
                                if self.handle.submit(message).is_err() {
                                    // Instance gone; nothing left to feed.
                                    return;
                                }
                            }
                            Ok(None) => continue,
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                guard.clear_ready();
                                break;
                            }
                            Err(e) => {
                                log_debug!(
                                    self.logger,
                                    Facility::Network,
                                    &format!("recvmsg failed: {}", e)
                                );
                                guard.clear_ready();
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}
