//! Raw ICMP socket transport
//!
//! One socket per address family. The sender direction sets the TTL (IPv4)
//! or hop limit (IPv6) before each write; the receiver direction reads
//! datagrams bounded by an absolute deadline. Deadline expiry is a normal
//! loop-exit condition, never an error.

use crate::trace::error::TraceError;
use crate::TraceOptions;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::{Duration, Instant};

/// Largest datagram the receive loops handle.
pub(crate) const MAX_PACKET: usize = 1500;

/// The transport surface the probe engines drive.
///
/// `set_ttl` maps to IP_TTL on IPv4 sockets and IPV6_UNICAST_HOPS on IPv6
/// sockets, so one trait covers both families. Implemented by
/// [`RawIcmpSocket`] and by scripted stubs in the engine tests.
pub(crate) trait ProbeTransport: Send + Sync {
    fn set_ttl(&self, ttl: u8) -> io::Result<()>;
    fn send_to(&self, msg: &[u8], dest: IpAddr) -> io::Result<usize>;
    /// Read one datagram, waiting no later than `deadline`. `Ok(None)`
    /// means the deadline elapsed.
    fn recv_deadline(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> io::Result<Option<(usize, IpAddr)>>;
    fn is_ipv6(&self) -> bool;
}

/// A raw ICMP (IPv4) or ICMPv6 socket bound to a source address.
pub(crate) struct RawIcmpSocket {
    socket: Socket,
    v6: bool,
}

impl RawIcmpSocket {
    /// Open a raw ICMPv4 socket bound to `source` (unspecified if `None`).
    pub(crate) fn open_v4(source: Option<Ipv4Addr>) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        let bind = SocketAddrV4::new(source.unwrap_or(Ipv4Addr::UNSPECIFIED), 0);
        socket.bind(&SockAddr::from(bind))?;
        Ok(Self { socket, v6: false })
    }

    /// Open a raw ICMPv6 socket bound to `source` (unspecified if `None`).
    ///
    /// Installs a kernel-side type filter accepting only Time Exceeded,
    /// Echo Reply and Destination Unreachable where the platform supports
    /// it; correlation does not depend on the filter.
    pub(crate) fn open_v6(source: Option<Ipv6Addr>) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        let bind = SocketAddrV6::new(source.unwrap_or(Ipv6Addr::UNSPECIFIED), 0, 0, 0);
        socket.bind(&SockAddr::from(bind))?;
        install_icmpv6_filter(&socket)?;
        Ok(Self { socket, v6: true })
    }
}

impl ProbeTransport for RawIcmpSocket {
    fn set_ttl(&self, ttl: u8) -> io::Result<()> {
        if self.v6 {
            self.socket.set_unicast_hops_v6(u32::from(ttl))
        } else {
            self.socket.set_ttl_v4(u32::from(ttl))
        }
    }

    fn send_to(&self, msg: &[u8], dest: IpAddr) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddr::new(dest, 0));
        self.socket.send_to(msg, &addr)
    }

    fn recv_deadline(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> io::Result<Option<(usize, IpAddr)>> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // A zero read timeout would mean "block forever"; keep the
            // kernel timeout at least one millisecond.
            self.socket
                .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;

            let uninit: &mut [MaybeUninit<u8>] =
                unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
            match self.socket.recv_from(uninit) {
                Ok((len, from)) => {
                    let Some(ip) = from.as_socket().map(|s| s.ip()) else {
                        continue;
                    };
                    return Ok(Some((len, ip)));
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_ipv6(&self) -> bool {
        self.v6
    }
}

/// Open the transport matching the destination's address family.
pub(crate) fn open_transport(
    dest: IpAddr,
    opts: &TraceOptions,
) -> Result<Box<dyn ProbeTransport>, TraceError> {
    let socket = match dest {
        IpAddr::V4(_) => RawIcmpSocket::open_v4(opts.source_v4)?,
        IpAddr::V6(_) => RawIcmpSocket::open_v6(opts.source_v6)?,
    };
    Ok(Box::new(socket))
}

#[cfg(target_os = "linux")]
fn install_icmpv6_filter(socket: &Socket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    const ICMP6_FILTER: libc::c_int = 1;
    const ICMPV6_DEST_UNREACH: u32 = 1;
    const ICMPV6_TIME_EXCEEDED: u32 = 3;
    const ICMPV6_ECHO_REPLY: u32 = 129;

    // Linux filter semantics: a set bit blocks the type. Block everything,
    // then clear the three types the engines correlate on.
    let mut filter = [u32::MAX; 8];
    for ty in [ICMPV6_DEST_UNREACH, ICMPV6_TIME_EXCEEDED, ICMPV6_ECHO_REPLY] {
        filter[(ty >> 5) as usize] &= !(1u32 << (ty & 31));
    }

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_ICMPV6,
            ICMP6_FILTER,
            filter.as_ptr() as *const libc::c_void,
            std::mem::size_of_val(&filter) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn install_icmpv6_filter(_socket: &Socket) -> io::Result<()> {
    Ok(())
}
