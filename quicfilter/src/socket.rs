//! Datagram I/O seam and its UDP implementation.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::error::FilterError;

/// Largest datagram `UdpTransport` receives.
const MAX_DATAGRAM: usize = 65535;

/// Most datagrams the kernel cuts out of one segmented send.
const MAX_GSO_SEGMENTS: usize = 64;

/// Largest payload of one segmented send.
const MAX_GSO_BYTES: usize = 65507;

/// Non-blocking datagram transport under the filter.
pub trait PacketSocket {
    /// Receive at most `max` datagrams and hand each to `on_packet`.
    ///
    /// Stops early once the socket has nothing more to read. Returns how
    /// many datagrams were received. An error from `on_packet` ends the
    /// burst and is returned as is.
    fn recv_burst(
        &mut self,
        max: usize,
        on_packet: &mut dyn FnMut(&[u8], SocketAddr) -> Result<(), FilterError>,
    ) -> Result<usize, FilterError>;

    /// Send `data` as consecutive datagrams of `segment` bytes, the last one
    /// possibly shorter.
    ///
    /// Returns the bytes sent, always a whole number of datagrams. Fails
    /// with [`io::ErrorKind::WouldBlock`] when not even one could be sent.
    fn send(&mut self, data: &[u8], segment: usize) -> io::Result<usize>;

    /// True when a datagram is waiting to be read.
    fn input_pending(&mut self) -> io::Result<bool>;

    fn local_addr(&self) -> SocketAddr;

    fn peer_addr(&self) -> SocketAddr;
}

/// A connected, non-blocking UDP socket.
///
/// Where the kernel supports UDP segmentation offload, a run of equal-size
/// datagrams goes out in one `sendmsg` carrying a `UDP_SEGMENT` control
/// message. Otherwise, or once the kernel refuses a segmented send, every
/// datagram is its own `send`.
pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddr,
    peer: SocketAddr,
    recv_buf: Vec<u8>,
    gso: bool,
}

impl UdpTransport {
    /// Bind `local`, connect to `peer` and switch to non-blocking mode.
    pub fn connect(local: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;
        socket.connect(&peer.into())?;
        Self::from_socket(socket.into())
    }

    /// Wrap an already connected socket.
    pub fn from_socket(socket: UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        let peer = socket.peer_addr()?;
        let gso = gso::supported(&socket);
        debug!(%local, %peer, gso, "udp transport ready");
        Ok(Self {
            socket,
            local,
            peer,
            recv_buf: vec![0u8; MAX_DATAGRAM],
            gso,
        })
    }

    /// Whether sends currently use segmentation offload.
    pub fn gso(&self) -> bool {
        self.gso
    }
}

/// Bytes of a `len`-byte run of `segment`-sized datagrams that fit one
/// segmented send.
fn gso_batch_len(len: usize, segment: usize) -> usize {
    let segments = (MAX_GSO_BYTES / segment).clamp(1, MAX_GSO_SEGMENTS);
    len.min(segments * segment)
}

fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

impl PacketSocket for UdpTransport {
    fn recv_burst(
        &mut self,
        max: usize,
        on_packet: &mut dyn FnMut(&[u8], SocketAddr) -> Result<(), FilterError>,
    ) -> Result<usize, FilterError> {
        let mut count = 0;
        while count < max {
            match self.socket.recv(&mut self.recv_buf) {
                Ok(n) => {
                    count += 1;
                    on_packet(&self.recv_buf[..n], self.peer)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(count)
    }

    fn send(&mut self, data: &[u8], segment: usize) -> io::Result<usize> {
        let segment = segment.max(1);
        let mut sent = 0;
        while sent < data.len() {
            let rest = &data[sent..];
            let segmented = self.gso && rest.len() > segment && segment < MAX_GSO_BYTES;
            let result = if segmented {
                let batch = &rest[..gso_batch_len(rest.len(), segment)];
                retry_interrupted(|| gso::send(&self.socket, batch, segment)).map(|()| batch.len())
            } else {
                let datagram = &rest[..rest.len().min(segment)];
                retry_interrupted(|| self.socket.send(datagram)).map(|_| datagram.len())
            };
            match result {
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && sent > 0 => {
                    trace!(sent, left = data.len() - sent, "udp send would block");
                    return Ok(sent);
                }
                Err(e) if segmented && gso::refused(&e) => {
                    debug!(error = %e, "segmented send refused; sending datagrams singly");
                    self.gso = false;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    fn input_pending(&mut self) -> io::Result<bool> {
        let mut probe = [0u8; 1];
        match self.socket.peek(&mut probe) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[cfg(target_os = "linux")]
mod gso {
    use std::io;
    use std::mem::size_of;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;

    /// `UDP_SEGMENT` from `linux/udp.h`.
    const UDP_SEGMENT: libc::c_int = 103;

    /// The kernel knows `UDP_SEGMENT` on this socket.
    pub fn supported(socket: &UdpSocket) -> bool {
        let value: libc::c_int = 0;
        // SAFETY: `value` outlives the call and the length matches its type.
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_UDP,
                UDP_SEGMENT,
                (&value as *const libc::c_int).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        ret == 0
    }

    /// One `sendmsg` that the kernel cuts into `segment`-byte datagrams.
    pub fn send(socket: &UdpSocket, batch: &[u8], segment: usize) -> io::Result<()> {
        let segment = u16::try_from(segment)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut iov = libc::iovec {
            iov_base: batch.as_ptr() as *mut libc::c_void,
            iov_len: batch.len(),
        };
        // Aligned room for one cmsghdr with a u16 payload.
        let mut control = [0u64; 4];
        // SAFETY: msghdr is plain data; all-zero is a valid empty header.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        // SAFETY: pure arithmetic on a constant length.
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(size_of::<u16>() as u32) } as _;

        // SAFETY: msg_control points at `control`, which is aligned and
        // large enough for the one header written here. `iov` and `batch`
        // outlive the sendmsg call.
        let ret = unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_UDP;
            (*cmsg).cmsg_type = UDP_SEGMENT;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<u16>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<u16>(), segment);
            libc::sendmsg(socket.as_raw_fd(), &msg, 0)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// The kernel or the device cannot segment this send.
    pub fn refused(e: &io::Error) -> bool {
        matches!(
            e.raw_os_error(),
            Some(libc::EIO | libc::EINVAL | libc::ENOPROTOOPT | libc::EOPNOTSUPP)
        )
    }
}

#[cfg(not(target_os = "linux"))]
mod gso {
    use std::io;
    use std::net::UdpSocket;

    pub fn supported(_socket: &UdpSocket) -> bool {
        false
    }

    pub fn send(_socket: &UdpSocket, _batch: &[u8], _segment: usize) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    pub fn refused(_e: &io::Error) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn pair() -> (UdpTransport, UdpSocket) {
        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        let transport =
            UdpTransport::connect("127.0.0.1:0".parse().unwrap(), remote.local_addr().unwrap())
                .unwrap();
        remote.connect(transport.local_addr()).unwrap();
        (transport, remote)
    }

    fn wait_pending(transport: &mut UdpTransport) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !transport.input_pending().unwrap() {
            assert!(Instant::now() < deadline, "datagram never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn segmented_send() {
        let (mut transport, remote) = pair();
        let data: Vec<u8> = (0..25u8).collect();
        assert_eq!(transport.send(&data, 10).unwrap(), 25);

        let mut buf = [0u8; 64];
        let lens: Vec<usize> = (0..3).map(|_| remote.recv(&mut buf).unwrap()).collect();
        assert_eq!(lens, vec![10, 10, 5]);
        assert_eq!(&buf[..5], &data[20..]);
    }

    #[test]
    fn segmented_send_batches() {
        assert_eq!(gso_batch_len(25, 10), 25);
        // 65507 / 1200 rounds down to 54 segments.
        assert_eq!(gso_batch_len(100 * 1200, 1200), 54 * 1200);
        // Small segments hit the segment count limit first.
        assert_eq!(gso_batch_len(10_000, 10), MAX_GSO_SEGMENTS * 10);
        assert_eq!(gso_batch_len(70_000, 65_000), 65_000);
    }

    #[test]
    fn one_send_covers_many_datagrams() {
        let (mut transport, remote) = pair();
        let data: Vec<u8> = (0..30u8).flat_map(|i| [i; 100]).collect();
        let offload = transport.gso();
        assert_eq!(transport.send(&data[..2950], 100).unwrap(), 2950);

        let mut buf = [0u8; 256];
        for i in 0..30u8 {
            let n = remote.recv(&mut buf).unwrap();
            let expect = if i == 29 { 50 } else { 100 };
            assert_eq!(n, expect, "datagram {i}");
            assert!(buf[..n].iter().all(|&b| b == i));
        }
        // A refused segmented send turns offload off, never on.
        assert!(offload || !transport.gso());
    }

    #[test]
    fn burst_is_bounded() {
        let (mut transport, remote) = pair();
        for i in 0..3u8 {
            remote.send(&[i; 4]).unwrap();
        }
        wait_pending(&mut transport);
        // Give the remaining datagrams a moment to land.
        std::thread::sleep(Duration::from_millis(20));

        let mut seen = Vec::new();
        let n = transport
            .recv_burst(2, &mut |pkt, from| {
                assert_eq!(from, remote.local_addr().unwrap());
                seen.push(pkt[0]);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(seen, vec![0, 1]);

        let n = transport.recv_burst(10, &mut |_, _| Ok(())).unwrap();
        assert_eq!(n, 1);
        assert!(!transport.input_pending().unwrap());
    }
}
