//! Raw L3 emitters. Both sockets carry `SO_MARK` so the firewall rules that
//! feed the queue skip-match our own frames; without the mark every emitted
//! segment would loop straight back into the verdict path.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::trace;

use super::{checksum, ipv4_header_len, tcp_header_len};
use crate::error::{Error, Result};

pub const PACKET_MARK: u32 = 0x8000;
pub const AVAILABLE_MTU: usize = 1400;
const RESPLIT_HEADROOM: usize = 128;

pub struct RawSender {
    v4: Socket,
    v6: Socket,
}

impl RawSender {
    pub fn new() -> io::Result<Self> {
        Self::with_mark(PACKET_MARK)
    }

    pub fn with_mark(mark: u32) -> io::Result<Self> {
        let v4 = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(libc::IPPROTO_RAW)))?;
        set_header_included(&v4)?;
        v4.set_mark(mark)?;

        let v6 = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::from(libc::IPPROTO_RAW)))?;
        v6.set_mark(mark)?;

        Ok(Self { v4, v6 })
    }

    /// Emit a complete IPv4 frame. Frames beyond `AVAILABLE_MTU` are
    /// resplit at the TCP layer first so the IP layer never fragments.
    pub fn send_v4(&self, pkt: &[u8], dst: Ipv4Addr) -> Result<()> {
        if pkt.len() > AVAILABLE_MTU {
            trace!(len = pkt.len(), "resplitting oversized frame");
            if let Some((first, second)) = tcp_resplit_v4(pkt, AVAILABLE_MTU - RESPLIT_HEADROOM) {
                self.send_raw_v4(&first, dst)?;
                return self.send_raw_v4(&second, dst);
            }
        }
        self.send_raw_v4(pkt, dst)
    }

    fn send_raw_v4(&self, pkt: &[u8], dst: Ipv4Addr) -> Result<()> {
        let addr = SockAddr::from(SocketAddrV4::new(dst, 0));
        self.v4
            .send_to(pkt, &addr)
            .map(|_| ())
            .map_err(Error::RawSend)
    }

    pub fn send_v6(&self, pkt: &[u8], dst: Ipv6Addr) -> Result<()> {
        let addr = SockAddr::from(SocketAddrV6::new(dst, 0, 0, 0));
        self.v6
            .send_to(pkt, &addr)
            .map(|_| ())
            .map_err(Error::RawSend)
    }
}

fn set_header_included(sock: &Socket) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_HDRINCL,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of_val(&on) as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Split an IPv4 TCP frame into two valid frames at payload offset `split`.
/// Sequence numbers stay aligned with the original stream: the second frame
/// continues at `seq + split`. PSH moves to the second frame, the IP id
/// advances monotonically.
pub fn tcp_resplit_v4(pkt: &[u8], split: usize) -> Option<(Vec<u8>, Vec<u8>)> {
    let ihl = ipv4_header_len(pkt)?;
    let thl = tcp_header_len(pkt, ihl)?;
    let payload_start = ihl + thl;
    let payload_len = pkt.len().checked_sub(payload_start)?;
    if split == 0 || split >= payload_len {
        return None;
    }

    let headers = &pkt[..payload_start];
    let payload = &pkt[payload_start..];
    let seq = u32::from_be_bytes(pkt[ihl + 4..ihl + 8].try_into().unwrap());
    let id = u16::from_be_bytes(pkt[4..6].try_into().unwrap());

    let mut first = Vec::with_capacity(payload_start + split);
    first.extend_from_slice(headers);
    first.extend_from_slice(&payload[..split]);
    first[2..4].copy_from_slice(&((payload_start + split) as u16).to_be_bytes());
    first[ihl + 13] &= !0x08;
    checksum::fix_ipv4(&mut first);
    checksum::fix_tcp_v4(&mut first);

    let mut second = Vec::with_capacity(payload_start + payload_len - split);
    second.extend_from_slice(headers);
    second.extend_from_slice(&payload[split..]);
    second[2..4].copy_from_slice(&((payload_start + payload_len - split) as u16).to_be_bytes());
    second[4..6].copy_from_slice(&id.wrapping_add(1).to_be_bytes());
    second[ihl + 4..ihl + 8].copy_from_slice(&seq.wrapping_add(split as u32).to_be_bytes());
    checksum::fix_ipv4(&mut second);
    checksum::fix_tcp_v4(&mut second);

    Some((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desync::testutil::tcp_packet_v4;
    use crate::net::checksum::tests::{ipv4_valid, tcp_v4_valid};

    #[test]
    fn resplit_preserves_payload_and_seq() {
        let payload = vec![0xabu8; 2000];
        let pkt = tcp_packet_v4(&payload, 5000, 0x18);

        let (first, second) = tcp_resplit_v4(&pkt, 1272).unwrap();
        assert_eq!(&first[40..], &payload[..1272]);
        assert_eq!(&second[40..], &payload[1272..]);

        let seq1 = u32::from_be_bytes(first[24..28].try_into().unwrap());
        let seq2 = u32::from_be_bytes(second[24..28].try_into().unwrap());
        assert_eq!(seq2, seq1 + 1272);

        // PSH cleared on the first, preserved on the second
        assert_eq!(first[20 + 13] & 0x08, 0);
        assert_eq!(second[20 + 13] & 0x08, 0x08);

        for frame in [&first, &second] {
            assert!(ipv4_valid(frame));
            assert!(tcp_v4_valid(frame));
        }
    }

    #[test]
    fn resplit_rejects_out_of_range_split() {
        let pkt = tcp_packet_v4(b"short", 1, 0x18);
        assert!(tcp_resplit_v4(&pkt, 0).is_none());
        assert!(tcp_resplit_v4(&pkt, 5).is_none());
    }

    #[test]
    fn resplit_advances_ip_id() {
        let pkt = tcp_packet_v4(&[0u8; 100], 1, 0x18);
        let (first, second) = tcp_resplit_v4(&pkt, 40).unwrap();
        let id1 = u16::from_be_bytes(first[4..6].try_into().unwrap());
        let id2 = u16::from_be_bytes(second[4..6].try_into().unwrap());
        assert_eq!(id2, id1.wrapping_add(1));
    }
}
