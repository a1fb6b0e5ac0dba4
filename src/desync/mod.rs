//! Outbound flight transformations. Every strategy *plans* a sequence of
//! complete L3 frames from the captured packet; planning is pure so the
//! tests can assert on exact byte layouts, and the worker replays the plan
//! through the raw sender, honoring the per-segment pauses.

pub mod combo;
pub mod disorder;
pub mod fake;
pub mod incoming;
pub mod oob;
pub mod split;

#[cfg(test)]
pub(crate) mod testutil;

use std::time::Duration;

use tracing::trace;

use crate::config::{SetConfig, Strategy};
use crate::net::{checksum, ipv4_header_len, tcp_header_len, IPV6_HEADER_LEN};

/// One frame of a planned flight.
#[derive(Debug)]
pub struct OutSegment {
    pub pause_before: Duration,
    pub frame: Vec<u8>,
}

impl OutSegment {
    pub fn immediate(frame: Vec<u8>) -> Self {
        Self {
            pause_before: Duration::ZERO,
            frame,
        }
    }

    pub fn after(pause: Duration, frame: Vec<u8>) -> Self {
        Self {
            pause_before: pause,
            frame,
        }
    }
}

/// Geometry of a TCP frame: where L3 ends and where the payload begins.
#[derive(Debug, Clone, Copy)]
pub struct PacketView {
    pub l3: usize,
    pub v6: bool,
    pub payload_start: usize,
}

impl PacketView {
    pub fn parse(pkt: &[u8], v6: bool) -> Option<Self> {
        let l3 = if v6 {
            (pkt.len() >= IPV6_HEADER_LEN).then_some(IPV6_HEADER_LEN)?
        } else {
            ipv4_header_len(pkt)?
        };
        let thl = tcp_header_len(pkt, l3)?;
        Some(Self {
            l3,
            v6,
            payload_start: l3 + thl,
        })
    }

    pub fn payload<'p>(&self, pkt: &'p [u8]) -> &'p [u8] {
        &pkt[self.payload_start..]
    }

    pub fn seq(&self, pkt: &[u8]) -> u32 {
        u32::from_be_bytes(pkt[self.l3 + 4..self.l3 + 8].try_into().unwrap())
    }

    pub fn ack(&self, pkt: &[u8]) -> u32 {
        u32::from_be_bytes(pkt[self.l3 + 8..self.l3 + 12].try_into().unwrap())
    }

    pub fn set_seq(&self, pkt: &mut [u8], seq: u32) {
        pkt[self.l3 + 4..self.l3 + 8].copy_from_slice(&seq.to_be_bytes());
    }

    pub fn set_ack(&self, pkt: &mut [u8], ack: u32) {
        pkt[self.l3 + 8..self.l3 + 12].copy_from_slice(&ack.to_be_bytes());
    }

    pub fn flags(&self, pkt: &[u8]) -> u8 {
        pkt[self.l3 + 13]
    }

    pub fn set_flags(&self, pkt: &mut [u8], flags: u8) {
        pkt[self.l3 + 13] = flags;
    }

    pub fn clear_psh(&self, pkt: &mut [u8]) {
        pkt[self.l3 + 13] &= !0x08;
    }

    pub fn set_psh(&self, pkt: &mut [u8]) {
        pkt[self.l3 + 13] |= 0x08;
    }

    pub fn set_urg(&self, pkt: &mut [u8], urgent_ptr: u16) {
        pkt[self.l3 + 13] |= 0x20;
        pkt[self.l3 + 18..self.l3 + 20].copy_from_slice(&urgent_ptr.to_be_bytes());
    }

    pub fn clear_urg(&self, pkt: &mut [u8]) {
        pkt[self.l3 + 13] &= !0x20;
        pkt[self.l3 + 18..self.l3 + 20].copy_from_slice(&[0, 0]);
    }

    pub fn set_ttl(&self, pkt: &mut [u8], ttl: u8) {
        if self.v6 {
            pkt[7] = ttl;
        } else {
            pkt[8] = ttl;
        }
    }

    /// Rewrite the length field for the frame's current size and recompute
    /// every checksum the family carries.
    pub fn finalize(&self, pkt: &mut [u8]) {
        if self.v6 {
            let payload_len = (pkt.len() - IPV6_HEADER_LEN) as u16;
            pkt[4..6].copy_from_slice(&payload_len.to_be_bytes());
            checksum::fix_tcp_v6(pkt);
        } else {
            let total = pkt.len() as u16;
            pkt[2..4].copy_from_slice(&total.to_be_bytes());
            checksum::fix_ipv4(pkt);
            checksum::fix_tcp_v4(pkt);
        }
    }

    pub fn bump_ip_id(&self, pkt: &mut [u8], delta: u16) {
        if !self.v6 {
            let id = u16::from_be_bytes(pkt[4..6].try_into().unwrap());
            pkt[4..6].copy_from_slice(&id.wrapping_add(delta).to_be_bytes());
        }
    }
}

/// Copy the original headers in front of `payload`, advance seq by
/// `seq_off` and the IPv4 id by `id_off`. The caller finalizes.
pub(crate) fn segment_with(
    pkt: &[u8],
    view: &PacketView,
    payload: &[u8],
    seq_off: u32,
    id_off: u16,
) -> Vec<u8> {
    let mut seg = Vec::with_capacity(view.payload_start + payload.len());
    seg.extend_from_slice(&pkt[..view.payload_start]);
    seg.extend_from_slice(payload);
    let seq = view.seq(pkt).wrapping_add(seq_off);
    view.set_seq(&mut seg, seq);
    view.bump_ip_id(&mut seg, id_off);
    seg
}

/// Plan the outbound transformation for a matched ClientHello flight.
/// `None` means nothing to do: the verdict stays an unmodified ACCEPT.
pub fn plan_outgoing(set: &SetConfig, pkt: &[u8], v6: bool) -> Option<Vec<OutSegment>> {
    let view = PacketView::parse(pkt, v6)?;
    if view.payload(pkt).is_empty() {
        return None;
    }

    let mut plan: Vec<OutSegment> = Vec::new();

    if set.faking.sni {
        fake::plan_decoys(set, pkt, &view, &mut plan);
    }

    match set.fragmentation.strategy {
        Strategy::None => {
            if plan.is_empty() && !set.tcp.post_desync_rst {
                return None;
            }
            plan.push(OutSegment::immediate(pkt.to_vec()));
        }
        Strategy::Tcp => split::plan(set, pkt, &view, &mut plan),
        Strategy::Disorder => disorder::plan(set, pkt, &view, &mut plan),
        Strategy::Oob => oob::plan(set, pkt, &view, &mut plan),
        Strategy::Combo => combo::plan(set, pkt, &view, &mut plan),
        Strategy::Synfake => fake::plan_synfake(set, pkt, &view, &mut plan),
        Strategy::Sack => fake::plan_sack(set, pkt, &view, &mut plan),
        Strategy::Delay => {
            let hold = if set.tcp.seg2_delay_ms > 0 {
                set.tcp.seg2_delay_ms
            } else {
                50
            };
            plan.push(OutSegment::after(
                Duration::from_millis(hold),
                pkt.to_vec(),
            ));
        }
    }

    if set.tcp.post_desync_rst {
        incoming::plan_post_desync(set, pkt, &view, &mut plan);
    }

    trace!(
        strategy = ?set.fragmentation.strategy,
        segments = plan.len(),
        "planned outbound flight"
    );
    Some(plan)
}

#[cfg(test)]
mod tests {
    use super::testutil::{reassemble_payload, tcp_packet_v4};
    use super::*;
    use crate::config::SetConfig;

    fn set_with(strategy: Strategy) -> SetConfig {
        let mut set = SetConfig::named("main", "Main");
        set.fragmentation.strategy = strategy;
        set
    }

    #[test]
    fn none_strategy_without_faking_accepts() {
        let pkt = tcp_packet_v4(&crate::sni::tls::build_client_hello("a.test"), 100, 0x18);
        assert!(plan_outgoing(&set_with(Strategy::None), &pkt, false).is_none());
    }

    #[test]
    fn empty_payload_accepts() {
        let pkt = tcp_packet_v4(&[], 100, 0x10);
        assert!(plan_outgoing(&set_with(Strategy::Tcp), &pkt, false).is_none());
    }

    #[test]
    fn delay_strategy_holds_single_frame() {
        let pkt = tcp_packet_v4(b"payload bytes", 100, 0x18);
        let plan = plan_outgoing(&set_with(Strategy::Delay), &pkt, false).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].frame, pkt);
        assert_eq!(plan[0].pause_before, Duration::from_millis(50));
    }

    #[test]
    fn every_strategy_preserves_payload_bytes() {
        let hello = crate::sni::tls::build_client_hello("invariant.example");
        let pkt = tcp_packet_v4(&hello, 77, 0x18);

        for strategy in [
            Strategy::Tcp,
            Strategy::Disorder,
            Strategy::Oob,
            Strategy::Combo,
            Strategy::Delay,
        ] {
            let mut set = set_with(strategy);
            set.fragmentation.middle_sni = true;
            let plan = plan_outgoing(&set, &pkt, false).unwrap();
            let rebuilt = reassemble_payload(&plan, strategy == Strategy::Oob);
            assert_eq!(rebuilt, hello, "payload corrupted by {strategy:?}");
        }
    }
}
