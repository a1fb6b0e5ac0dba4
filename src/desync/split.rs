//! Two-segment TCP split of the ClientHello flight.

use std::time::Duration;

use tracing::trace;

use super::{segment_with, OutSegment, PacketView};
use crate::config::SetConfig;
use crate::sni::tls;

/// Split position: the configured absolute offset, or the middle of the
/// hostname when `middle_sni` is set and the SNI can be located. Clamped
/// into `(0, payload_len)`.
pub(crate) fn split_position(set: &SetConfig, payload: &[u8]) -> usize {
    let frag = &set.fragmentation;
    let mut pos = frag.sni_position;

    if frag.middle_sni {
        if let Some((start, end)) = tls::locate_sni(payload) {
            pos = start + (end - start) / 2;
            trace!(start, end, pos, "splitting inside the hostname");
        }
    }

    if pos >= payload.len() {
        pos = payload.len() / 2;
    }
    if pos == 0 {
        pos = 1;
    }
    pos
}

pub fn plan(set: &SetConfig, pkt: &[u8], view: &PacketView, plan: &mut Vec<OutSegment>) {
    let payload = view.payload(pkt);
    if payload.len() < 2 {
        plan.push(OutSegment::immediate(pkt.to_vec()));
        return;
    }

    let pos = split_position(set, payload);

    let mut first = segment_with(pkt, view, &payload[..pos], 0, 0);
    view.clear_psh(&mut first);
    view.finalize(&mut first);

    let mut second = segment_with(pkt, view, &payload[pos..], pos as u32, 1);
    view.finalize(&mut second);

    let pause = Duration::from_millis(set.tcp.seg2_delay_ms);
    if set.fragmentation.reverse_order {
        plan.push(OutSegment::immediate(second));
        plan.push(OutSegment::after(pause, first));
    } else {
        plan.push(OutSegment::immediate(first));
        plan.push(OutSegment::after(pause, second));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SetConfig;
    use crate::desync::testutil::{reassemble_payload, tcp_packet_v4, tcp_packet_v6};
    use crate::net::checksum::tests::{ipv4_valid, tcp_v4_valid, tcp_v6_valid};

    fn tcp_set() -> SetConfig {
        let mut set = SetConfig::named("main", "Main");
        set.fragmentation.strategy = crate::config::Strategy::Tcp;
        set
    }

    #[test]
    fn splits_at_position_one() {
        let payload = vec![0x16u8; 517];
        let pkt = tcp_packet_v4(&payload, 1000, 0x18);
        let view = PacketView::parse(&pkt, false).unwrap();

        let mut out = Vec::new();
        plan(&tcp_set(), &pkt, &view, &mut out);
        assert_eq!(out.len(), 2);

        let (a, b) = (&out[0].frame, &out[1].frame);
        assert_eq!(a.len() - 40, 1);
        assert_eq!(b.len() - 40, 516);

        let seq_a = u32::from_be_bytes(a[24..28].try_into().unwrap());
        let seq_b = u32::from_be_bytes(b[24..28].try_into().unwrap());
        assert_eq!(seq_b, seq_a + 1);

        // PSH only on the trailing segment
        assert_eq!(a[20 + 13] & 0x08, 0);
        assert_eq!(b[20 + 13] & 0x08, 0x08);

        for frame in [a, b] {
            assert!(ipv4_valid(frame));
            assert!(tcp_v4_valid(frame));
        }
    }

    #[test]
    fn middle_sni_lands_inside_hostname() {
        let hello = crate::sni::tls::build_client_hello("middle.example.org");
        let (start, end) = crate::sni::tls::locate_sni(&hello).unwrap();

        let mut set = tcp_set();
        set.fragmentation.middle_sni = true;
        let pos = split_position(&set, &hello);
        assert!(pos > start && pos < end);
    }

    #[test]
    fn reverse_order_swaps_emission() {
        let pkt = tcp_packet_v4(&[0u8; 100], 500, 0x18);
        let view = PacketView::parse(&pkt, false).unwrap();

        let mut set = tcp_set();
        set.fragmentation.reverse_order = true;
        set.fragmentation.sni_position = 10;
        set.tcp.seg2_delay_ms = 7;

        let mut out = Vec::new();
        plan(&set, &pkt, &view, &mut out);

        let seq_first = u32::from_be_bytes(out[0].frame[24..28].try_into().unwrap());
        assert_eq!(seq_first, 510, "higher-seq segment emitted first");
        assert_eq!(out[1].pause_before, Duration::from_millis(7));

        assert_eq!(reassemble_payload(&out, false), vec![0u8; 100]);
    }

    #[test]
    fn v6_split_checksums_validate() {
        let pkt = tcp_packet_v6(&[0x42u8; 200], 9000, 0x18);
        let view = PacketView::parse(&pkt, true).unwrap();

        let mut set = tcp_set();
        set.fragmentation.sni_position = 33;
        let mut out = Vec::new();
        plan(&set, &pkt, &view, &mut out);

        assert_eq!(out.len(), 2);
        for seg in &out {
            assert!(tcp_v6_valid(&seg.frame));
        }
        assert_eq!(reassemble_payload_v6(&out), vec![0x42u8; 200]);
    }

    fn reassemble_payload_v6(plan: &[OutSegment]) -> Vec<u8> {
        let mut pieces: Vec<(u32, Vec<u8>)> = plan
            .iter()
            .map(|seg| {
                let pkt = &seg.frame;
                let thl = ((pkt[40 + 12] >> 4) as usize) * 4;
                let seq = u32::from_be_bytes(pkt[44..48].try_into().unwrap());
                (seq, pkt[40 + thl..].to_vec())
            })
            .collect();
        pieces.sort_by_key(|(seq, _)| *seq);
        pieces.into_iter().flat_map(|(_, p)| p).collect()
    }
}
