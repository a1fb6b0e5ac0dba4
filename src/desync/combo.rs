//! Combined split: the union of every heuristic's split points, shuffled,
//! with a long first gap so stateful DPIs time out their reassembly.

use std::time::Duration;

use rand::Rng;

use super::disorder::{build_pieces, mark_trailing_psh, shuffle};
use super::{OutSegment, PacketView};
use crate::config::SetConfig;
use crate::sni::tls;

pub fn plan(set: &SetConfig, pkt: &[u8], view: &PacketView, plan: &mut Vec<OutSegment>) {
    let payload = view.payload(pkt);
    if payload.len() < 20 {
        plan.push(OutSegment::immediate(pkt.to_vec()));
        return;
    }

    let combo = &set.fragmentation.combo;
    let mut splits = Vec::new();

    if combo.first_byte_split {
        splits.push(1);
    }
    if combo.extension_split {
        if let Some(point) = pre_sni_extension_point(payload) {
            if point > 1 && point < payload.len() - 5 {
                splits.push(point);
            }
        }
    }
    if set.fragmentation.middle_sni {
        if let Some((start, end)) = tls::locate_sni(payload) {
            let len = end - start;
            if start > 2 {
                splits.push(start - 1);
            }
            splits.push(start + len / 2);
            if len > 15 {
                splits.push(start + len * 3 / 4);
            }
        }
    }

    splits.retain(|&s| s > 0 && s < payload.len());
    splits.sort_unstable();
    splits.dedup();
    if splits.is_empty() {
        splits.push(payload.len() / 2);
    }

    let mut pieces = build_pieces(pkt, view, payload, &splits);
    if pieces.len() < 2 {
        plan.push(OutSegment::immediate(pkt.to_vec()));
        return;
    }

    shuffle(&mut pieces, combo.shuffle_mode);
    mark_trailing_psh(view, &mut pieces);

    let first_delay = if combo.first_delay_ms > 0 {
        combo.first_delay_ms
    } else {
        100
    };
    let jitter_max = if combo.jitter_max_us > 0 {
        combo.jitter_max_us
    } else {
        2000
    };

    let mut rng = rand::thread_rng();
    for (i, piece) in pieces.into_iter().enumerate() {
        let pause = match i {
            0 => Duration::ZERO,
            1 => Duration::from_millis(first_delay + rng.gen_range(0..=first_delay / 3)),
            _ => Duration::from_micros(rng.gen_range(0..jitter_max)),
        };
        plan.push(OutSegment::after(pause, piece.frame));
    }
}

/// Offset of the server_name extension header, so a split there separates
/// the extension list prefix from the hostname bytes.
fn pre_sni_extension_point(payload: &[u8]) -> Option<usize> {
    let (start, _) = tls::locate_sni(payload)?;
    // hostname sits 9 bytes into the extension: type(2) len(2) list(2)
    // name_type(1) name_len(2)
    start.checked_sub(9)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShuffleMode;
    use crate::desync::testutil::{reassemble_payload, tcp_packet_v4};
    use crate::net::checksum::tests::tcp_v4_valid;

    fn combo_set() -> SetConfig {
        let mut set = SetConfig::named("main", "Main");
        set.fragmentation.strategy = crate::config::Strategy::Combo;
        set.fragmentation.middle_sni = true;
        set
    }

    #[test]
    fn unions_all_heuristics() {
        let hello = crate::sni::tls::build_client_hello("combo.example.com");
        let pkt = tcp_packet_v4(&hello, 31_000, 0x18);
        let view = PacketView::parse(&pkt, false).unwrap();

        let mut out = Vec::new();
        plan(&combo_set(), &pkt, &view, &mut out);
        // first-byte + pre-extension + three SNI points → at least 4 cuts
        assert!(out.len() >= 4, "got {} segments", out.len());
        assert_eq!(reassemble_payload(&out, false), hello);
        for seg in &out {
            assert!(tcp_v4_valid(&seg.frame));
        }
    }

    #[test]
    fn first_gap_dominates_then_jitter() {
        let hello = crate::sni::tls::build_client_hello("gaps.example.com");
        let pkt = tcp_packet_v4(&hello, 1, 0x18);
        let view = PacketView::parse(&pkt, false).unwrap();

        let mut set = combo_set();
        set.fragmentation.combo.first_delay_ms = 90;
        set.fragmentation.combo.jitter_max_us = 500;

        let mut out = Vec::new();
        plan(&set, &pkt, &view, &mut out);

        assert_eq!(out[0].pause_before, Duration::ZERO);
        assert!(out[1].pause_before >= Duration::from_millis(90));
        assert!(out[1].pause_before <= Duration::from_millis(120));
        for seg in &out[2..] {
            assert!(seg.pause_before < Duration::from_millis(1));
        }
    }

    #[test]
    fn pre_extension_point_precedes_hostname() {
        let hello = crate::sni::tls::build_client_hello("ext.example");
        let (start, _) = crate::sni::tls::locate_sni(&hello).unwrap();
        assert_eq!(pre_sni_extension_point(&hello), Some(start - 9));
    }

    #[test]
    fn reverse_shuffle_respected() {
        let hello = crate::sni::tls::build_client_hello("rev.example");
        let pkt = tcp_packet_v4(&hello, 500, 0x18);
        let view = PacketView::parse(&pkt, false).unwrap();

        let mut set = combo_set();
        set.fragmentation.combo.shuffle_mode = ShuffleMode::Reverse;

        let mut out = Vec::new();
        plan(&set, &pkt, &view, &mut out);
        let seqs: Vec<u32> = out
            .iter()
            .map(|s| u32::from_be_bytes(s.frame[24..28].try_into().unwrap()))
            .collect();
        let mut desc = seqs.clone();
        desc.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(seqs, desc);
    }

    #[test]
    fn short_payload_passes_through() {
        let pkt = tcp_packet_v4(b"short payload!", 1, 0x18);
        let view = PacketView::parse(&pkt, false).unwrap();
        let mut out = Vec::new();
        plan(&combo_set(), &pkt, &view, &mut out);
        assert_eq!(out.len(), 1);
    }
}
