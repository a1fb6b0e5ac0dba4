//! SNI-aware multi-segment split with shuffled emission order. The peer
//! reassembles by sequence number; the DPI has to buffer and reorder,
//! which many middleboxes refuse to do.

use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use super::{segment_with, OutSegment, PacketView};
use crate::config::{SetConfig, ShuffleMode};
use crate::sni::tls;

pub(super) struct Piece {
    pub(super) start: usize,
    pub(super) frame: Vec<u8>,
}

pub fn plan(set: &SetConfig, pkt: &[u8], view: &PacketView, plan: &mut Vec<OutSegment>) {
    let payload = view.payload(pkt);
    if payload.len() < 10 {
        plan.push(OutSegment::immediate(pkt.to_vec()));
        return;
    }

    let splits = split_points(set, payload);
    let mut pieces = build_pieces(pkt, view, payload, &splits);
    if pieces.len() < 2 {
        plan.push(OutSegment::immediate(pkt.to_vec()));
        return;
    }

    shuffle(&mut pieces, set.fragmentation.disorder.shuffle_mode);
    mark_trailing_psh(view, &mut pieces);

    let d = &set.fragmentation.disorder;
    let mut rng = rand::thread_rng();
    for (i, piece) in pieces.into_iter().enumerate() {
        let pause = if i == 0 {
            Duration::ZERO
        } else if set.tcp.seg2_delay_ms > 0 {
            let jitter = rng.gen_range(0..=set.tcp.seg2_delay_ms / 2);
            Duration::from_millis(set.tcp.seg2_delay_ms + jitter)
        } else {
            let (min, max) = jitter_window(d.min_jitter_us, d.max_jitter_us);
            Duration::from_micros(rng.gen_range(min..=max))
        };
        plan.push(OutSegment::after(pause, piece.frame));
    }
}

fn jitter_window(min: u64, max: u64) -> (u64, u64) {
    let min = if min == 0 { 1000 } else { min };
    let max = if max <= min { min + 2000 } else { max };
    (min, max)
}

fn split_points(set: &SetConfig, payload: &[u8]) -> Vec<usize> {
    let mut splits = Vec::new();

    if set.fragmentation.middle_sni {
        if let Some((start, end)) = tls::locate_sni(payload) {
            let len = end - start;
            splits.push(start);
            if len > 6 {
                splits.push(start + len / 2);
            }
            splits.push(end);
        }
    }
    if splits.is_empty() {
        splits = vec![1, payload.len() / 2, payload.len() * 3 / 4];
    }

    splits.retain(|&s| s > 0 && s < payload.len());
    splits.sort_unstable();
    splits.dedup();
    splits
}

pub(super) fn build_pieces(pkt: &[u8], view: &PacketView, payload: &[u8], splits: &[usize]) -> Vec<Piece> {
    let mut bounds = Vec::with_capacity(splits.len() + 2);
    bounds.push(0);
    bounds.extend_from_slice(splits);
    bounds.push(payload.len());

    let mut pieces = Vec::with_capacity(bounds.len() - 1);
    for (i, pair) in bounds.windows(2).enumerate() {
        let (start, end) = (pair[0], pair[1]);
        if end <= start {
            continue;
        }
        let mut frame = segment_with(pkt, view, &payload[start..end], start as u32, i as u16);
        view.clear_psh(&mut frame);
        view.finalize(&mut frame);
        pieces.push(Piece { start, frame });
    }
    pieces
}

pub(super) fn shuffle(pieces: &mut [Piece], mode: ShuffleMode) {
    let mut rng = rand::thread_rng();
    match mode {
        ShuffleMode::Full => pieces.shuffle(&mut rng),
        ShuffleMode::Reverse => pieces.reverse(),
        ShuffleMode::Middle => {
            let n = pieces.len();
            if n > 3 {
                pieces[1..n - 1].shuffle(&mut rng);
            } else if n > 1 {
                pieces.reverse();
            }
        }
    }
}

/// PSH belongs on the logically last segment only, wherever the shuffle
/// put it in emission order.
pub(crate) fn mark_trailing_psh(view: &PacketView, pieces: &mut [Piece]) {
    if let Some(idx) = pieces
        .iter()
        .enumerate()
        .max_by_key(|(_, p)| p.start)
        .map(|(i, _)| i)
    {
        view.set_psh(&mut pieces[idx].frame);
        view.finalize(&mut pieces[idx].frame);
    }
}
