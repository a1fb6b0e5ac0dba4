//! Decoy traffic: segments engineered to reach the DPI but never count for
//! the endpoint, either because their TTL expires en route, their checksum
//! is broken, or their sequence numbers fall outside the window.

use rand::seq::SliceRandom;
use rand::Rng;

use super::{segment_with, OutSegment, PacketView};
use crate::config::{FakePayload, FakingConfig, FakingStrategy, SetConfig};
use crate::sni::tls;

/// Decoy ClientHello bytes for the configured flavor.
pub fn decoy_payload(faking: &FakingConfig) -> Vec<u8> {
    match faking.payload {
        FakePayload::Google => tls::build_client_hello("www.google.com"),
        FakePayload::Duckduckgo => tls::build_client_hello("duckduckgo.com"),
        FakePayload::Custom => hex::decode(&faking.custom_payload)
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| tls::build_client_hello("www.google.com")),
    }
}

/// Pre-emit `fake_count` decoy ClientHello segments carrying an innocuous
/// hostname at the original sequence position.
pub fn plan_decoys(set: &SetConfig, pkt: &[u8], view: &PacketView, plan: &mut Vec<OutSegment>) {
    let payload = decoy_payload(&set.faking);
    for i in 0..set.faking.fake_count.max(1) {
        let mut frame = segment_with(pkt, view, &payload, 0, i as u16);
        view.set_ttl(&mut frame, set.faking.ttl);
        apply_corruption(&mut frame, view, set.faking.strategy);
        plan.push(OutSegment::immediate(frame));
    }
}

/// Corrupt a decoy so the endpoint drops it. The frame is finalized here:
/// sequence perturbations re-fix the checksums, `badsum` breaks them after
/// fixing, and the result is never a zero checksum word.
pub fn apply_corruption(frame: &mut [u8], view: &PacketView, strategy: FakingStrategy) {
    let mut rng = rand::thread_rng();
    let strategy = match strategy {
        FakingStrategy::Rand => *[
            FakingStrategy::Badsum,
            FakingStrategy::Badseq,
            FakingStrategy::Badack,
            FakingStrategy::All,
        ]
        .choose(&mut rng)
        .unwrap(),
        s => s,
    };

    match strategy {
        FakingStrategy::Pastseq => {
            let seq = view.seq(frame).wrapping_sub(10_000);
            view.set_seq(frame, seq);
            view.finalize(frame);
        }
        FakingStrategy::Tcp4 => {
            view.finalize(frame);
        }
        FakingStrategy::Badseq => {
            let seq = view.seq(frame).wrapping_add(rng.gen_range(10_000..110_000));
            view.set_seq(frame, seq);
            view.finalize(frame);
        }
        FakingStrategy::Badack => {
            let ack = view.ack(frame).wrapping_add(rng.gen_range(10_000..110_000));
            view.set_ack(frame, ack);
            view.finalize(frame);
        }
        FakingStrategy::All => {
            let seq = view.seq(frame).wrapping_add(rng.gen_range(10_000..110_000));
            view.set_seq(frame, seq);
            let ack = view.ack(frame).wrapping_add(rng.gen_range(10_000..110_000));
            view.set_ack(frame, ack);
            view.finalize(frame);
            corrupt_checksum(frame, view);
        }
        FakingStrategy::Badsum => {
            view.finalize(frame);
            corrupt_checksum(frame, view);
        }
        FakingStrategy::Rand => unreachable!("resolved above"),
    }
}

/// Xor the TCP checksum word with a non-zero pair; a zeroed checksum would
/// read as "unset" to some stacks instead of "wrong".
pub(crate) fn corrupt_checksum(frame: &mut [u8], view: &PacketView) {
    let mut rng = rand::thread_rng();
    frame[view.l3 + 16] ^= rng.gen_range(1..=255u8);
    frame[view.l3 + 17] ^= rng.gen_range(1..=255u8);
    if frame[view.l3 + 16] == 0 && frame[view.l3 + 17] == 0 {
        frame[view.l3 + 17] = 1;
    }
}

/// SYN decoy carrying a plausible hello where the handshake SYN sat, then
/// the untouched original.
pub fn plan_synfake(set: &SetConfig, pkt: &[u8], view: &PacketView, plan: &mut Vec<OutSegment>) {
    let payload = decoy_payload(&set.faking);
    let mut syn = segment_with(pkt, view, &payload, 0, 0);
    let seq = view.seq(pkt).wrapping_sub(1);
    view.set_seq(&mut syn, seq);
    view.set_ack(&mut syn, 0);
    view.set_flags(&mut syn, 0x02);
    view.set_ttl(&mut syn, set.faking.ttl);
    view.finalize(&mut syn);

    plan.push(OutSegment::immediate(syn));
    plan.push(OutSegment::immediate(pkt.to_vec()));
}

/// SACK-bearing decoys with broken checksums ahead of the original. The
/// option block advertises a hole the flow never had.
pub fn plan_sack(set: &SetConfig, pkt: &[u8], view: &PacketView, plan: &mut Vec<OutSegment>) {
    let seq = view.seq(pkt);
    for i in 0..set.faking.fake_count.max(1) {
        let mut frame = Vec::with_capacity(view.payload_start + 12);
        frame.extend_from_slice(&pkt[..view.l3 + 20]);

        // NOP, NOP, SACK(kind 5, len 10): one bogus block behind the flow
        frame.push(0x01);
        frame.push(0x01);
        frame.push(0x05);
        frame.push(0x0a);
        frame.extend_from_slice(&seq.wrapping_sub(3000).to_be_bytes());
        frame.extend_from_slice(&seq.wrapping_sub(1500).to_be_bytes());

        // data offset grows by the 12 option bytes
        frame[view.l3 + 12] = (8 << 4) | (frame[view.l3 + 12] & 0x0f);
        let sack_view = PacketView {
            l3: view.l3,
            v6: view.v6,
            payload_start: view.l3 + 32,
        };
        sack_view.set_flags(&mut frame, 0x10);
        sack_view.set_ttl(&mut frame, set.faking.ttl);
        sack_view.bump_ip_id(&mut frame, i as u16);
        sack_view.finalize(&mut frame);
        corrupt_checksum(&mut frame, &sack_view);
        plan.push(OutSegment::immediate(frame));
    }
    plan.push(OutSegment::immediate(pkt.to_vec()));
}
