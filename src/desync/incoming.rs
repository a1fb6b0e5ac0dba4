//! Server→client stream disruption and the post-desync burst. Injected
//! frames travel *toward the server*: source is the client, destination
//! the server, so the caller emits them at the incoming packet's source.

use std::time::Duration;

use rand::Rng;

use super::{OutSegment, PacketView};
use crate::config::{IncomingMode, SetConfig};
use crate::net::{checksum, IPV6_HEADER_LEN};

const FLAG_FIN: u8 = 0x01;
const FLAG_RST: u8 = 0x04;
const FLAG_ACK: u8 = 0x10;

/// Facts read out of the inbound frame that the injected decoys reuse.
struct Inbound {
    server_port: u16,
    client_port: u16,
    server_seq: u32,
    server_ack: u32,
    payload_len: usize,
}

impl Inbound {
    fn parse(pkt: &[u8], view: &PacketView) -> Self {
        Self {
            server_port: u16::from_be_bytes(pkt[view.l3..view.l3 + 2].try_into().unwrap()),
            client_port: u16::from_be_bytes(pkt[view.l3 + 2..view.l3 + 4].try_into().unwrap()),
            server_seq: view.seq(pkt),
            server_ack: view.ack(pkt),
            payload_len: pkt.len() - view.payload_start,
        }
    }
}

/// Build the disruption frames for an inbound data segment. Empty when the
/// mode is off.
pub fn plan_disruption(
    set: &SetConfig,
    pkt: &[u8],
    view: &PacketView,
    mode: IncomingMode,
) -> Vec<OutSegment> {
    let inc = &set.tcp.incoming;
    let inbound = Inbound::parse(pkt, view);
    let count = inc.fake_count.max(1);
    let mut rng = rand::thread_rng();
    let mut plan = Vec::new();

    match mode {
        IncomingMode::Off => {}
        IncomingMode::Fake => {
            // spoofed client ACKs at a jittered stream position
            for i in 0..count {
                let seq = inbound.server_ack.wrapping_add(rng.gen_range(0..1000));
                let ack = inbound.server_seq.wrapping_add(inbound.payload_len as u32);
                let mut frame = spoofed_frame(pkt, view, &inbound, seq, ack, FLAG_ACK, i as u16);
                set_ttl(&mut frame, view, inc.fake_ttl);
                let spoof = spoof_view(view);
                super::fake::apply_corruption(&mut frame, &spoof, inc.strategy);
                plan.push(OutSegment::immediate(frame));
            }
        }
        IncomingMode::Reset => {
            for i in 0..count {
                let ack = inbound.server_seq.wrapping_add(inbound.payload_len as u32);
                let mut frame = spoofed_frame(
                    pkt,
                    view,
                    &inbound,
                    inbound.server_ack,
                    ack,
                    FLAG_RST | FLAG_ACK,
                    i as u16,
                );
                set_ttl(&mut frame, view, inc.fake_ttl);
                finalize_spoof(&mut frame, view);
                super::fake::corrupt_checksum(&mut frame, &spoof_view(view));
                plan.push(OutSegment::immediate(frame));
            }
        }
        IncomingMode::Fin => {
            for i in 0..count {
                let mut frame = spoofed_frame(
                    pkt,
                    view,
                    &inbound,
                    inbound.server_ack,
                    inbound.server_seq,
                    FLAG_FIN | FLAG_ACK,
                    i as u16,
                );
                set_ttl(&mut frame, view, inc.fake_ttl);
                finalize_spoof(&mut frame, view);
                plan.push(OutSegment::immediate(frame));
            }
        }
        IncomingMode::Desync => {
            for i in 0..count {
                for flag in [FLAG_RST, FLAG_FIN, FLAG_ACK] {
                    let mut frame = spoofed_frame(
                        pkt,
                        view,
                        &inbound,
                        inbound.server_ack,
                        inbound.server_seq,
                        flag,
                        i as u16,
                    );
                    set_ttl(&mut frame, view, inc.fake_ttl);
                    finalize_spoof(&mut frame, view);
                    plan.push(OutSegment::immediate(frame));
                }
            }
        }
    }
    plan
}

/// Bare 20-byte-TCP frame from client to server, addresses and ports
/// mirrored out of the inbound packet.
fn spoofed_frame(
    pkt: &[u8],
    view: &PacketView,
    inbound: &Inbound,
    seq: u32,
    ack: u32,
    flags: u8,
    id_off: u16,
) -> Vec<u8> {
    let mut frame;
    if view.v6 {
        frame = vec![0u8; IPV6_HEADER_LEN + 20];
        frame[0] = 0x60;
        frame[4..6].copy_from_slice(&20u16.to_be_bytes());
        frame[6] = 6;
        frame[8..24].copy_from_slice(&pkt[24..40]); // src = client
        frame[24..40].copy_from_slice(&pkt[8..24]); // dst = server
    } else {
        frame = vec![0u8; 40];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&40u16.to_be_bytes());
        let id: u16 = rand::thread_rng().gen();
        frame[4..6].copy_from_slice(&id.wrapping_add(id_off).to_be_bytes());
        frame[9] = 6;
        frame[12..16].copy_from_slice(&pkt[16..20]); // src = client
        frame[16..20].copy_from_slice(&pkt[12..16]); // dst = server
    }

    let t = if view.v6 { IPV6_HEADER_LEN } else { 20 };
    frame[t..t + 2].copy_from_slice(&inbound.client_port.to_be_bytes());
    frame[t + 2..t + 4].copy_from_slice(&inbound.server_port.to_be_bytes());
    frame[t + 4..t + 8].copy_from_slice(&seq.to_be_bytes());
    frame[t + 8..t + 12].copy_from_slice(&ack.to_be_bytes());
    frame[t + 12] = 0x50;
    frame[t + 13] = flags;
    frame[t + 14..t + 16].copy_from_slice(&0xffffu16.to_be_bytes());
    frame
}

/// The spoofed frames always carry a bare TCP header, so their geometry is
/// fixed regardless of the inbound packet's options.
fn spoof_view(view: &PacketView) -> PacketView {
    let l3 = if view.v6 { IPV6_HEADER_LEN } else { 20 };
    PacketView {
        l3,
        v6: view.v6,
        payload_start: l3 + 20,
    }
}

fn set_ttl(frame: &mut [u8], view: &PacketView, ttl: u8) {
    if view.v6 {
        frame[7] = ttl;
    } else {
        frame[8] = ttl;
    }
}

fn finalize_spoof(frame: &mut [u8], view: &PacketView) {
    if view.v6 {
        checksum::fix_tcp_v6(frame);
    } else {
        checksum::fix_ipv4(frame);
        checksum::fix_tcp_v4(frame);
    }
}

/// After the real flight: five decoys with clashing flag/seq variants so a
/// DPI that tracks the teardown state loses the thread. All carry broken
/// checksums and the faking TTL (default 3), 100 µs apart.
pub fn plan_post_desync(set: &SetConfig, pkt: &[u8], view: &PacketView, plan: &mut Vec<OutSegment>) {
    let payload_len = (pkt.len() - view.payload_start) as i64;
    let seq = view.seq(pkt);
    let ttl = if set.faking.ttl == 0 { 3 } else { set.faking.ttl };

    let variants: [(u8, i64); 5] = [
        (FLAG_RST, 0),
        (FLAG_RST | FLAG_ACK, payload_len),
        (FLAG_FIN | FLAG_ACK, payload_len + 1),
        (FLAG_RST, -10_000),
        (FLAG_RST | FLAG_ACK, 100_000),
    ];

    for (i, (flags, seq_off)) in variants.into_iter().enumerate() {
        let mut frame = Vec::with_capacity(view.l3 + 20);
        frame.extend_from_slice(&pkt[..view.l3 + 20]);

        let burst_view = PacketView {
            l3: view.l3,
            v6: view.v6,
            payload_start: view.l3 + 20,
        };
        frame[view.l3 + 12] = 0x50;
        burst_view.set_flags(&mut frame, flags);
        let new_seq = (i64::from(seq) + seq_off).max(0) as u32;
        burst_view.set_seq(&mut frame, new_seq);
        set_ttl(&mut frame, view, ttl);
        burst_view.bump_ip_id(&mut frame, i as u16);
        burst_view.finalize(&mut frame);
        super::fake::corrupt_checksum(&mut frame, &burst_view);

        let pause = if i == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(100)
        };
        plan.push(OutSegment::after(pause, frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desync::testutil::{tcp_packet_v4, tcp_packet_v6, V4_DST, V4_SRC};
    use crate::net::checksum::tests::{tcp_v4_valid, tcp_v6_valid};

    /// An inbound frame is server→client: source 443, destination the
    /// client port. The builders emit client→server frames, so reuse them
    /// with swapped expectations.
    fn inbound_v4(payload: &[u8]) -> Vec<u8> {
        let mut pkt = tcp_packet_v4(payload, 600_000, 0x18);
        // swap addresses and ports to make it server→client
        let (src, dst) = (V4_DST, V4_SRC);
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt[20..22].copy_from_slice(&443u16.to_be_bytes());
        pkt[22..24].copy_from_slice(&40000u16.to_be_bytes());
        crate::net::checksum::fix_ipv4(&mut pkt);
        crate::net::checksum::fix_tcp_v4(&mut pkt);
        pkt
    }

    fn incoming_set(mode: IncomingMode) -> SetConfig {
        let mut set = SetConfig::named("main", "Main");
        set.tcp.incoming.mode = mode;
        set.tcp.incoming.fake_count = 2;
        set.tcp.incoming.fake_ttl = 6;
        set
    }

    #[test]
    fn reset_frames_target_server_with_broken_checksum() {
        let pkt = inbound_v4(&[0u8; 1000]);
        let view = PacketView::parse(&pkt, false).unwrap();
        let set = incoming_set(IncomingMode::Reset);

        let plan = plan_disruption(&set, &pkt, &view, IncomingMode::Reset);
        assert_eq!(plan.len(), 2);

        for seg in &plan {
            let f = &seg.frame;
            assert_eq!(f.len(), 40);
            // src = client, dst = server
            assert_eq!(&f[12..16], &V4_SRC);
            assert_eq!(&f[16..20], &V4_DST);
            assert_eq!(u16::from_be_bytes(f[22..24].try_into().unwrap()), 443);
            assert_eq!(f[33] & FLAG_RST, FLAG_RST);
            assert_eq!(f[8], 6, "decoy ttl");

            // seq = server's ack (client position), ack = server seq + payload
            let seq = u32::from_be_bytes(f[24..28].try_into().unwrap());
            let ack = u32::from_be_bytes(f[28..32].try_into().unwrap());
            assert_eq!(seq, 0x1111_1111);
            assert_eq!(ack, 600_000 + 1000);

            assert!(!tcp_v4_valid(f), "reset decoys must fail the checksum");
            assert_ne!(&f[20 + 16..20 + 18], &[0, 0]);
        }
    }

    #[test]
    fn fake_mode_jitters_seq_near_client_position() {
        let pkt = inbound_v4(&[0u8; 500]);
        let view = PacketView::parse(&pkt, false).unwrap();
        let mut set = incoming_set(IncomingMode::Fake);
        // tcp4 leaves the sequence untouched, so the jitter is observable
        set.tcp.incoming.strategy = crate::config::FakingStrategy::Tcp4;

        let plan = plan_disruption(&set, &pkt, &view, IncomingMode::Fake);
        for seg in &plan {
            let seq = u32::from_be_bytes(seg.frame[24..28].try_into().unwrap());
            assert!((0x1111_1111..0x1111_1111 + 1000).contains(&seq));
        }
    }

    #[test]
    fn desync_mode_cycles_rst_fin_ack() {
        let pkt = inbound_v4(&[0u8; 100]);
        let view = PacketView::parse(&pkt, false).unwrap();
        let set = incoming_set(IncomingMode::Desync);

        let plan = plan_disruption(&set, &pkt, &view, IncomingMode::Desync);
        assert_eq!(plan.len(), 6); // 2 rounds x 3 flags
        let flags: Vec<u8> = plan.iter().map(|s| s.frame[33]).collect();
        assert_eq!(&flags[..3], &[FLAG_RST, FLAG_FIN, FLAG_ACK]);
    }

    #[test]
    fn fin_frames_keep_valid_checksums() {
        let pkt = inbound_v4(&[0u8; 100]);
        let view = PacketView::parse(&pkt, false).unwrap();
        let set = incoming_set(IncomingMode::Fin);

        let plan = plan_disruption(&set, &pkt, &view, IncomingMode::Fin);
        for seg in &plan {
            assert!(tcp_v4_valid(&seg.frame));
        }
    }

    #[test]
    fn v6_disruption_builds_sixty_byte_frames() {
        let mut pkt = tcp_packet_v6(&[0u8; 200], 5000, 0x18);
        pkt[40..42].copy_from_slice(&443u16.to_be_bytes());
        pkt[42..44].copy_from_slice(&40000u16.to_be_bytes());
        crate::net::checksum::fix_tcp_v6(&mut pkt);

        let view = PacketView::parse(&pkt, true).unwrap();
        let set = incoming_set(IncomingMode::Fin);
        let plan = plan_disruption(&set, &pkt, &view, IncomingMode::Fin);
        for seg in &plan {
            assert_eq!(seg.frame.len(), 60);
            assert!(tcp_v6_valid(&seg.frame));
        }
    }

    #[test]
    fn post_desync_burst_shape() {
        let pkt = tcp_packet_v4(&[0u8; 300], 50_000, 0x18);
        let view = PacketView::parse(&pkt, false).unwrap();
        let mut set = SetConfig::named("main", "Main");
        set.faking.ttl = 0; // default 3 kicks in

        let mut plan = Vec::new();
        plan_post_desync(&set, &pkt, &view, &mut plan);
        assert_eq!(plan.len(), 5);

        let seqs: Vec<u32> = plan
            .iter()
            .map(|s| u32::from_be_bytes(s.frame[24..28].try_into().unwrap()))
            .collect();
        assert_eq!(seqs, vec![50_000, 50_300, 50_301, 40_000, 150_000]);

        for (i, seg) in plan.iter().enumerate() {
            assert_eq!(seg.frame.len(), 40);
            assert_eq!(seg.frame[8], 3);
            assert!(!tcp_v4_valid(&seg.frame));
            if i > 0 {
                assert_eq!(seg.pause_before, Duration::from_micros(100));
            }
        }
    }
}
