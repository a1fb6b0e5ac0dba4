//! Out-of-band byte injection. The first segment ends with an extra byte
//! flagged urgent; the receiving stack consumes it out of line while a DPI
//! that ignores the urgent pointer sees a corrupted hostname.

use std::time::Duration;

use tracing::trace;

use super::{segment_with, OutSegment, PacketView};
use crate::config::SetConfig;
use crate::sni::tls;

pub fn plan(set: &SetConfig, pkt: &[u8], view: &PacketView, plan: &mut Vec<OutSegment>) {
    let payload = view.payload(pkt);
    if payload.len() < 2 {
        plan.push(OutSegment::immediate(pkt.to_vec()));
        return;
    }

    let frag = &set.fragmentation;
    let mut pos = frag.oob_position.max(1);
    if frag.middle_sni {
        if let Some((start, end)) = tls::locate_sni(payload) {
            pos = start + (end - start) / 2;
            trace!(start, end, pos, "oob byte lands inside the hostname");
        }
    }
    if pos >= payload.len() {
        pos = payload.len() / 2;
    }
    if pos == 0 {
        pos = 1;
    }

    let oob_char = if frag.oob_char == 0 { b'x' } else { frag.oob_char };

    // first segment: payload[..pos] plus the OOB byte under URG
    let mut first_payload = Vec::with_capacity(pos + 1);
    first_payload.extend_from_slice(&payload[..pos]);
    first_payload.push(oob_char);
    let mut first = segment_with(pkt, view, &first_payload, 0, 0);
    view.clear_psh(&mut first);
    view.set_urg(&mut first, (pos + 1) as u16);
    view.finalize(&mut first);

    // second segment continues after the OOB byte: it consumed a sequence
    // number, so the peer expects seq + pos + 1
    let mut second = segment_with(pkt, view, &payload[pos..], (pos + 1) as u32, 1);
    view.clear_urg(&mut second);
    view.finalize(&mut second);

    let pause = Duration::from_millis(set.tcp.seg2_delay_ms);
    if frag.reverse_order {
        plan.push(OutSegment::immediate(second));
        plan.push(OutSegment::after(pause, first));
    } else {
        plan.push(OutSegment::immediate(first));
        plan.push(OutSegment::after(pause, second));
    }
}
