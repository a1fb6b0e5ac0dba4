//! TLS ClientHello walking. The locator is a strict forward parse of the
//! handshake body; any bounds violation returns `None` and the caller
//! falls through to an unmodified verdict.

use rand::RngCore;

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;

/// Locate the SNI hostname inside a TLS record starting at the TCP payload.
/// Returns the byte span of the hostname, relative to the record start.
pub fn locate_sni(record: &[u8]) -> Option<(usize, usize)> {
    if record.len() < 5 || record[0] != RECORD_HANDSHAKE {
        return None;
    }
    let (start, end) = locate_sni_handshake(&record[5..])?;
    Some((start + 5, end + 5))
}

/// Same walk over a bare handshake message, as carried by a QUIC CRYPTO
/// frame where no record layer exists.
pub fn locate_sni_handshake(hs: &[u8]) -> Option<(usize, usize)> {
    if hs.first() != Some(&HANDSHAKE_CLIENT_HELLO) {
        return None;
    }
    // handshake header (4) + legacy_version (2) + random (32)
    let mut pos = 4usize.checked_add(2 + 32)?;

    let session_id_len = *hs.get(pos)? as usize;
    pos = pos.checked_add(1 + session_id_len)?;

    let cipher_len = read_u16(hs, pos)? as usize;
    pos = pos.checked_add(2 + cipher_len)?;

    let compression_len = *hs.get(pos)? as usize;
    pos = pos.checked_add(1 + compression_len)?;

    let extensions_len = read_u16(hs, pos)? as usize;
    pos += 2;
    let extensions_end = pos.checked_add(extensions_len)?;
    if extensions_end > hs.len() {
        return None;
    }

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(hs, pos)?;
        let ext_len = read_u16(hs, pos + 2)? as usize;
        pos += 4;
        if pos + ext_len > extensions_end {
            return None;
        }

        if ext_type == EXT_SERVER_NAME {
            let mut sni = pos;
            let list_len = read_u16(hs, sni)? as usize;
            if sni + 2 + list_len > pos + ext_len {
                return None;
            }
            sni += 2;
            let list_end = sni + list_len;
            while sni + 3 <= list_end {
                let name_type = hs[sni];
                let name_len = read_u16(hs, sni + 1)? as usize;
                sni += 3;
                if sni + name_len > list_end {
                    return None;
                }
                if name_type == 0 {
                    return Some((sni, sni + name_len));
                }
                sni += name_len;
            }
            return None;
        }
        pos += ext_len;
    }

    None
}

/// Hostname slice behind a located span, validated as UTF-8.
pub fn sni_str(payload: &[u8], span: (usize, usize)) -> Option<&str> {
    payload
        .get(span.0..span.1)
        .and_then(|b| std::str::from_utf8(b).ok())
}

/// Declared total length of a handshake record (header included) when the
/// buffer opens a ClientHello that keeps going past what we have — the
/// split-ClientHello case the flow table buffers for.
pub fn pending_record_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 6 || buf[0] != RECORD_HANDSHAKE || buf[5] != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let declared = 5 + read_u16(buf, 3)? as usize;
    (declared > buf.len()).then_some(declared)
}

fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]))
}

/// Build a plausible ClientHello record for `host`. Doubles as the decoy
/// payload generator, the synfake body and the prober's handshake.
pub fn build_client_hello(host: &str) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut random = [0u8; 32];
    rng.fill_bytes(&mut random);
    let mut session_id = [0u8; 32];
    rng.fill_bytes(&mut session_id);
    let mut key_share = [0u8; 32];
    rng.fill_bytes(&mut key_share);

    // extensions
    let mut ext = Vec::new();

    // server_name
    let name = host.as_bytes();
    push_ext(&mut ext, EXT_SERVER_NAME, &{
        let mut v = Vec::with_capacity(5 + name.len());
        v.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        v.push(0); // host_name
        v.extend_from_slice(&(name.len() as u16).to_be_bytes());
        v.extend_from_slice(name);
        v
    });
    // supported_groups: x25519, secp256r1, secp384r1
    push_ext(&mut ext, 0x000a, &[0x00, 0x06, 0x00, 0x1d, 0x00, 0x17, 0x00, 0x18]);
    // signature_algorithms
    push_ext(
        &mut ext,
        0x000d,
        &[0x00, 0x08, 0x04, 0x03, 0x08, 0x04, 0x04, 0x01, 0x08, 0x05],
    );
    // alpn: h2, http/1.1
    push_ext(
        &mut ext,
        0x0010,
        &[
            0x00, 0x0c, 0x02, b'h', b'2', 0x08, b'h', b't', b't', b'p', b'/', b'1', b'.', b'1',
        ],
    );
    // supported_versions: 1.3, 1.2
    push_ext(&mut ext, 0x002b, &[0x04, 0x03, 0x04, 0x03, 0x03]);
    // key_share: x25519
    push_ext(&mut ext, 0x0033, &{
        let mut v = vec![0x00, 0x24, 0x00, 0x1d, 0x00, 0x20];
        v.extend_from_slice(&key_share);
        v
    });

    let cipher_suites: &[u16] = &[0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xcca9, 0xcca8];

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&random);
    body.push(session_id.len() as u8);
    body.extend_from_slice(&session_id);
    body.extend_from_slice(&((cipher_suites.len() * 2) as u16).to_be_bytes());
    for cs in cipher_suites {
        body.extend_from_slice(&cs.to_be_bytes());
    }
    body.extend_from_slice(&[0x01, 0x00]); // null compression only
    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut hello = Vec::with_capacity(body.len() + 9);
    hello.push(RECORD_HANDSHAKE);
    hello.extend_from_slice(&[0x03, 0x01]);
    hello.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    hello.push(HANDSHAKE_CLIENT_HELLO);
    hello.push(0);
    hello.extend_from_slice(&(body.len() as u16).to_be_bytes()[..]);
    hello.extend_from_slice(&body);
    hello
}

fn push_ext(out: &mut Vec<u8>, ext_type: u16, data: &[u8]) {
    out.extend_from_slice(&ext_type.to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locates_sni_in_generated_hello() {
        let hello = build_client_hello("foo.example");
        let span = locate_sni(&hello).expect("sni present");
        assert_eq!(sni_str(&hello, span), Some("foo.example"));
    }

    #[test]
    fn rejects_non_handshake_records() {
        let mut hello = build_client_hello("foo.example");
        hello[0] = 0x17;
        assert!(locate_sni(&hello).is_none());
    }

    #[test]
    fn rejects_server_hello() {
        let mut hello = build_client_hello("foo.example");
        hello[5] = 0x02;
        assert!(locate_sni(&hello).is_none());
    }

    #[test]
    fn never_panics_on_single_byte_flips() {
        let hello = build_client_hello("fuzz.example");
        for i in 0..hello.len() {
            let mut mutated = hello.clone();
            mutated[i] ^= 0xff;
            let _ = locate_sni(&mutated);
        }
    }

    #[test]
    fn never_panics_on_truncation() {
        let hello = build_client_hello("trunc.example");
        for len in 0..hello.len() {
            let _ = locate_sni(&hello[..len]);
        }
    }

    #[test]
    fn handshake_layer_parse_without_record_header() {
        let hello = build_client_hello("quic.example");
        let span = locate_sni_handshake(&hello[5..]).expect("sni present");
        assert_eq!(
            std::str::from_utf8(&hello[5..][span.0..span.1]).unwrap(),
            "quic.example"
        );
    }

    #[test]
    fn pending_record_len_on_truncated_hello() {
        let hello = build_client_hello("split.example");
        let partial = &hello[..40];
        assert_eq!(pending_record_len(partial), Some(hello.len()));
        // complete record is not pending
        assert_eq!(pending_record_len(&hello), None);
    }
}
