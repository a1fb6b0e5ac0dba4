//! QUIC v1 Initial unprotection (RFC 9001) far enough to read the SNI out
//! of the CRYPTO frames. Stateless: a ClientHello spread over several
//! Initial packets is not reassembled here.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, KeyInit as _, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use super::tls;

/// RFC 9001 §5.2 initial salt for QUIC v1.
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

const QUIC_V1: u32 = 0x0000_0001;

pub struct InitialKeys {
    pub key: [u8; 16],
    pub iv: [u8; 12],
    pub hp: [u8; 16],
}

struct InitialHeader {
    version: u32,
    dcid: Vec<u8>,
    /// offset of the protected packet-number field
    pn_offset: usize,
    /// declared length of packet number + payload
    length: usize,
}

/// Extract the SNI hostname from a client Initial packet, or `None` when
/// the datagram is not one we can unprotect.
pub fn extract_sni(packet: &[u8]) -> Option<String> {
    let hdr = parse_initial_header(packet)?;
    if hdr.version != QUIC_V1 {
        return None;
    }
    let keys = derive_client_initial_keys(&hdr.dcid)?;
    let plaintext = unprotect(packet, &hdr, &keys)?;
    let hello = assemble_crypto(&plaintext)?;
    let span = tls::locate_sni_handshake(&hello)?;
    std::str::from_utf8(&hello[span.0..span.1])
        .ok()
        .map(str::to_owned)
}

/// Long-header Initial: first byte 0xC0..=0xCF.
pub fn is_initial(packet: &[u8]) -> bool {
    matches!(packet.first(), Some(b) if b & 0xf0 == 0xc0)
}

fn parse_initial_header(buf: &[u8]) -> Option<InitialHeader> {
    if !is_initial(buf) || buf.len() < 7 {
        return None;
    }
    let version = u32::from_be_bytes(buf[1..5].try_into().unwrap());
    let mut pos = 5;

    let dcid_len = *buf.get(pos)? as usize;
    pos += 1;
    let dcid = buf.get(pos..pos + dcid_len)?.to_vec();
    pos += dcid_len;

    let scid_len = *buf.get(pos)? as usize;
    pos += 1 + scid_len;

    let (token_len, n) = read_varint(buf, pos)?;
    pos += n + token_len as usize;
    if pos > buf.len() {
        return None;
    }

    let (length, n) = read_varint(buf, pos)?;
    pos += n;
    let length = length as usize;
    if length < 20 || pos + length > buf.len() {
        return None;
    }

    Some(InitialHeader {
        version,
        dcid,
        pn_offset: pos,
        length,
    })
}

/// HKDF schedule of RFC 9001 §5.1–5.4 for the client direction.
pub fn derive_client_initial_keys(dcid: &[u8]) -> Option<InitialKeys> {
    let (_, initial) = Hkdf::<Sha256>::extract(Some(&INITIAL_SALT[..]), dcid);

    let mut client_secret = [0u8; 32];
    initial
        .expand(&hkdf_label("client in", 32), &mut client_secret)
        .ok()?;
    let client = Hkdf::<Sha256>::from_prk(&client_secret).ok()?;

    let mut keys = InitialKeys {
        key: [0; 16],
        iv: [0; 12],
        hp: [0; 16],
    };
    client.expand(&hkdf_label("quic key", 16), &mut keys.key).ok()?;
    client.expand(&hkdf_label("quic iv", 12), &mut keys.iv).ok()?;
    client.expand(&hkdf_label("quic hp", 16), &mut keys.hp).ok()?;
    Some(keys)
}

/// TLS 1.3 HkdfLabel with the "tls13 " prefix and empty context.
fn hkdf_label(label: &str, out_len: u16) -> Vec<u8> {
    let full = format!("tls13 {label}");
    let mut info = Vec::with_capacity(4 + full.len());
    info.extend_from_slice(&out_len.to_be_bytes());
    info.push(full.len() as u8);
    info.extend_from_slice(full.as_bytes());
    info.push(0);
    info
}

fn unprotect(packet: &[u8], hdr: &InitialHeader, keys: &InitialKeys) -> Option<Vec<u8>> {
    // header-protection mask from the 16-byte sample past the longest
    // possible packet number
    let sample_at = hdr.pn_offset + 4;
    let sample: [u8; 16] = packet.get(sample_at..sample_at + 16)?.try_into().ok()?;
    let hp = Aes128::new(GenericArray::from_slice(&keys.hp));
    let mut mask = GenericArray::clone_from_slice(&sample);
    hp.encrypt_block(&mut mask);

    let first = packet[0] ^ (mask[0] & 0x0f);
    let pn_len = (first & 0x03) as usize + 1;
    if hdr.pn_offset + pn_len > packet.len() {
        return None;
    }

    let mut header = packet[..hdr.pn_offset + pn_len].to_vec();
    header[0] = first;
    let mut pn = 0u64;
    for i in 0..pn_len {
        header[hdr.pn_offset + i] ^= mask[1 + i];
        pn = (pn << 8) | u64::from(header[hdr.pn_offset + i]);
    }

    // pn left-padded to the iv width, xored into the tail
    let mut nonce = keys.iv;
    for (i, b) in pn.to_be_bytes().into_iter().enumerate() {
        nonce[4 + i] ^= b;
    }

    let ct_start = hdr.pn_offset + pn_len;
    let ct_end = hdr.pn_offset + hdr.length;
    let ciphertext = packet.get(ct_start..ct_end)?;

    let aead = Aes128Gcm::new_from_slice(&keys.key).ok()?;
    aead.decrypt(
        Nonce::from_slice(&nonce),
        Payload {
            msg: ciphertext,
            aad: &header,
        },
    )
    .ok()
}

/// Collect CRYPTO frame chunks and stitch the contiguous prefix starting
/// at stream offset 0. PADDING and PING are skipped; any other frame type
/// ends the scan.
fn assemble_crypto(plaintext: &[u8]) -> Option<Vec<u8>> {
    let mut chunks: Vec<(u64, &[u8])> = Vec::new();
    let mut pos = 0usize;

    while pos < plaintext.len() {
        match plaintext[pos] {
            0x00 | 0x01 => pos += 1,
            0x06 => {
                pos += 1;
                let (offset, n) = read_varint(plaintext, pos)?;
                pos += n;
                let (len, n) = read_varint(plaintext, pos)?;
                pos += n;
                let data = plaintext.get(pos..pos + len as usize)?;
                pos += len as usize;
                chunks.push((offset, data));
            }
            _ => break,
        }
    }

    if chunks.is_empty() {
        return None;
    }
    chunks.sort_by_key(|(off, _)| *off);

    let mut hello = Vec::new();
    for (off, data) in chunks {
        if off as usize != hello.len() {
            return None; // hole in the crypto stream
        }
        hello.extend_from_slice(data);
    }
    Some(hello)
}

fn read_varint(buf: &[u8], pos: usize) -> Option<(u64, usize)> {
    let first = *buf.get(pos)?;
    let len = 1usize << (first >> 6);
    let bytes = buf.get(pos..pos + len)?;
    let mut value = u64::from(first & 0x3f);
    for b in &bytes[1..] {
        value = (value << 8) | u64::from(*b);
    }
    Some((value, len))
}
