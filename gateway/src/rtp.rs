//! RTP depacketization.
//!
//! Both gateways consume one-way RTP carrying 16-bit linear PCM at 16 kHz
//! mono. Only the fixed header, the CSRC list and the optional header
//! extension are honored; there is no jitter buffer and no reordering.

/// Fixed RTP header length (RFC 3550).
pub const HEADER_LEN: usize = 12;

/// The synchronization source identifier at header offset 8.
pub fn ssrc(packet: &[u8]) -> Option<u32> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    Some(u32::from_be_bytes([
        packet[8], packet[9], packet[10], packet[11],
    ]))
}

/// Strip the RTP header and return the PCM payload.
///
/// Skips `CC × 4` CSRC bytes and, when the X bit is set, the 4-byte
/// extension header plus `extLen × 4` extension bytes. Returns `None` for
/// datagrams too short to carry the advertised header.
pub fn payload(packet: &[u8]) -> Option<&[u8]> {
    if packet.len() < HEADER_LEN {
        return None;
    }

    let first = packet[0];
    let csrc_count = (first & 0x0f) as usize;
    let has_extension = first & 0x10 != 0;

    let mut offset = HEADER_LEN + csrc_count * 4;
    if has_extension {
        if packet.len() < offset + 4 {
            return None;
        }
        let ext_words =
            u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) as usize;
        offset += 4 + ext_words * 4;
    }

    if packet.len() < offset {
        return None;
    }
    Some(&packet[offset..])
}
