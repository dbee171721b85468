//! RTP header parsing/serialization and payload codecs (μ-law <-> PCM16).
//!
//! Mirrors the shape of a STUN/TURN wire codec: a fixed-size binary header
//! is parsed out of a byte slice, a payload follows, and encoding reverses
//! the process into a caller-supplied buffer.

use bytes::{BufMut, BytesMut};

use crate::error::PacketError;

/// Number of 8 kHz samples carried by one outbound 20 ms RTP packet.
pub const SAMPLES_PER_PACKET: usize = 160;

pub const PT_ULAW: u8 = 0;

/// The codec negotiated for a server instance. Codec negotiation per
/// session is out of scope (spec §1) — this is fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Ulaw,
    Slin16 { payload_type: u8 },
}

impl Codec {
    pub fn payload_type(&self) -> u8 {
        match self {
            Self::Ulaw => PT_ULAW,
            Self::Slin16 { payload_type } => *payload_type,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ulaw => "ulaw",
            Self::Slin16 { .. } => "slin16",
        }
    }

    /// Decode one payload (μ-law bytes, or a slin16 passthrough) into
    /// PCM16 little-endian. Returns `UnsupportedCodec` if the payload type
    /// on the wire does not match what this server instance is configured
    /// for.
    pub fn decode(&self, payload_type: u8, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        match self {
            Self::Ulaw if payload_type == PT_ULAW => Ok(decode_ulaw(payload)),
            Self::Slin16 { payload_type: pt } if payload_type == *pt => Ok(payload.to_vec()),
            _ => Err(PacketError::UnsupportedCodec),
        }
    }

    /// Encode a PCM16 little-endian frame into the wire payload for this
    /// codec.
    pub fn encode(&self, pcm16: &[u8]) -> Vec<u8> {
        match self {
            Self::Ulaw => encode_ulaw(pcm16),
            Self::Slin16 { .. } => pcm16.to_vec(),
        }
    }
}

/// The fixed 12-byte RTP header (RFC 3550 §5.1), plus the flags needed to
/// know whether the datagram carried a non-standard (CSRC/extension) head
/// that had to be skipped to reach the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// True when CSRC count or the extension flag was nonzero, meaning
    /// this packet used a non-standard header the receiver had to skip
    /// over. Counted separately rather than rejected (spec §4.1).
    pub non_standard: bool,
}

const FIXED_HEADER_LEN: usize = 12;
const EXTENSION_HEADER_LEN: usize = 4;

impl RtpHeader {
    /// Parses the RTP header and returns it alongside the payload slice
    /// (padding and extension header already skipped).
    ///
    /// Rejects (no side effect on caller state) any datagram where
    /// `version != 2`, total length is under 12 bytes, or the declared
    /// CSRC count or extension length runs past the end of the datagram.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(PacketError::InvalidHeader);
        }

        let b0 = data[0];
        let b1 = data[1];

        let version = b0 >> 6;
        if version != 2 {
            return Err(PacketError::InvalidHeader);
        }

        let padding = (b0 & 0x20) != 0;
        let extension = (b0 & 0x10) != 0;
        let csrc_count = b0 & 0x0F;

        let marker = (b1 & 0x80) != 0;
        let payload_type = b1 & 0x7F;

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = FIXED_HEADER_LEN + csrc_count as usize * 4;
        if offset > data.len() {
            return Err(PacketError::InvalidHeader);
        }

        let mut non_standard = csrc_count != 0;

        if extension {
            non_standard = true;

            if offset + EXTENSION_HEADER_LEN > data.len() {
                return Err(PacketError::InvalidHeader);
            }

            let ext_len_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += EXTENSION_HEADER_LEN + ext_len_words * 4;

            if offset > data.len() {
                return Err(PacketError::InvalidHeader);
            }
        }

        let mut payload = &data[offset..];

        if padding {
            if let Some(&pad_len) = payload.last() {
                let pad_len = pad_len as usize;
                if pad_len == 0 || pad_len > payload.len() {
                    return Err(PacketError::InvalidHeader);
                }
                payload = &payload[..payload.len() - pad_len];
            } else {
                return Err(PacketError::InvalidHeader);
            }
        }

        Ok((
            Self {
                version,
                padding,
                extension,
                csrc_count,
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
                non_standard,
            },
            payload,
        ))
    }

    /// Serializes a standard (version 2, no CSRC, no extension, no
    /// padding) RTP header followed by `payload` into `out`.
    pub fn encode(
        marker: bool,
        payload_type: u8,
        sequence: u16,
        timestamp: u32,
        ssrc: u32,
        payload: &[u8],
        out: &mut BytesMut,
    ) {
        out.reserve(FIXED_HEADER_LEN + payload.len());
        out.put_u8(0x80); // version=2, padding=0, extension=0, CSRC=0
        out.put_u8(((marker as u8) << 7) | (payload_type & 0x7F));
        out.put_u16(sequence);
        out.put_u32(timestamp);
        out.put_u32(ssrc);
        out.put_slice(payload);
    }
}

/// G.711 μ-law encode/decode, the classic segment-based reference
/// implementation (Bellamy, *Digital Telephony*). Bit-exact in both
/// directions, subject to the quantization the standard itself defines.
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 8159;
const SEG_UEND: [i32; 8] = [0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF];

fn ulaw_segment(val: i32) -> i32 {
    for (i, &bound) in SEG_UEND.iter().enumerate() {
        if val <= bound {
            return i as i32;
        }
    }
    8
}

pub fn linear_to_ulaw(pcm: i16) -> u8 {
    let mut pcm_val = (pcm as i32) >> 2;

    let mask = if pcm_val < 0 {
        pcm_val = -pcm_val;
        0x7F
    } else {
        0xFF
    };

    if pcm_val > ULAW_CLIP {
        pcm_val = ULAW_CLIP;
    }
    pcm_val += ULAW_BIAS >> 2;

    let seg = ulaw_segment(pcm_val);
    if seg >= 8 {
        (0x7F ^ mask) as u8
    } else {
        let uval = (seg << 4) | ((pcm_val >> (seg + 1)) & 0xF);
        (uval ^ mask) as u8
    }
}

pub fn ulaw_to_linear(u_val: u8) -> i16 {
    const QUANT_MASK: i32 = 0xF;
    const SEG_SHIFT: i32 = 4;
    const SEG_MASK: i32 = 0x70;
    const SIGN_BIT: i32 = 0x80;

    let u = (!u_val) as i32;
    let mut t = ((u & QUANT_MASK) << 3) + ULAW_BIAS;
    t <<= (u & SEG_MASK) >> SEG_SHIFT;

    (if (u & SIGN_BIT) != 0 {
        ULAW_BIAS - t
    } else {
        t - ULAW_BIAS
    }) as i16
}

/// Decodes a μ-law payload into PCM16 little-endian (two bytes per
/// sample), one input byte per sample.
pub fn decode_ulaw(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() * 2);
    for &byte in payload {
        out.extend_from_slice(&ulaw_to_linear(byte).to_le_bytes());
    }
    out
}

/// Encodes a PCM16 little-endian frame into μ-law, one output byte per
/// sample. Trailing odd byte (malformed input) is ignored.
pub fn encode_ulaw(pcm16: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm16.len() / 2);
    for chunk in pcm16.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        out.push(linear_to_ulaw(sample));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_version() {
        let mut data = vec![0u8; 12];
        data[0] = 0x40; // version = 1
        assert_eq!(RtpHeader::parse(&data), Err(PacketError::InvalidHeader));
    }

    #[test]
    fn rejects_short_datagram() {
        let data = [0u8; 8];
        assert_eq!(RtpHeader::parse(&data), Err(PacketError::InvalidHeader));
    }

    #[test]
    fn rejects_csrc_past_end() {
        let mut data = vec![0u8; 12];
        data[0] = 0x82; // version=2, csrc_count=2 (needs 8 more bytes we don't have)
        assert_eq!(RtpHeader::parse(&data), Err(PacketError::InvalidHeader));
    }

    #[test]
    fn parses_standard_header() {
        let mut data = vec![0u8; 12 + 4];
        data[0] = 0x80;
        data[1] = 0x00; // PT 0
        data[2..4].copy_from_slice(&100u16.to_be_bytes());
        data[4..8].copy_from_slice(&0u32.to_be_bytes());
        data[8..12].copy_from_slice(&0x1111_1111u32.to_be_bytes());
        data[12..16].copy_from_slice(&[0xFFu8; 4]);

        let (header, payload) = RtpHeader::parse(&data).unwrap();
        assert_eq!(header.version, 2);
        assert!(!header.non_standard);
        assert_eq!(header.sequence, 100);
        assert_eq!(header.ssrc, 0x1111_1111);
        assert_eq!(payload, &[0xFFu8; 4]);
    }

    #[test]
    fn counts_csrc_as_non_standard_but_accepts() {
        let mut data = vec![0u8; 12 + 4 + 2];
        data[0] = 0x81; // version=2, csrc_count=1
        data[12..16].copy_from_slice(&[1, 2, 3, 4]); // one CSRC
        data[16..18].copy_from_slice(&[0xAA, 0xBB]);

        let (header, payload) = RtpHeader::parse(&data).unwrap();
        assert!(header.non_standard);
        assert_eq!(payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn encode_then_parse_round_trips_header_fields() {
        let mut buf = BytesMut::new();
        RtpHeader::encode(true, 0, 42, 1600, 0xDEAD_BEEF, &[1, 2, 3], &mut buf);

        let (header, payload) = RtpHeader::parse(&buf).unwrap();
        assert_eq!(header.version, 2);
        assert!(header.marker);
        assert_eq!(header.payload_type, 0);
        assert_eq!(header.sequence, 42);
        assert_eq!(header.timestamp, 1600);
        assert_eq!(header.ssrc, 0xDEAD_BEEF);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn ulaw_round_trip_is_within_quantization_bound() {
        // property 4: decode(encode(x)) differs from x by at most the
        // mu-law quantization bound.
        for sample in [-32000i16, -1000, -1, 0, 1, 1000, 32000, i16::MAX, i16::MIN + 1] {
            let encoded = linear_to_ulaw(sample);
            let decoded = ulaw_to_linear(encoded);
            let err = (sample as i32 - decoded as i32).abs();
            // mu-law's coarsest segment step is far below this bound; a
            // generous bound avoids coupling the test to exact
            // per-segment quantization step sizes.
            assert!(err <= 1100, "sample={sample} decoded={decoded} err={err}");
        }
    }

    #[test]
    fn ulaw_silence_round_trips_to_near_zero() {
        let payload = vec![0xFFu8; 160];
        let pcm = decode_ulaw(&payload);
        assert_eq!(pcm.len(), 320);
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            assert!(sample.abs() < 10, "expected near-zero, got {sample}");
        }
    }

    #[test]
    fn slin16_decode_is_passthrough() {
        let codec = Codec::Slin16 { payload_type: 118 };
        let payload = [1, 2, 3, 4];
        let decoded = codec.decode(118, &payload).unwrap();
        assert_eq!(decoded, payload);

        let encoded = codec.encode(&payload);
        assert_eq!(encoded, payload);
    }

    #[test]
    fn codec_rejects_mismatched_payload_type() {
        let codec = Codec::Ulaw;
        assert_eq!(
            codec.decode(118, &[0u8; 4]),
            Err(PacketError::UnsupportedCodec)
        );
    }
}
