use crc32c::crc32c;
use thiserror::Error;

pub const JOURNAL_MAGIC: u32 = 0x4d53_4a31;
pub const JOURNAL_FORMAT_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 8;
pub const MAX_FRAME_BODY_BYTES: usize = 16 * 1024 * 1024;

/// seq + timestamp + kind + crc
const FRAME_OVERHEAD: usize = 8 + 8 + 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Batch,
}

impl FrameKind {
    fn tag(self) -> u8 {
        match self {
            FrameKind::Batch => 0x01,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(FrameKind::Batch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalFrame {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame at offset {offset}")]
    Truncation { offset: usize },
    #[error("corrupt frame at offset {offset}")]
    Corruption { offset: usize },
    #[error("frame payload of {0} bytes is too large")]
    TooLarge(usize),
    #[error("bad journal header")]
    BadHeader,
}

pub fn encode_header() -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0..4].copy_from_slice(&JOURNAL_MAGIC.to_be_bytes());
    out[4..6].copy_from_slice(&JOURNAL_FORMAT_VERSION.to_be_bytes());
    out
}

pub fn check_header(bytes: &[u8]) -> Result<(), FrameError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameError::BadHeader);
    }
    let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if magic != JOURNAL_MAGIC || version != JOURNAL_FORMAT_VERSION {
        return Err(FrameError::BadHeader);
    }
    Ok(())
}

/// `len | seq | timestamp | kind | payload | crc32c`, big-endian; the crc
/// covers everything before it including the length.
pub fn encode_frame(frame: &JournalFrame) -> Result<Vec<u8>, FrameError> {
    let body_len = FRAME_OVERHEAD + frame.payload.len();
    if body_len > MAX_FRAME_BODY_BYTES {
        return Err(FrameError::TooLarge(frame.payload.len()));
    }
    let frame_length = u32::try_from(body_len).map_err(|_| FrameError::TooLarge(body_len))?;
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&frame_length.to_be_bytes());
    out.extend_from_slice(&frame.seq.to_be_bytes());
    out.extend_from_slice(&frame.timestamp_ms.to_be_bytes());
    out.push(frame.kind.tag());
    out.extend_from_slice(&frame.payload);
    let crc = crc32c(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Walks the frames of an in-memory journal image.
pub struct FrameCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FrameCursor<'a> {
    pub fn new(bytes: &'a [u8], offset: usize) -> Self {
        Self { bytes, offset }
    }

    /// Start of the next unread frame; after an error, the start of the bad one.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn next_frame(&mut self) -> Result<Option<JournalFrame>, FrameError> {
        let start = self.offset;
        let rest = &self.bytes[start.min(self.bytes.len())..];
        if rest.is_empty() {
            return Ok(None);
        }
        if rest.len() < 4 {
            return Err(FrameError::Truncation { offset: start });
        }
        let body_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if !(FRAME_OVERHEAD..=MAX_FRAME_BODY_BYTES).contains(&body_len) {
            return Err(FrameError::Corruption { offset: start });
        }
        if rest.len() < 4 + body_len {
            return Err(FrameError::Truncation { offset: start });
        }
        let covered = &rest[..body_len];
        let crc_bytes = &rest[body_len..4 + body_len];
        let stored_crc = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32c(covered) != stored_crc {
            return Err(FrameError::Corruption { offset: start });
        }
        let body = &rest[4..body_len];
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&body[0..8]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&body[8..16]);
        let kind = FrameKind::from_tag(body[16]).ok_or(FrameError::Corruption { offset: start })?;
        self.offset = start + 4 + body_len;
        Ok(Some(JournalFrame {
            seq: u64::from_be_bytes(seq),
            timestamp_ms: u64::from_be_bytes(timestamp),
            kind,
            payload: body[17..].to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        FrameCursor, FrameError, FrameKind, HEADER_SIZE, JournalFrame, check_header,
        encode_frame, encode_header,
    };

    fn image(count: u64) -> Vec<u8> {
        let mut bytes = encode_header().to_vec();
        for seq in 1..=count {
            let frame = JournalFrame {
                seq,
                timestamp_ms: 1_000 + seq,
                kind: FrameKind::Batch,
                payload: format!("batch-{seq}").into_bytes(),
            };
            bytes.extend(encode_frame(&frame).expect("encode"));
        }
        bytes
    }

    #[test]
    fn cursor_reads_frames_in_order() {
        let bytes = image(50);
        check_header(&bytes).expect("header");
        let mut cursor = FrameCursor::new(&bytes, HEADER_SIZE);
        for seq in 1..=50 {
            let frame = cursor.next_frame().expect("next").expect("frame");
            assert_eq!(frame.seq, seq);
            assert_eq!(frame.payload, format!("batch-{seq}").into_bytes());
        }
        assert!(cursor.next_frame().expect("end").is_none());
        assert_eq!(cursor.offset(), bytes.len());
    }

    #[test]
    fn flipped_payload_byte_is_corruption_at_frame_start() {
        let mut bytes = image(3);
        let first_len = {
            let mut cursor = FrameCursor::new(&bytes, HEADER_SIZE);
            cursor.next_frame().expect("first").expect("frame");
            cursor.offset()
        };
        // first byte of the second frame's payload
        bytes[first_len + 4 + 17] ^= 0xff;
        let mut cursor = FrameCursor::new(&bytes, HEADER_SIZE);
        cursor.next_frame().expect("first").expect("frame");
        assert_eq!(
            cursor.next_frame().expect_err("corrupt"),
            FrameError::Corruption { offset: first_len }
        );
        assert_eq!(cursor.offset(), first_len);
    }

    #[test]
    fn every_tail_cut_is_truncation() {
        let bytes = image(4);
        for cut in 1..30 {
            let truncated = &bytes[..bytes.len() - cut];
            let mut cursor = FrameCursor::new(truncated, HEADER_SIZE);
            let mut frames = 0;
            loop {
                match cursor.next_frame() {
                    Ok(Some(_)) => frames += 1,
                    Ok(None) => break,
                    Err(FrameError::Truncation { .. }) => break,
                    Err(e) => panic!("unexpected error at cut {cut}: {e:?}"),
                }
            }
            assert!(frames < 4);
        }
    }

    #[test]
    fn header_mismatch_is_rejected() {
        assert_eq!(check_header(&[0u8; 3]), Err(FrameError::BadHeader));
        let mut bytes = encode_header();
        bytes[0] ^= 0x01;
        assert_eq!(check_header(&bytes), Err(FrameError::BadHeader));
    }

    #[test]
    fn absurd_length_is_corruption() {
        let mut bytes = u32::MAX.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        let mut cursor = FrameCursor::new(&bytes, 0);
        assert_eq!(
            cursor.next_frame().expect_err("oversized"),
            FrameError::Corruption { offset: 0 }
        );
    }
}
