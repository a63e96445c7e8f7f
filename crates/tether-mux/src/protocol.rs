//! Wire format of the multiplexer.
//!
//! Every frame starts with a 4-byte header; all integers are big-endian.
//!
//! ```text
//! control frame (target = 0xFFFF)
//!  0      2      4        6     8
//!  +------+------+--------+-----+
//!  |BEEF  |FFFF  | opcode | id  |   opcode: 0 create, 1 rejected, 2 approved
//!  +------+------+--------+-----+
//!
//! channel frame (target = channel id)
//!  0      2      4     5
//!  +------+------+-----+-------------------------+
//!  |BEEF  | id   | tag | payload                 |   tag: 0 string, 1 binary
//!  +------+------+-----+-------------------------+
//!  |BEEF  | id   |  2  | code (2) | reason ...   |   graceful close
//!  +------+------+-----+                              (exactly 5 bytes: terminate)
//! ```
//!
//! Anything that does not start with the magic word is not ours and goes
//! to the host's default stream.

use bytes::Bytes;
use tether_transport::buffer::{compose, concat, read_u16};
use tether_transport::{CloseMessage, ConnectionError, Data};

use crate::MuxError;

pub const MAGIC_WORD: u16 = 0xBEEF;
/// Target id of control frames.
pub const CONTROL_ID: u16 = 0xFFFF;
/// Channel ids are `0..CHANNEL_ID_LIMIT`.
pub const CHANNEL_ID_LIMIT: u16 = 0xFFFE;

pub const CREATE_CHANNEL: u16 = 0;
pub const REJECTED: u16 = 1;
pub const APPROVED: u16 = 2;

pub const CONTENT_STRING: u8 = 0;
pub const CONTENT_BINARY: u8 = 1;
pub const END_OF_TRANSMISSION: u8 = 2;

const HEADER_LEN: usize = 4;
const PAYLOAD_OFFSET: usize = 5;
const REASON_OFFSET: usize = 7;

/// A decoded multiplexer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The peer proposes a new channel with this id.
    CreateChannel(u16),
    /// Answer to a [`Frame::CreateChannel`].
    Reply { id: u16, accepted: bool },
    /// Application data for a channel.
    Content { id: u16, data: Data },
    /// End of a channel. `None` means the peer terminated it.
    Close {
        id: u16,
        message: Option<CloseMessage>,
    },
}

impl Frame {
    /// Decodes `buf`. Returns `Ok(None)` for payloads that do not start with
    /// the magic word.
    pub fn parse(buf: &Bytes) -> Result<Option<Frame>, MuxError> {
        if read_u16(buf, 0) != Some(MAGIC_WORD) {
            return Ok(None);
        }
        let target = read_u16(buf, 2).ok_or_else(|| malformed("truncated header"))?;

        if target == CONTROL_ID {
            let opcode = read_u16(buf, 4).ok_or_else(|| malformed("truncated control frame"))?;
            let id = read_u16(buf, 6).ok_or_else(|| malformed("truncated control frame"))?;
            let frame = match opcode {
                CREATE_CHANNEL => Frame::CreateChannel(id),
                APPROVED => Frame::Reply { id, accepted: true },
                REJECTED => Frame::Reply {
                    id,
                    accepted: false,
                },
                other => return Err(malformed(format!("unknown opcode {other}"))),
            };
            return Ok(Some(frame));
        }

        let id = target;
        let tag = *buf
            .get(HEADER_LEN)
            .ok_or_else(|| malformed("missing content tag"))?;
        let frame = match tag {
            CONTENT_STRING => Frame::Content {
                id,
                data: Data::Text(utf8(buf.slice(PAYLOAD_OFFSET..))?),
            },
            CONTENT_BINARY => Frame::Content {
                id,
                data: Data::Binary(buf.slice(PAYLOAD_OFFSET..)),
            },
            END_OF_TRANSMISSION if buf.len() == PAYLOAD_OFFSET => Frame::Close { id, message: None },
            END_OF_TRANSMISSION => {
                let code = read_u16(buf, PAYLOAD_OFFSET)
                    .ok_or_else(|| malformed("truncated close code"))?;
                let reason = utf8(buf.slice(REASON_OFFSET..))?;
                Frame::Close {
                    id,
                    message: Some(CloseMessage::new(i32::from(code), reason)),
                }
            }
            other => return Err(malformed(format!("unknown content tag {other}"))),
        };
        Ok(Some(frame))
    }
}

fn malformed(reason: impl Into<String>) -> MuxError {
    MuxError::MalformedFrame(reason.into())
}

fn utf8(bytes: Bytes) -> Result<String, MuxError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| malformed(format!("invalid utf-8: {e}")))
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn build_create_channel(id: u16) -> Bytes {
    compose(&[MAGIC_WORD, CONTROL_ID, CREATE_CHANNEL, id])
}

pub fn build_channel_reply(id: u16, accepted: bool) -> Bytes {
    let opcode = if accepted { APPROVED } else { REJECTED };
    compose(&[MAGIC_WORD, CONTROL_ID, opcode, id])
}

pub fn build_data_frame(id: u16, data: &Data) -> Bytes {
    let header = compose(&[MAGIC_WORD, id]);
    let parts: [&[u8]; 3] = match data {
        Data::Text(text) => [&header, &[CONTENT_STRING], text.as_bytes()],
        Data::Binary(bytes) => [&header, &[CONTENT_BINARY], bytes],
    };
    concat(&parts)
}

/// Builds a graceful close frame. The code must fit in 16 bits.
pub fn build_close_frame(id: u16, message: &CloseMessage) -> Result<Bytes, ConnectionError> {
    let code =
        u16::try_from(message.code).map_err(|_| ConnectionError::InvalidCloseCode(message.code))?;
    let header = compose(&[MAGIC_WORD, id]);
    let code = code.to_be_bytes();
    let parts: [&[u8]; 4] = [
        &header,
        &[END_OF_TRANSMISSION],
        &code,
        message.reason.as_bytes(),
    ];
    Ok(concat(&parts))
}

pub fn build_terminate_frame(id: u16) -> Bytes {
    let header = compose(&[MAGIC_WORD, id]);
    let parts: [&[u8]; 2] = [&header, &[END_OF_TRANSMISSION]];
    concat(&parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: Bytes) -> Frame {
        Frame::parse(&bytes)
            .expect("should parse")
            .expect("should be a mux frame")
    }

    #[test]
    fn test_control_frames_layout() {
        assert_eq!(
            &build_create_channel(14)[..],
            &[0xBE, 0xEF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x0E]
        );
        assert_eq!(parse(build_create_channel(14)), Frame::CreateChannel(14));
        assert_eq!(
            parse(build_channel_reply(14, true)),
            Frame::Reply { id: 14, accepted: true }
        );
        assert_eq!(
            parse(build_channel_reply(14, false)),
            Frame::Reply { id: 14, accepted: false }
        );
    }

    #[test]
    fn test_string_content_round_trips() {
        for text in ["", "asdf", "grüße 🎉"] {
            let frame = build_data_frame(3, &Data::from(text));
            assert_eq!(frame[4], CONTENT_STRING);
            assert_eq!(
                parse(frame),
                Frame::Content { id: 3, data: Data::from(text) }
            );
        }
    }

    #[test]
    fn test_binary_content_starts_at_offset_five() {
        let frame = build_data_frame(0x0102, &Data::from(vec![9u8, 8, 7]));
        assert_eq!(&frame[..], &[0xBE, 0xEF, 0x01, 0x02, CONTENT_BINARY, 9, 8, 7]);
    }

    #[test]
    fn test_close_frame_carries_code_and_reason() {
        let message = CloseMessage::new(3042, "Test reason");
        let frame = build_close_frame(7, &message).expect("code fits");
        assert_eq!(&frame[5..7], &3042u16.to_be_bytes());
        assert_eq!(parse(frame), Frame::Close { id: 7, message: Some(message) });
    }

    #[test]
    fn test_close_frame_rejects_wide_codes() {
        let err = build_close_frame(7, &CloseMessage::new(-1, "x")).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidCloseCode(-1)));
        assert!(build_close_frame(7, &CloseMessage::new(70_000, "x")).is_err());
    }

    #[test]
    fn test_terminate_frame_is_five_bytes() {
        let frame = build_terminate_frame(7);
        assert_eq!(frame.len(), 5);
        assert_eq!(parse(frame), Frame::Close { id: 7, message: None });
    }

    #[test]
    fn test_parse_foreign_payload_is_none() {
        assert_eq!(Frame::parse(&Bytes::from_static(b"hello")).unwrap(), None);
        assert_eq!(Frame::parse(&Bytes::new()).unwrap(), None);
    }

    #[test]
    fn test_parse_malformed_frames_fail() {
        let cases: [&'static [u8]; 4] = [
            &[0xBE, 0xEF, 0x00],
            &[0xBE, 0xEF, 0xFF, 0xFF, 0x00, 0x09, 0x00, 0x01],
            &[0xBE, 0xEF, 0x00, 0x01, 0x07],
            &[0xBE, 0xEF, 0x00, 0x01, END_OF_TRANSMISSION, 0x00],
        ];
        for case in cases {
            assert!(
                matches!(Frame::parse(&Bytes::from_static(case)), Err(MuxError::MalformedFrame(_))),
                "{case:?} should be malformed"
            );
        }
    }
}
