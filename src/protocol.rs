//! The NSQ v2 wire protocol: framing, command encoding, and name validation.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{NsqError, Result};

pub const MAGIC_V2: &[u8] = b"  V2";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";

pub const FRAME_TYPE_RESPONSE: i32 = 0;
pub const FRAME_TYPE_ERROR: i32 = 1;
pub const FRAME_TYPE_MESSAGE: i32 = 2;

lazy_static! {
    static ref VALID_NAME_RE: Regex = Regex::new(r"^[.a-zA-Z0-9_-]+(#ephemeral)?$").unwrap();
}

fn valid_name(name: &str) -> bool {
    let len = name.len();
    len > 0 && len < 65 && VALID_NAME_RE.is_match(name)
}

pub fn valid_topic_name(topic: &str) -> bool {
    valid_name(topic)
}

pub fn valid_channel_name(channel: &str) -> bool {
    valid_name(channel)
}

pub fn assert_valid_topic_name(topic: &str) -> Result<()> {
    if valid_topic_name(topic) {
        Ok(())
    } else {
        Err(NsqError::BadTopic)
    }
}

pub fn assert_valid_channel_name(channel: &str) -> Result<()> {
    if valid_channel_name(channel) {
        Ok(())
    } else {
        Err(NsqError::BadChannel)
    }
}

/// A parsed response frame: `(frame_type, payload)`.
pub struct Frame {
    pub frame_type: i32,
    pub payload: Bytes,
}

/// Decodes the 4-byte big-endian size prefix that precedes every frame.
pub fn unpack_size(data: &[u8]) -> Result<i32> {
    if data.len() != 4 {
        return Err(NsqError::FrameError(-1));
    }
    Ok(BigEndian::read_i32(data))
}

/// Splits a frame's body (everything after the size prefix) into its type
/// and payload.
pub fn unpack_response(data: &[u8]) -> Result<Frame> {
    if data.len() < 4 {
        return Err(NsqError::FrameError(-1));
    }
    let frame_type = BigEndian::read_i32(&data[..4]);
    Ok(Frame {
        frame_type,
        payload: Bytes::copy_from_slice(&data[4..]),
    })
}

/// A decoded `MESSAGE` frame payload.
pub struct WireMessage {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: [u8; 16],
    pub body: Bytes,
}

pub fn unpack_message(data: &[u8]) -> Result<WireMessage> {
    if data.len() < 26 {
        return Err(NsqError::BadMessage);
    }
    let timestamp = BigEndian::read_i64(&data[0..8]);
    let attempts = BigEndian::read_u16(&data[8..10]);
    let mut id = [0u8; 16];
    id.copy_from_slice(&data[10..26]);
    let body = Bytes::copy_from_slice(&data[26..]);
    Ok(WireMessage {
        timestamp,
        attempts,
        id,
        body,
    })
}

fn pack_body(out: &mut BytesMut, body: Option<&[u8]>) {
    match body {
        None => {}
        Some(b) => {
            out.put_i32(b.len() as i32);
            out.put_slice(b);
        }
    }
}

fn command(cmd: &[u8], body: Option<&[u8]>, params: &[&[u8]]) -> Bytes {
    let mut out = BytesMut::with_capacity(cmd.len() + 16);
    out.put_slice(cmd);
    for p in params {
        out.put_u8(b' ');
        out.put_slice(p);
    }
    out.put_u8(b'\n');
    pack_body(&mut out, body);
    out.freeze()
}

pub fn identify(json: &[u8]) -> Bytes {
    command(b"IDENTIFY", Some(json), &[])
}

pub fn auth(secret: &[u8]) -> Bytes {
    command(b"AUTH", Some(secret), &[])
}

pub fn subscribe(topic: &str, channel: &str) -> Result<Bytes> {
    assert_valid_topic_name(topic)?;
    assert_valid_channel_name(channel)?;
    Ok(command(b"SUB", None, &[topic.as_bytes(), channel.as_bytes()]))
}

pub fn publish(topic: &str, body: &[u8]) -> Result<Bytes> {
    assert_valid_topic_name(topic)?;
    Ok(command(b"PUB", Some(body), &[topic.as_bytes()]))
}

pub fn multipublish(topic: &str, bodies: &[Bytes]) -> Result<Bytes> {
    assert_valid_topic_name(topic)?;
    let mut payload = BytesMut::new();
    payload.put_i32(bodies.len() as i32);
    for m in bodies {
        payload.put_i32(m.len() as i32);
        payload.put_slice(m);
    }
    Ok(command(b"MPUB", Some(&payload), &[topic.as_bytes()]))
}

pub fn deferpublish(topic: &str, body: &[u8], delay_ms: i64) -> Result<Bytes> {
    assert_valid_topic_name(topic)?;
    if delay_ms < 0 {
        return Err(NsqError::Invalid);
    }
    let delay = delay_ms.to_string();
    Ok(command(
        b"DPUB",
        Some(body),
        &[topic.as_bytes(), delay.as_bytes()],
    ))
}

pub fn ready(count: u32) -> Bytes {
    let count = count.to_string();
    command(b"RDY", None, &[count.as_bytes()])
}

pub fn finish(message_id: &[u8]) -> Bytes {
    command(b"FIN", None, &[message_id])
}

pub fn requeue(message_id: &[u8], timeout_ms: i64) -> Bytes {
    let timeout = timeout_ms.to_string();
    command(b"REQ", None, &[message_id, timeout.as_bytes()])
}

pub fn touch(message_id: &[u8]) -> Bytes {
    command(b"TOUCH", None, &[message_id])
}

pub fn close() -> Bytes {
    command(b"CLS", None, &[])
}

pub fn nop() -> Bytes {
    command(b"NOP", None, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(valid_topic_name("t"));
        assert!(valid_topic_name("my.topic-1_2"));
        assert!(valid_topic_name("topic#ephemeral"));
        assert!(!valid_topic_name(""));
        assert!(!valid_topic_name("bad topic"));
        assert!(!valid_topic_name(&"a".repeat(65)));
        assert!(valid_topic_name(&"a".repeat(64)));
    }

    #[test]
    fn subscribe_framing() {
        let cmd = subscribe("t", "c").unwrap();
        assert_eq!(&cmd[..], b"SUB t c\n");
    }

    #[test]
    fn publish_framing_includes_length_prefixed_body() {
        let cmd = publish("t", b"hi").unwrap();
        assert_eq!(&cmd[..7], b"PUB t\n\x00");
        assert_eq!(&cmd[7..11], &[0, 0, 0, 2]);
        assert_eq!(&cmd[11..], b"hi");
    }

    #[test]
    fn multipublish_framing() {
        let bodies = vec![Bytes::from_static(b"a"), Bytes::from_static(b"bb")];
        let cmd = multipublish("t", &bodies).unwrap();
        // MPUB t\n <size:4><count:4><len:4>a<len:4>bb
        assert_eq!(&cmd[..7], b"MPUB t\n");
        let size = unpack_size(&cmd[7..11]).unwrap();
        assert_eq!(size as usize, cmd.len() - 11);
        let count = BigEndian::read_i32(&cmd[11..15]);
        assert_eq!(count, 2);
    }

    #[test]
    fn response_round_trip() {
        let payload = b"OK";
        let mut framed = BytesMut::new();
        framed.put_i32(FRAME_TYPE_RESPONSE);
        framed.put_slice(payload);
        let frame = unpack_response(&framed).unwrap();
        assert_eq!(frame.frame_type, FRAME_TYPE_RESPONSE);
        assert_eq!(&frame.payload[..], payload);
    }

    #[test]
    fn message_round_trip() {
        let mut data = BytesMut::new();
        data.put_i64(42);
        data.put_u16(1);
        data.put_slice(&[7u8; 16]);
        data.put_slice(b"body");
        let msg = unpack_message(&data).unwrap();
        assert_eq!(msg.timestamp, 42);
        assert_eq!(msg.attempts, 1);
        assert_eq!(msg.id, [7u8; 16]);
        assert_eq!(&msg.body[..], b"body");
    }

    #[test]
    fn negative_defer_rejected_locally() {
        assert!(matches!(
            deferpublish("t", b"x", -1),
            Err(NsqError::Invalid)
        ));
    }

    #[test]
    fn ready_command() {
        assert_eq!(&ready(0)[..], b"RDY 0\n");
        assert_eq!(&ready(100)[..], b"RDY 100\n");
    }
}
