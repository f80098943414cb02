//! Hand-rolled MQTT 3.1.1 fixed-header framing over `tokio_util::codec`.
//! Packet shapes (`Connect`/`ConnectAck`/`Publish`/`Subscribe`/`SubscribeAck`/
//! `PingReq`/`PingResp`/`Disconnect`) follow the wire layout in the retrieved
//! `mqtt-core`/`mqtt-packet` sources, rewritten against our own framing
//! rather than depending on that crate: its published version predates the
//! MQTT 5 properties it also carries, and pinning it would drag in a
//! protocol variant we don't implement.
//!
//! Only the packet types this frontend actually uses are decoded/encoded;
//! anything else is a protocol error.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

#[derive(Debug, Clone)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Publish {
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topic_filters: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe(Subscribe),
    PingReq,
    Disconnect,
}

#[derive(Debug, Clone)]
pub enum ServerPacket {
    ConnAck(ConnectReturnCode),
    Publish(Publish),
    SubAck { packet_id: u16, granted_qos: Vec<u8> },
    PingResp,
}

const CONNECT: u8 = 1 << 4;
const CONNACK: u8 = 2 << 4;
const PUBLISH: u8 = 3 << 4;
const PUBACK: u8 = 4 << 4;
const SUBSCRIBE: u8 = 8 << 4;
const SUBACK: u8 = 9 << 4;
const PINGREQ: u8 = 12 << 4;
const PINGRESP: u8 = 13 << 4;
const DISCONNECT: u8 = 14 << 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed remaining length")]
    MalformedLength,
    #[error("unsupported packet type: {0:#x}")]
    UnsupportedType(u8),
    #[error("truncated packet")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<CodecError> for io::Error {
    fn from(e: CodecError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Reads the variable-length "remaining length" field (MQTT 3.1.1 §2.2.3):
/// up to 4 continuation bytes, 7 data bits each, little-endian multiplier.
fn decode_remaining_length(buf: &[u8]) -> Option<(usize, usize)> {
    let mut multiplier = 1usize;
    let mut value = 0usize;
    for (consumed, &byte) in buf.iter().enumerate().take(4) {
        value += (byte & 0x7f) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Some((value, consumed + 1));
        }
        multiplier *= 128;
    }
    None
}

fn encode_remaining_length(out: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn read_utf8_string(buf: &mut io::Cursor<&[u8]>) -> Result<String, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| CodecError::Truncated)
}

fn put_utf8_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

pub struct MqttCodec;

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if src.is_empty() {
            return Ok(None);
        }
        let packet_type = src[0] & 0xf0;
        let flags = src[0] & 0x0f;
        let Some((remaining_len, len_bytes)) = decode_remaining_length(&src[1..]) else {
            if src.len() > 5 {
                return Err(CodecError::MalformedLength);
            }
            return Ok(None);
        };
        let header_len = 1 + len_bytes;
        if src.len() < header_len + remaining_len {
            return Ok(None);
        }
        src.advance(header_len);
        let body = src.split_to(remaining_len);
        let mut cursor = io::Cursor::new(&body[..]);

        let packet = match packet_type {
            CONNECT => {
                let _protocol_name = read_utf8_string(&mut cursor)?;
                if cursor.remaining() < 4 {
                    return Err(CodecError::Truncated);
                }
                let _protocol_level = cursor.get_u8();
                let flags = cursor.get_u8();
                let keep_alive_secs = cursor.get_u16();
                let client_id = read_utf8_string(&mut cursor)?;
                let has_will = flags & 0x04 != 0;
                if has_will {
                    let _will_topic = read_utf8_string(&mut cursor)?;
                    if cursor.remaining() < 2 {
                        return Err(CodecError::Truncated);
                    }
                    let will_len = cursor.get_u16() as usize;
                    if cursor.remaining() < will_len {
                        return Err(CodecError::Truncated);
                    }
                    cursor.advance(will_len);
                }
                let username = if flags & 0x80 != 0 { Some(read_utf8_string(&mut cursor)?) } else { None };
                let password = if flags & 0x40 != 0 {
                    if cursor.remaining() < 2 {
                        return Err(CodecError::Truncated);
                    }
                    let pw_len = cursor.get_u16() as usize;
                    if cursor.remaining() < pw_len {
                        return Err(CodecError::Truncated);
                    }
                    let mut pw = vec![0u8; pw_len];
                    cursor.copy_to_slice(&mut pw);
                    Some(pw)
                } else {
                    None
                };
                Packet::Connect(Connect {
                    client_id,
                    keep_alive_secs,
                    clean_session: flags & 0x02 != 0,
                    username,
                    password,
                })
            }
            PUBLISH => {
                let topic = read_utf8_string(&mut cursor)?;
                let qos = (flags >> 1) & 0x03;
                let packet_id = if qos > 0 {
                    if cursor.remaining() < 2 {
                        return Err(CodecError::Truncated);
                    }
                    Some(cursor.get_u16())
                } else {
                    None
                };
                let mut payload = vec![0u8; cursor.remaining()];
                cursor.copy_to_slice(&mut payload);
                Packet::Publish(Publish { topic, packet_id, payload })
            }
            PUBACK => {
                if cursor.remaining() < 2 {
                    return Err(CodecError::Truncated);
                }
                Packet::PubAck { packet_id: cursor.get_u16() }
            }
            SUBSCRIBE => {
                if cursor.remaining() < 2 {
                    return Err(CodecError::Truncated);
                }
                let packet_id = cursor.get_u16();
                let mut topic_filters = Vec::new();
                while cursor.remaining() > 0 {
                    topic_filters.push(read_utf8_string(&mut cursor)?);
                    if cursor.remaining() < 1 {
                        return Err(CodecError::Truncated);
                    }
                    cursor.advance(1); // requested QoS, ignored: we only ever grant QoS 0.
                }
                Packet::Subscribe(Subscribe { packet_id, topic_filters })
            }
            PINGREQ => Packet::PingReq,
            DISCONNECT => Packet::Disconnect,
            other => return Err(CodecError::UnsupportedType(other)),
        };
        Ok(Some(packet))
    }
}

impl Encoder<ServerPacket> for MqttCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ServerPacket, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut body = BytesMut::new();
        let header_byte;
        match item {
            ServerPacket::ConnAck(code) => {
                header_byte = CONNACK;
                body.put_u8(0); // session present: always false, we keep no persisted sessions.
                body.put_u8(code as u8);
            }
            ServerPacket::Publish(publish) => {
                header_byte = PUBLISH; // QoS 0: no packet identifier.
                put_utf8_string(&mut body, &publish.topic);
                body.put_slice(&publish.payload);
            }
            ServerPacket::SubAck { packet_id, granted_qos } => {
                header_byte = SUBACK;
                body.put_u16(packet_id);
                body.put_slice(&granted_qos);
            }
            ServerPacket::PingResp => {
                header_byte = PINGRESP;
            }
        }
        dst.put_u8(header_byte);
        encode_remaining_length(dst, body.len());
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_connect_with_username_and_password() {
        let mut buf = BytesMut::new();
        buf.put_u8(CONNECT);
        let mut body = BytesMut::new();
        put_utf8_string(&mut body, "MQTT");
        body.put_u8(4); // protocol level 3.1.1
        body.put_u8(0xC2); // username + password, clean session
        body.put_u16(30);
        put_utf8_string(&mut body, "eui-0102030405060708");
        put_utf8_string(&mut body, "eui-0102030405060708");
        put_utf8_string(&mut body, "api-key");
        encode_remaining_length(&mut buf, body.len());
        buf.put_slice(&body);

        let packet = MqttCodec.decode(&mut buf).unwrap().unwrap();
        match packet {
            Packet::Connect(connect) => {
                assert_eq!(connect.client_id, "eui-0102030405060708");
                assert_eq!(connect.username.as_deref(), Some("eui-0102030405060708"));
                assert_eq!(connect.password.as_deref(), Some("api-key".as_bytes()));
                assert_eq!(connect.keep_alive_secs, 30);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn waits_for_more_bytes_when_body_is_incomplete() {
        let mut buf = BytesMut::new();
        buf.put_u8(PUBLISH);
        buf.put_u8(20); // remaining length, but body is short
        buf.put_slice(b"short");
        assert!(MqttCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encodes_connack_accepted() {
        let mut buf = BytesMut::new();
        MqttCodec.encode(ServerPacket::ConnAck(ConnectReturnCode::Accepted), &mut buf).unwrap();
        assert_eq!(&buf[..], &[CONNACK, 2, 0, 0]);
    }

    #[test]
    fn round_trips_publish_payload() {
        let mut buf = BytesMut::new();
        let publish = Publish { topic: "v3/gw-1/down".to_string(), packet_id: None, payload: vec![1, 2, 3] };
        MqttCodec.encode(ServerPacket::Publish(publish), &mut buf).unwrap();
        assert_eq!(buf[0], PUBLISH);
    }
}
