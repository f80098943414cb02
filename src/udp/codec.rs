//! Semtech GWMP (UDP packet-forwarder protocol, version 2) framing: the
//! 12-byte binary header this protocol shares across every datagram type,
//! plus the `rxpk`/`stat`/`txpk` JSON bodies PUSH_DATA/PULL_RESP carry. Field
//! names and the wire layout follow the protocol description quoted in
//! comments throughout `semtech-udp`'s own `push_data`/`pull_resp` packet
//! modules; this codec reimplements that framing directly over a plain UDP
//! socket instead of depending on the crate, whose `RxPk`/`TxPk` types are
//! tied to a `server_runtime`/`client_runtime` split this server doesn't use.

use base64::Engine;
use gs_core::{CodingRate, Modulation};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PROTOCOL_VERSION: u8 = 2;
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identifier {
    PushData = 0,
    PushAck = 1,
    PullData = 2,
    PullResp = 3,
    PullAck = 4,
    TxAck = 5,
}

impl Identifier {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Identifier::PushData),
            1 => Some(Identifier::PushAck),
            2 => Some(Identifier::PullData),
            3 => Some(Identifier::PullResp),
            4 => Some(Identifier::PullAck),
            5 => Some(Identifier::TxAck),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram shorter than the 4-byte GWMP header")]
    Truncated,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown identifier byte {0}")]
    UnknownIdentifier(u8),
    #[error("datagram missing the 8-byte gateway EUI")]
    MissingEui,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type MacAddress = [u8; 8];

#[derive(Debug, Clone)]
pub enum UplinkFrame {
    PushData { token: u16, gateway_mac: MacAddress, rxpk: Vec<RxPk>, stat: Option<Stat> },
    PullData { token: u16, gateway_mac: MacAddress },
    TxAck { token: u16, gateway_mac: MacAddress, error: Option<String> },
}

/// Parses one inbound datagram's GWMP header and, for PUSH_DATA, its JSON
/// body. PULL_DATA/TX_ACK bodies are either absent or optional JSON per the
/// protocol, handled the same way.
pub fn decode(buf: &[u8]) -> Result<UplinkFrame, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    let version = buf[0];
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let token = u16::from_le_bytes([buf[1], buf[2]]);
    let identifier = Identifier::from_u8(buf[3]).ok_or(DecodeError::UnknownIdentifier(buf[3]))?;

    match identifier {
        Identifier::PushData => {
            if buf.len() < HEADER_LEN + 8 {
                return Err(DecodeError::MissingEui);
            }
            let mut gateway_mac = [0u8; 8];
            gateway_mac.copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + 8]);
            let body: PushDataBody = serde_json::from_slice(&buf[HEADER_LEN + 8..])?;
            Ok(UplinkFrame::PushData { token, gateway_mac, rxpk: body.rxpk.unwrap_or_default(), stat: body.stat })
        }
        Identifier::PullData => {
            if buf.len() < HEADER_LEN + 8 {
                return Err(DecodeError::MissingEui);
            }
            let mut gateway_mac = [0u8; 8];
            gateway_mac.copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + 8]);
            Ok(UplinkFrame::PullData { token, gateway_mac })
        }
        Identifier::TxAck => {
            if buf.len() < HEADER_LEN + 8 {
                return Err(DecodeError::MissingEui);
            }
            let mut gateway_mac = [0u8; 8];
            gateway_mac.copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + 8]);
            let error = if buf.len() > HEADER_LEN + 8 {
                let body: TxAckBody = serde_json::from_slice(&buf[HEADER_LEN + 8..])?;
                body.txpk_ack.error.filter(|e| e != "NONE")
            } else {
                None
            };
            Ok(UplinkFrame::TxAck { token, gateway_mac, error })
        }
        other => Err(DecodeError::UnknownIdentifier(other as u8)),
    }
}

pub fn encode_push_ack(token: u16) -> Vec<u8> {
    vec![PROTOCOL_VERSION, (token & 0xff) as u8, (token >> 8) as u8, Identifier::PushAck as u8]
}

pub fn encode_pull_ack(token: u16) -> Vec<u8> {
    vec![PROTOCOL_VERSION, (token & 0xff) as u8, (token >> 8) as u8, Identifier::PullAck as u8]
}

pub fn encode_pull_resp(token: u16, txpk: &TxPk) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = vec![PROTOCOL_VERSION, (token & 0xff) as u8, (token >> 8) as u8, Identifier::PullResp as u8];
    buf.extend(serde_json::to_vec(&PullRespBody { txpk: txpk.clone() })?);
    Ok(buf)
}

#[derive(Debug, Deserialize)]
struct PushDataBody {
    #[serde(default)]
    rxpk: Option<Vec<RxPk>>,
    #[serde(default)]
    stat: Option<Stat>,
}

#[derive(Debug, Serialize)]
struct PullRespBody {
    txpk: TxPk,
}

#[derive(Debug, Deserialize)]
struct TxAckBody {
    txpk_ack: TxPkAck,
}

#[derive(Debug, Deserialize)]
struct TxPkAck {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RxPk {
    pub tmst: u32,
    pub freq: f64,
    pub rfch: u32,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub rssi: i32,
    pub lsnr: f32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TxPk {
    pub imme: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    pub freq: f64,
    pub rfch: u32,
    pub powe: i32,
    pub modu: &'static str,
    pub datr: String,
    pub codr: &'static str,
    pub ipol: bool,
    pub size: usize,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stat {
    #[serde(default)]
    pub lati: Option<f64>,
    #[serde(default)]
    pub long: Option<f64>,
    #[serde(default)]
    pub alti: Option<f64>,
    #[serde(default)]
    pub time: Option<String>,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD.decode(s.as_bytes()).map_err(D::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateParseError {
    #[error("malformed LoRa data rate identifier: {0}")]
    Lora(String),
    #[error("malformed coding rate identifier: {0}")]
    CodingRate(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Parses `"SF7BW125"`/`"50000"` style `datr` strings into a `Modulation`.
pub fn parse_modulation(modu: &str, datr: &str) -> Result<Modulation, RateParseError> {
    if modu.eq_ignore_ascii_case("FSK") {
        let bitrate_bps: u32 = datr.parse().map_err(|_| RateParseError::Lora(datr.to_string()))?;
        return Ok(Modulation::Fsk { bitrate_bps });
    }
    let rest = datr.strip_prefix("SF").ok_or_else(|| RateParseError::Lora(datr.to_string()))?;
    let bw_pos = rest.find("BW").ok_or_else(|| RateParseError::Lora(datr.to_string()))?;
    let spreading_factor: u8 = rest[..bw_pos].parse().map_err(|_| RateParseError::Lora(datr.to_string()))?;
    let bandwidth_khz: u32 = rest[bw_pos + 2..].parse().map_err(|_| RateParseError::Lora(datr.to_string()))?;
    Ok(Modulation::Lora { spreading_factor, bandwidth_hz: bandwidth_khz * 1000 })
}

pub fn format_datr(modulation: Modulation) -> String {
    match modulation {
        Modulation::Lora { spreading_factor, bandwidth_hz } => format!("SF{spreading_factor}BW{}", bandwidth_hz / 1000),
        Modulation::Fsk { bitrate_bps } => bitrate_bps.to_string(),
    }
}

pub fn parse_coding_rate(codr: &str) -> Result<CodingRate, RateParseError> {
    match codr {
        "4/5" => Ok(CodingRate::Cr4_5),
        "4/6" => Ok(CodingRate::Cr4_6),
        "4/7" => Ok(CodingRate::Cr4_7),
        "4/8" => Ok(CodingRate::Cr4_8),
        other => Err(RateParseError::CodingRate(other.to_string())),
    }
}

pub fn format_coding_rate(coding_rate: CodingRate) -> &'static str {
    match coding_rate {
        CodingRate::Cr4_5 => "4/5",
        CodingRate::Cr4_6 => "4/6",
        CodingRate::Cr4_7 => "4/7",
        CodingRate::Cr4_8 => "4/8",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_push_data() -> Vec<u8> {
        let mut buf = vec![PROTOCOL_VERSION, 0x34, 0x12, Identifier::PushData as u8];
        buf.extend([1u8, 2, 3, 4, 5, 6, 7, 8]);
        let body = serde_json::json!({
            "rxpk": [{
                "tmst": 100u32, "freq": 868.1, "rfch": 0, "modu": "LORA",
                "datr": "SF7BW125", "codr": "4/5", "rssi": -80, "lsnr": 8.0,
                "data": base64::engine::general_purpose::STANDARD.encode([1,2,3])
            }]
        });
        buf.extend(serde_json::to_vec(&body).unwrap());
        buf
    }

    #[test]
    fn decodes_push_data_header_and_body() {
        let frame = decode(&sample_push_data()).unwrap();
        match frame {
            UplinkFrame::PushData { token, gateway_mac, rxpk, .. } => {
                assert_eq!(token, 0x1234);
                assert_eq!(gateway_mac, [1, 2, 3, 4, 5, 6, 7, 8]);
                assert_eq!(rxpk.len(), 1);
                assert_eq!(rxpk[0].data, vec![1, 2, 3]);
            }
            other => panic!("expected PushData, got {other:?}"),
        }
    }

    #[test]
    fn rejects_wrong_protocol_version() {
        let mut buf = sample_push_data();
        buf[0] = 1;
        assert!(matches!(decode(&buf), Err(DecodeError::UnsupportedVersion(1))));
    }

    #[test]
    fn datr_round_trips_through_format_and_parse() {
        let modulation = Modulation::Lora { spreading_factor: 9, bandwidth_hz: 125_000 };
        let formatted = format_datr(modulation);
        assert_eq!(formatted, "SF9BW125");
        assert_eq!(parse_modulation("LORA", &formatted).unwrap(), modulation);
    }

    #[test]
    fn push_ack_echoes_token() {
        let ack = encode_push_ack(0x1234);
        assert_eq!(ack, vec![PROTOCOL_VERSION, 0x34, 0x12, Identifier::PushAck as u8]);
    }
}
