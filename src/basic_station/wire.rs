//! LNS WebSocket JSON framing (the wire format BasicStation firmware
//! speaks). Mirrors how `udp::codec` shapes GWMP's JSON bodies: plain
//! `serde` structs plus free functions that convert to/from the canonical
//! `message` types, kept out of the frontend struct itself.
//!
//! `pdu` carries the raw LoRaWAN frame as a hex string, the way the
//! protocol's own `jreq`/`updf`/`dnmsg` messages do — this server never
//! parses the MAC payload inside it, only moves it between the gateway and
//! the network server.

use crate::error::{Error, Result};
use crate::message::{RxMetadata, TxSettings, UplinkMessage};
use gs_core::{FrequencyPlan, Modulation};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Debug, Deserialize)]
#[serde(tag = "msgtype", rename_all = "lowercase")]
pub enum InboundMessage {
    Version(VersionMessage),
    Jreq(UplinkFrame),
    Updf(UplinkFrame),
    Dntxed(DntxedMessage),
    Timesync(TimesyncMessage),
}

#[derive(Debug, Deserialize)]
pub struct VersionMessage {
    pub station: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub model: String,
    pub protocol: u32,
}

#[derive(Debug, Deserialize)]
pub struct UpInfo {
    pub rctx: u64,
    pub xtime: u64,
    pub rssi: f32,
    pub snr: f32,
}

/// Shared shape of `jreq` (join-request uplink) and `updf` (data uplink):
/// BasicStation reports both the same way, distinguishing them only by
/// `msgtype`, which this server doesn't need to branch on since it never
/// inspects the MAC payload either way.
#[derive(Debug, Deserialize)]
pub struct UplinkFrame {
    #[serde(rename = "DR")]
    pub dr: u8,
    #[serde(rename = "Freq")]
    pub freq_hz: u32,
    pub upinfo: UpInfo,
    pub pdu: String,
}

#[derive(Debug, Deserialize)]
pub struct DntxedMessage {
    pub diid: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimesyncMessage {
    #[serde(default)]
    pub txtime: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RouterInfoResponse {
    pub muxs: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct RouterInfoRequest {
    #[serde(default)]
    pub router: String,
}

/// Reply to `version`: tells the station which channels and data rates to
/// use. `DRs` entries are `[spreading_factor, bandwidth_hz, -1]` per the
/// protocol's own encoding of a LoRa data rate row; FSK rows aren't
/// representable in that triple so they're omitted here.
#[derive(Debug, Serialize)]
pub struct RouterConfig {
    pub msgtype: &'static str,
    #[serde(rename = "NetID")]
    pub net_id: Vec<i32>,
    #[serde(rename = "JoinEui")]
    pub join_eui: Vec<[i64; 2]>,
    pub region: String,
    pub hwspec: String,
    pub freq_range: [u32; 2],
    #[serde(rename = "DRs")]
    pub drs: Vec<[i32; 3]>,
    pub sx1301_conf: Vec<serde_json::Value>,
    pub nocca: bool,
    pub nodc: bool,
    pub nodwell: bool,
}

impl RouterConfig {
    pub fn from_plan(plan: &FrequencyPlan) -> Self {
        let drs = plan
            .data_rate_table
            .iter()
            .map(|m| match m {
                Modulation::Lora { spreading_factor, bandwidth_hz } => [*spreading_factor as i32, *bandwidth_hz as i32, -1],
                Modulation::Fsk { .. } => [-1, -1, -1],
            })
            .collect();
        let freq_min = plan.uplink_channels.iter().map(|c| c.frequency_hz).min().unwrap_or(0);
        let freq_max = plan.uplink_channels.iter().map(|c| c.frequency_hz).max().unwrap_or(0);
        Self {
            msgtype: "router_config",
            net_id: vec![0],
            join_eui: Vec::new(),
            region: plan.id.clone(),
            hwspec: "sx1301/1".to_string(),
            freq_range: [freq_min, freq_max],
            drs,
            sx1301_conf: Vec::new(),
            nocca: true,
            nodc: true,
            nodwell: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DnMsg {
    pub msgtype: &'static str,
    #[serde(rename = "DevEui")]
    pub dev_eui: String,
    pub diid: u64,
    pub xtime: u64,
    #[serde(rename = "RxDelay")]
    pub rx_delay: u32,
    #[serde(rename = "RX1DR")]
    pub rx1_dr: u32,
    #[serde(rename = "RX1Freq")]
    pub rx1_freq: u32,
    #[serde(rename = "RX2DR", skip_serializing_if = "Option::is_none")]
    pub rx2_dr: Option<u32>,
    #[serde(rename = "RX2Freq", skip_serializing_if = "Option::is_none")]
    pub rx2_freq: Option<u32>,
    pub priority: i32,
    pub pdu: String,
}

/// Converts one `jreq`/`updf` frame into a canonical uplink, resolving `DR`
/// against the gateway's frequency plan the way `udp::codec::parse_modulation`
/// resolves `datr`.
pub fn to_uplink_message(frame: &UplinkFrame, plan: &FrequencyPlan) -> Result<UplinkMessage> {
    let modulation = plan
        .modulation_for(frame.dr)
        .ok_or_else(|| Error::Decode(format!("unknown data rate index {}", frame.dr)))?;
    let raw_payload = hex_decode(&frame.pdu).map_err(|_| Error::Decode(format!("malformed pdu hex: {}", frame.pdu)))?;
    Ok(UplinkMessage {
        raw_payload,
        settings: TxSettings {
            modulation,
            coding_rate: gs_core::CodingRate::Cr4_5,
            frequency_hz: frame.freq_hz,
            gateway_timestamp_us: frame.upinfo.xtime as u32,
        },
        rx_metadata: vec![RxMetadata {
            antenna_index: frame.upinfo.rctx as u32,
            timestamp_us: frame.upinfo.xtime as u32,
            rssi: frame.upinfo.rssi,
            channel_rssi: frame.upinfo.rssi,
            snr: frame.upinfo.snr,
            fine_timestamp: None,
            location: None,
            uplink_token: Vec::new(),
        }],
        received_at: SystemTime::now(),
    })
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn hex_decode(s: &str) -> std::result::Result<Vec<u8>, std::num::ParseIntError> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..(i + 2).min(s.len())], 16))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gs_core::frequency_plan::eu_863_870;

    #[test]
    fn hex_round_trips() {
        let bytes = vec![0xde, 0xad, 0xbe, 0xef];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn uplink_frame_resolves_data_rate_against_plan() {
        let plan = eu_863_870();
        let frame = UplinkFrame {
            dr: 5,
            freq_hz: 868_100_000,
            upinfo: UpInfo { rctx: 0, xtime: 42, rssi: -80.0, snr: 8.0 },
            pdu: hex_encode(&[1, 2, 3]),
        };
        let uplink = to_uplink_message(&frame, &plan).unwrap();
        assert_eq!(uplink.raw_payload, vec![1, 2, 3]);
        assert_eq!(uplink.settings.modulation, Modulation::Lora { spreading_factor: 7, bandwidth_hz: 125_000 });
    }

    #[test]
    fn unknown_data_rate_is_rejected() {
        let plan = eu_863_870();
        let frame = UplinkFrame {
            dr: 255,
            freq_hz: 868_100_000,
            upinfo: UpInfo { rctx: 0, xtime: 0, rssi: 0.0, snr: 0.0 },
            pdu: "00".to_string(),
        };
        assert!(to_uplink_message(&frame, &plan).is_err());
    }
}
