//! Canonical, protocol-agnostic message types. Every frontend translates its
//! own wire format into these types before handing anything to a
//! `Connection`; no protocol-specific type crosses that boundary.

use gs_core::{CodingRate, Modulation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

/// One-of string gateway ID or 8-byte EUI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayIdentity {
    Id(String),
    Eui([u8; 8]),
}

impl fmt::Display for GatewayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayIdentity::Id(id) => write!(f, "{id}"),
            GatewayIdentity::Eui(eui) => {
                for b in eui {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f32,
}

/// Radio transmit settings shared by uplinks and scheduled downlinks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TxSettings {
    pub modulation: Modulation,
    pub coding_rate: CodingRate,
    pub frequency_hz: u32,
    /// Gateway-local concentrator timestamp, microseconds, wraps at 2^32.
    pub gateway_timestamp_us: u32,
}

/// Per-antenna receive metadata for one uplink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxMetadata {
    pub antenna_index: u32,
    pub timestamp_us: u32,
    pub rssi: f32,
    pub channel_rssi: f32,
    pub snr: f32,
    pub fine_timestamp: Option<u64>,
    /// Populated only when the gateway's `LocationPublic` flag is set; see
    /// `Connection::handle_up`.
    pub location: Option<Location>,
    pub uplink_token: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkMessage {
    pub raw_payload: Vec<u8>,
    pub settings: TxSettings,
    pub rx_metadata: Vec<RxMetadata>,
    pub received_at: SystemTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusMetrics {
    pub boot_time: Option<SystemTime>,
    pub platform: Option<String>,
    pub firmware_version: Option<String>,
    pub ip: Option<String>,
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub time: SystemTime,
    pub antenna_locations: Vec<Location>,
    pub metrics: StatusMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxAckResult {
    Success,
    Collision,
    TooLate,
    TooEarly,
    TxPowerAdjusted,
    TxFreqMismatch,
    TxScheduleConflict,
    TxAckGpsTimeMismatch,
    GatewayDisconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxAck {
    pub token: Vec<u8>,
    pub result: TxAckResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Class {
    A,
    B,
    C,
}

/// Either a reference to the uplink that opens this downlink's Rx windows
/// (Class A) or a fixed gateway/antenna target (Class B/C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DownlinkPath {
    Uplink { gateway: GatewayIdentity, token: Vec<u8> },
    Fixed { gateway: GatewayIdentity, antenna_ids: Vec<u32> },
}

impl DownlinkPath {
    pub fn gateway(&self) -> &GatewayIdentity {
        match self {
            DownlinkPath::Uplink { gateway, .. } => gateway,
            DownlinkPath::Fixed { gateway, .. } => gateway,
        }
    }
}

use gs_core::RxWindowParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownlinkRequest {
    pub class: Class,
    pub paths: Vec<DownlinkPath>,
    pub raw_payload: Vec<u8>,
    pub priority: i32,
    pub rx1_delay_secs: u32,
    pub rx1: Option<RxWindowParams>,
    pub rx2: Option<RxWindowParams>,
    pub absolute_time: Option<SystemTime>,
    pub frequency_plan_id: Option<String>,
}

/// A downlink that has cleared every scheduler check and is ready to be
/// handed to the frontend for transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledDownlink {
    pub raw_payload: Vec<u8>,
    pub settings: TxSettings,
    pub tx_power_dbm: f32,
    pub starts_at: SystemTime,
    pub ends_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eui_identity_displays_as_lowercase_hex() {
        let identity = GatewayIdentity::Eui([0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22, 0x33]);
        assert_eq!(identity.to_string(), "deadbeef00112233");
    }

    #[test]
    fn id_identity_displays_verbatim() {
        let identity = GatewayIdentity::Id("gw-east-1".to_string());
        assert_eq!(identity.to_string(), "gw-east-1");
    }

    #[test]
    fn downlink_path_reports_its_gateway_for_either_variant() {
        let gateway = GatewayIdentity::Id("gw-1".to_string());
        let uplink_path = DownlinkPath::Uplink { gateway: gateway.clone(), token: vec![1] };
        let fixed_path = DownlinkPath::Fixed { gateway: gateway.clone(), antenna_ids: vec![0] };
        assert_eq!(*uplink_path.gateway(), gateway);
        assert_eq!(*fixed_path.gateway(), gateway);
    }
}
