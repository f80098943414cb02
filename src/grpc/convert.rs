//! Conversions between the canonical types in `crate::message` and the
//! wire types `build.rs` generates from `proto/gs.proto`. Proto3 enum
//! fields are read/written as their underlying `i32` (prost never exposes
//! them as the generated Rust enum on the message struct itself, precisely
//! so an unrecognized value on the wire doesn't fail to decode), so every
//! conversion here matches on the numeric value directly rather than on a
//! generated variant name.

pub mod pb {
    tonic::include_proto!("gs.v1");
}

use crate::error::Error;
use crate::message::{
    Class, DownlinkPath, DownlinkRequest, GatewayIdentity, Location, RxMetadata, ScheduledDownlink, Status,
    StatusMetrics, TxAck, TxAckResult, TxSettings, UplinkMessage,
};
use crate::stats::StatsSnapshot;
use gs_core::{CodingRate, FrequencyPlan, Modulation, RxWindowParams};
use std::time::{Duration, SystemTime};

fn unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_nanos() as i64
}

fn from_unix_nanos(nanos: i64) -> SystemTime {
    if nanos < 0 {
        SystemTime::UNIX_EPOCH
    } else {
        SystemTime::UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    }
}

fn modulation_to_pb(modulation: Modulation, settings: &mut pb::TxSettings) {
    match modulation {
        Modulation::Lora { spreading_factor, bandwidth_hz } => {
            settings.modulation = 0; // MODULATION_LORA
            settings.spreading_factor = spreading_factor as u32;
            settings.bandwidth_hz = bandwidth_hz;
        }
        Modulation::Fsk { bitrate_bps } => {
            settings.modulation = 1; // MODULATION_FSK
            settings.bitrate_bps = bitrate_bps;
        }
    }
}

fn modulation_from_pb(settings: &pb::TxSettings) -> Result<Modulation, Error> {
    match settings.modulation {
        0 => Ok(Modulation::Lora { spreading_factor: settings.spreading_factor as u8, bandwidth_hz: settings.bandwidth_hz }),
        1 => Ok(Modulation::Fsk { bitrate_bps: settings.bitrate_bps }),
        other => Err(Error::Decode(format!("unknown modulation discriminant {other}"))),
    }
}

fn coding_rate_to_pb(coding_rate: CodingRate) -> i32 {
    match coding_rate {
        CodingRate::Cr4_5 => 0,
        CodingRate::Cr4_6 => 1,
        CodingRate::Cr4_7 => 2,
        CodingRate::Cr4_8 => 3,
    }
}

fn coding_rate_from_pb(value: i32) -> Result<CodingRate, Error> {
    match value {
        0 => Ok(CodingRate::Cr4_5),
        1 => Ok(CodingRate::Cr4_6),
        2 => Ok(CodingRate::Cr4_7),
        3 => Ok(CodingRate::Cr4_8),
        other => Err(Error::Decode(format!("unknown coding rate discriminant {other}"))),
    }
}

fn tx_settings_to_pb(settings: &TxSettings) -> pb::TxSettings {
    let mut pb_settings = pb::TxSettings {
        modulation: 0,
        spreading_factor: 0,
        bandwidth_hz: 0,
        bitrate_bps: 0,
        coding_rate: coding_rate_to_pb(settings.coding_rate),
        frequency_hz: settings.frequency_hz,
        gateway_timestamp_us: settings.gateway_timestamp_us,
    };
    modulation_to_pb(settings.modulation, &mut pb_settings);
    pb_settings
}

fn tx_settings_from_pb(settings: &pb::TxSettings) -> Result<TxSettings, Error> {
    Ok(TxSettings {
        modulation: modulation_from_pb(settings)?,
        coding_rate: coding_rate_from_pb(settings.coding_rate)?,
        frequency_hz: settings.frequency_hz,
        gateway_timestamp_us: settings.gateway_timestamp_us,
    })
}

fn location_to_pb(location: Location) -> pb::Location {
    pb::Location { latitude: location.latitude, longitude: location.longitude, altitude_m: location.altitude_m }
}

fn location_from_pb(location: pb::Location) -> Location {
    Location { latitude: location.latitude, longitude: location.longitude, altitude_m: location.altitude_m }
}

fn rx_metadata_to_pb(rx: &RxMetadata) -> pb::RxMetadata {
    pb::RxMetadata {
        antenna_index: rx.antenna_index,
        timestamp_us: rx.timestamp_us,
        rssi: rx.rssi,
        channel_rssi: rx.channel_rssi,
        snr: rx.snr,
        fine_timestamp: rx.fine_timestamp,
        location: rx.location.map(location_to_pb),
        uplink_token: rx.uplink_token.clone(),
    }
}

fn rx_metadata_from_pb(rx: pb::RxMetadata) -> RxMetadata {
    RxMetadata {
        antenna_index: rx.antenna_index,
        timestamp_us: rx.timestamp_us,
        rssi: rx.rssi,
        channel_rssi: rx.channel_rssi,
        snr: rx.snr,
        fine_timestamp: rx.fine_timestamp,
        location: rx.location.map(location_from_pb),
        uplink_token: rx.uplink_token,
    }
}

pub fn uplink_message_to_pb(uplink: &UplinkMessage) -> pb::UplinkMessage {
    pb::UplinkMessage {
        raw_payload: uplink.raw_payload.clone(),
        settings: Some(tx_settings_to_pb(&uplink.settings)),
        rx_metadata: uplink.rx_metadata.iter().map(rx_metadata_to_pb).collect(),
        received_at_unix_nanos: unix_nanos(uplink.received_at),
    }
}

pub fn uplink_message_from_pb(uplink: pb::UplinkMessage) -> Result<UplinkMessage, Error> {
    let settings = uplink.settings.ok_or_else(|| Error::Decode("uplink missing settings".to_string()))?;
    Ok(UplinkMessage {
        raw_payload: uplink.raw_payload,
        settings: tx_settings_from_pb(&settings)?,
        rx_metadata: uplink.rx_metadata.into_iter().map(rx_metadata_from_pb).collect(),
        received_at: from_unix_nanos(uplink.received_at_unix_nanos),
    })
}

pub fn status_to_pb(status: &Status) -> pb::Status {
    pb::Status {
        time_unix_nanos: unix_nanos(status.time),
        antenna_locations: status.antenna_locations.iter().copied().map(location_to_pb).collect(),
        metrics: Some(pb::StatusMetrics {
            boot_time_unix_nanos: status.metrics.boot_time.map(unix_nanos),
            platform: status.metrics.platform.clone(),
            firmware_version: status.metrics.firmware_version.clone(),
            ip: status.metrics.ip.clone(),
            extra: status.metrics.extra.clone(),
        }),
    }
}

pub fn status_from_pb(status: pb::Status) -> Status {
    let metrics = status.metrics.unwrap_or_default();
    Status {
        time: from_unix_nanos(status.time_unix_nanos),
        antenna_locations: status.antenna_locations.into_iter().map(location_from_pb).collect(),
        metrics: StatusMetrics {
            boot_time: metrics.boot_time_unix_nanos.map(from_unix_nanos),
            platform: metrics.platform,
            firmware_version: metrics.firmware_version,
            ip: metrics.ip,
            extra: metrics.extra,
        },
    }
}

fn tx_ack_result_to_pb(result: TxAckResult) -> i32 {
    match result {
        TxAckResult::Success => 0,
        TxAckResult::Collision => 1,
        TxAckResult::TooLate => 2,
        TxAckResult::TooEarly => 3,
        TxAckResult::TxPowerAdjusted => 4,
        TxAckResult::TxFreqMismatch => 5,
        TxAckResult::TxScheduleConflict => 6,
        TxAckResult::TxAckGpsTimeMismatch => 7,
        TxAckResult::GatewayDisconnected => 8,
    }
}

fn tx_ack_result_from_pb(value: i32) -> Result<TxAckResult, Error> {
    match value {
        0 => Ok(TxAckResult::Success),
        1 => Ok(TxAckResult::Collision),
        2 => Ok(TxAckResult::TooLate),
        3 => Ok(TxAckResult::TooEarly),
        4 => Ok(TxAckResult::TxPowerAdjusted),
        5 => Ok(TxAckResult::TxFreqMismatch),
        6 => Ok(TxAckResult::TxScheduleConflict),
        7 => Ok(TxAckResult::TxAckGpsTimeMismatch),
        8 => Ok(TxAckResult::GatewayDisconnected),
        other => Err(Error::Decode(format!("unknown tx ack result discriminant {other}"))),
    }
}

pub fn tx_ack_to_pb(ack: &TxAck) -> pb::TxAck {
    pb::TxAck { token: ack.token.clone(), result: tx_ack_result_to_pb(ack.result) }
}

pub fn tx_ack_from_pb(ack: pb::TxAck) -> Result<TxAck, Error> {
    Ok(TxAck { token: ack.token, result: tx_ack_result_from_pb(ack.result)? })
}

fn class_to_pb(class: Class) -> i32 {
    match class {
        Class::A => 0,
        Class::B => 1,
        Class::C => 2,
    }
}

fn class_from_pb(value: i32) -> Result<Class, Error> {
    match value {
        0 => Ok(Class::A),
        1 => Ok(Class::B),
        2 => Ok(Class::C),
        other => Err(Error::Decode(format!("unknown class discriminant {other}"))),
    }
}

fn rx_window_to_pb(params: RxWindowParams) -> pb::RxWindowParams {
    pb::RxWindowParams { data_rate: params.data_rate as u32, frequency_hz: params.frequency_hz }
}

fn rx_window_from_pb(params: pb::RxWindowParams) -> RxWindowParams {
    RxWindowParams { data_rate: params.data_rate as u8, frequency_hz: params.frequency_hz }
}

fn path_to_pb(path: &DownlinkPath) -> pb::DownlinkPath {
    let inner = match path {
        DownlinkPath::Uplink { gateway, token } => {
            pb::downlink_path::Path::Uplink(pb::UplinkPath { gateway: gateway.to_string(), token: token.clone() })
        }
        DownlinkPath::Fixed { gateway, antenna_ids } => {
            pb::downlink_path::Path::Fixed(pb::FixedPath { gateway: gateway.to_string(), antenna_ids: antenna_ids.clone() })
        }
    };
    pb::DownlinkPath { path: Some(inner) }
}

fn path_from_pb(path: pb::DownlinkPath, default_gateway: &GatewayIdentity) -> Result<DownlinkPath, Error> {
    match path.path {
        Some(pb::downlink_path::Path::Uplink(pb::UplinkPath { gateway, token })) => {
            let gateway = if gateway.is_empty() { default_gateway.clone() } else { GatewayIdentity::Id(gateway) };
            Ok(DownlinkPath::Uplink { gateway, token })
        }
        Some(pb::downlink_path::Path::Fixed(pb::FixedPath { gateway, antenna_ids })) => {
            let gateway = if gateway.is_empty() { default_gateway.clone() } else { GatewayIdentity::Id(gateway) };
            Ok(DownlinkPath::Fixed { gateway, antenna_ids })
        }
        None => Err(Error::Decode("downlink path missing oneof".to_string())),
    }
}

pub fn downlink_request_from_pb(request: pb::DownlinkRequest, gateway: &GatewayIdentity) -> Result<DownlinkRequest, Error> {
    Ok(DownlinkRequest {
        class: class_from_pb(request.class)?,
        paths: request.paths.into_iter().map(|p| path_from_pb(p, gateway)).collect::<Result<_, _>>()?,
        raw_payload: request.raw_payload,
        priority: request.priority,
        rx1_delay_secs: request.rx1_delay_secs,
        rx1: request.rx1.map(rx_window_from_pb),
        rx2: request.rx2.map(rx_window_from_pb),
        absolute_time: request.absolute_time_unix_nanos.map(from_unix_nanos),
        frequency_plan_id: request.frequency_plan_id,
    })
}

pub fn downlink_request_to_pb(request: &DownlinkRequest) -> pb::DownlinkRequest {
    pb::DownlinkRequest {
        class: class_to_pb(request.class),
        paths: request.paths.iter().map(path_to_pb).collect(),
        raw_payload: request.raw_payload.clone(),
        priority: request.priority,
        rx1_delay_secs: request.rx1_delay_secs,
        rx1: request.rx1.map(rx_window_to_pb),
        rx2: request.rx2.map(rx_window_to_pb),
        absolute_time_unix_nanos: request.absolute_time.map(unix_nanos),
        frequency_plan_id: request.frequency_plan_id.clone(),
    }
}

pub fn scheduled_downlink_to_pb(scheduled: &ScheduledDownlink) -> pb::ScheduledDownlink {
    pb::ScheduledDownlink {
        raw_payload: scheduled.raw_payload.clone(),
        settings: Some(tx_settings_to_pb(&scheduled.settings)),
        tx_power_dbm: scheduled.tx_power_dbm,
        starts_at_unix_nanos: unix_nanos(scheduled.starts_at),
        ends_at_unix_nanos: unix_nanos(scheduled.ends_at),
    }
}

pub fn frequency_plan_to_pb(plan: &FrequencyPlan) -> pb::ConcentratorConfig {
    let channel_to_pb = |c: &gs_core::Channel| pb::Channel {
        frequency_hz: c.frequency_hz,
        min_data_rate: c.min_data_rate as u32,
        max_data_rate: c.max_data_rate as u32,
    };
    pb::ConcentratorConfig {
        frequency_plan_id: plan.id.clone(),
        uplink_channels: plan.uplink_channels.iter().map(channel_to_pb).collect(),
        downlink_channels: plan.downlink_channels.iter().map(channel_to_pb).collect(),
        rx2_default: Some(rx_window_to_pb(plan.rx2_default)),
        max_eirp_dbm: plan.max_eirp_dbm,
    }
}

pub fn stats_snapshot_to_pb(snapshot: &StatsSnapshot) -> pb::ConnectionStats {
    pb::ConnectionStats {
        uplinks_received: snapshot.uplinks_received,
        uplinks_forwarded: snapshot.uplinks_forwarded,
        downlinks_sent: snapshot.downlinks_sent,
        downlinks_succeeded: snapshot.downlinks_succeeded,
        downlinks_failed: snapshot.downlinks_failed,
        status_received: snapshot.status_received,
        last_round_trip_millis: snapshot.last_round_trip.map(|d| d.as_millis() as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gs_core::Modulation;
    use std::time::SystemTime;

    #[test]
    fn uplink_message_round_trips_through_pb() {
        let uplink = UplinkMessage {
            raw_payload: vec![1, 2, 3],
            settings: TxSettings {
                modulation: Modulation::Lora { spreading_factor: 7, bandwidth_hz: 125_000 },
                coding_rate: CodingRate::Cr4_5,
                frequency_hz: 868_100_000,
                gateway_timestamp_us: 42,
            },
            rx_metadata: vec![RxMetadata {
                antenna_index: 0,
                timestamp_us: 42,
                rssi: -80.0,
                channel_rssi: -80.0,
                snr: 8.0,
                fine_timestamp: None,
                location: None,
                uplink_token: vec![9, 9],
            }],
            received_at: SystemTime::now(),
        };
        let pb = uplink_message_to_pb(&uplink);
        let back = uplink_message_from_pb(pb).unwrap();
        assert_eq!(back.raw_payload, uplink.raw_payload);
        assert_eq!(back.settings.frequency_hz, uplink.settings.frequency_hz);
        assert_eq!(back.rx_metadata[0].uplink_token, vec![9, 9]);
    }

    #[test]
    fn tx_ack_round_trips_through_pb() {
        let ack = TxAck { token: vec![1], result: TxAckResult::Collision };
        let pb = tx_ack_to_pb(&ack);
        let back = tx_ack_from_pb(pb).unwrap();
        assert_eq!(back.result, TxAckResult::Collision);
    }
}
