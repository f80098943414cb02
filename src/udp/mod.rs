//! UDP frontend: Semtech GWMP v2 over a single shared socket, one
//! outbound-writer fiber per connected gateway. Structured the way
//! `Gateway::run` composes a `tokio::select!` around
//! `shutdown`/`udp_runtime.recv()`/a downlink channel, but the inbound half
//! is now one socket shared by every gateway (UDP has no per-peer socket),
//! and the outbound half is split out into its own per-gateway fiber: an
//! inbound reader, an outbound writer, and a liveness sweep per connection.

pub mod codec;

use crate::connection::Connection;
use crate::error::Result;
use crate::message::{
    GatewayIdentity, Location, RxMetadata, ScheduledDownlink, Status, StatusMetrics, TxAck, TxAckResult, TxSettings,
    UplinkMessage,
};
use crate::registry::GatewayRegistry;
use codec::{decode, encode_pull_ack, encode_pull_resp, encode_push_ack, MacAddress, TxPk, UplinkFrame};
use slog::{debug, info, o, warn, Logger};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct UdpFrontendConfig {
    pub listen: SocketAddr,
    pub frequency_plan_id: String,
    pub downlink_path_expires: Duration,
    pub connection_expires: Duration,
    pub addr_change_block: Duration,
}

struct PathEntry {
    addr: SocketAddr,
    last_seen: Instant,
    pending: Option<(SocketAddr, Instant)>,
}

pub struct UdpFrontend {
    socket: Arc<UdpSocket>,
    paths: RwLock<HashMap<MacAddress, PathEntry>>,
    registry: Arc<GatewayRegistry>,
    config: UdpFrontendConfig,
    logger: Logger,
}

const MAX_DATAGRAM: usize = 2048;

impl UdpFrontend {
    pub async fn bind(config: UdpFrontendConfig, registry: Arc<GatewayRegistry>, logger: Logger) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(config.listen).await?;
        let logger = logger.new(o!("module" => "udp", "listen" => config.listen.to_string()));
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            paths: RwLock::new(HashMap::new()),
            registry,
            config,
            logger,
        }))
    }

    pub async fn run(self: Arc<Self>, shutdown: triggered::Listener) -> Result<()> {
        info!(self.logger, "starting");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut expiry_check = tokio::time::interval(self.config.connection_expires / 4);
        loop {
            tokio::select! {
                _ = shutdown.clone() => {
                    info!(self.logger, "shutting down");
                    return Ok(());
                }
                _ = expiry_check.tick() => self.sweep_expired().await,
                received = self.socket.recv_from(&mut buf) => {
                    let (n, addr) = received?;
                    self.handle_datagram(&buf[..n], addr).await;
                }
            }
        }
    }

    async fn handle_datagram(self: &Arc<Self>, buf: &[u8], addr: SocketAddr) {
        match decode(buf) {
            Ok(UplinkFrame::PushData { token, gateway_mac, rxpk, stat }) => {
                self.remember_path(gateway_mac, addr).await;
                let _ = self.socket.send_to(&encode_push_ack(token), addr).await;
                self.handle_push_data(gateway_mac, rxpk, stat).await;
            }
            Ok(UplinkFrame::PullData { token, gateway_mac }) => {
                self.remember_path(gateway_mac, addr).await;
                let _ = self.socket.send_to(&encode_pull_ack(token), addr).await;
                self.ensure_connected(gateway_mac).await;
            }
            Ok(UplinkFrame::TxAck { gateway_mac, error, .. }) => {
                self.handle_tx_ack(gateway_mac, error).await;
            }
            Err(err) => {
                warn!(self.logger, "ignoring unparseable datagram from {addr}: {err}");
            }
        }
    }

    /// Anti-hijack address tracking: a new source address for a known EUI
    /// is only promoted to current after it has been observed consistently
    /// for `addr_change_block`.
    async fn remember_path(&self, mac: MacAddress, addr: SocketAddr) {
        let now = Instant::now();
        let mut paths = self.paths.write().await;
        match paths.get_mut(&mac) {
            None => {
                paths.insert(mac, PathEntry { addr, last_seen: now, pending: None });
            }
            Some(entry) if entry.addr == addr => {
                entry.last_seen = now;
                entry.pending = None;
            }
            Some(entry) => match entry.pending {
                Some((pending_addr, first_seen)) if pending_addr == addr => {
                    if now.duration_since(first_seen) >= self.config.addr_change_block {
                        entry.addr = addr;
                        entry.last_seen = now;
                        entry.pending = None;
                    }
                }
                _ => entry.pending = Some((addr, now)),
            },
        }
    }

    async fn current_path(&self, mac: MacAddress) -> Option<SocketAddr> {
        let paths = self.paths.read().await;
        let entry = paths.get(&mac)?;
        if entry.last_seen.elapsed() > self.config.downlink_path_expires {
            return None;
        }
        Some(entry.addr)
    }

    async fn sweep_expired(&self) {
        let expired: Vec<MacAddress> = {
            let paths = self.paths.read().await;
            paths
                .iter()
                .filter(|(_, e)| e.last_seen.elapsed() > self.config.connection_expires)
                .map(|(mac, _)| *mac)
                .collect()
        };
        for mac in expired {
            self.paths.write().await.remove(&mac);
            self.registry.disconnect(&GatewayIdentity::Eui(mac)).await;
            debug!(self.logger, "connection expired"; "eui" => hex(&mac));
        }
    }

    async fn ensure_connected(self: &Arc<Self>, mac: MacAddress) -> Arc<Connection> {
        let identity = GatewayIdentity::Eui(mac);
        if let Ok(connection) = self.registry.get_connection(&identity).await {
            return connection;
        }
        let (connection, downlink_rx) = self
            .registry
            .connect(&identity, "", Some(self.config.frequency_plan_id.as_str()))
            .await
            .expect("EUI-only UDP gateways authenticate without a credential");
        let frontend = self.clone();
        tokio::spawn(async move { frontend.drain_downlinks(mac, downlink_rx).await });
        connection
    }

    async fn handle_push_data(self: &Arc<Self>, mac: MacAddress, rxpk: Vec<codec::RxPk>, stat: Option<codec::Stat>) {
        let connection = self.ensure_connected(mac).await;
        for pk in rxpk {
            match to_uplink_message(&pk) {
                Ok(uplink) => {
                    if let Err(err) = connection.handle_up(uplink).await {
                        warn!(self.logger, "handle_up failed: {err}");
                    }
                }
                Err(err) => warn!(self.logger, "ignoring rxpk with unparseable rate: {err}"),
            }
        }
        if let Some(stat) = stat {
            let status = to_status(stat);
            if let Err(err) = connection.handle_status(status).await {
                warn!(self.logger, "handle_status failed: {err}");
            }
        }
    }

    async fn handle_tx_ack(&self, mac: MacAddress, error: Option<String>) {
        let identity = GatewayIdentity::Eui(mac);
        if let Ok(connection) = self.registry.get_connection(&identity).await {
            let result = match error.as_deref() {
                None => TxAckResult::Success,
                Some("TOO_LATE") => TxAckResult::TooLate,
                Some("TOO_EARLY") => TxAckResult::TooEarly,
                Some("COLLISION_PACKET") | Some("COLLISION_BEACON") => TxAckResult::Collision,
                Some("TX_FREQ") => TxAckResult::TxFreqMismatch,
                Some("TX_POWER") => TxAckResult::TxPowerAdjusted,
                Some(_) => TxAckResult::TxScheduleConflict,
            };
            connection.handle_tx_ack(TxAck { token: Vec::new(), result });
        }
    }

    /// Per-gateway outbound-writer fiber: drains the Connection's scheduled
    /// downlinks and emits them as PULL_RESP on the gateway's last-known
    /// path. Exits (and is not respawned) once the channel closes, which
    /// happens when the Connection is closed/displaced.
    async fn drain_downlinks(self: Arc<Self>, mac: MacAddress, mut downlink_rx: mpsc::Receiver<ScheduledDownlink>) {
        while let Some(downlink) = downlink_rx.recv().await {
            let Some(addr) = self.current_path(mac).await else {
                warn!(self.logger, "dropping downlink: no live path for gateway"; "eui" => hex(&mac));
                continue;
            };
            let txpk = to_txpk(&downlink);
            match encode_pull_resp(rand::random(), &txpk) {
                Ok(datagram) => {
                    let _ = self.socket.send_to(&datagram, addr).await;
                }
                Err(err) => warn!(self.logger, "failed to encode PULL_RESP: {err}"),
            }
        }
    }
}

fn hex(mac: &MacAddress) -> String {
    mac.iter().map(|b| format!("{b:02x}")).collect()
}

fn to_uplink_message(pk: &codec::RxPk) -> std::result::Result<UplinkMessage, codec::RateParseError> {
    let modulation = codec::parse_modulation(&pk.modu, &pk.datr)?;
    let coding_rate = codec::parse_coding_rate(&pk.codr)?;
    Ok(UplinkMessage {
        raw_payload: pk.data.clone(),
        settings: TxSettings {
            modulation,
            coding_rate,
            frequency_hz: (pk.freq * 1_000_000.0).round() as u32,
            gateway_timestamp_us: pk.tmst,
        },
        rx_metadata: vec![RxMetadata {
            antenna_index: pk.rfch,
            timestamp_us: pk.tmst,
            rssi: pk.rssi as f32,
            channel_rssi: pk.rssi as f32,
            snr: pk.lsnr,
            fine_timestamp: None,
            location: None,
            uplink_token: Vec::new(),
        }],
        received_at: SystemTime::now(),
    })
}

fn to_status(stat: codec::Stat) -> Status {
    let antenna_locations = match (stat.lati, stat.long) {
        (Some(latitude), Some(longitude)) => {
            vec![Location { latitude, longitude, altitude_m: stat.alti.unwrap_or_default() as f32 }]
        }
        _ => Vec::new(),
    };
    Status { time: SystemTime::now(), antenna_locations, metrics: StatusMetrics::default() }
}

fn to_txpk(downlink: &ScheduledDownlink) -> TxPk {
    TxPk {
        imme: false,
        tmst: Some(downlink.settings.gateway_timestamp_us),
        freq: f64::from(downlink.settings.frequency_hz) / 1_000_000.0,
        rfch: 0,
        powe: downlink.tx_power_dbm.round() as i32,
        modu: match downlink.settings.modulation {
            gs_core::Modulation::Lora { .. } => "LORA",
            gs_core::Modulation::Fsk { .. } => "FSK",
        },
        datr: codec::format_datr(downlink.settings.modulation),
        codr: codec::format_coding_rate(downlink.settings.coding_rate),
        ipol: true,
        size: downlink.raw_payload.len(),
        data: downlink.raw_payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rxpk_converts_to_uplink_message() {
        let pk = codec::RxPk {
            tmst: 42,
            freq: 868.1,
            rfch: 0,
            modu: "LORA".to_string(),
            datr: "SF7BW125".to_string(),
            codr: "4/5".to_string(),
            rssi: -80,
            lsnr: 8.0,
            data: vec![1, 2, 3],
        };
        let uplink = to_uplink_message(&pk).unwrap();
        assert_eq!(uplink.settings.frequency_hz, 868_100_000);
        assert_eq!(uplink.raw_payload, vec![1, 2, 3]);
    }

    #[test]
    fn stat_without_coordinates_yields_no_antenna_locations() {
        let stat = codec::Stat { lati: None, long: None, alti: None, time: None };
        let status = to_status(stat);
        assert!(status.antenna_locations.is_empty());
    }
}
