//! Per-gateway connection state machine. One instance per live protocol
//! session, regardless of which frontend created it — the frontend only
//! ever calls `handle_up`/`handle_status`/`handle_tx_ack`/`send_down` and
//! reads `ScheduledDownlink`s off the channel returned by `Connection::new`,
//! the way a `Gateway` owns a
//! `Sender<LinkPacket>`/`Receiver<LinkPacket>` pair around a `UdpRuntime`.

use crate::error::Result;
use crate::events::{Event, EventKind, EventPublisher};
use crate::identity::{GatewayRecord, IdentityClient};
use crate::message::{DownlinkRequest, GatewayIdentity, ScheduledDownlink, Status, TxAck, TxAckResult, UplinkMessage};
use crate::network_server::NetworkServerClient;
use crate::scheduler::{GatewayScheduler, SchedulerConfig};
use crate::stats::{ConnectionStats, Debounce, StatsSnapshot, StatsStore};
use crate::token::TokenMinter;
use gs_core::FrequencyPlan;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Draining,
    Closed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// Immutable-for-the-lifetime-of-the-connection facts a frontend needs
/// without taking any lock.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub identity: GatewayIdentity,
    pub frequency_plan_id: String,
    pub location_public: bool,
}

pub struct Connection {
    identity: GatewayIdentity,
    record: RwLock<GatewayRecord>,
    frequency_plan: Arc<FrequencyPlan>,
    scheduler: GatewayScheduler,
    token_minter: Arc<TokenMinter>,
    identity_client: Arc<dyn IdentityClient>,
    network_server: Arc<dyn NetworkServerClient>,
    events: EventPublisher,
    stats: ConnectionStats,
    stats_store: Arc<dyn StatsStore>,
    state: AtomicU8,
    downlink_tx: mpsc::Sender<ScheduledDownlink>,
    status: watch::Sender<Option<Status>>,
    location_debounce: Debounce,
    shutdown_trigger: triggered::Trigger,
    shutdown_listener: triggered::Listener,
}

/// Channel buffer for scheduled downlinks waiting to be picked up by the
/// owning frontend's writer fiber.
const DOWNLINK_CHANNEL_CAPACITY: usize = 16;

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: GatewayIdentity,
        record: GatewayRecord,
        frequency_plan: Arc<FrequencyPlan>,
        scheduler_config: SchedulerConfig,
        token_minter: Arc<TokenMinter>,
        identity_client: Arc<dyn IdentityClient>,
        network_server: Arc<dyn NetworkServerClient>,
        events: EventPublisher,
        stats_store: Arc<dyn StatsStore>,
        location_update_debounce: std::time::Duration,
    ) -> (Arc<Self>, mpsc::Receiver<ScheduledDownlink>) {
        let (downlink_tx, downlink_rx) = mpsc::channel(DOWNLINK_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(None);
        let (shutdown_trigger, shutdown_listener) = triggered::trigger();
        let scheduler = GatewayScheduler::new(frequency_plan.clone(), scheduler_config);
        let connection = Arc::new(Self {
            identity: identity.clone(),
            record: RwLock::new(record),
            frequency_plan,
            scheduler,
            token_minter,
            identity_client,
            network_server,
            events: events.clone(),
            stats: ConnectionStats::default(),
            stats_store,
            state: AtomicU8::new(0),
            downlink_tx,
            status,
            location_debounce: Debounce::new(location_update_debounce),
            shutdown_trigger,
            shutdown_listener,
        });
        events.publish(EventKind::GatewayConnect, identity);
        (connection, downlink_rx)
    }

    pub fn context(&self) -> ConnectionContext {
        let record = self.record.read().unwrap();
        ConnectionContext {
            identity: self.identity.clone(),
            frequency_plan_id: record.frequency_plan_id.clone(),
            location_public: record.location_public,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn shutdown_listener(&self) -> triggered::Listener {
        self.shutdown_listener.clone()
    }

    pub fn status(&self) -> watch::Receiver<Option<Status>> {
        self.status.subscribe()
    }

    /// Enriches, accounts for, and forwards one uplink. Location is
    /// attached here and only here: a frontend never sets
    /// `RxMetadata::location` itself.
    pub async fn handle_up(&self, mut uplink: UplinkMessage) -> Result<()> {
        let (location_public, antenna_location) = {
            let record = self.record.read().unwrap();
            (record.location_public, record.antenna_location)
        };
        let antenna_ids: Vec<u32> = uplink.rx_metadata.iter().map(|m| m.antenna_index).collect();
        let token = self
            .token_minter
            .mint(&antenna_ids, uplink.settings.gateway_timestamp_us, uplink.received_at);
        for rx in &mut uplink.rx_metadata {
            rx.uplink_token = token.clone();
            if location_public {
                rx.location = antenna_location;
            } else {
                rx.location = None;
            }
        }

        self.stats.record_uplink_received();
        self.events.publish(EventKind::UpReceive, self.identity.clone());

        self.network_server.forward_uplink(self.identity.clone(), uplink).await;
        self.stats.record_uplink_forwarded();
        self.events.publish(EventKind::UpForward, self.identity.clone());
        Ok(())
    }

    /// Forwards a status report, optionally pushing a debounced antenna
    /// location update back to the identity provider.
    pub async fn handle_status(&self, status: Status) -> Result<()> {
        self.stats.record_status_received();
        self.events.publish(EventKind::StatusReceive, self.identity.clone());

        let update_location_from_status = self.record.read().unwrap().update_location_from_status;
        if update_location_from_status && self.location_debounce.check(Instant::now()) {
            if let Some(location) = status.antenna_locations.first().copied() {
                if self.identity_client.update_location(&self.identity, location).await.is_ok() {
                    self.record.write().unwrap().antenna_location = Some(location);
                }
            }
        }

        let _ = self.status.send(Some(status.clone()));
        self.network_server.forward_status(self.identity.clone(), status).await;
        self.events.publish(EventKind::StatusForward, self.identity.clone());
        Ok(())
    }

    pub fn handle_tx_ack(&self, ack: TxAck) {
        let success = matches!(ack.result, TxAckResult::Success);
        self.stats.record_downlink_result(success);
        let kind = if success { EventKind::DownTxSuccess } else { EventKind::DownTxFail };
        self.events.publish(kind, self.identity.clone());
    }

    /// Runs the request through the scheduler and, on success, hands the
    /// admitted emission to the frontend's writer fiber over `downlink_tx`.
    pub async fn send_down(&self, request: DownlinkRequest) -> Result<ScheduledDownlink> {
        self.events.publish(EventKind::DownSend, self.identity.clone());
        let scheduled = self.scheduler.schedule(&request, &self.token_minter).await?;
        self.stats.record_downlink_sent();
        let _ = self.downlink_tx.send(scheduled.clone()).await;
        Ok(scheduled)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn mirror_stats(&self) {
        self.stats_store.store(&self.identity, self.stats.snapshot()).await;
    }

    pub fn frequency_plan(&self) -> &Arc<FrequencyPlan> {
        &self.frequency_plan
    }

    /// Begins the Draining phase; the owning frontend is expected to stop
    /// accepting new work and let in-flight downlinks complete.
    pub fn begin_drain(&self) {
        self.state.store(1, Ordering::Release);
    }

    /// Releases scheduler state, fires the shutdown trigger so any fiber
    /// holding a clone of the listener unwinds, and emits `disconnect`.
    pub fn close(&self) {
        self.state.store(2, Ordering::Release);
        self.shutdown_trigger.trigger();
        self.events.publish(EventKind::GatewayDisconnect, self.identity.clone());
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InMemoryIdentityClient;
    use crate::message::{Class, DownlinkPath, Location, RxMetadata, StatusMetrics, TxSettings};
    use crate::network_server::ChannelNetworkServerClient;
    use crate::stats::NoopStatsStore;
    use gs_core::frequency_plan::eu_863_870;
    use gs_core::{CodingRate, Modulation};
    use std::time::{Duration, SystemTime};

    fn record(location_public: bool) -> GatewayRecord {
        GatewayRecord {
            identity: GatewayIdentity::Id("gw-1".into()),
            api_key: "key".into(),
            location_public,
            update_location_from_status: true,
            frequency_plan_id: gs_core::frequency_plan::EU_863_870.to_string(),
            antenna_location: Some(Location { latitude: 1.0, longitude: 2.0, altitude_m: 3.0 }),
        }
    }

    fn uplink() -> UplinkMessage {
        UplinkMessage {
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
                uplink_token: Vec::new(),
            }],
            received_at: SystemTime::now(),
        }
    }

    fn new_connection(location_public: bool) -> (Arc<Connection>, mpsc::Receiver<ScheduledDownlink>, mpsc::Receiver<(GatewayIdentity, UplinkMessage)>) {
        let (uplinks_tx, uplinks_rx) = mpsc::channel(8);
        let (statuses_tx, _statuses_rx) = mpsc::channel(8);
        let ns = Arc::new(ChannelNetworkServerClient::new(uplinks_tx, statuses_tx));
        let identity_client = Arc::new(InMemoryIdentityClient::new(false));
        let (connection, downlink_rx) = Connection::new(
            GatewayIdentity::Id("gw-1".into()),
            record(location_public),
            Arc::new(eu_863_870()),
            SchedulerConfig::default(),
            Arc::new(TokenMinter::new()),
            identity_client,
            ns,
            EventPublisher::new(16),
            Arc::new(NoopStatsStore),
            Duration::from_secs(60),
        );
        (connection, downlink_rx, uplinks_rx)
    }

    #[tokio::test]
    async fn handle_up_attaches_location_only_when_public() {
        let (connection, _downlink_rx, mut uplinks_rx) = new_connection(true);
        connection.handle_up(uplink()).await.unwrap();
        let (_, forwarded) = uplinks_rx.recv().await.unwrap();
        assert!(forwarded.rx_metadata[0].location.is_some());
        assert!(!forwarded.rx_metadata[0].uplink_token.is_empty());
        assert_eq!(connection.stats().uplinks_forwarded, 1);
    }

    #[tokio::test]
    async fn handle_up_omits_location_when_not_public() {
        let (connection, _downlink_rx, mut uplinks_rx) = new_connection(false);
        connection.handle_up(uplink()).await.unwrap();
        let (_, forwarded) = uplinks_rx.recv().await.unwrap();
        assert!(forwarded.rx_metadata[0].location.is_none());
    }

    #[tokio::test]
    async fn send_down_pushes_to_downlink_channel() {
        let (connection, mut downlink_rx, mut uplinks_rx) = new_connection(false);
        connection.handle_up(uplink()).await.unwrap();
        let (_, forwarded) = uplinks_rx.recv().await.unwrap();
        let token = forwarded.rx_metadata[0].uplink_token.clone();

        let request = DownlinkRequest {
            class: Class::A,
            paths: vec![DownlinkPath::Uplink { gateway: GatewayIdentity::Id("gw-1".into()), token }],
            raw_payload: vec![9, 9],
            priority: 0,
            rx1_delay_secs: 1,
            rx1: Some(gs_core::RxWindowParams { data_rate: 5, frequency_hz: 868_100_000 }),
            rx2: None,
            absolute_time: None,
            frequency_plan_id: None,
        };
        let scheduled = connection.send_down(request).await.unwrap();
        let received = downlink_rx.recv().await.unwrap();
        assert_eq!(received.starts_at, scheduled.starts_at);
        assert_eq!(connection.stats().downlinks_sent, 1);
    }

    #[tokio::test]
    async fn close_transitions_state_and_fires_listener() {
        let (connection, _downlink_rx, _uplinks_rx) = new_connection(false);
        let listener = connection.shutdown_listener();
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed);
        listener.await;
    }
}
