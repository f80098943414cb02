//! Gateway Server registry: the identity→Connection map every frontend
//! shares, plus the operations that don't belong to any one Connection
//! (`Connect`, `GetConnection`, `ScheduleDownlink`, `Stats`). Held behind
//! `tokio::sync::RwLock` — reads (the common case, one per inbound frame)
//! don't block each other.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::identity::IdentityClient;
use crate::events::EventPublisher;
use crate::message::{DownlinkRequest, GatewayIdentity, ScheduledDownlink};
use crate::network_server::NetworkServerClient;
use crate::scheduler::SchedulerConfig;
use crate::stats::{StatsSnapshot, StatsStore};
use crate::token::TokenMinter;
use gs_core::FrequencyPlanStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

pub struct RegistryConfig {
    pub scheduler: SchedulerConfig,
    pub location_update_debounce: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { scheduler: SchedulerConfig::default(), location_update_debounce: Duration::from_secs(60) }
    }
}

pub struct GatewayRegistry {
    connections: RwLock<HashMap<GatewayIdentity, Arc<Connection>>>,
    frequency_plans: Arc<FrequencyPlanStore>,
    identity_client: Arc<dyn IdentityClient>,
    network_server: Arc<dyn NetworkServerClient>,
    events: EventPublisher,
    stats_store: Arc<dyn StatsStore>,
    token_minter: Arc<TokenMinter>,
    config: RegistryConfig,
}

impl GatewayRegistry {
    pub fn new(
        frequency_plans: Arc<FrequencyPlanStore>,
        identity_client: Arc<dyn IdentityClient>,
        network_server: Arc<dyn NetworkServerClient>,
        events: EventPublisher,
        stats_store: Arc<dyn StatsStore>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            frequency_plans,
            identity_client,
            network_server,
            events,
            stats_store,
            token_minter: Arc::new(TokenMinter::new()),
            config,
        }
    }

    /// Authenticates the gateway, displaces any existing connection for the
    /// same identity (a later connect for the same identity always wins),
    /// and installs the new one.
    ///
    /// `frequency_plan_hint` lets a frontend that already knows which plan
    /// a listener serves (UDP's per-listener `listeners` map) take priority
    /// over whatever plan the identity record carries, since the listener's
    /// RF plan is a physical fact the operator configured.
    pub async fn connect(
        &self,
        identity: &GatewayIdentity,
        credential: &str,
        frequency_plan_hint: Option<&str>,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<ScheduledDownlink>)> {
        let mut record = self.identity_client.authenticate(identity, credential).await?;
        if let Some(hint) = frequency_plan_hint {
            if self.frequency_plans.contains(hint) {
                record.frequency_plan_id = hint.to_string();
            }
        }
        let frequency_plan = self.frequency_plans.get(&record.frequency_plan_id)?.clone();

        let (connection, downlink_rx) = Connection::new(
            identity.clone(),
            record,
            Arc::new(frequency_plan),
            self.config.scheduler,
            self.token_minter.clone(),
            self.identity_client.clone(),
            self.network_server.clone(),
            self.events.clone(),
            self.stats_store.clone(),
            self.config.location_update_debounce,
        );

        let previous = self.connections.write().await.insert(identity.clone(), connection.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        Ok((connection, downlink_rx))
    }

    pub async fn get_connection(&self, identity: &GatewayIdentity) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| Error::NotFound(identity.to_string()))
    }

    /// `ScheduleDownlink` always targets an already-resolved identity (the
    /// caller names the gateway directly, unlike an uplink-token path), so a
    /// missing live Connection here means "not connected", which is
    /// `Aborted` rather than `NotFound` — `NotFound` is reserved for an
    /// identity that was never known to the registry at all, or a `Stats`
    /// lookup while disconnected.
    pub async fn schedule_downlink(&self, identity: &GatewayIdentity, request: DownlinkRequest) -> Result<ScheduledDownlink> {
        let connection = match self.get_connection(identity).await {
            Ok(connection) => connection,
            Err(Error::NotFound(_)) => {
                return Err(Error::Aborted(crate::error::ScheduleError {
                    path_errors: vec![crate::error::PathError {
                        gateway: identity.clone(),
                        windows: vec![("connection", crate::scheduler::WindowError::FailedPrecondition("gateway not connected"))],
                    }],
                }));
            }
            Err(other) => return Err(other),
        };
        connection.send_down(request).await
    }

    pub async fn stats(&self, identity: &GatewayIdentity) -> Result<StatsSnapshot> {
        let connection = self.get_connection(identity).await?;
        Ok(connection.stats())
    }

    pub async fn disconnect(&self, identity: &GatewayIdentity) {
        if let Some(connection) = self.connections.write().await.remove(identity) {
            connection.close();
        }
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<crate::events::Event> {
        self.events.subscribe()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Mirrors every live connection's stats to the external store. Intended
    /// to be driven by a periodic task in `main.rs` at
    /// `update_connection_stats_debounce_time` cadence.
    pub async fn mirror_all_stats(&self) {
        let connections: Vec<Arc<Connection>> = self.connections.read().await.values().cloned().collect();
        for connection in connections {
            connection.mirror_stats().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::identity::{GatewayRecord, InMemoryIdentityClient};
    use crate::message::Location;
    use crate::network_server::ChannelNetworkServerClient;
    use crate::stats::NoopStatsStore;
    use gs_core::frequency_plan::EU_863_870;

    fn registry() -> (GatewayRegistry, mpsc::Receiver<(GatewayIdentity, crate::message::UplinkMessage)>) {
        let identity_client = Arc::new(InMemoryIdentityClient::new(true));
        identity_client.register(GatewayRecord {
            identity: GatewayIdentity::Id("gw-1".into()),
            api_key: "secret".into(),
            location_public: true,
            update_location_from_status: true,
            frequency_plan_id: EU_863_870.to_string(),
            antenna_location: Some(Location { latitude: 0.0, longitude: 0.0, altitude_m: 0.0 }),
        });
        let (uplinks_tx, uplinks_rx) = mpsc::channel(8);
        let (statuses_tx, _statuses_rx) = mpsc::channel(8);
        let ns = Arc::new(ChannelNetworkServerClient::new(uplinks_tx, statuses_tx));
        let registry = GatewayRegistry::new(
            Arc::new(FrequencyPlanStore::with_defaults()),
            identity_client,
            ns,
            EventPublisher::new(16),
            Arc::new(NoopStatsStore),
            RegistryConfig::default(),
        );
        (registry, uplinks_rx)
    }

    #[tokio::test]
    async fn connect_with_bad_credential_is_unauthenticated() {
        let (registry, _rx) = registry();
        let identity = GatewayIdentity::Id("gw-1".into());
        let err = registry.connect(&identity, "wrong", None).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated));
    }

    #[tokio::test]
    async fn connect_then_get_connection_round_trips() {
        let (registry, _rx) = registry();
        let identity = GatewayIdentity::Id("gw-1".into());
        let (connection, _downlink_rx) = registry.connect(&identity, "secret", None).await.unwrap();
        let fetched = registry.get_connection(&identity).await.unwrap();
        assert!(Arc::ptr_eq(&connection, &fetched));
    }

    #[tokio::test]
    async fn reconnect_displaces_and_closes_the_previous_connection() {
        let (registry, _rx) = registry();
        let identity = GatewayIdentity::Id("gw-1".into());
        let (first, _first_rx) = registry.connect(&identity, "secret", None).await.unwrap();
        let (second, _second_rx) = registry.connect(&identity, "secret", None).await.unwrap();
        assert_eq!(first.state(), ConnectionState::Closed);
        assert_eq!(second.state(), ConnectionState::Connected);
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_gateway_lookup_is_not_found() {
        let (registry, _rx) = registry();
        let err = registry.get_connection(&GatewayIdentity::Id("ghost".into())).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn fixed_path_downlink_to_disconnected_gateway_is_aborted() {
        use crate::message::{Class, DownlinkPath, DownlinkRequest};

        let (registry, _rx) = registry();
        let identity = GatewayIdentity::Id("not-connected".into());
        let request = DownlinkRequest {
            class: Class::C,
            paths: vec![DownlinkPath::Fixed { gateway: identity.clone(), antenna_ids: vec![0] }],
            raw_payload: vec![0u8; 10],
            priority: 0,
            rx1_delay_secs: 1,
            rx1: None,
            rx2: None,
            absolute_time: None,
            frequency_plan_id: None,
        };
        let err = registry.schedule_downlink(&identity, request).await.unwrap_err();
        assert!(matches!(err, Error::Aborted(_)));
    }
}
