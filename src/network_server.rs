//! Client boundary to the Network Server (consumes normalized uplinks,
//! issues downlink requests), which lives outside this crate. The registry
//! forwards every normalized uplink and status report through
//! this trait; the Network Server, in turn, calls back into the registry's
//! `ScheduleDownlink` (modeled here as a direct call rather than a second
//! trait, since that direction is already the registry's own public API).

use crate::message::{Status, UplinkMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait NetworkServerClient: Send + Sync {
    async fn forward_uplink(&self, gateway: crate::message::GatewayIdentity, uplink: UplinkMessage);
    async fn forward_status(&self, gateway: crate::message::GatewayIdentity, status: Status);
}

/// Channel-backed stand-in used by `main.rs` and by tests: forwarded
/// messages land on an `mpsc` channel the caller can drain, rather than
/// going out over a real RPC transport.
pub struct ChannelNetworkServerClient {
    uplinks: mpsc::Sender<(crate::message::GatewayIdentity, UplinkMessage)>,
    statuses: mpsc::Sender<(crate::message::GatewayIdentity, Status)>,
}

impl ChannelNetworkServerClient {
    pub fn new(
        uplinks: mpsc::Sender<(crate::message::GatewayIdentity, UplinkMessage)>,
        statuses: mpsc::Sender<(crate::message::GatewayIdentity, Status)>,
    ) -> Self {
        Self { uplinks, statuses }
    }
}

#[async_trait]
impl NetworkServerClient for ChannelNetworkServerClient {
    async fn forward_uplink(&self, gateway: crate::message::GatewayIdentity, uplink: UplinkMessage) {
        let _ = self.uplinks.send((gateway, uplink)).await;
    }

    async fn forward_status(&self, gateway: crate::message::GatewayIdentity, status: Status) {
        let _ = self.statuses.send((gateway, status)).await;
    }
}
