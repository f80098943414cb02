//! Process-wide lifecycle event bus: the only state shared across every
//! gateway connection besides the frequency-plan store. A thin wrapper over
//! `tokio::sync::broadcast` giving callers a publish/subscribe stream of
//! connect/disconnect/status/uplink/downlink events.

use crate::message::GatewayIdentity;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum EventKind {
    GatewayConnect,
    GatewayDisconnect,
    UpReceive,
    UpForward,
    DownSend,
    DownTxSuccess,
    DownTxFail,
    StatusReceive,
    StatusForward,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::GatewayConnect => "gs.gateway.connect",
            EventKind::GatewayDisconnect => "gs.gateway.disconnect",
            EventKind::UpReceive => "gs.up.receive",
            EventKind::UpForward => "gs.up.forward",
            EventKind::DownSend => "gs.down.send",
            EventKind::DownTxSuccess => "gs.down.tx.success",
            EventKind::DownTxFail => "gs.down.tx.fail",
            EventKind::StatusReceive => "gs.status.receive",
            EventKind::StatusForward => "gs.status.forward",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub gateway: GatewayIdentity,
}

#[derive(Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<Event>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, kind: EventKind, gateway: GatewayIdentity) {
        // No subscribers is a normal, frequent state; the send error is not
        // actionable here.
        let _ = self.sender.send(Event { kind, gateway });
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = EventPublisher::new(16);
        let mut rx = publisher.subscribe();
        publisher.publish(EventKind::GatewayConnect, GatewayIdentity::Id("gw-1".into()));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind.name(), "gs.gateway.connect");
    }
}
