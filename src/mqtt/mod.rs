//! MQTT frontend: one TCP listener, one `Connection` per
//! accepted socket. Structured the way `UdpFrontend` splits inbound/outbound,
//! but here each session owns a private socket so the split is a natural
//! `tokio::select!` between codec reads and the `Connection`'s downlink
//! channel rather than a separately spawned writer fiber.

pub mod codec;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::grpc::convert::{self, pb};
use crate::message::{GatewayIdentity, ScheduledDownlink};
use crate::registry::GatewayRegistry;
use codec::{Connect, ConnectReturnCode, MqttCodec, Packet, Publish, ServerPacket, Subscribe};
use futures::{SinkExt, StreamExt};
use prost::Message;
use slog::{debug, info, o, warn, Logger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

#[derive(Debug, Clone)]
pub struct MqttFrontendConfig {
    pub listen: SocketAddr,
    pub keep_alive_grace: Duration,
}

impl Default for MqttFrontendConfig {
    fn default() -> Self {
        Self { listen: "0.0.0.0:1882".parse().unwrap(), keep_alive_grace: Duration::from_secs(10) }
    }
}

pub struct MqttFrontend {
    listener: TcpListener,
    registry: Arc<GatewayRegistry>,
    config: MqttFrontendConfig,
    logger: Logger,
}

impl MqttFrontend {
    pub async fn bind(config: MqttFrontendConfig, registry: Arc<GatewayRegistry>, logger: Logger) -> Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let logger = logger.new(o!("module" => "mqtt", "listen" => config.listen.to_string()));
        Ok(Self { listener, registry, config, logger })
    }

    pub async fn run(self, shutdown: triggered::Listener) -> Result<()> {
        info!(self.logger, "starting");
        loop {
            tokio::select! {
                _ = shutdown.clone() => {
                    info!(self.logger, "shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (socket, addr) = accepted?;
                    let registry = self.registry.clone();
                    let config = self.config.clone();
                    let logger = self.logger.new(o!("peer" => addr.to_string()));
                    let session_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_session(socket, registry, config, logger.clone(), session_shutdown).await {
                            warn!(logger, "session ended with error: {err}");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_session(
    socket: TcpStream,
    registry: Arc<GatewayRegistry>,
    config: MqttFrontendConfig,
    logger: Logger,
    shutdown: triggered::Listener,
) -> Result<()> {
    let mut framed = Framed::new(socket, MqttCodec);

    let connect = match tokio::time::timeout(config.keep_alive_grace, framed.next()).await {
        Ok(Some(Ok(Packet::Connect(connect)))) => connect,
        _ => return Err(Error::InvalidArgument("expected CONNECT as first packet".to_string())),
    };

    let Some(canonical_id) = connect.username.clone() else {
        framed.send(ServerPacket::ConnAck(ConnectReturnCode::BadUserNameOrPassword)).await?;
        return Ok(());
    };

    let (connection, mut downlink_rx) = match authenticate(&registry, &connect).await {
        Ok(pair) => pair,
        Err(_) => {
            framed.send(ServerPacket::ConnAck(ConnectReturnCode::BadUserNameOrPassword)).await?;
            return Ok(());
        }
    };
    framed.send(ServerPacket::ConnAck(ConnectReturnCode::Accepted)).await?;
    info!(logger, "gateway connected"; "id" => canonical_id.clone());

    let identity = GatewayIdentity::Id(canonical_id.clone());
    let up_topic = format!("v3/{canonical_id}/up");
    let status_topic = format!("v3/{canonical_id}/status");
    let ack_topic = format!("v3/{canonical_id}/down/ack");
    let down_topic = format!("v3/{canonical_id}/down");

    let keep_alive = Duration::from_secs(connect.keep_alive_secs.max(1) as u64) + config.keep_alive_grace;
    let session_shutdown = connection.shutdown_listener();

    loop {
        tokio::select! {
            _ = shutdown.clone() => break,
            _ = session_shutdown.clone() => break,
            downlink = downlink_rx.recv() => {
                match downlink {
                    Some(scheduled) => {
                        if let Err(err) = publish_downlink(&mut framed, &down_topic, &scheduled).await {
                            warn!(logger, "failed to publish downlink: {err}");
                            break;
                        }
                    }
                    None => break,
                }
            }
            received = tokio::time::timeout(keep_alive, framed.next()) => {
                match received {
                    Err(_elapsed) => {
                        debug!(logger, "keep-alive timeout"; "id" => canonical_id.clone());
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(err))) => {
                        warn!(logger, "codec error: {err}");
                        break;
                    }
                    Ok(Some(Ok(packet))) => {
                        if !handle_packet(
                            packet,
                            &mut framed,
                            &connection,
                            &identity,
                            &up_topic,
                            &status_topic,
                            &ack_topic,
                            &logger,
                        ).await? {
                            break;
                        }
                    }
                }
            }
        }
    }

    registry.disconnect(&identity).await;
    info!(logger, "gateway disconnected"; "id" => canonical_id);
    Ok(())
}

/// Authenticates against the identity provider using the CONNECT packet's
/// username as the canonical gateway identifier and its password as the API
/// key. The MQTT `client_id` carries no identity meaning here and is never
/// used for authentication or topic derivation.
async fn authenticate(
    registry: &GatewayRegistry,
    connect: &Connect,
) -> Result<(Arc<Connection>, tokio::sync::mpsc::Receiver<ScheduledDownlink>)> {
    let username = connect.username.as_deref().ok_or(Error::Unauthenticated)?;
    let identity = GatewayIdentity::Id(username.to_string());
    let credential = connect
        .password
        .as_ref()
        .map(|pw| String::from_utf8_lossy(pw).into_owned())
        .unwrap_or_default();
    registry.connect(&identity, &credential, None).await
}

/// Dispatches one client packet; returns `Ok(false)` when the session should
/// end (`DISCONNECT`).
#[allow(clippy::too_many_arguments)]
async fn handle_packet(
    packet: Packet,
    framed: &mut Framed<TcpStream, MqttCodec>,
    connection: &Arc<Connection>,
    identity: &GatewayIdentity,
    up_topic: &str,
    status_topic: &str,
    ack_topic: &str,
    logger: &Logger,
) -> Result<bool> {
    match packet {
        Packet::Publish(Publish { topic, payload, .. }) => {
            if topic == up_topic {
                match pb::UplinkMessage::decode(payload.as_slice()).map_err(|e| Error::Decode(e.to_string())).and_then(convert::uplink_message_from_pb) {
                    Ok(uplink) => {
                        if let Err(err) = connection.handle_up(uplink).await {
                            warn!(logger, "handle_up failed: {err}");
                        }
                    }
                    Err(err) => warn!(logger, "ignoring unparseable uplink on {topic}: {err}"),
                }
            } else if topic == status_topic {
                match pb::Status::decode(payload.as_slice()) {
                    Ok(status) => {
                        if let Err(err) = connection.handle_status(convert::status_from_pb(status)).await {
                            warn!(logger, "handle_status failed: {err}");
                        }
                    }
                    Err(err) => warn!(logger, "ignoring unparseable status on {topic}: {err}"),
                }
            } else if topic == ack_topic {
                match pb::TxAck::decode(payload.as_slice()).map_err(|e| Error::Decode(e.to_string())).and_then(convert::tx_ack_from_pb) {
                    Ok(ack) => connection.handle_tx_ack(ack),
                    Err(err) => warn!(logger, "ignoring unparseable tx ack on {topic}: {err}"),
                }
            } else {
                warn!(logger, "publish on unexpected topic {topic}"; "gateway" => identity.to_string());
            }
            Ok(true)
        }
        Packet::Subscribe(Subscribe { packet_id, topic_filters }) => {
            let granted_qos = vec![0u8; topic_filters.len()];
            framed.send(ServerPacket::SubAck { packet_id, granted_qos }).await?;
            Ok(true)
        }
        Packet::PingReq => {
            framed.send(ServerPacket::PingResp).await?;
            Ok(true)
        }
        Packet::Disconnect => Ok(false),
        Packet::Connect(_) | Packet::PubAck { .. } => Ok(true),
    }
}

async fn publish_downlink(
    framed: &mut Framed<TcpStream, MqttCodec>,
    down_topic: &str,
    scheduled: &ScheduledDownlink,
) -> Result<()> {
    let message = convert::scheduled_downlink_to_pb(scheduled);
    let mut payload = Vec::with_capacity(message.encoded_len());
    message.encode(&mut payload).map_err(|e| Error::Decode(e.to_string()))?;
    framed
        .send(ServerPacket::Publish(Publish { topic: down_topic.to_string(), packet_id: None, payload }))
        .await?;
    Ok(())
}

impl From<codec::CodecError> for Error {
    fn from(e: codec::CodecError) -> Self {
        Error::Decode(e.to_string())
    }
}

