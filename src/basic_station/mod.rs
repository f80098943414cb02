//! BasicStation (LNS WebSocket) frontend: a discovery HTTP endpoint plus a
//! per-gateway WebSocket session, built directly on `hyper` (used here
//! instead of pulling in a second HTTP stack) and `tokio-tungstenite` for
//! the upgraded connection — the same split UDP/MQTT use between "accept"
//! and "per-gateway fiber set", just with the accept half speaking HTTP
//! first.

pub mod wire;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::{GatewayIdentity, ScheduledDownlink, TxAck, TxAckResult};
use crate::registry::GatewayRegistry;
use futures::{SinkExt, StreamExt};
use gs_core::FrequencyPlanStore;
use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::Upgraded;
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use slog::{info, o, warn, Logger};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Clone)]
pub struct BasicStationFrontendConfig {
    pub listen: SocketAddr,
    pub frequency_plan_id: String,
    pub ws_ping_interval: Duration,
}

pub struct BasicStationFrontend {
    registry: Arc<GatewayRegistry>,
    frequency_plans: Arc<FrequencyPlanStore>,
    config: BasicStationFrontendConfig,
    logger: Logger,
    diid_counter: AtomicU64,
}

impl BasicStationFrontend {
    pub fn new(registry: Arc<GatewayRegistry>, frequency_plans: Arc<FrequencyPlanStore>, config: BasicStationFrontendConfig, logger: Logger) -> Arc<Self> {
        Arc::new(Self {
            registry,
            frequency_plans,
            config,
            logger: logger.new(o!("module" => "basic_station")),
            diid_counter: AtomicU64::new(0),
        })
    }

    pub async fn serve(self: Arc<Self>, shutdown: triggered::Listener) -> Result<()> {
        let listen = self.config.listen;
        info!(self.logger, "starting"; "listen" => listen.to_string());
        let frontend = self.clone();
        let make_service = make_service_fn(move |_conn| {
            let frontend = frontend.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| frontend.clone().route(req))) }
        });
        Server::bind(&listen)
            .serve(make_service)
            .with_graceful_shutdown(async move { shutdown.await })
            .await
            .map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    async fn route(self: Arc<Self>, req: Request<Body>) -> std::result::Result<Response<Body>, Infallible> {
        let response = match (req.method(), req.uri().path().to_string()) {
            (&Method::POST, path) | (&Method::GET, path) if path == "/router-info" => self.discovery(req).await,
            (&Method::GET, path) if path.starts_with("/traffic/") => {
                let id = path.trim_start_matches("/traffic/").to_string();
                self.upgrade_traffic(req, id).await
            }
            _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()).unwrap(),
        };
        Ok(response)
    }

    /// `GET|POST /router-info`: the LNS discovery step. The gateway posts
    /// its own identity; we hand back the `muxs` URL it should open a
    /// WebSocket to for traffic.
    async fn discovery(&self, req: Request<Body>) -> Response<Body> {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost")
            .to_string();
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
        let router_id = serde_json::from_slice::<wire::RouterInfoRequest>(&body)
            .map(|r| r.router)
            .unwrap_or_default();
        let muxs = wire::RouterInfoResponse { muxs: format!("ws://{host}/traffic/{router_id}") };
        let payload = serde_json::to_vec(&muxs).unwrap_or_default();
        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload))
            .unwrap()
    }

    async fn upgrade_traffic(self: Arc<Self>, mut req: Request<Body>, id: String) -> Response<Body> {
        let Some(accept_key) = req.headers().get("sec-websocket-key").map(|k| derive_accept_key(k.as_bytes())) else {
            return Response::builder().status(StatusCode::BAD_REQUEST).body(Body::from("missing websocket key")).unwrap();
        };

        let identity = parse_identity(&id);
        let connect_result = self.registry.connect(&identity, "", Some(&self.config.frequency_plan_id)).await;
        let (connection, downlink_rx) = match connect_result {
            Ok(pair) => pair,
            Err(err) => {
                warn!(self.logger, "rejecting basicstation link for {id}: {err}");
                return Response::builder().status(StatusCode::UNAUTHORIZED).body(Body::empty()).unwrap();
            }
        };

        let frontend = self.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => frontend.run_session(upgraded, identity, connection, downlink_rx).await,
                Err(err) => warn!(frontend.logger, "websocket upgrade failed: {err}"),
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, HeaderValue::from_static("upgrade"))
            .header(UPGRADE, HeaderValue::from_static("websocket"))
            .header("sec-websocket-accept", accept_key)
            .body(Body::empty())
            .unwrap()
    }

    async fn run_session(
        self: Arc<Self>,
        upgraded: Upgraded,
        identity: GatewayIdentity,
        connection: Arc<Connection>,
        mut downlink_rx: tokio::sync::mpsc::Receiver<ScheduledDownlink>,
    ) {
        let mut ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
        let logger = self.logger.new(o!("gateway" => identity.to_string()));
        info!(logger, "gateway connected");

        let shutdown = connection.shutdown_listener();
        let mut ping_interval = tokio::time::interval(self.config.ws_ping_interval);
        let mut missed_pongs = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.clone() => break,
                _ = ping_interval.tick() => {
                    if missed_pongs >= 2 {
                        warn!(logger, "missed {missed_pongs} pings in a row, dropping link");
                        break;
                    }
                    if ws.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                    missed_pongs += 1;
                }
                downlink = downlink_rx.recv() => {
                    match downlink {
                        Some(scheduled) => {
                            if let Err(err) = self.send_dnmsg(&mut ws, &identity, &scheduled).await {
                                warn!(logger, "failed to send dnmsg: {err}");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                next = ws.next() => {
                    match next {
                        Some(Ok(Message::Pong(_))) => missed_pongs = 0,
                        Some(Ok(Message::Text(text))) => {
                            if let Err(err) = self.handle_text(&mut ws, &text, &connection).await {
                                warn!(logger, "ignoring malformed basicstation frame: {err}");
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(logger, "websocket error: {err}");
                            break;
                        }
                    }
                }
            }
        }

        self.registry.disconnect(&identity).await;
        info!(logger, "gateway disconnected");
    }

    async fn handle_text(&self, ws: &mut WebSocketStream<Upgraded>, text: &str, connection: &Arc<Connection>) -> Result<()> {
        let message: wire::InboundMessage = serde_json::from_str(text)?;
        let plan = self.frequency_plans.get(&self.config.frequency_plan_id)?;
        match message {
            wire::InboundMessage::Version(version) => {
                info!(self.logger, "handshake from station {}", version.station);
                let reply = wire::RouterConfig::from_plan(plan);
                let payload = serde_json::to_string(&reply)?;
                ws.send(Message::Text(payload)).await.map_err(|e| Error::Decode(e.to_string()))?;
            }
            wire::InboundMessage::Jreq(frame) | wire::InboundMessage::Updf(frame) => {
                connection.handle_up(wire::to_uplink_message(&frame, plan)?).await?;
            }
            wire::InboundMessage::Dntxed(dntxed) => {
                let result = if dntxed.error.is_some() { TxAckResult::TxScheduleConflict } else { TxAckResult::Success };
                connection.handle_tx_ack(TxAck { token: Vec::new(), result });
            }
            wire::InboundMessage::Timesync(_) => {
                // No monotonic GPS/server time source is wired up yet; the
                // station's own clock is left authoritative until one is.
            }
        }
        Ok(())
    }

    async fn send_dnmsg(
        &self,
        ws: &mut WebSocketStream<Upgraded>,
        identity: &GatewayIdentity,
        scheduled: &ScheduledDownlink,
    ) -> Result<()> {
        let diid = self.diid_counter.fetch_add(1, Ordering::Relaxed);
        let plan = self.frequency_plans.get(&self.config.frequency_plan_id)?;
        let rx1_dr = plan
            .data_rate_table
            .iter()
            .position(|m| *m == scheduled.settings.modulation)
            .unwrap_or(0) as u32;
        let dnmsg = wire::DnMsg {
            msgtype: "dnmsg",
            dev_eui: identity.to_string(),
            diid,
            xtime: scheduled.settings.gateway_timestamp_us as u64,
            rx_delay: 1,
            rx1_dr,
            rx1_freq: scheduled.settings.frequency_hz,
            rx2_dr: None,
            rx2_freq: None,
            priority: 0,
            pdu: wire::hex_encode(&scheduled.raw_payload),
        };
        let payload = serde_json::to_string(&dnmsg)?;
        ws.send(Message::Text(payload)).await.map_err(|e| Error::Decode(e.to_string()))?;
        Ok(())
    }
}

/// A 16-hex-digit `/traffic/<id>` path segment is an EUI; anything else is
/// treated as an opaque string identity, same as `grpc`'s metadata-based ids.
fn parse_identity(id: &str) -> GatewayIdentity {
    if id.len() == 16 {
        if let Ok(bytes) = wire::hex_decode(id) {
            if let Ok(eui) = <[u8; 8]>::try_from(bytes) {
                return GatewayIdentity::Eui(eui);
            }
        }
    }
    GatewayIdentity::Id(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_id_parses_as_eui() {
        let identity = parse_identity("0102030405060708");
        assert_eq!(identity, GatewayIdentity::Eui([1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn non_hex_id_parses_as_string_id() {
        let identity = parse_identity("my-gateway");
        assert_eq!(identity, GatewayIdentity::Id("my-gateway".to_string()));
    }
}
