//! gRPC frontend: a single `tonic` service, `LinkGateway`, generated from
//! `proto/gs.proto` by `build.rs`. Simpler than the UDP/MQTT frontends by
//! design: the bidirectional `LinkGateway` call maps straight onto
//! `Connection::handle_up`/`handle_status`/`handle_tx_ack`/the downlink
//! channel, and the three unary RPCs proxy directly into the frequency-plan
//! store and the registry with no extra translation.

pub mod convert;

use crate::connection::Connection;
use crate::error::Error;
use crate::message::GatewayIdentity;
use crate::registry::GatewayRegistry;
use convert::pb;
use futures::Stream;
use gs_core::FrequencyPlanStore;
use slog::{info, o, warn, Logger};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status as GrpcStatus, Streaming};

pub use pb::link_gateway_server::{LinkGateway, LinkGatewayServer};

#[derive(Clone)]
pub struct GrpcFrontend {
    registry: Arc<GatewayRegistry>,
    frequency_plans: Arc<FrequencyPlanStore>,
    logger: Logger,
}

impl GrpcFrontend {
    pub fn new(registry: Arc<GatewayRegistry>, frequency_plans: Arc<FrequencyPlanStore>, logger: Logger) -> Self {
        Self { registry, frequency_plans, logger: logger.new(o!("module" => "grpc")) }
    }

    pub async fn serve(self, listen: SocketAddr, shutdown: triggered::Listener) -> crate::error::Result<()> {
        info!(self.logger, "starting"; "listen" => listen.to_string());
        Server::builder()
            .add_service(LinkGatewayServer::new(self))
            .serve_with_shutdown(listen, async move { shutdown.await })
            .await
            .map_err(|e| Error::InvalidArgument(e.to_string()))
    }
}

/// Extracts `id`/`authorization: Bearer <api key>` from call metadata, the
/// way the UDP/MQTT frontends read identity/credential off their own wire
/// framing.
fn credentials_from_metadata<T>(request: &Request<T>) -> Result<(GatewayIdentity, String), GrpcStatus> {
    let metadata = request.metadata();
    let id = metadata
        .get("id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GrpcStatus::unauthenticated("missing id metadata"))?
        .to_string();
    let api_key = metadata
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
        .to_string();
    Ok((GatewayIdentity::Id(id), api_key))
}

#[tonic::async_trait]
impl LinkGateway for GrpcFrontend {
    type LinkGatewayStream = Pin<Box<dyn Stream<Item = Result<pb::GatewayDown, GrpcStatus>> + Send + 'static>>;

    async fn link_gateway(
        &self,
        request: Request<Streaming<pb::GatewayUp>>,
    ) -> Result<Response<Self::LinkGatewayStream>, GrpcStatus> {
        let (identity, credential) = credentials_from_metadata(&request)?;
        let (connection, mut downlink_rx) = self
            .registry
            .connect(&identity, &credential, None)
            .await
            .map_err(grpc_status)?;

        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let registry = self.registry.clone();
        let logger = self.logger.new(o!("gateway" => identity.to_string()));
        let connection_for_reader: Arc<Connection> = connection.clone();
        let shutdown = connection.shutdown_listener();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.clone() => break,
                    next = inbound.message() => {
                        match next {
                            Ok(Some(up)) => {
                                if let Err(err) = dispatch_gateway_up(&connection_for_reader, up).await {
                                    warn!(logger, "failed to dispatch GatewayUp: {err}");
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                warn!(logger, "stream error: {err}");
                                break;
                            }
                        }
                    }
                }
            }
            registry.disconnect(&identity).await;
        });

        tokio::spawn(async move {
            while let Some(scheduled) = downlink_rx.recv().await {
                let down = pb::GatewayDown { downlink: Some(convert::scheduled_downlink_to_pb(&scheduled)) };
                if tx.send(Ok(down)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_concentrator_config(
        &self,
        request: Request<pb::GetConcentratorConfigRequest>,
    ) -> Result<Response<pb::ConcentratorConfig>, GrpcStatus> {
        let plan_id = request.into_inner().frequency_plan_id;
        let plan = self.frequency_plans.get(&plan_id).map_err(|e| GrpcStatus::not_found(e.to_string()))?;
        Ok(Response::new(convert::frequency_plan_to_pb(plan)))
    }

    async fn get_gateway_connection_stats(
        &self,
        request: Request<pb::GetGatewayConnectionStatsRequest>,
    ) -> Result<Response<pb::ConnectionStats>, GrpcStatus> {
        let identity = identity_from_pb(request.into_inner().gateway)?;
        let snapshot = self.registry.stats(&identity).await.map_err(grpc_status)?;
        Ok(Response::new(convert::stats_snapshot_to_pb(&snapshot)))
    }

    async fn schedule_downlink(
        &self,
        request: Request<pb::ScheduleDownlinkRequest>,
    ) -> Result<Response<pb::ScheduledDownlink>, GrpcStatus> {
        let inner = request.into_inner();
        let identity = identity_from_pb(inner.gateway)?;
        let req = inner
            .request
            .ok_or_else(|| GrpcStatus::invalid_argument("missing request"))
            .and_then(|r| convert::downlink_request_from_pb(r, &identity).map_err(|e| GrpcStatus::invalid_argument(e.to_string())))?;
        let scheduled = self.registry.schedule_downlink(&identity, req).await.map_err(grpc_status)?;
        Ok(Response::new(convert::scheduled_downlink_to_pb(&scheduled)))
    }
}

async fn dispatch_gateway_up(connection: &Arc<Connection>, up: pb::GatewayUp) -> crate::error::Result<()> {
    match up.message {
        Some(pb::gateway_up::Message::Uplink(uplink)) => {
            connection.handle_up(convert::uplink_message_from_pb(uplink)?).await
        }
        Some(pb::gateway_up::Message::Status(status)) => {
            connection.handle_status(convert::status_from_pb(status)).await
        }
        Some(pb::gateway_up::Message::TxAck(ack)) => {
            connection.handle_tx_ack(convert::tx_ack_from_pb(ack)?);
            Ok(())
        }
        None => Ok(()),
    }
}

fn identity_from_pb(identity: Option<pb::GatewayIdentity>) -> Result<GatewayIdentity, GrpcStatus> {
    identity
        .map(|i| GatewayIdentity::Id(i.id))
        .ok_or_else(|| GrpcStatus::invalid_argument("missing gateway identity"))
}

fn grpc_status(err: Error) -> GrpcStatus {
    match err {
        Error::Unauthenticated => GrpcStatus::unauthenticated(err.to_string()),
        Error::PermissionDenied => GrpcStatus::permission_denied(err.to_string()),
        Error::NotFound(_) => GrpcStatus::not_found(err.to_string()),
        Error::Aborted(_) => GrpcStatus::aborted(err.to_string()),
        Error::InvalidArgument(_) | Error::Decode(_) => GrpcStatus::invalid_argument(err.to_string()),
        Error::DeadlineExceeded => GrpcStatus::deadline_exceeded(err.to_string()),
        Error::Canceled => GrpcStatus::cancelled(err.to_string()),
        Error::Io(_) | Error::Json(_) | Error::FrequencyPlan(_) => GrpcStatus::internal(err.to_string()),
    }
}
