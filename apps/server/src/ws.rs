//! Socket upgrade policy and the per-connection signaling loop.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;

use async_trait::async_trait;
use confab_pipeline::PipelineConfig;
use confab_session::keys::OUTBOUND_SOCKET;
use confab_session::{AnalysisId, ProjectId, SessionContext, UserId};
use confab_signal::{
    MessageTransport, OutboundSocket, SignalError, WireMessage,
};
use confab_storage::Project;

use crate::rtc;
use crate::state::AppState;

const POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct UpgradeParams {
    ticket_id: Option<String>,
    project_id: Option<String>,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<UpgradeParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, addr, state))
}

async fn close_with_policy(mut socket: WebSocket, reason: &'static str) {
    tracing::info!(reason, "rejecting socket upgrade");
    let frame = CloseFrame {
        code: POLICY_VIOLATION,
        reason: reason.into(),
    };
    if let Err(error) = socket.send(WsMessage::Close(Some(frame))).await {
        tracing::debug!(%error, "close frame send failed");
    }
}

async fn handle_socket(
    socket: WebSocket,
    params: UpgradeParams,
    addr: SocketAddr,
    state: AppState,
) {
    let Some(ticket_id) = params.ticket_id.filter(|t| !t.is_empty()) else {
        return close_with_policy(socket, "Authentication ticket required").await;
    };
    let Some(project_param) = params.project_id.filter(|p| !p.is_empty()) else {
        return close_with_policy(socket, "Project ID required").await;
    };

    let Some(ticket) = state.tickets.validate(&ticket_id, addr.ip(), Utc::now()) else {
        return close_with_policy(socket, "Invalid authentication ticket").await;
    };

    let Ok(project_id) = project_param.parse::<ProjectId>() else {
        return close_with_policy(socket, "Project not found").await;
    };
    let project = {
        let store = Arc::clone(&state.store);
        match tokio::task::spawn_blocking(move || store.get_project(project_id)).await {
            Ok(Ok(project)) => project,
            Ok(Err(_)) | Err(_) => {
                return close_with_policy(socket, "Project not found").await;
            }
        }
    };

    state.connections.fetch_add(1, Ordering::Relaxed);
    serve_session(socket, state.clone(), ticket.user_id, project, addr).await;
    state.connections.fetch_sub(1, Ordering::Relaxed);
}

async fn serve_session(
    socket: WebSocket,
    state: AppState,
    user_id: UserId,
    project: Project,
    addr: SocketAddr,
) {
    let ctx = state.manager.new_session(user_id, project.project_id).await;
    let session_id = ctx.session_id();
    tracing::info!(
        session_id = %session_id,
        user_id = %user_id,
        client_ip = %addr.ip(),
        "socket session accepted"
    );

    let transport = Arc::new(SocketTransport::new(socket));
    if let Err(error) = ctx
        .register(OUTBOUND_SOCKET, OutboundSocket::start(transport))
        .await
    {
        tracing::error!(session_id = %session_id, %error, "socket registration failed");
        let _ = ctx.teardown().await;
        return;
    }
    let outbound = match ctx.get(OUTBOUND_SOCKET).await {
        Ok(Some(outbound)) => outbound,
        _ => {
            let _ = ctx.teardown().await;
            return;
        }
    };

    if let Err(error) = send_connect_messages(&state, &outbound, &project).await {
        tracing::error!(session_id = %session_id, %error, "connect messages failed");
    }

    receive_loop(&state, &ctx, &outbound).await;

    // Disconnect: end the audio track first so the pipeline finalizes, then
    // tear the session down, then flush and close the wire.
    rtc::close_peer_connection(&ctx).await;
    if let Err(error) = ctx.teardown().await {
        tracing::warn!(session_id = %session_id, %error, "teardown failed");
    }
    outbound.close().await;
    tracing::info!(session_id = %session_id, "socket session finished");
}

/// One `catchup` (project history) then one `project_metadata`, in order.
async fn send_connect_messages(
    state: &AppState,
    outbound: &OutboundSocket,
    project: &Project,
) -> anyhow::Result<()> {
    let store = Arc::clone(&state.store);
    let project_id = project.project_id;
    let (transcript, insights) = tokio::task::spawn_blocking(move || {
        let transcript = store
            .transcripts_for_project(project_id)?
            .iter()
            .map(|row| row.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let insights = store
            .analyses_for_project(project_id)?
            .into_iter()
            .map(|analysis| analysis.text)
            .collect::<Vec<_>>();
        Ok::<_, confab_storage::StorageError>((transcript, insights))
    })
    .await??;

    outbound
        .send(WireMessage::catchup(transcript, insights))
        .await?;
    outbound
        .send(WireMessage::project_metadata(
            project.project_id.to_string(),
            project.name.clone(),
        ))
        .await?;
    Ok(())
}

async fn receive_loop(state: &AppState, ctx: &SessionContext, outbound: &OutboundSocket) {
    let session_id = ctx.session_id();
    loop {
        match outbound.receive().await {
            Ok(Some(message)) => {
                if let Err(error) = dispatch(state, ctx, outbound, message).await {
                    tracing::error!(session_id = %session_id, %error, "message dispatch failed");
                    break;
                }
            }
            Ok(None) => break,
            Err(SignalError::Codec(error)) => {
                tracing::warn!(session_id = %session_id, %error, "malformed client message");
                let _ = outbound
                    .send(WireMessage::error(
                        "malformed_message",
                        "could not parse message envelope",
                        Some(session_id.to_string()),
                    ))
                    .await;
            }
            Err(error) => {
                tracing::warn!(session_id = %session_id, %error, "socket receive failed");
                break;
            }
        }
    }
}

async fn dispatch(
    state: &AppState,
    ctx: &SessionContext,
    outbound: &OutboundSocket,
    message: WireMessage,
) -> anyhow::Result<()> {
    let session_id = ctx.session_id();
    match message {
        WireMessage::Offer { sdp, .. } => {
            let pipeline_config = PipelineConfig::new(state.config.target_sample_rate);
            match rtc::handle_offer(ctx, sdp, pipeline_config).await {
                Ok(answer) => outbound.send(WireMessage::answer(answer)).await?,
                Err(error) => {
                    tracing::error!(session_id = %session_id, %error, "offer handling failed");
                    outbound
                        .send(WireMessage::error(
                            "offer_error",
                            error.to_string(),
                            Some(session_id.to_string()),
                        ))
                        .await?;
                }
            }
        }
        WireMessage::IceCandidate { candidate, .. } => {
            if let Err(error) = rtc::handle_ice_candidate(ctx, candidate).await {
                tracing::warn!(session_id = %session_id, %error, "ice candidate rejected");
                outbound
                    .send(WireMessage::error(
                        "ice_candidate_error",
                        error.to_string(),
                        Some(session_id.to_string()),
                    ))
                    .await?;
            }
        }
        WireMessage::Ping { .. } => outbound.send(WireMessage::pong()).await?,
        WireMessage::DismissAiAnalysis { analysis_id, .. } => {
            dismiss_analysis(state, ctx, outbound, &analysis_id).await?;
        }
        other => {
            tracing::warn!(session_id = %session_id, kind = other.kind(), "unexpected client message");
            outbound
                .send(WireMessage::error(
                    "unexpected_message",
                    format!("unexpected message type `{}`", other.kind()),
                    Some(session_id.to_string()),
                ))
                .await?;
        }
    }
    Ok(())
}

async fn dismiss_analysis(
    state: &AppState,
    ctx: &SessionContext,
    outbound: &OutboundSocket,
    analysis_id: &str,
) -> anyhow::Result<()> {
    let session_id = ctx.session_id();
    let parsed: Result<AnalysisId, _> = analysis_id.parse();
    let result = match parsed {
        Ok(analysis_id) => {
            let store = Arc::clone(&state.store);
            let user_id = ctx.data().await?.user_id;
            tokio::task::spawn_blocking(move || store.dismiss_analysis(analysis_id, user_id))
                .await?
                .map_err(|error| error.to_string())
        }
        Err(error) => Err(error.to_string()),
    };

    if let Err(reason) = result {
        tracing::warn!(session_id = %session_id, analysis_id, reason, "dismissal failed");
        outbound
            .send(WireMessage::error(
                "dismiss_error",
                reason,
                Some(session_id.to_string()),
            ))
            .await?;
    }
    Ok(())
}

/// Axum's WebSocket behind the [`MessageTransport`] seam. The halves are
/// split so the outbound writer and the receive loop never contend.
pub struct SocketTransport {
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    stream: Mutex<SplitStream<WebSocket>>,
}

impl SocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl MessageTransport for SocketTransport {
    async fn send_text(&self, text: String) -> Result<(), SignalError> {
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|error| SignalError::Transport(error.to_string()))
    }

    async fn receive_text(&self) -> Result<Option<String>, SignalError> {
        loop {
            let next = { self.stream.lock().await.next().await };
            match next {
                None => return Ok(None),
                Some(Err(error)) => return Err(SignalError::Transport(error.to_string())),
                Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                // Binary frames and protocol pings are not part of the
                // signaling protocol.
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&self) -> Result<(), SignalError> {
        // The peer may already be gone; a failed close frame is fine.
        let _ = self.sink.lock().await.send(WsMessage::Close(None)).await;
        Ok(())
    }
}
