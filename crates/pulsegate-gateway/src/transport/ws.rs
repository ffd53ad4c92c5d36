//! WebSocket connection lifecycle (spec §4.6 + §4.11).
//!
//! On upgrade: `Security::allow_connect` runs first thing in the session
//! (a rejection sends a WS close frame rather than an HTTP status), then
//! `AuthGate::authenticate`, session creation, then a reader loop on this
//! task plus a spawned bus-forwarder task that drains the session's bus
//! subscription into its outbound mailbox. A dedicated writer task drains
//! the outbound mailbox onto the socket so a slow client never blocks
//! dispatch.

use std::net::SocketAddr;

use axum::extract::{ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::Instrument;

use pulsegate_core::error::{CloseCode, PulseError, SecurityReason};

use crate::app_state::AppState;
use crate::auth::Handshake;
use crate::session::{close_frame, Session, SessionState};
use crate::transport::codec::{self, Inbound};

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub auth_token: Option<String>,
}

fn handshake_from(headers: &HeaderMap, q: &WsQuery) -> Handshake {
    Handshake {
        auth_token: q.auth_token.clone(),
        authorization_header: headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()).map(str::to_string),
        query_token: q.token.clone(),
        alt_token: None,
        two_factor_code: headers.get("x-2fa-code").and_then(|v| v.to_str().ok()).map(str::to_string),
    }
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if state.is_draining() {
        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
    }

    // Blacklist/rate-limit/DDoS rejection is sent as a WS close frame (spec
    // §6), not an HTTP status, so the upgrade completes unconditionally and
    // `run_session` runs the security check first thing.
    let handshake = handshake_from(&headers, &q);
    let user_agent = headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok()).unwrap_or("-").to_string();

    state.metrics().ws_upgrades.inc(&[]);
    ws.on_upgrade(move |socket| handle_socket(state, addr.ip().to_string(), user_agent, handshake, socket))
}

async fn handle_socket(state: AppState, remote_addr: String, user_agent: String, handshake: Handshake, socket: WebSocket) {
    let supervisor = state.supervisor().clone();
    let session_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!("ws_session", session = %session_id, %remote_addr);

    run_session(state, supervisor, session_id, remote_addr, user_agent, handshake, socket).instrument(span).await;
}

async fn run_session(
    state: AppState,
    supervisor: std::sync::Arc<crate::supervisor::Supervisor>,
    session_id: String,
    remote_addr: String,
    user_agent: String,
    handshake: Handshake,
    socket: WebSocket,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    if let Ok(ip) = remote_addr.parse() {
        if let Err(e) = supervisor.security.allow_connect(ip, None).await {
            state.metrics().handshake_rejections.inc(&[("reason", e.client_code().as_str())]);
            tracing::info!(%remote_addr, code = e.client_code().as_str(), "connection rejected");
            let code = e.close_code().unwrap_or(CloseCode::RateLimited);
            let reason = match &e {
                PulseError::Security(SecurityReason::Blacklisted(reason)) => format!("blacklisted: {reason}"),
                _ => e.client_code().as_str().to_string(),
            };
            let _ = ws_tx.send(close_frame(code, &reason)).await;
            return;
        }
    }

    let outcome = match supervisor.auth_gate.authenticate(&handshake, &remote_addr).await {
        Ok(o) => o,
        Err(e) => {
            tracing::info!(code = e.client_code().as_str(), "authentication failed");
            let code = e.close_code().unwrap_or(CloseCode::AuthFailure);
            let _ = ws_tx.send(close_frame(code, e.client_code().as_str())).await;
            return;
        }
    };

    let user_id = outcome.user.user_id.clone();
    let session = std::sync::Arc::new(Session::new(session_id.clone(), supervisor.node_id.clone(), remote_addr.clone(), user_agent));
    session.set_user(user_id.clone()).await;
    session.set_roles(outcome.user.roles.iter().cloned());
    session.set_state(SessionState::Active);
    supervisor.sessions.insert(session.clone());
    supervisor.sessions.attach_user(&user_id, &session_id);
    state.metrics().ws_active_sessions.inc(&[]);

    let _ = supervisor.presence.on_session_opened(&user_id).await;

    let bus_mailbox = session.bus_inbox();
    let user_topic = format!("user:{user_id}");
    let user_sub_id = supervisor.bus.subscribe_shared(user_topic.clone(), bus_mailbox.clone());

    let ready_frame = pulsegate_core::protocol::ServerFrame::new(
        "ready",
        serde_json::json!({
            "user": {"id": user_id, "display_name": outcome.user.display_name},
            "session_id": session_id,
            "server_time": std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0),
        }),
    );
    let _ = session.send(axum::extract::ws::Message::Text(serde_json::to_string(&ready_frame).unwrap_or_default())).await;

    let outbound = session.outbound_handle();
    let writer_supervisor = supervisor.clone();
    let writer = tokio::spawn(async move {
        loop {
            let msg = outbound.recv().await;
            if ws_tx.send(msg).await.is_err() {
                writer_supervisor.metrics.writer_timeouts.inc(&[]);
                break;
            }
        }
    });

    let forward_session = session.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            let envelope = bus_mailbox.recv().await;
            let frame = pulsegate_core::protocol::ServerFrame::new(envelope.kind.clone(), envelope.payload.clone());
            let body = serde_json::to_string(&frame).unwrap_or_default();
            let _ = forward_session.send(axum::extract::ws::Message::Text(body)).await;
        }
    });

    let mut ping_tick = tokio::time::interval(std::time::Duration::from_millis(state.cfg().gateway.ping_interval_ms));
    let mut close_code = CloseCode::Shutdown;
    let mut shutdown_rx = supervisor.subscribe_shutdown();

    'session: loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                if !session.heartbeat_alive().await {
                    close_code = CloseCode::HeartbeatTimeout;
                    break 'session;
                }
                let _ = session.send(axum::extract::ws::Message::Ping(Vec::new())).await;
            }

            _ = shutdown_rx.recv() => {
                close_code = CloseCode::Shutdown;
                break 'session;
            }

            _ = session.closed_by_request() => {
                close_code = session.take_requested_close().await.unwrap_or(CloseCode::Blacklisted);
                break 'session;
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(msg)) => {
                        session.touch_activity();
                        match codec::decode(msg) {
                            Ok(Inbound::Ping(v)) => {
                                let _ = session.send(axum::extract::ws::Message::Pong(v)).await;
                            }
                            Ok(Inbound::Pong(_)) => {
                                session.record_pong().await;
                            }
                            Ok(Inbound::Close) => break 'session,
                            Ok(Inbound::Frame(frame)) => {
                                if session.record_event_rate().await > 100 {
                                    if let Ok(addr) = remote_addr.parse() {
                                        supervisor.security.raise_suspicion(addr, crate::security::Security::EVENTS_PER_SECOND_PENALTY).await;
                                    }
                                }

                                let started = std::time::Instant::now();
                                let data = frame.data.as_deref();
                                let result = supervisor.router.dispatch(&session, &user_id, &frame.event, data).await;
                                state.metrics().dispatch_duration.observe(&[("event", frame.event.as_str())], started.elapsed());

                                match result {
                                    Ok(payload) => {
                                        let reply = pulsegate_core::protocol::ServerFrame::new(format!("{}.ack", frame.event), payload);
                                        let reply = if let Some(id) = frame.id { reply.with_id(id) } else { reply };
                                        let body = serde_json::to_string(&reply).unwrap_or_default();
                                        let _ = session.send(axum::extract::ws::Message::Text(body)).await;
                                    }
                                    Err(e) => {
                                        state.metrics().service_errors.inc(&[("code", e.client_code().as_str())]);
                                        if let PulseError::Security(_) = &e {
                                            if let Ok(addr) = remote_addr.parse() {
                                                supervisor.security.raise_suspicion(addr, crate::security::Security::UNKNOWN_EVENT_PENALTY).await;
                                            }
                                        }
                                        if let Some(code) = e.close_code() {
                                            close_code = code;
                                            let error_frame = pulsegate_core::protocol::ServerFrame::new("error", serde_json::json!({"code": e.client_code().as_str()}));
                                            let _ = session.send(axum::extract::ws::Message::Text(serde_json::to_string(&error_frame).unwrap_or_default())).await;
                                            break 'session;
                                        } else {
                                            let error_frame = pulsegate_core::protocol::ServerFrame::new("error", serde_json::json!({"code": e.client_code().as_str()}));
                                            let _ = session.send(axum::extract::ws::Message::Text(serde_json::to_string(&error_frame).unwrap_or_default())).await;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                state.metrics().decode_errors.inc(&[]);
                                let error_frame = pulsegate_core::protocol::ServerFrame::new("error", serde_json::json!({"code": e.client_code().as_str()}));
                                let _ = session.send(axum::extract::ws::Message::Text(serde_json::to_string(&error_frame).unwrap_or_default())).await;
                            }
                        }

                        if session.is_chronic_slow_consumer() {
                            close_code = CloseCode::SlowConsumer;
                            break 'session;
                        }
                    }
                    Some(Err(_)) => break 'session,
                    None => break 'session,
                }
            }
        }
    }

    session.set_state(SessionState::Closing);
    let _ = session.send(close_frame(close_code, "session_closed")).await;

    forwarder.abort();
    supervisor.bus.unsubscribe(&user_topic, user_sub_id);
    supervisor.typing.on_session_close(&session_id).await;
    let _ = supervisor.presence.on_session_closed(&user_id).await;
    for room in session.room_set() {
        let _ = supervisor
            .bus
            .publish(&room, "room.presence", serde_json::json!({"delta": -1}), crate::bus::PublishOpts::default())
            .await;
    }
    session.leave_all_rooms(&supervisor.bus);
    supervisor.sessions.remove(&session_id, Some(&user_id));
    session.set_state(SessionState::Closed);
    state.metrics().ws_active_sessions.dec(&[]);

    let _ = supervisor
        .bus
        .publish(
            &format!("session.closed.{}", supervisor.node_id),
            "session.closed",
            serde_json::json!({"session_id": session_id, "user_id": user_id}),
            crate::bus::PublishOpts::default(),
        )
        .await;

    writer.abort();
}
