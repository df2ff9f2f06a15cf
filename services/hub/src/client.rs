//! Per-connection state machine.
//!
//! The handshake runs sequentially on the whole socket: the first envelope
//! must be `auth` and must arrive inside the auth deadline, or the socket
//! closes with a policy-violation reason.  After a successful handshake the
//! socket splits into a read pump (framing, deserialization, submission to
//! the processor) and a write pump (send-buffer drain, batching, pings).
//! Either pump exiting cancels the client scope, which makes its sibling
//! exit; an authenticated connection unregisters exactly once, guarded by
//! the hub's conn-id identity check.

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chat_protocol::{close_reasons, AuthRequest, AuthResult, Envelope, MessageType};

use crate::auth::{extract_bearer, AuthError, TokenClaims};
use crate::breaker::BreakerError;
use crate::hub::ClientHandle;
use crate::processor::InboundTask;
use crate::state::AppState;

/// Owns one upgraded socket until both pumps exit.
pub async fn serve(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    state.metrics.connection_opened();
    run_connection(socket, &state, conn_id).await;
    state.metrics.connection_closed();
}

async fn run_connection(mut socket: WebSocket, state: &AppState, conn_id: Uuid) {
    let Some(claims) = authenticate(&mut socket, state).await else {
        return;
    };
    info!(conn_id = %conn_id, user_id = %claims.user_id, "client authenticated");

    let ack = match Envelope::new(MessageType::Auth, &AuthResult { authenticated: true })
        .and_then(|e| e.to_json())
    {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to marshal auth ack");
            return;
        }
    };
    let write_wait = state.config.ws_write_wait;

    let (sender, send_buffer) = mpsc::channel(state.config.ws_send_buf_size);
    let cancel = CancellationToken::new();
    // Register before acking so the client is routable the moment it sees
    // the auth response.  Envelopes arriving meanwhile wait in the send
    // buffer until the write pump starts.
    state
        .hub
        .register(ClientHandle {
            conn_id,
            user_id: claims.user_id.clone(),
            username: claims.username.clone(),
            sender,
            cancel: cancel.clone(),
        })
        .await;

    match timeout(write_wait, socket.send(Message::Text(ack.into()))).await {
        Ok(Ok(())) => {}
        _ => {
            state.hub.unregister(conn_id, &claims.user_id).await;
            return;
        }
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(
        sink,
        send_buffer,
        write_wait,
        state.config.ws_ping_period,
        cancel.clone(),
    ));

    read_pump(stream, state, &claims.user_id, &cancel).await;

    // Identity-checked: a connection evicted by a re-register no-ops here.
    state.hub.unregister(conn_id, &claims.user_id).await;
    cancel.cancel();
    let _ = writer.await;
    info!(conn_id = %conn_id, user_id = %claims.user_id, "client closed");
}

/// Handshake phase.  Returns None when the socket was closed; every failure
/// path sends its close frame before returning.
async fn authenticate(socket: &mut WebSocket, state: &AppState) -> Option<TokenClaims> {
    let write_wait = state.config.ws_write_wait;
    let deadline = Instant::now() + state.config.ws_auth_timeout;
    loop {
        let frame = match timeout_at(deadline, socket.recv()).await {
            Err(_) => {
                close_with(
                    socket,
                    close_code::POLICY,
                    close_reasons::AUTHENTICATION_REQUIRED,
                    write_wait,
                )
                .await;
                return None;
            }
            Ok(None) | Ok(Some(Err(_))) => return None,
            Ok(Some(Ok(frame))) => frame,
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return None,
            Message::Binary(_) => {
                close_with(
                    socket,
                    close_code::POLICY,
                    close_reasons::AUTHENTICATION_REQUIRED,
                    write_wait,
                )
                .await;
                return None;
            }
        };
        let Some(line) = split_frames(&text).next() else {
            continue;
        };
        let envelope = match Envelope::from_json(line) {
            Ok(envelope) => envelope,
            Err(_) => {
                close_with(
                    socket,
                    close_code::INVALID,
                    close_reasons::AUTHENTICATION_REQUIRED,
                    write_wait,
                )
                .await;
                return None;
            }
        };
        if envelope.message_type != MessageType::Auth {
            close_with(
                socket,
                close_code::POLICY,
                close_reasons::AUTHENTICATION_REQUIRED,
                write_wait,
            )
            .await;
            return None;
        }
        let request: AuthRequest = match envelope.decode_payload() {
            Ok(request) => request,
            Err(_) => {
                close_with(
                    socket,
                    close_code::INVALID,
                    close_reasons::AUTHENTICATION_REQUIRED,
                    write_wait,
                )
                .await;
                return None;
            }
        };

        let token = extract_bearer(&request.token);
        let claims = match state.verifier.verify(token).await {
            Ok(claims) if !claims.user_id.is_empty() => claims,
            Ok(_) | Err(AuthError::InvalidToken) => {
                close_with(
                    socket,
                    close_code::POLICY,
                    close_reasons::INVALID_TOKEN,
                    write_wait,
                )
                .await;
                return None;
            }
            Err(AuthError::Revoked) => {
                close_with(
                    socket,
                    close_code::POLICY,
                    close_reasons::TOKEN_REVOKED,
                    write_wait,
                )
                .await;
                return None;
            }
            Err(AuthError::Internal(e)) => {
                warn!(error = %e, "token verification failed");
                close_with(
                    socket,
                    close_code::ERROR,
                    close_reasons::INTERNAL_ERROR,
                    write_wait,
                )
                .await;
                return None;
            }
        };

        match state
            .auth_breaker
            .call(|| state.revoked.is_revoked(&claims.jti))
            .await
        {
            Ok(false) => {}
            Ok(true) => {
                close_with(
                    socket,
                    close_code::POLICY,
                    close_reasons::TOKEN_REVOKED,
                    write_wait,
                )
                .await;
                return None;
            }
            Err(BreakerError::Repo(e)) if e.is_not_found() => {}
            Err(e) => {
                warn!(error = %e, "revocation check failed");
                close_with(
                    socket,
                    close_code::ERROR,
                    close_reasons::INTERNAL_ERROR,
                    write_wait,
                )
                .await;
                return None;
            }
        }
        return Some(claims);
    }
}

/// Inbound framing and submission.  The read deadline starts at `pong_wait`
/// and is pushed out on every pong; a malformed envelope is skipped without
/// closing the socket.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    user_id: &str,
    cancel: &CancellationToken,
) {
    let pong_wait = state.config.ws_pong_wait;
    let mut deadline = Instant::now() + pong_wait;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = timeout_at(deadline, stream.next()) => match res {
                Err(_) => {
                    debug!(user_id, "pong deadline expired");
                    break;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Err(e))) => {
                    debug!(user_id, error = %e, "socket read failed");
                    break;
                }
                Ok(Some(Ok(Message::Pong(_)))) => {
                    deadline = Instant::now() + pong_wait;
                }
                // The transport answers pings itself.
                Ok(Some(Ok(Message::Ping(_)))) => {}
                Ok(Some(Ok(Message::Binary(_)))) => {}
                Ok(Some(Ok(Message::Text(text)))) => {
                    for line in split_frames(&text) {
                        match Envelope::from_json(line) {
                            Ok(envelope) => state.processor.submit(InboundTask {
                                sender_id: user_id.to_owned(),
                                envelope,
                            }),
                            Err(e) => {
                                state.metrics.invalid_payload();
                                debug!(user_id, error = %e, "malformed envelope skipped");
                            }
                        }
                    }
                }
            },
        }
    }
}

/// Outbound framing.  Drains readily-available envelopes into one
/// newline-joined text frame; emits a ping every `ping_period`.  Exits (and
/// cancels the client scope) when the send buffer closes or a write fails.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut send_buffer: mpsc::Receiver<String>,
    write_wait: Duration,
    ping_period: Duration,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval(ping_period);
    ping.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                send_close(&mut sink, write_wait).await;
                break;
            }
            maybe = send_buffer.recv() => match maybe {
                None => {
                    // Buffer closed by the hub: eviction or shutdown.
                    send_close(&mut sink, write_wait).await;
                    break;
                }
                Some(first) => {
                    let mut batch = first;
                    while let Ok(next) = send_buffer.try_recv() {
                        batch.push('\n');
                        batch.push_str(&next);
                    }
                    match timeout(write_wait, sink.send(Message::Text(batch.into()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
            },
            _ = ping.tick() => {
                match timeout(write_wait, sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
    cancel.cancel();
}

async fn send_close(sink: &mut SplitSink<WebSocket, Message>, write_wait: Duration) {
    let frame = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::default(),
    }));
    let _ = timeout(write_wait, sink.send(frame)).await;
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str, write_wait: Duration) {
    let frame = Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    }));
    let _ = timeout(write_wait, socket.send(frame)).await;
}

/// Splits a transport frame into envelope lines (empty lines skipped).
fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n').map(str::trim).filter(|l| !l.is_empty())
}
