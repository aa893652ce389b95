//! Client-facing transport listeners (C3): accepts TCP, TLS, WebSocket and
//! WebSocket-over-TLS connections and hands each one to
//! [`crate::session::run_session`]. A connection's transport kind never
//! changes the session state machine, only how bytes reach it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::error::{NodeError, Result};
use crate::session::{run_session, SessionContext};
use crate::tls_util::TlsMaterial;

/// Accepts raw TCP connections and hands each to `run_session`. Runs for
/// the lifetime of the node.
pub async fn serve_tcp(bind_addr: SocketAddr, ctx: Arc<SessionContext>) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await.map_err(NodeError::Io)?;
    info!("tcp listener bound on {bind_addr}");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("tcp accept failed: {e}");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(stream);
            run_session(reader, writer, protocol::TransportKind::Tcp, ctx).await;
        });
        let _ = peer;
    }
}

/// Accepts TLS-wrapped TCP connections and hands each to `run_session`
/// after completing the handshake.
pub async fn serve_tls(bind_addr: SocketAddr, tls: Arc<TlsMaterial>, ctx: Arc<SessionContext>) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await.map_err(NodeError::Io)?;
    let acceptor = TlsAcceptor::from(tls.server_config()?);
    info!("tls listener bound on {bind_addr}");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("tls accept failed: {e}");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    warn!("tls handshake with {peer} failed: {e}");
                    return;
                }
            };
            let (reader, writer) = tokio::io::split(tls_stream);
            run_session(reader, writer, protocol::TransportKind::Tls, ctx).await;
        });
    }
}

/// Builds the `axum::Router` shared by the WS and WSS listeners: a single
/// upgrade route at `ws_path`.
fn router(ctx: Arc<SessionContext>, ws_path: &str) -> Router {
    Router::new().route(ws_path, get(ws_upgrade)).with_state(ctx)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(ctx): State<Arc<SessionContext>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let reader = WsReader { stream, buf: VecDeque::new() };
        let writer = WsWriter { sink };
        run_session(reader, writer, protocol::TransportKind::Ws, ctx).await;
    })
}

/// Serves plain (unencrypted) WebSocket connections at `ws_path`.
pub async fn serve_ws(bind_addr: SocketAddr, ws_path: &str, ctx: Arc<SessionContext>) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await.map_err(NodeError::Io)?;
    info!("ws listener bound on {bind_addr}{ws_path}");
    axum::serve(listener, router(ctx, ws_path))
        .await
        .map_err(|e| NodeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

/// Serves WebSocket-over-TLS connections at `ws_path`. `axum::serve` has no
/// TLS termination of its own, so this uses `axum-server`'s rustls
/// acceptor instead.
pub async fn serve_wss(bind_addr: SocketAddr, ws_path: &str, tls: Arc<TlsMaterial>, ctx: Arc<SessionContext>) -> Result<()> {
    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_config(tls.server_config()?);
    info!("wss listener bound on {bind_addr}{ws_path}");
    axum_server::bind_rustls(bind_addr, rustls_config)
        .serve(router(ctx, ws_path).into_make_service())
        .await
        .map_err(|e| NodeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

/// Adapts the read half of an `axum` WebSocket into an `AsyncRead` byte
/// stream: binary frame payloads are queued and drained in arrival order,
/// matching the length-prefixed frame codec's expectation of a plain byte
/// stream regardless of transport.
struct WsReader {
    stream: SplitStream<WebSocket>,
    buf: VecDeque<u8>,
}

impl AsyncRead for WsReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        loop {
            if !self.buf.is_empty() {
                let n = out.remaining().min(self.buf.len());
                let chunk: Vec<u8> = self.buf.drain(..n).collect();
                out.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(bytes)))) => {
                    self.buf.extend(bytes);
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Adapts the write half of an `axum` WebSocket into an `AsyncWrite` byte
/// stream: every `write_all` call is sent as one binary frame.
struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

impl AsyncWrite for WsWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => match Pin::new(&mut self.sink).start_send(Message::Binary(buf.to_vec())) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(e) => Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))),
            },
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.sink)
            .poll_flush(cx)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.sink)
            .poll_close(cx)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

#[allow(dead_code)]
fn log_transport_error(transport: protocol::TransportKind, err: &NodeError) {
    error!("{transport} listener exited: {err}");
}
