//! WebSocket accept loop. One task per connection; frames are handled
//! sequentially per session, so a device's records are processed in arrival
//! order. A session's role is discovered from its first command.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::common::error::{FaceGateError, Result};
use crate::service::router::Router;
use crate::service::session::{SessionHandle, SessionRole};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server {
    router: Arc<Router>,
}

impl Server {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub async fn run(&self, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("listening on ws://{}", addr);

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let router = self.router.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, router).await {
                                    tracing::debug!(%peer, "connection ended: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept failed: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Devices get a purge command pair before their sessions close; the
        // server waits for each connection task to finish sending.
        tracing::info!("shutting down, draining sessions");
        self.router.drain_sessions().await;

        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("sessions did not drain in time, aborting remaining connections");
            connections.shutdown().await;
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, router: Arc<Router>) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| FaceGateError::Transport(e.to_string()))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Writer task drains the session's outbound queue; a close frame ends it
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_tx.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let session = SessionHandle::new(router.registry().allocate_session_id(), peer, out_tx);
    let mut role = SessionRole::Unknown;
    tracing::debug!(session = session.id, %peer, "connection open");

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                router.handle_frame(&session, &mut role, &text).await;
            }
            Ok(Message::Ping(payload)) => {
                session.send_raw(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(session = session.id, "read error: {}", e);
                break;
            }
        }
    }

    router.handle_disconnect(session.id).await;
    session.close();
    let _ = writer.await;
    tracing::debug!(session = session.id, %peer, ?role, "connection closed");
    Ok(())
}
