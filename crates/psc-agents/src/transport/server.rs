//! Inbound side of the transport.
//!
//! `POST /accl` takes an [`Envelope`], pushes it onto the agent's inbox and
//! acknowledges at once; the reactor handles it later, in arrival order.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::error::AgentError;
use crate::transport::message::{Envelope, Reply};

/// Distance between successive candidate ports.
pub const PORT_STEP: u16 = 20;

/// Candidate ports tried before giving up.
pub const PORT_ATTEMPTS: u32 = 100;

#[derive(Clone)]
struct InboxState {
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Builds the agent endpoint router.
pub fn build_router(tx: mpsc::UnboundedSender<Envelope>) -> Router {
    Router::new()
        .route("/accl", post(accept))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(InboxState { tx })
}

async fn accept(State(state): State<InboxState>, Json(envelope): Json<Envelope>) -> Json<Reply> {
    tracing::trace!(
        message = envelope.message.name(),
        from = ?envelope.from,
        "inbound message"
    );
    let accepted = state.tx.send(envelope).is_ok();
    Json(Reply { accepted })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// A bound and serving endpoint.
#[derive(Debug)]
pub struct Inbound {
    pub port: u16,
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
    pub server: JoinHandle<()>,
}

impl Inbound {
    /// Binds near `preferred_port` and starts serving.
    ///
    /// Port 0 asks the OS for an ephemeral port. Otherwise a taken port is
    /// skipped in steps of [`PORT_STEP`], at most [`PORT_ATTEMPTS`] times.
    pub async fn open(preferred_port: u16) -> Result<Inbound, AgentError> {
        let listener = bind(preferred_port).await?;
        let port = listener
            .local_addr()
            .map_err(|source| AgentError::Bind {
                port: preferred_port,
                source,
            })?
            .port();

        let (tx, inbox) = mpsc::unbounded_channel();
        let app = build_router(tx);
        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "agent endpoint stopped");
            }
        });
        tracing::debug!(port, "agent endpoint listening");

        Ok(Inbound {
            port,
            inbox,
            server,
        })
    }
}

async fn bind(preferred_port: u16) -> Result<TcpListener, AgentError> {
    if preferred_port == 0 {
        return TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .map_err(|source| AgentError::Bind { port: 0, source });
    }

    let mut port = preferred_port;
    for attempt in 1..=PORT_ATTEMPTS {
        match TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == ErrorKind::AddrInUse => {
                tracing::debug!(port, attempt, "port taken");
                match port.checked_add(PORT_STEP) {
                    Some(next) => port = next,
                    None => break,
                }
            }
            Err(source) => return Err(AgentError::Bind { port, source }),
        }
    }
    Err(AgentError::PortsExhausted {
        first: preferred_port,
        attempts: PORT_ATTEMPTS,
    })
}
