//! WebSocket accept loop and admission boundary.
//!
//! Everything here runs before the core sees a client: the TCP accept, the
//! WebSocket upgrade, the document id shape check, and the access decision.
//! Authentication itself (token validation, session issuance) belongs to the
//! embedding service; this adapter only requires that a caller identity
//! arrives on the upgrade request and that the [`AccessPolicy`] admits it.
//! Once admitted, the upgraded channel is handed to `RoomManager::join` and
//! the core takes over.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::bus::Bus;
use crate::config::CollabConfig;
use crate::manager::RoomManager;
use crate::storage::SnapshotStore;
use crate::transport::WsChannel;

/// Longest admissible document id.
pub const MAX_DOC_ID_LEN: usize = 50;

/// Admission errors.
#[derive(Debug, Clone)]
pub enum AdmissionError {
    /// No caller identity on the request
    MissingIdentity,
    /// Document id fails the shape rules
    InvalidDocumentId,
    /// Document does not exist
    NotFound(String),
    /// Caller is neither owner nor on the access list
    AccessDenied(String),
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingIdentity => write!(f, "No caller identity established"),
            Self::InvalidDocumentId => write!(f, "Invalid document id"),
            Self::NotFound(id) => write!(f, "Document not found: {id}"),
            Self::AccessDenied(id) => write!(f, "Access denied for document: {id}"),
        }
    }
}

impl std::error::Error for AdmissionError {}

/// Document access decisions, made before a client reaches the core.
///
/// Implementors verify the document exists and that `caller` is its owner
/// or appears on its access list.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn authorize(&self, caller: &str, doc_id: &str) -> Result<(), AdmissionError>;
}

/// Policy that admits every established caller (development and tests).
pub struct OpenAccess;

#[async_trait]
impl AccessPolicy for OpenAccess {
    async fn authorize(&self, _caller: &str, _doc_id: &str) -> Result<(), AdmissionError> {
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Core tuning constants
    pub collab: CollabConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8081".to_string(),
            collab: CollabConfig::default(),
        }
    }
}

/// The collaboration server: accept loop plus admission.
pub struct CollabServer {
    config: ServerConfig,
    manager: Arc<RoomManager>,
    policy: Arc<dyn AccessPolicy>,
}

impl CollabServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn SnapshotStore>,
        bus: Arc<dyn Bus>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        let manager = RoomManager::new(config.collab.clone(), store, bus);
        Self {
            config,
            manager,
            policy,
        }
    }

    /// The room directory behind this server.
    pub fn manager(&self) -> &Arc<RoomManager> {
        &self.manager
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Accept WebSocket connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let manager = self.manager.clone();
            let policy = self.policy.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, manager, policy).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        manager: Arc<RoomManager>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut doc_id = String::new();
        let mut caller: Option<String> = None;

        // The upgrade callback is synchronous: only the request shape is
        // checked here. The async policy decision runs right after the
        // upgrade and closes denied connections before the core sees them.
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match doc_path(req.uri().path()) {
                Some(id) => doc_id = id.to_string(),
                None => return Err(reject(StatusCode::BAD_REQUEST)),
            }
            caller = bearer_caller(req);
            Ok(resp)
        })
        .await?;

        log::info!("WebSocket connection established from {addr}");

        let Some(caller) = caller else {
            log::warn!("Rejected connection from {addr}: {}", AdmissionError::MissingIdentity);
            let _ = ws.close(None).await;
            return Ok(());
        };

        if let Err(e) = policy.authorize(&caller, &doc_id).await {
            log::warn!("Rejected caller {caller} from {addr}: {e}");
            let _ = ws.close(None).await;
            return Ok(());
        }

        manager.join(&doc_id, Box::new(WsChannel::new(ws))).await;
        Ok(())
    }
}

/// Extract the document id from a `/ws/<doc_id>` path, enforcing the
/// admissible shape (length in [1, MAX_DOC_ID_LEN], single segment).
fn doc_path(path: &str) -> Option<&str> {
    let doc_id = path.strip_prefix("/ws/")?;
    if doc_id.is_empty() || doc_id.len() > MAX_DOC_ID_LEN || doc_id.contains('/') {
        return None;
    }
    Some(doc_id)
}

/// Caller identity established by the upstream auth layer, carried as a
/// bearer token on the upgrade request.
fn bearer_caller(req: &Request) -> Option<String> {
    let value = req.headers().get("authorization")?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut resp = ErrorResponse::new(None);
    *resp.status_mut() = status;
    resp
}
