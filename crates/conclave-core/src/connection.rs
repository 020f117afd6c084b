//! Client-side websocket connection to the Registry/Router: up to 3
//! reconnect attempts with a 3 s back-off on both send and receive
//! failures, and no ping timeout on the underlying socket (the Router
//! drives liveness, not the client).

use std::time::Duration;

use conclave_schema::AgentMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("received message could not be decoded as an AgentMessage: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("not connected to the router")]
    NotConnected,
    #[error("exhausted {attempts} reconnect attempts against {url}")]
    ReconnectExhausted { attempts: u32, url: String },
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One client's connection to the Router's `/ws/{agent_name}` endpoint.
/// Holds at most one live socket; send and receive both reconnect
/// independently on failure rather than sharing a single retry budget.
pub struct ConnectionManager {
    url: String,
    socket: tokio::sync::Mutex<Option<Socket>>,
}

impl ConnectionManager {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            socket: tokio::sync::Mutex::new(None),
        }
    }

    async fn connect_once(&self) -> Result<Socket, ConnError> {
        let (socket, _response) = tokio_tungstenite::connect_async(&self.url).await?;
        Ok(socket)
    }

    /// Establishes a socket if none is held, retrying up to `MAX_ATTEMPTS`
    /// times with `RETRY_BACKOFF` between attempts.
    async fn ensure_connected(&self) -> Result<(), ConnError> {
        let mut guard = self.socket.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.connect_once().await {
                Ok(socket) => {
                    *guard = Some(socket);
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(attempt, url = %self.url, error = %err, "router connect attempt failed");
                    last_err = Some(err);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
        let _ = last_err;
        Err(ConnError::ReconnectExhausted {
            attempts: MAX_ATTEMPTS,
            url: self.url.clone(),
        })
    }

    fn drop_socket_locked(guard: &mut Option<Socket>) {
        *guard = None;
    }

    /// Sends one message, reconnecting and retrying up to `MAX_ATTEMPTS`
    /// times on transport failure. The socket is torn down between
    /// attempts so a stale connection isn't retried verbatim.
    pub async fn send(&self, message: &AgentMessage) -> Result<(), ConnError> {
        let payload = serde_json::to_string(message).expect("AgentMessage always serializes");

        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            self.ensure_connected().await?;
            let mut guard = self.socket.lock().await;
            let result = match guard.as_mut() {
                Some(socket) => socket.send(WsMessage::Text(payload.clone().into())).await,
                None => return Err(ConnError::NotConnected),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "router send failed, reconnecting");
                    Self::drop_socket_locked(&mut guard);
                    last_err = Some(err);
                    drop(guard);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
        Err(last_err.map(ConnError::from).unwrap_or(ConnError::NotConnected))
    }

    /// Receives and decodes one message, reconnecting and retrying up to
    /// `MAX_ATTEMPTS` times on transport failure. A malformed payload is
    /// not retried: reconnecting would not fix a parse error, so it
    /// surfaces immediately as `ConnError::Malformed`.
    pub async fn recv(&self) -> Result<AgentMessage, ConnError> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            self.ensure_connected().await?;
            let mut guard = self.socket.lock().await;
            let next = match guard.as_mut() {
                Some(socket) => socket.next().await,
                None => return Err(ConnError::NotConnected),
            };
            match next {
                Some(Ok(WsMessage::Text(text))) => {
                    return serde_json::from_str(&text).map_err(ConnError::Malformed);
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    tracing::warn!(attempt, "router socket closed, reconnecting");
                    Self::drop_socket_locked(&mut guard);
                    drop(guard);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    tracing::warn!(attempt, error = %err, "router recv failed, reconnecting");
                    Self::drop_socket_locked(&mut guard);
                    last_err = Some(err);
                    drop(guard);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
        Err(last_err.map(ConnError::from).unwrap_or(ConnError::NotConnected))
    }
}
