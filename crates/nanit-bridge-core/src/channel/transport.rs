//! Transport seam for control channels.
//!
//! A `Connector` opens one channel and hands back a pair of queues: frames to
//! send, and frames/close notifications received. The controller never touches
//! the socket directly, so channel lifecycle is driven entirely by these events.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

/// Base URL of the camera control endpoint
pub const DEFAULT_CONTROL_BASE_URL: &str = "wss://api.nanit.com";

/// Queue depth between the controller and the socket tasks
const CHANNEL_BUFFER_SIZE: usize = 32;

#[derive(Debug)]
pub enum Outbound {
    Frame(Vec<u8>),
    Close,
}

#[derive(Debug)]
pub enum Inbound {
    Frame(Vec<u8>),
    Closed(Option<String>),
}

/// An open control channel.
pub struct Transport {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<Inbound>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    #[error("endpoint rejected the connection with status {0}")]
    Rejected(u16),

    #[error("{0}")]
    Failed(String),
}

impl OpenError {
    /// The bearer token was refused
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, OpenError::Rejected(401) | OpenError::Rejected(403))
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel to the camera addressed by `stream_target`. Resolves once
    /// the channel is open or has failed to open.
    async fn open(&self, stream_target: &str, bearer_token: &str) -> Result<Transport, OpenError>;
}

/// WebSocket connector for the camera control endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, stream_target: &str) -> String {
        format!("{}/focus/cameras/{}/user_connect", self.base_url, stream_target)
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_BASE_URL)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, stream_target: &str, bearer_token: &str) -> Result<Transport, OpenError> {
        let url = self.url(stream_target);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| OpenError::Failed(e.to_string()))?;
        let authorization = HeaderValue::from_str(&format!("Bearer {}", bearer_token))
            .map_err(|e| OpenError::Failed(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, authorization);

        let (ws_stream, _) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(response) => OpenError::Rejected(response.status().as_u16()),
            other => OpenError::Failed(other.to_string()),
        })?;
        debug!(%url, "WebSocket open");

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(CHANNEL_BUFFER_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(CHANNEL_BUFFER_SIZE);

        // Writer: drains outbound frames until asked to close or the controller lets go
        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Frame(bytes) => {
                        if let Err(e) = write.send(Message::Binary(bytes)).await {
                            warn!(error = %e, "Failed to write control frame");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = write.close().await;
        });

        // Reader: forwards binary frames, reports the close reason exactly once
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = inbound_tx.closed() => return,
                    message = read.next() => match message {
                        Some(Ok(Message::Binary(bytes))) => {
                            if inbound_tx.send(Inbound::Frame(bytes)).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map(|f| format!("{} {}", u16::from(f.code), f.reason));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break None,
                    },
                }
            };
            let _ = inbound_tx.send(Inbound::Closed(reason)).await;
        });

        Ok(Transport {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
