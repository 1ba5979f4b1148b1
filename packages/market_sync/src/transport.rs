//! Transport seam between the connection manager and the wire.
//!
//! A [`Connector`] opens one [`Link`] per connection attempt. The link is a
//! pair of queues: the manager pushes [`ClientEvent`]s into `outbound` and
//! drains [`TransportEvent`]s from `inbound`. The WebSocket implementation
//! bridges those queues to a socket with a writer task and a reader task.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, warn};

use crate::error::SyncError;
use crate::models::Credential;
use crate::protocol::{ClientEvent, ServerEvent};

/// What the transport reports back to the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Event(ServerEvent),
    /// The peer closed the socket.
    Closed { reason: String },
    /// Read or write failure; the link is dead.
    Error(String),
}

/// One established connection.
pub struct Link {
    pub outbound: mpsc::Sender<ClientEvent>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to the live channel.
///
/// `Err(SyncError::Auth)` means the credential was rejected and must not be
/// retried; any other error is treated as a transient connection failure.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<Link, SyncError>>;
}

/// WebSocket connector (JSON text frames, bearer auth on the upgrade request).
pub struct WsConnector {
    url: String,
    capacity: usize,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, capacity: usize) -> Self {
        Self {
            url: url.into(),
            capacity: capacity.max(1),
        }
    }

    async fn open(&self, credential: &Credential) -> Result<Link, SyncError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Connection(format!("invalid live channel url: {e}")))?;
        let auth = HeaderValue::from_str(&credential.bearer())
            .map_err(|_| SyncError::Auth("credential is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        debug!(url = %self.url, "opening live channel");
        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => stream,
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                return Err(match status {
                    401 | 403 => SyncError::Auth(format!("live channel returned {status}")),
                    code => SyncError::Connection(format!("live channel HTTP error {code}")),
                });
            }
            Err(e) => return Err(SyncError::Connection(e.to_string())),
        };

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientEvent>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(self.capacity);

        // Writer: drain outbound queue → socket. Closing the queue closes the socket.
        let writer_in_tx = in_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let text = match event.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(event = event.name(), "failed to encode client event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    let _ = writer_in_tx
                        .send(TransportEvent::Error(format!("write failed: {e}")))
                        .await;
                    return;
                }
            }
            let _ = ws_tx.close().await;
            debug!("live channel writer closed");
        });

        // Reader: socket → validated server events.
        tokio::spawn(async move {
            let end = loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if in_tx.send(TransportEvent::Event(event)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("dropping malformed frame: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        break TransportEvent::Closed { reason };
                    }
                    Some(Ok(Message::Binary(_))) => debug!("ignoring binary frame"),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break TransportEvent::Error(e.to_string()),
                    None => {
                        break TransportEvent::Closed {
                            reason: "stream ended".to_string(),
                        };
                    }
                }
            };
            let _ = in_tx.send(end).await;
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl Connector for WsConnector {
    fn connect<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<Link, SyncError>> {
        Box::pin(self.open(credential))
    }
}
