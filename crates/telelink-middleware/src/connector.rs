//! Socket opening seam.
//!
//! [`TransportLink`][crate::transport_link::TransportLink] never touches a
//! WebSocket directly. It asks a [`SocketConnector`] for a [`SocketSession`]
//! (an outgoing text sink plus an incoming text stream) and drives that.
//! Production code uses [`WebSocketConnector`]; tests script their own
//! sessions.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use telelink_types::LinkError;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, warn};

/// One open socket.
///
/// Dropping every clone of `outgoing` closes the socket. The `incoming`
/// stream ends when the peer closes and yields an error when the transport
/// fails.
pub struct SocketSession {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: BoxStream<'static, Result<String, LinkError>>,
}

/// Client handshake request for `url`, carrying `Authorization: Bearer`
/// when a token is configured.
pub(crate) fn authorized_request(url: &str, token: Option<&str>) -> Result<Request, LinkError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| LinkError::Connection(format!("invalid socket url {url}: {e}")))?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| LinkError::Connection(format!("invalid auth token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

/// Opens command sockets.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a socket to `url`. Callers bound this with their own timeout.
    async fn open(&self, url: &str) -> Result<SocketSession, LinkError>;
}

/// [`SocketConnector`] backed by `tokio-tungstenite`.
#[derive(Default)]
pub struct WebSocketConnector {
    auth_token: Option<String>,
}

impl WebSocketConnector {
    pub fn new(auth_token: Option<String>) -> Self {
        Self { auth_token }
    }
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<SocketSession, LinkError> {
        let request = authorized_request(url, self.auth_token.as_deref())?;
        let (ws_stream, _response) = connect_async(request)
            .await
            .map_err(|e| LinkError::Connection(format!("{url}: {e}")))?;
        let (mut ws_tx, ws_rx) = ws_stream.split();

        let (outgoing, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    warn!(error = %e, "socket write failed");
                    break;
                }
            }
            // Every sender is gone: the link let go of the socket.
            if let Err(e) = ws_tx.close().await {
                debug!(error = %e, "socket close");
            }
        });

        let incoming = stream::unfold(ws_rx, |mut ws_rx| async move {
            loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Some((Ok(text.as_str().to_owned()), ws_rx));
                    }
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Some((Err(LinkError::Transport(e.to_string())), ws_rx));
                    }
                }
            }
        })
        .boxed();

        Ok(SocketSession { outgoing, incoming })
    }
}
