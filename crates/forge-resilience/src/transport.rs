use async_trait::async_trait;
use forge_core::Channel;
use forge_protocol::events::SET_INTERVAL;
use forge_protocol::{ClientMessage, Envelope};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// The link a controller drives.
///
/// `recv` must be cancel safe: the controller races it against its own
/// timers and drops the future when a timer wins.
#[async_trait]
pub trait Transport: Send {
    /// Establish the link. Called again after every failure.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Next authentic payload. Any error means the link is gone.
    async fn recv(&mut self) -> Result<Value, TransportError>;

    /// Drop the link. Safe to call when not connected.
    async fn disconnect(&mut self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for one gateway channel at `<base>/ws/<channel>`.
///
/// Yields the `data` of every success envelope carrying the channel's event
/// name; acks, heartbeats and error envelopes are logged and skipped.
pub struct WsTransport {
    url: String,
    channel: Channel,
    interval_ms: Option<u64>,
    stream: Option<WsStream>,
}

impl WsTransport {
    /// `base` is the gateway root, e.g. `ws://127.0.0.1:3333`.
    pub fn new(base: &str, channel: Channel) -> Self {
        Self {
            url: format!("{}/ws/{}", base.trim_end_matches('/'), channel),
            channel,
            interval_ms: None,
            stream: None,
        }
    }

    /// Ask the gateway for a per-connection cadence after every connect.
    pub fn with_interval(mut self, interval_ms: u64) -> Self {
        self.interval_ms = Some(interval_ms);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let (mut stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        if let Some(ms) = self.interval_ms {
            let request = ClientMessage::new(SET_INTERVAL, Some(json!(ms)));
            let text = serde_json::to_string(&request)
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            stream
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        }

        info!(url = %self.url, "transport connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Value, TransportError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::Lost("not connected".into()));
        };
        let expected = self.channel.event_name();

        loop {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(TransportError::Lost(e.to_string()));
                }
                None => {
                    self.stream = None;
                    return Err(TransportError::Lost("stream ended".into()));
                }
            };

            match message {
                Message::Text(text) => {
                    let envelope: Envelope = match serde_json::from_str(text.as_str()) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(url = %self.url, error = %e, "unparseable frame skipped");
                            continue;
                        }
                    };
                    if envelope.is_success() && envelope.event == expected {
                        return Ok(envelope.data);
                    }
                    debug!(url = %self.url, event = %envelope.event, status = ?envelope.status, "frame skipped");
                }
                Message::Close(frame) => {
                    self.stream = None;
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .unwrap_or_else(|| "closed by server".into());
                    return Err(TransportError::Lost(reason));
                }
                // tungstenite answers pings on its own
                _ => {}
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                debug!(url = %self.url, error = %e, "close handshake failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_is_built_from_base_and_channel() {
        let t = WsTransport::new("ws://127.0.0.1:3333/", Channel::Metrics);
        assert_eq!(t.url(), "ws://127.0.0.1:3333/ws/metrics");
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn recv_without_connect_is_lost() {
        let mut t = WsTransport::new("ws://127.0.0.1:1", Channel::Health);
        let err = t.recv().await.unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_LOST");
        t.disconnect().await;
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let mut t = WsTransport::new("ws://127.0.0.1:1", Channel::Health);
        assert!(matches!(
            t.connect().await,
            Err(TransportError::ConnectFailed(_))
        ));
    }
}
