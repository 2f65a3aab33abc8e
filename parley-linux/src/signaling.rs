//! Rendezvous connection: a WebSocket carrying JSON signals.

use anyhow::{anyhow, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_core::{ClientSignal, ServerSignal};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Signaling {
    write: SplitSink<Ws, Message>,
    read: SplitStream<Ws>,
}

/// The server learns who we are from the `userId` query parameter.
pub fn session_url(base: &str, peer_id: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}userId={}", base, sep, peer_id)
}

impl Signaling {
    pub async fn connect(base: &str, peer_id: &str) -> Result<Self> {
        let url = session_url(base, peer_id);
        let (ws, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("connecting to {}", base))?;
        log::info!("connected to rendezvous server {}", base);
        let (write, read) = ws.split();
        Ok(Self { write, read })
    }

    pub async fn send(&mut self, signal: &ClientSignal) -> Result<()> {
        let text = signal.encode()?;
        log::debug!("signal out: {}", text);
        self.write
            .send(Message::text(text))
            .await
            .map_err(|e| anyhow!(e))
    }

    /// Next decodable signal. `Ok(None)` when the server closed the connection;
    /// undecodable text and non-text messages are skipped.
    pub async fn next(&mut self) -> Result<Option<ServerSignal>> {
        while let Some(msg) = self.read.next().await {
            let msg = msg?;
            if msg.is_close() {
                return Ok(None);
            }
            if !msg.is_text() {
                continue;
            }
            let text = msg.to_text()?;
            match ServerSignal::decode(text) {
                Ok(signal) => return Ok(Some(signal)),
                Err(e) => log::warn!("dropping malformed signal: {}", e),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_goes_in_the_query() {
        assert_eq!(
            session_url("ws://host/ws", "alice"),
            "ws://host/ws?userId=alice"
        );
        assert_eq!(
            session_url("ws://host/ws?v=2", "alice"),
            "ws://host/ws?v=2&userId=alice"
        );
    }
}
