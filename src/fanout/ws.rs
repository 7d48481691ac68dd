use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{ConnectionRegistry, SubscriptionScope};

/// How long a fresh connection gets to present a token before it is
/// treated as anonymous.
const AUTH_WINDOW: Duration = Duration::from_secs(2);

/// Maps bearer tokens to subjects. Verification is synchronous; the
/// registry never sees tokens, only the resolved subject.
pub trait AuthVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Option<String>;
}

/// Rejects every token, so all connections come in anonymous.
pub struct NoAuth;

impl AuthVerifier for NoAuth {
    fn verify(&self, _token: &str) -> Option<String> {
        None
    }
}

/// Fixed token table loaded at startup.
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: pairs.into_iter().collect(),
        }
    }
}

impl AuthVerifier for StaticTokens {
    fn verify(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

#[derive(Deserialize)]
struct ClientHello {
    token: Option<String>,
}

/// Accept loop. Each connection gets its own reader/writer pair; a slow
/// or dead socket only ever loses its own events.
pub async fn serve(
    listen: &str,
    registry: Arc<ConnectionRegistry>,
    verifier: Arc<dyn AuthVerifier>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(addr = listen, "subscriber endpoint listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = registry.clone();
        let verifier = verifier.clone();
        tokio::spawn(async move {
            debug!(%peer, "incoming connection");
            if let Err(e) = handle_connection(stream, registry, verifier).await {
                debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<ConnectionRegistry>,
    verifier: Arc<dyn AuthVerifier>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut writer, mut reader) = ws.split();

    // Optional hello frame: a valid token upgrades the connection to the
    // full feed, anything else (or silence) means anonymous recent-only.
    let mut subject = None;
    if let Ok(Some(Ok(Message::Text(first)))) =
        tokio::time::timeout(AUTH_WINDOW, reader.next()).await
    {
        if let Ok(hello) = serde_json::from_str::<ClientHello>(&first) {
            if let Some(token) = hello.token {
                match verifier.verify(&token) {
                    Some(s) => subject = Some(s),
                    None => {
                        warn!("rejected connection with invalid token");
                        let _ = writer.close().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    let scope = if subject.is_some() {
        SubscriptionScope::Full
    } else {
        SubscriptionScope::RecentOnly
    };
    let (id, queue) = registry.register(subject, scope);

    // Single loop over both halves. The queue is closed by the registry on
    // unregister or a stale sweep, which ends the loop and drops the socket.
    loop {
        tokio::select! {
            event = queue.next() => {
                let Some(event) = event else {
                    let _ = writer.close().await;
                    break;
                };
                let payload = match serde_json::to_string(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(connection = id, error = %e, "failed to encode event");
                        continue;
                    }
                };
                if writer.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Text(_)))
                    | Some(Ok(Message::Ping(_)))
                    | Some(Ok(Message::Pong(_))) => {
                        registry.record_heartbeat(id);
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    registry.unregister(id);
    Ok(())
}

/// Periodically drops connections that stopped sending heartbeats.
pub fn spawn_heartbeat_sweeper(registry: Arc<ConnectionRegistry>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let swept = registry.sweep_stale();
            if !swept.is_empty() {
                info!(count = swept.len(), "swept stale connections");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_tokens_resolve_subjects() {
        let v = StaticTokens::new([("secret-1".to_string(), "alice".to_string())]);
        assert_eq!(v.verify("secret-1").as_deref(), Some("alice"));
        assert_eq!(v.verify("wrong"), None);
        assert_eq!(NoAuth.verify("anything"), None);
    }
}
