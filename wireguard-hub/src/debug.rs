//! C12: the read-only debug surface, served over the netstack tun alongside
//! the control API when `--debug-server` is set. A single unauthenticated
//! `GET /` dumping the primary engine's own IPC `get()` text, with the
//! `private_key` line always redacted: this surface never leaks a private
//! key, even over a loopback-only listener.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;

use crate::engine::Engine;
use crate::netstack::{NetstackListener, NetstackStream};

const REDACTED_PRIVATE_KEY_LINE: &str = "private_key=[...]";

/// Serves the debug dump over a netstack TCP listener. Blocks until the
/// listener's connection channel closes.
pub async fn serve(engine: Arc<Engine>, connections: mpsc::Receiver<NetstackStream>) {
    let router = Router::new().route("/", get(dump)).with_state(engine);

    if let Err(error) = axum::serve(NetstackListener::new(connections), router.into_make_service()).await {
        tracing::warn!(%error, "debug server exited");
    }
}

async fn dump(axum::extract::State(engine): axum::extract::State<Arc<Engine>>) -> String {
    engine
        .get()
        .await
        .lines()
        .map(|line| if line.starts_with("private_key=") { REDACTED_PRIVATE_KEY_LINE } else { line })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use boringtun::x25519::StaticSecret;

    use super::*;

    #[tokio::test]
    async fn dump_redacts_private_key_but_keeps_everything_else() {
        let engine = Arc::new(Engine::new(StaticSecret::from([1u8; 32]), 51820));
        let secret_hex = hex::encode([7u8; 32]);
        engine.set(&format!("private_key={secret_hex}\nlisten_port=51820\n")).await.unwrap();

        let text = dump(axum::extract::State(engine)).await;

        assert!(!text.contains(&secret_hex));
        assert!(text.contains(REDACTED_PRIVATE_KEY_LINE));
        assert!(text.contains("listen_port=51820"));
    }
}
