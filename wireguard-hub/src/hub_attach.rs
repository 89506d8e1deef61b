//! C11: "hub-attach" — the hub's own synthetic WireGuard peer. It runs a
//! second [`Engine`] under a freshly generated identity, registers it as a
//! peer of the primary engine (`allowed_ip = hub_address/32`), and registers
//! the primary back as its own only peer (`allowed_ip = 0.0.0.0/0`,
//! keepalive every 5s so the "link" never looks dead). Everything either
//! engine decrypts that's addressed to the hub's own overlay IP ends up on
//! the secondary engine's loopback device, which C4's netstack reads from.
//!
//! This closes what would otherwise be a cyclic reference: the primary's
//! peer table needs the secondary's public key and endpoint, and the
//! secondary's only peer is the primary. Resolved by build order: bring the primary up
//! first (it doesn't need the secondary yet to accept ordinary peer
//! traffic), construct and bring up the secondary second, then register the
//! secondary into the primary's table last.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use boringtun::x25519::StaticSecret;
use ipnet::Ipv4Net;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::engine::{Engine, Outgoing};
use crate::loopback::{self, EngineSide, UpperSide};
use crate::udp::UdpBind;

const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// The hub's attached peer: a second engine with its own generated keypair
/// and its own loopback-bound UDP socket, running its own receive/tick loop
/// independent of the primary's.
pub struct HubAttach {
    pub engine: Arc<Engine>,
}

/// Brings the secondary engine up, binds it its own loopback UDP socket,
/// wires both engines' peer tables, and spawns its driver loop.
///
/// `primary` must already be up. `hub_address` is the hub's own `/32` on the
/// overlay; `primary_endpoint` is where the secondary should send datagrams
/// to reach the primary (typically `127.0.0.1:<primary's bound port>`).
pub async fn attach(
    primary: &Engine,
    hub_address: Ipv4Net,
    primary_endpoint: SocketAddr,
) -> (HubAttach, UpperSide) {
    let secondary_private = generate_private_key();
    let secondary = Arc::new(Engine::new(secondary_private, 0));
    secondary.up().await;
    secondary.set_own_address(hub_address.addr());

    let (bind, bound_port) = UdpBind::bind(Some("127.0.0.1"), 0)
        .await
        .expect("binding an ephemeral loopback UDP socket never fails");
    let bind = Arc::new(bind);

    let default_route = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("0.0.0.0/0 is always valid");
    let primary_peer_blob = format!(
        "public_key={}\nallowed_ip={}\nendpoint={}\npersistent_keepalive_interval=5\n",
        hex::encode(primary.public_key().as_bytes()),
        default_route,
        primary_endpoint,
    );
    secondary
        .set(&primary_peer_blob)
        .await
        .expect("well-formed IPC blob for a freshly generated peer");

    let secondary_endpoint: SocketAddr = format!("127.0.0.1:{bound_port}").parse().expect("valid loopback address");
    let secondary_peer_blob = format!(
        "public_key={}\nallowed_ip={}/32\nendpoint={}\n",
        hex::encode(secondary.public_key().as_bytes()),
        hub_address.addr(),
        secondary_endpoint,
    );
    primary
        .set(&secondary_peer_blob)
        .await
        .expect("well-formed IPC blob for a freshly generated peer");

    let (engine_side, upper_side) = loopback::channel();

    tracing::info!(
        hub_public_key = %hex::encode(secondary.public_key().as_bytes()),
        hub_address = %hub_address.addr(),
        port = bound_port,
        "hub-attach peer online",
    );

    tokio::spawn(run_driver(secondary.clone(), bind, engine_side));

    (HubAttach { engine: secondary }, upper_side)
}

/// Drives the secondary engine: pumps inbound datagrams and periodic timer
/// ticks, and shuttles plaintext to/from the loopback device the netstack
/// reads from. Mirrors the main driver loop a primary engine runs, just
/// scoped to a single peer (the primary) and a single loopback route (the
/// hub's own overlay address).
async fn run_driver(engine: Arc<Engine>, bind: Arc<UdpBind>, mut engine_side: EngineSide) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);

    loop {
        tokio::select! {
            received = bind.recv_from() => {
                let Ok((datagram, src)) = received else { continue };
                let outgoing = engine.handle_datagram(src, &datagram).await;
                dispatch(&bind, &mut engine_side, outgoing).await;
            }
            _ = ticker.tick() => {
                let outgoing = engine.tick().await;
                dispatch(&bind, &mut engine_side, outgoing).await;
            }
            reply = engine_side.recv_down() => {
                let Ok(packet) = reply else { return };
                if let Some((addr, datagram)) = engine.encapsulate_outbound(&packet).await {
                    let _ = bind.send_to(&datagram, addr).await;
                }
            }
        }
    }
}

async fn dispatch(bind: &Arc<UdpBind>, engine_side: &mut EngineSide, outgoing: Vec<Outgoing>) {
    for item in outgoing {
        match item {
            Outgoing::ToNetwork(addr, datagram) => {
                let _ = bind.send_to(&datagram, addr).await;
            }
            Outgoing::ToLoopback(packet) => {
                let _ = engine_side.send_up(packet).await;
            }
        }
    }
}

fn generate_private_key() -> StaticSecret {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    StaticSecret::from(bytes)
}
