#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use boringtun::x25519::StaticSecret;
use clap::Parser;
use rand::rngs::OsRng;
use rand::RngCore;

mod api;
mod cli;
mod config;
mod debug;
mod engine;
mod error;
mod hub_attach;
mod ipc;
mod logging;
mod loopback;
mod netstack;
mod peer;
mod udp;

use cli::Cli;
use engine::{Engine, Outgoing};
use udp::UdpBind;

const TICK_INTERVAL: Duration = Duration::from_millis(250);
const CONTROL_API_PORT: u16 = 80;
const DEBUG_SERVER_PORT: u16 = 8080;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(error) = logging::init(cli.log_level.as_deref()) {
        eprintln!("failed to set up logging: {error:#}");
        return ExitCode::FAILURE;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    match runtime.block_on(run(cli)) {
        Ok(()) => {
            tracing::info!("shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(%error, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config::load(&cli).map_err(anyhow::Error::from)?;

    tracing::info!(
        port = config.port,
        peers = config.peers.len(),
        debug_server = config.debug_server,
        webui = config.webui,
        "starting wireguard-hub",
    );

    // C1: open the UDP sockets before anything else depends on the port being live.
    let (udp_bind, bound_port) = UdpBind::bind(config.bind_address.as_deref(), config.port)
        .await
        .map_err(anyhow::Error::from)?;
    let udp_bind = Arc::new(udp_bind);

    // C3: bring the primary engine up and seed it with the configured peer set.
    let private_key = StaticSecret::from(config.private_key);
    let primary = Arc::new(Engine::new(private_key, bound_port));
    primary.up().await;
    primary
        .set(&config::initial_ipc_blob(&config))
        .await
        .map_err(anyhow::Error::from)?;

    tracing::info!(
        public_key = %base64_public_key(&primary),
        port = bound_port,
        "primary engine up",
    );

    let primary_driver = tokio::spawn(run_primary_driver(primary.clone(), udp_bind.clone()));

    // C11: attach the hub's own synthetic peer last, only if it has an overlay address.
    let netstack_handle = if let Some(hub_address) = config.hub_address {
        let primary_endpoint: SocketAddr = format!("127.0.0.1:{bound_port}").parse().expect("valid loopback address");
        let (hub_attach, upper_side) = hub_attach::attach(&primary, hub_address, primary_endpoint).await;

        let mut netstack_actor = netstack::NetstackActor::new(hub_address.addr(), upper_side);

        let debug_connections =
            if config.debug_server { Some(netstack_actor.listen_tcp(DEBUG_SERVER_PORT)) } else { None };
        let api_connections = if config.webui { Some(netstack_actor.listen_tcp(CONTROL_API_PORT)) } else { None };

        tokio::spawn(netstack_actor.run());

        if let Some(connections) = debug_connections {
            tokio::spawn(debug::serve(primary.clone(), connections));
            tracing::info!(port = DEBUG_SERVER_PORT, "debug surface enabled");
        }

        if let Some(connections) = api_connections {
            let jwt_secret = config
                .webui_jwt_secret
                .clone()
                .unwrap_or_else(generate_random_jwt_secret);
            let admin_password_hash = config
                .webui_admin_password_hash
                .clone()
                .ok_or_else(|| anyhow::anyhow!("webui enabled but no admin password hash configured"))?;

            let state = Arc::new(api::ApiState::new(primary.clone(), config.clone(), jwt_secret, admin_password_hash));
            tokio::spawn(api::serve(state, connections));
            tracing::info!(port = CONTROL_API_PORT, "control API enabled");
        }

        Some(hub_attach)
    } else {
        if config.debug_server || config.webui {
            tracing::warn!("debug server / control API requested but no hub address configured; neither will be served");
        }
        None
    };

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    if let Some(hub_attach) = netstack_handle {
        hub_attach.engine.close().await;
    }
    primary_driver.abort();
    primary.close().await;
    udp_bind.close();

    Ok(())
}

/// Drives the primary engine: pumps inbound UDP datagrams and periodic timer
/// ticks. Every outgoing packet from a primary-engine peer is a ciphertext
/// datagram (the primary never sets its own overlay address, so it never
/// produces `Outgoing::ToLoopback` itself — only the hub-attach secondary does).
async fn run_primary_driver(engine: Arc<Engine>, bind: Arc<UdpBind>) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);

    loop {
        tokio::select! {
            received = bind.recv_from() => {
                let Ok((datagram, src)) = received else { continue };
                let outgoing = engine.handle_datagram(src, &datagram).await;
                dispatch(&bind, outgoing).await;
            }
            _ = ticker.tick() => {
                let outgoing = engine.tick().await;
                dispatch(&bind, outgoing).await;
            }
        }
    }
}

async fn dispatch(bind: &Arc<UdpBind>, outgoing: Vec<Outgoing>) {
    for item in outgoing {
        if let Outgoing::ToNetwork(addr, datagram) = item {
            if let Err(error) = bind.send_to(&datagram, addr).await {
                tracing::debug!(%error, %addr, "failed to send datagram");
            }
        }
    }
}

fn base64_public_key(engine: &Engine) -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    BASE64.encode(engine.public_key().as_bytes())
}

fn generate_random_jwt_secret() -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
