//! C9: the control API. A small REST surface over the primary engine's IPC
//! get/set, gated by [`auth`]'s bearer-token check on every route but the
//! static index page and the login route itself. Every mutating route
//! acquires `mutation_lock` before touching the engine, so a read-validate-
//! write sequence (check for overlap, then commit) is atomic with respect to
//! concurrent callers — the engine's own internal mutex only serializes the
//! IPC calls themselves, not a multi-step request.

mod auth;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::Ipv4Net;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::config::{self, HubConfig};
use crate::engine::Engine;
use crate::error::{HubError, PeerOp};
use crate::ipc;
use crate::netstack::NetstackStream;
use crate::peer;

pub struct ApiState {
    pub engine: Arc<Engine>,
    pub config: HubConfig,
    pub jwt_secret: String,
    pub admin_password_hash: String,
    /// Serializes `PUT`/`POST`/`DELETE /peers` so a check-then-commit
    /// sequence can't race against another caller's mutation.
    pub mutation_lock: Mutex<()>,
    /// One process-wide generator so two concurrent draws never return the
    /// same candidate address.
    pub free_address_generator: addr_planner::FreeAddressGenerator,
}

impl ApiState {
    pub fn new(engine: Arc<Engine>, config: HubConfig, jwt_secret: String, admin_password_hash: String) -> Self {
        Self {
            engine,
            config,
            jwt_secret,
            admin_password_hash,
            mutation_lock: Mutex::new(()),
            free_address_generator: addr_planner::FreeAddressGenerator::default(),
        }
    }
}

/// Serves the control API over a netstack TCP listener (see [`crate::netstack`]).
/// Blocks until the listener's connection channel closes.
pub async fn serve(state: Arc<ApiState>, connections: mpsc::Receiver<NetstackStream>) {
    let router = Router::new()
        .route("/", get(index))
        .route("/auth", post(auth::login).get(auth::whoami))
        .route("/hub", get(get_hub))
        .route("/peers", get(list_peers).post(create_peer))
        .route("/peers/:public_key", put(set_peer).delete(remove_peer))
        .route("/config", get(get_config))
        .with_state(state);

    if let Err(error) =
        axum::serve(crate::netstack::NetstackListener::new(connections), router.into_make_service()).await
    {
        tracing::warn!(%error, "control API server exited");
    }
}

async fn index() -> &'static str {
    "wireguard-hub control API"
}

async fn live_peers(engine: &Engine) -> Vec<ipc::ParsedPeer> {
    ipc::parse(&engine.get().await)
}

fn allowed_ip_ranges(peers: &[ipc::ParsedPeer]) -> Vec<Ipv4Net> {
    peers.iter().filter_map(|p| p.allowed_ip).collect()
}

#[derive(Serialize)]
struct HubInfo {
    public_key: String,
    port: u16,
    hub_network: String,
    random_free_ip: String,
    external_ip: String,
}

/// `GET /hub`: hub identity plus the minimal supernet enclosing every current
/// peer and one free address drawn from it, exactly as C5 would hand a new
/// peer its allowed-IP.
async fn get_hub(State(state): State<Arc<ApiState>>, _claims: auth::Claims) -> Result<Json<HubInfo>, HubError> {
    let peers = live_peers(&state.engine).await;
    let ranges = allowed_ip_ranges(&peers);

    let hub_network =
        addr_planner::supernet(&ranges).map_err(|e| HubError::Engine(format!("failed to find hub network: {e}")))?;
    // An exhausted address space isn't treated as an error here: it surfaces
    // as an empty `random_free_ip` rather than a failed request.
    let random_free_ip = state
        .free_address_generator
        .generate(&ranges)
        .map_err(|e| HubError::Engine(format!("failed to find a free address: {e}")))?
        .map(|ip| ip.to_string())
        .unwrap_or_default();

    Ok(Json(HubInfo {
        public_key: BASE64.encode(state.engine.public_key().as_bytes()),
        port: state.engine.listen_port(),
        hub_network: hub_network.to_string(),
        random_free_ip,
        external_ip: state.config.bind_address.clone().unwrap_or_default(),
    }))
}

#[derive(Serialize)]
struct PeerView {
    public_key: String,
    allowed_ip: Option<String>,
    endpoint: Option<String>,
    last_handshake_time_sec: Option<u64>,
    tx_bytes: Option<u64>,
    rx_bytes: Option<u64>,
    is_hub: bool,
    /// Always `false`: the netstack listener doesn't expose a connection's
    /// originating overlay address (see `NetstackListener::Addr = ()` in
    /// `crate::netstack`), so "is this peer the caller" can't be determined.
    /// Documented as a known gap rather than silently wrong.
    is_requester: bool,
}

/// `GET /peers`: every peer from `get()`, sorted by public key, annotated
/// with whether its allowed-IP is the hub's own `/32`.
async fn list_peers(State(state): State<Arc<ApiState>>, _claims: auth::Claims) -> Json<Vec<PeerView>> {
    let peers = live_peers(&state.engine).await;
    let hub_address = state.config.hub_address;

    Json(
        peers
            .into_iter()
            .map(|p| {
                let is_hub = match (p.allowed_ip, hub_address) {
                    (Some(ip), Some(hub)) => ip == hub,
                    _ => false,
                };
                PeerView {
                    public_key: p.public_key_base64(),
                    allowed_ip: p.allowed_ip.map(|n| n.to_string()),
                    endpoint: p.endpoint.map(|a| a.to_string()),
                    last_handshake_time_sec: p.last_handshake_time_sec,
                    tx_bytes: p.tx_bytes,
                    rx_bytes: p.rx_bytes,
                    is_hub,
                    is_requester: false,
                }
            })
            .collect(),
    )
}

#[derive(Deserialize, Default)]
struct SetPeerRequest {
    #[serde(default)]
    allowed_ip: Option<String>,
}

#[derive(Serialize)]
struct SetPeerResponse {
    allowed_ip: String,
    hub_network: String,
}

/// `PUT /peers/{base64PubKey}`: add or update a peer. An empty/absent
/// `allowedIP` asks C5 to generate one from the current supernet;
/// otherwise the given value is canonicalised. Rejects with 400 on overlap.
async fn set_peer(
    State(state): State<Arc<ApiState>>,
    Path(public_key): Path<String>,
    _claims: auth::Claims,
    Json(request): Json<SetPeerRequest>,
) -> Result<Json<SetPeerResponse>, HubError> {
    let _guard = state.mutation_lock.lock().await;
    let key_bytes = peer::decode_public_key(&public_key)?;
    commit_peer(&state, key_bytes, request.allowed_ip.as_deref()).await
}

#[derive(Deserialize)]
struct CreatePeerRequest {
    #[serde(default)]
    allowed_ip: Option<String>,
}

#[derive(Serialize)]
struct CreatePeerResponse {
    private_key: String,
    public_key: String,
    allowed_ip: String,
    hub_network: String,
}

/// `POST /peers`: like `PUT`, but also generates a fresh WireGuard keypair.
/// The private key is returned exactly once and never stored.
async fn create_peer(
    State(state): State<Arc<ApiState>>,
    _claims: auth::Claims,
    Json(request): Json<CreatePeerRequest>,
) -> Result<Json<CreatePeerResponse>, HubError> {
    let _guard = state.mutation_lock.lock().await;

    let mut private_key_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut private_key_bytes);
    let private_key = StaticSecret::from(private_key_bytes);
    let public_key = PublicKey::from(&private_key);

    let committed = commit_peer(&state, *public_key.as_bytes(), request.allowed_ip.as_deref()).await?;

    Ok(Json(CreatePeerResponse {
        private_key: BASE64.encode(private_key.to_bytes()),
        public_key: BASE64.encode(public_key.as_bytes()),
        allowed_ip: committed.allowed_ip,
        hub_network: committed.hub_network,
    }))
}

async fn commit_peer(
    state: &ApiState,
    key_bytes: [u8; 32],
    requested_ip: Option<&str>,
) -> Result<SetPeerResponse, HubError> {
    let existing = live_peers(&state.engine).await;
    let ranges = allowed_ip_ranges(&existing);

    let hub_network =
        addr_planner::supernet(&ranges).map_err(|e| HubError::Engine(format!("failed to find hub network: {e}")))?;

    let allowed_ip = match requested_ip.filter(|s| !s.is_empty()) {
        Some(raw) => {
            let candidate = peer::parse_allowed_ip(raw)?;
            for other in &existing {
                if other.public_key == key_bytes {
                    continue;
                }
                if let Some(other_ip) = other.allowed_ip {
                    if addr_planner::overlaps(&candidate, &other_ip) {
                        return Err(HubError::Validation(format!(
                            "allowed-ip {candidate} overlaps an existing peer"
                        )));
                    }
                }
            }
            if let Some(hub_address) = state.config.hub_address {
                if addr_planner::overlaps(&candidate, &hub_address) {
                    return Err(HubError::Validation(format!("allowed-ip {candidate} overlaps the hub address")));
                }
            }
            candidate
        }
        None => state
            .free_address_generator
            .generate(&ranges)
            .map_err(|e| HubError::Engine(format!("failed to generate an address: {e}")))?
            .ok_or_else(|| HubError::Engine("address space exhausted".to_string()))?,
    };

    let blob = ipc::render_add(&hex::encode(key_bytes), allowed_ip);
    state
        .engine
        .set(&blob)
        .await
        .map_err(|e| HubError::PeerMutation { op: PeerOp::Add, detail: e.to_string() })?;

    Ok(SetPeerResponse { allowed_ip: allowed_ip.to_string(), hub_network: hub_network.to_string() })
}

/// `DELETE /peers/{base64PubKey}`: unconditional remove.
async fn remove_peer(
    State(state): State<Arc<ApiState>>,
    Path(public_key): Path<String>,
    _claims: auth::Claims,
) -> Result<(), HubError> {
    let _guard = state.mutation_lock.lock().await;
    let key_bytes = peer::decode_public_key(&public_key)?;
    let blob = ipc::render_remove(&hex::encode(key_bytes));
    state
        .engine
        .set(&blob)
        .await
        .map_err(|e| HubError::PeerMutation { op: PeerOp::Remove, detail: e.to_string() })
}

/// `GET /config`: the live config as redacted YAML, peers drawn from the
/// engine's current table minus the hub's own self-peer.
async fn get_config(State(state): State<Arc<ApiState>>, _claims: auth::Claims) -> Result<String, HubError> {
    let peers = live_peers(&state.engine).await;
    let hub_address = state.config.hub_address;

    let live: Vec<peer::PeerSpec> = peers
        .into_iter()
        .filter(|p| !matches!((p.allowed_ip, hub_address), (Some(ip), Some(hub)) if ip == hub))
        .filter_map(|p| Some(peer::PeerSpec { public_key: p.public_key, allowed_ip: p.allowed_ip? }))
        .collect();

    config::to_redacted_yaml(&state.config, &live)
}
