//! Aggregates the hub's configuration from three ordered sources — CLI flags,
//! environment variables, a YAML file — and validates the assembled peer set.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::cli::{peer_env_vars, Cli};
use crate::error::HubError;
use crate::peer::{self, PeerSpec};

const DEFAULT_CONFIG_PATH: &str = "wireguard-hub.yaml";
const DEFAULT_PORT: u16 = 9999;

/// The hub's fully assembled, validated configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub private_key: [u8; 32],
    pub port: u16,
    pub bind_address: Option<String>,
    pub hub_address: Option<Ipv4Net>,
    pub peers: Vec<PeerSpec>,
    pub debug_server: bool,
    pub webui: bool,
    pub webui_jwt_secret: Option<String>,
    pub webui_admin_password_hash: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    private_key: Option<String>,
    port: Option<u16>,
    bind_address: Option<String>,
    hub_address: Option<String>,
    debug_server: Option<bool>,
    webui: Option<bool>,
    webui_jwt_secret: Option<String>,
    webui_admin_password_hash: Option<String>,
    #[serde(default)]
    peers: Vec<ConfigPeer>,
}

#[derive(Debug, Deserialize)]
struct ConfigPeer {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "allowedIP", alias = "allowedIPs")]
    allowed_ip: String,
}

/// Loads and validates the hub configuration, applying flags > env > file > default.
pub fn load(cli: &Cli) -> Result<HubConfig, HubError> {
    let file = load_file(cli.config.as_deref())?;

    let private_key_b64 = cli
        .private_key
        .clone()
        .or_else(|| file.private_key.clone())
        .ok_or_else(|| HubError::Config("private key is required (--private-key, PRIVATE_KEY, or config file)".into()))?;
    let private_key = decode_private_key(&private_key_b64)?;

    let port = cli.port.or(file.port).unwrap_or(DEFAULT_PORT);
    let bind_address = cli.bind_address.clone().or_else(|| file.bind_address.clone());
    let debug_server = cli.debug_server.or(file.debug_server).unwrap_or(false);
    let webui = cli.webui.or(file.webui).unwrap_or(false);
    let webui_jwt_secret = cli.webui_jwt_secret.clone().or_else(|| file.webui_jwt_secret.clone());
    let webui_admin_password_hash = cli
        .webui_admin_password_hash
        .clone()
        .or_else(|| file.webui_admin_password_hash.clone());

    let hub_address = cli
        .hub_address
        .clone()
        .or_else(|| file.hub_address.clone())
        .map(|s| peer::parse_allowed_ip(&s))
        .transpose()?
        .map(|net| Ipv4Net::new(net.network(), 32).expect("/32 is always valid"));

    let peers = collect_peers(cli, &file)?;

    let config = HubConfig {
        private_key,
        port,
        bind_address,
        hub_address,
        peers,
        debug_server,
        webui,
        webui_jwt_secret,
        webui_admin_password_hash,
    };

    validate(&config)?;
    Ok(config)
}

fn load_file(path: Option<&Path>) -> Result<ConfigFile, HubError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match std::fs::read_to_string(&path) {
        Ok(contents) => serde_yml::from_str(&contents)
            .map_err(|e| HubError::Config(format!("invalid config file {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(HubError::Config(format!("failed to read config file {}: {e}", path.display()))),
    }
}

fn collect_peers(cli: &Cli, file: &ConfigFile) -> Result<Vec<PeerSpec>, HubError> {
    let mut peers = Vec::new();

    for raw in &cli.peers {
        peers.push(PeerSpec::parse(raw)?);
    }
    for raw in peer_env_vars() {
        peers.push(PeerSpec::parse(&raw)?);
    }
    for entry in &file.peers {
        let public_key = peer::decode_public_key(&entry.public_key)?;
        let allowed_ip = peer::parse_allowed_ip(&entry.allowed_ip)?;
        peers.push(PeerSpec { public_key, allowed_ip });
    }

    Ok(peers)
}

fn decode_private_key(s: &str) -> Result<[u8; 32], HubError> {
    let bytes = BASE64
        .decode(s.trim())
        .map_err(|e| HubError::Config(format!("invalid base64 private key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| HubError::Config("private key must decode to 32 bytes".to_string()))
}

/// Checks I1-I4 against the assembled peer set, reporting which two entries collide.
fn validate(config: &HubConfig) -> Result<(), HubError> {
    let mut seen_keys = std::collections::HashSet::new();

    for (i, peer) in config.peers.iter().enumerate() {
        if !seen_keys.insert(peer.public_key) {
            return Err(HubError::Config(format!(
                "duplicate peer public key: {}",
                peer.public_key_base64()
            )));
        }

        for other in &config.peers[..i] {
            if addr_planner::overlaps(&peer.allowed_ip, &other.allowed_ip) {
                return Err(HubError::Config(format!(
                    "peer {} ({}) overlaps peer {} ({})",
                    peer.public_key_base64(),
                    peer.allowed_ip,
                    other.public_key_base64(),
                    other.allowed_ip,
                )));
            }
        }

        if let Some(hub_address) = config.hub_address {
            if addr_planner::overlaps(&peer.allowed_ip, &hub_address) {
                return Err(HubError::Config(format!(
                    "peer {} ({}) overlaps hub address {}",
                    peer.public_key_base64(),
                    peer.allowed_ip,
                    hub_address,
                )));
            }
        }
    }

    Ok(())
}

/// Builds the initial IPC `set` blob for the primary engine: the hub's own
/// private key, listen port, then one `public_key`/`allowed_ip` pair per peer.
pub fn initial_ipc_blob(config: &HubConfig) -> String {
    let mut blob = String::new();
    blob.push_str(&format!("private_key={}\n", hex::encode(config.private_key)));
    blob.push_str(&format!("listen_port={}\n", config.port));

    for peer in &config.peers {
        blob.push_str(&format!("public_key={}\n", peer.public_key_hex()));
        blob.push_str(&format!("allowed_ip={}\n", peer.allowed_ip));
    }

    blob
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RedactedConfig {
    port: u16,
    bind_address: Option<String>,
    hub_address: Option<String>,
    debug_server: bool,
    webui: bool,
    webui_jwt_secret: &'static str,
    webui_admin_password_hash: Option<&'static str>,
    peers: Vec<RedactedPeer>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RedactedPeer {
    public_key: String,
    allowed_ip: String,
}

/// Renders the live config as YAML for `GET /config`, with secrets redacted
/// and peers drawn from the live `live_peers` list (the engine's current
/// table, minus the hub self-peer), not the startup snapshot.
pub fn to_redacted_yaml(config: &HubConfig, live_peers: &[PeerSpec]) -> Result<String, HubError> {
    let redacted = RedactedConfig {
        port: config.port,
        bind_address: config.bind_address.clone(),
        hub_address: config.hub_address.map(|n| n.to_string()),
        debug_server: config.debug_server,
        webui: config.webui,
        webui_jwt_secret: if config.webui_jwt_secret.is_some() { "[...]" } else { "" },
        webui_admin_password_hash: config.webui_admin_password_hash.as_ref().map(|_| "[...]"),
        peers: live_peers
            .iter()
            .map(|p| RedactedPeer {
                public_key: p.public_key_base64(),
                allowed_ip: p.allowed_ip.to_string(),
            })
            .collect(),
    };

    serde_yml::to_string(&redacted).map_err(|e| HubError::Engine(format!("failed to render config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(private_key_b64: &str) -> Cli {
        Cli {
            private_key: Some(private_key_b64.to_string()),
            port: None,
            bind_address: None,
            peers: vec![],
            config: Some(PathBuf::from("/nonexistent/wireguard-hub.yaml")),
            log_level: None,
            hub_address: None,
            debug_server: None,
            webui: None,
            webui_jwt_secret: None,
            webui_admin_password_hash: None,
        }
    }

    #[test]
    fn rejects_overlapping_peers() {
        let mut cli = base(&BASE64.encode([1u8; 32]));
        cli.peers = vec![
            format!("{},192.168.0.0/24", BASE64.encode([2u8; 32])),
            format!("{},192.168.0.5/32", BASE64.encode([3u8; 32])),
        ];

        assert!(load(&cli).is_err());
    }

    #[test]
    fn applies_default_port_when_unset() {
        let cli = base(&BASE64.encode([1u8; 32]));
        let config = load(&cli).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn rejects_missing_private_key() {
        let mut cli = base(&BASE64.encode([1u8; 32]));
        cli.private_key = None;
        assert!(load(&cli).is_err());
    }
}
