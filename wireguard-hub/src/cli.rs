use std::path::PathBuf;

use clap::Parser;

/// Userspace WireGuard hub.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Hub private key, base64-encoded.
    #[arg(long, env = "PRIVATE_KEY")]
    pub private_key: Option<String>,

    /// UDP port to listen on. Defaults to 9999 if unset here, in the env, and in the config file.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Source address hint for the UDP sockets.
    #[arg(long, env = "BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// A peer to register at startup, `<base64-public-key>,<allowedIP>`. Repeatable.
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Path to a YAML config file. Defaults to `wireguard-hub.yaml` in the working directory.
    #[arg(long, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// `debug`, `info`, `warn`, or `error`. Takes precedence over `RUST_LOG` when set.
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// The hub's own `/32` on the overlay network.
    #[arg(long, env = "HUB_ADDRESS")]
    pub hub_address: Option<String>,

    /// Serve the read-only debug dump over the overlay. Defaults to `false`.
    #[arg(long, env = "DEBUG_SERVER")]
    pub debug_server: Option<bool>,

    /// Serve the control API and web UI. Defaults to `false`.
    #[arg(long, env = "WEBUI")]
    pub webui: Option<bool>,

    /// HMAC secret for web UI bearer tokens. Generated at random if unset.
    #[arg(long, env = "WEBUI_JWT_SECRET")]
    pub webui_jwt_secret: Option<String>,

    /// Bcrypt hash of the admin password, required to enable the web UI.
    #[arg(long, env = "WEBUI_ADMIN_PASSWORD_HASH")]
    pub webui_admin_password_hash: Option<String>,
}

/// Collects every environment variable whose name begins `PEER_`.
///
/// The variable name itself is ignored; it's purely a namespacing device to
/// let operators set several `PEER_*` variables without a single repeated key.
pub fn peer_env_vars() -> Vec<String> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with("PEER_"))
        .map(|(_, value)| value)
        .collect()
}
