//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/parley/config.toml or /etc/parley/config.toml.
/// Env overrides: PARLEY_SIGNALING_URL, PARLEY_PEER_ID, PARLEY_LISTEN_PORT,
/// PARLEY_ADVERTISE_HOST, PARLEY_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Rendezvous server WebSocket URL.
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,
    /// Our id on the rendezvous server. Defaults to the login name.
    #[serde(default = "default_peer_id")]
    pub peer_id: String,
    /// Local TCP port for peer links (default 47800).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Host other peers dial; sent inside our offers and answers.
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,
    /// Where received files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default)]
    pub core: parley_core::Config,
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}
fn default_peer_id() -> String {
    std::env::var("USER").unwrap_or_else(|_| "parley".to_string())
}
fn default_listen_port() -> u16 {
    47800
}
fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}
fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: default_signaling_url(),
            peer_id: default_peer_id(),
            listen_port: default_listen_port(),
            advertise_host: default_advertise_host(),
            download_dir: default_download_dir(),
            core: parley_core::Config::default(),
        }
    }
}

impl Config {
    /// `host:port` other peers connect to.
    pub fn advertise_addr(&self) -> String {
        format!("{}:{}", self.advertise_host, self.listen_port)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("PARLEY_SIGNALING_URL") {
        c.signaling_url = s;
    }
    if let Some(s) = var("PARLEY_PEER_ID") {
        c.peer_id = s;
    }
    if let Some(s) = var("PARLEY_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Some(s) = var("PARLEY_ADVERTISE_HOST") {
        c.advertise_host = s;
    }
    if let Some(s) = var("PARLEY_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/parley/config.toml"));
    }
    out.push(PathBuf::from("/etc/parley/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => log::warn!("ignoring {}: {}", p.display(), e),
                },
                Err(e) => log::warn!("cannot read {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}
