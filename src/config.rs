//! Configuration module for Akari
//!
//! One JSON process config selects the role; a directory of per-SNI
//! (server) or per-endpoint (agent) JSON files describes the backends.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default process config path
pub const DEFAULT_CONFIG_FILE: &str = "/etc/akari/akari.json";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// panic=0, fatal=1, error=2, warn=3, info=4, debug=5
    pub log_level: u8,
    pub mode: Mode,
    pub addr: String,
    /// Directory of per-SNI / per-endpoint files
    pub conf: String,
    /// Server mode only: answer plaintext :80 with redirects to the TLS port
    pub http_redirect: bool,
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: 4,
            mode: Mode::Server,
            addr: "0.0.0.0:443".to_string(),
            conf: "/etc/akari/conf".to_string(),
            http_redirect: false,
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Port part of the listen address, used by the redirect helper.
    pub fn https_port(&self) -> &str {
        self.addr.rsplit(':').next().unwrap_or("443")
    }
}

/// Process role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Agent,
}

/// TLS listener configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Prefer forward-secure AEAD cipher suites
    #[serde(default)]
    pub fs: bool,
    #[serde(default)]
    pub certs: Vec<CertPair>,
}

/// One certificate chain + key, optionally pinned to server names.
/// A pair without `sni` entries becomes the default certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertPair {
    pub cert: String,
    pub key: String,
    #[serde(default)]
    pub sni: Vec<String>,
}

/// Backend protocol selected per SNI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    #[default]
    Tcp,
    Socks5,
    Https,
    Auto,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendMode::Tcp => "tcp",
            BackendMode::Socks5 => "socks5",
            BackendMode::Https => "https",
            BackendMode::Auto => "auto",
        };
        f.write_str(s)
    }
}

/// Per-SNI backend descriptor (server mode)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConf {
    pub sni: String,
    pub mode: BackendMode,
    /// Upstream for `tcp` mode; reverse-proxy fallback for `https` mode
    pub addr: String,
    /// `"user:pass"`, empty for no authentication
    pub auth: String,
    /// Accept multiplexed sub-streams on this SNI
    pub mux: bool,
    pub mux_v2: bool,
    /// `https` mode only: path -> upstream
    pub reverse_proxy: HashMap<String, String>,
    /// `https` mode only: serve the site but refuse proxying
    pub disable_forward_proxy: bool,
}

impl ServerConf {
    pub fn conn_mode(&self) -> String {
        if self.mux {
            format!("mux-{}", self.mode)
        } else {
            self.mode.to_string()
        }
    }
}

/// Per-endpoint descriptor (agent mode)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConf {
    /// TLS ServerName sent to the remote
    pub sni: String,
    /// TLS dial target
    pub remote: String,
    /// Plaintext bind address
    pub local: String,
    /// Opaque credential, consumed by whatever sits behind the tunnel
    pub auth: String,
    pub mux: bool,
    /// Pool of mux sessions instead of one shared session
    pub pool: bool,
    /// Pool size; 0 means the default of 8
    pub max_idle: usize,
    /// Per-session stream soft cap; 0 means the default of 8
    pub max_mux: usize,
    pub mux_v2: bool,
}

const DEFAULT_MAX_IDLE: usize = 8;
const DEFAULT_MAX_MUX: usize = 8;

impl AgentConf {
    pub fn conn_mode(&self) -> &'static str {
        if self.mux {
            if self.pool {
                "mux-pool"
            } else {
                "mux-tcp"
            }
        } else {
            "tcp"
        }
    }

    pub fn max_idle(&self) -> usize {
        if self.max_idle == 0 {
            DEFAULT_MAX_IDLE
        } else {
            self.max_idle
        }
    }

    pub fn max_mux(&self) -> usize {
        if self.max_mux == 0 {
            DEFAULT_MAX_MUX
        } else {
            self.max_mux
        }
    }
}

/// Load every per-SNI backend file under `dir`, keyed by SNI.
pub fn load_server_conf<P: AsRef<Path>>(dir: P) -> Result<HashMap<String, ServerConf>> {
    let mut confs = HashMap::new();
    for entry in read_conf_dir(dir.as_ref())? {
        let item: ServerConf = parse_conf_file(&entry)?;
        confs.insert(item.sni.clone(), item);
    }
    Ok(confs)
}

/// Load every per-endpoint file under `dir`.
pub fn load_agent_conf<P: AsRef<Path>>(dir: P) -> Result<Vec<AgentConf>> {
    let mut confs = Vec::new();
    for entry in read_conf_dir(dir.as_ref())? {
        confs.push(parse_conf_file(&entry)?);
    }
    Ok(confs)
}

fn read_conf_dir(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("failed to read conf dir {}: {}", dir.display(), e)))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::Config(format!("read conf dir: {}", e)))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn parse_conf_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.log_level, 4);
        assert_eq!(cfg.mode, Mode::Server);
        assert_eq!(cfg.addr, "0.0.0.0:443");
        assert_eq!(cfg.conf, "/etc/akari/conf");
        assert!(!cfg.http_redirect);
        assert!(!cfg.tls.fs);
        assert_eq!(cfg.https_port(), "443");
    }

    #[test]
    fn parse_server_conf() {
        let json = r#"{
            "sni": "a.example",
            "mode": "https",
            "addr": "127.0.0.1:9000",
            "auth": "u:p",
            "mux": true,
            "muxV2": true,
            "reverseProxy": { "/api": "127.0.0.1:9001" },
            "disableForwardProxy": true
        }"#;
        let conf: ServerConf = serde_json::from_str(json).unwrap();
        assert_eq!(conf.sni, "a.example");
        assert_eq!(conf.mode, BackendMode::Https);
        assert_eq!(conf.auth, "u:p");
        assert!(conf.mux_v2);
        assert_eq!(conf.reverse_proxy["/api"], "127.0.0.1:9001");
        assert!(conf.disable_forward_proxy);
        assert_eq!(conf.conn_mode(), "mux-https");
    }

    #[test]
    fn parse_agent_conf() {
        let json = r#"{
            "sni": "a.example",
            "remote": "203.0.113.1:443",
            "local": "127.0.0.1:1080",
            "mux": true,
            "pool": true
        }"#;
        let conf: AgentConf = serde_json::from_str(json).unwrap();
        assert_eq!(conf.conn_mode(), "mux-pool");
        assert_eq!(conf.max_idle(), 8);
        assert_eq!(conf.max_mux(), 8);

        let json = r#"{ "maxIdle": 2, "maxMux": 1 }"#;
        let conf: AgentConf = serde_json::from_str(json).unwrap();
        assert_eq!(conf.conn_mode(), "tcp");
        assert_eq!(conf.max_idle(), 2);
        assert_eq!(conf.max_mux(), 1);
    }
}
