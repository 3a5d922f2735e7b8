use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

const DEFAULT_CONFIG_FILE: &str = "mc-lite.toml";

fn default_connection_timeout() -> u64 {
    5000
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    listen: String,
    /// Milliseconds; bounds the handshake read and the backend dial.
    #[serde(default = "default_connection_timeout")]
    connection_timeout: u64,
    #[serde(default)]
    lite: LiteSection,
}

#[derive(Debug, Deserialize)]
struct LiteSection {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    routes: Vec<RouteConfig>,
}

fn default_enabled() -> bool {
    true
}

impl Default for LiteSection {
    fn default() -> Self {
        LiteSection {
            enabled: true,
            routes: Vec::new(),
        }
    }
}

/// A single `host`/`backend` entry may be written as a string or a list.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
struct RouteConfig {
    host: OneOrMany,
    backend: OneOrMany,
    #[serde(default)]
    proxy_protocol: bool,
    #[serde(default)]
    real_ip: bool,
}

/// A validated route: host patterns (exact, `*`, or `*.suffix`, lowercased)
/// mapped to one or more `host[:port]` backends.
#[derive(Debug, Clone)]
pub struct Route {
    pub hosts: Vec<String>,
    pub backends: Vec<String>,
    pub proxy_protocol: bool,
    pub real_ip: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub connection_timeout: Duration,
    pub lite_enabled: bool,
    pub routes: Vec<Route>,
}

/// Immutable per-connection view of the config. Taken at accept time, so a
/// reload only affects connections accepted afterwards.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub routes: Vec<Route>,
    pub connection_timeout: Duration,
}

impl Config {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let raw: RawConfig = toml::from_str(&text).with_context(|| "parsing config")?;
        Config::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let mut routes = Vec::with_capacity(raw.lite.routes.len());
        for (i, rc) in raw.lite.routes.into_iter().enumerate() {
            routes.push(compile_route(rc).with_context(|| format!("route #{}", i + 1))?);
        }
        Ok(Config {
            listen: raw.listen,
            connection_timeout: Duration::from_millis(raw.connection_timeout),
            lite_enabled: raw.lite.enabled,
            routes,
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            routes: self.routes.clone(),
            connection_timeout: self.connection_timeout,
        }
    }
}

fn compile_route(rc: RouteConfig) -> Result<Route> {
    // Patterns are matched case-insensitively, so normalize here once.
    let hosts: Vec<String> = rc
        .host
        .into_vec()
        .into_iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect();
    if hosts.is_empty() {
        bail!("missing host patterns");
    }

    let backends: Vec<String> = rc
        .backend
        .into_vec()
        .into_iter()
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .collect();
    if backends.is_empty() {
        bail!("missing backends");
    }

    Ok(Route {
        hosts,
        backends,
        proxy_protocol: rc.proxy_protocol,
        real_ip: rc.real_ip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config> {
        Config::from_raw(toml::from_str(text).unwrap())
    }

    #[test]
    fn parses_scalar_and_list_forms() {
        let cfg = parse(
            r#"
            listen = "0.0.0.0:25565"
            connection_timeout = 1000

            [[lite.routes]]
            host = "Play.Example.COM"
            backend = "10.0.0.1:25566"

            [[lite.routes]]
            host = ["a", "b"]
            backend = ["10.0.0.3:1", "10.0.0.4:2"]
            proxy_protocol = true
            real_ip = true
            "#,
        )
        .unwrap();

        assert!(cfg.lite_enabled);
        assert_eq!(cfg.connection_timeout, Duration::from_millis(1000));
        assert_eq!(cfg.routes.len(), 2);
        assert_eq!(cfg.routes[0].hosts, ["play.example.com"]);
        assert_eq!(cfg.routes[0].backends, ["10.0.0.1:25566"]);
        assert!(!cfg.routes[0].proxy_protocol);
        assert_eq!(cfg.routes[1].hosts, ["a", "b"]);
        assert!(cfg.routes[1].proxy_protocol);
        assert!(cfg.routes[1].real_ip);
    }

    #[test]
    fn defaults_apply() {
        let cfg = parse(r#"listen = "0.0.0.0:25565""#).unwrap();
        assert_eq!(cfg.connection_timeout, Duration::from_millis(5000));
        assert!(cfg.lite_enabled);
        assert!(cfg.routes.is_empty());
    }

    #[test]
    fn lite_can_be_disabled() {
        let cfg = parse(
            r#"
            listen = "0.0.0.0:25565"
            [lite]
            enabled = false
            "#,
        )
        .unwrap();
        assert!(!cfg.lite_enabled);
    }

    #[test]
    fn rejects_route_without_backends() {
        let err = parse(
            r#"
            listen = "0.0.0.0:25565"
            [[lite.routes]]
            host = "example.com"
            backend = []
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("missing backends"));
    }

    #[test]
    fn rejects_route_without_hosts() {
        let err = parse(
            r#"
            listen = "0.0.0.0:25565"
            [[lite.routes]]
            host = ["  "]
            backend = "10.0.0.1"
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("missing host patterns"));
    }
}
