//! Configuration for the proxy daemon.
//!
//! Settings come from command-line arguments and a TOML configuration file;
//! CLI arguments take precedence. Backend servers are described by
//! `[servers.<name>]` tables which may inherit from one another through a
//! `_base` key; inheritance chains are flattened at load time and cycles
//! are rejected.

use crate::error::{Error, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Default EPP wire protocol port (RFC 5734).
pub const EPP_PORT: u16 = 700;

/// Object URIs advertised in the login frame when a profile lists none.
pub const DEFAULT_OBJECT_URIS: &[&str] = &[
    "urn:ietf:params:xml:ns:epp-1.0",
    "urn:ietf:params:xml:ns:domain-1.0",
    "urn:ietf:params:xml:ns:host-1.0",
    "urn:ietf:params:xml:ns:contact-1.0",
    "urn:ietf:params:xml:ns:secDNS-1.0",
    "urn:ietf:params:xml:ns:secDNS-1.1",
    "urn:ietf:params:xml:ns:e164epp-1.0",
    "urn:ietf:params:xml:ns:rgp-1.0",
];

/// Command-line arguments for the proxy daemon.
#[derive(Parser, Debug)]
#[command(name = "epp-proxyd")]
#[command(version)]
#[command(about = "An EPP reverse proxy", long_about = None)]
pub struct CliArgs {
    /// Name of the backend server profile to relay to
    pub server: String,

    /// Path to TOML configuration file
    #[arg(long, default_value = "/etc/epprelay/proxyd.toml")]
    pub config: PathBuf,

    /// Interface address to bind to
    #[arg(long)]
    pub addr: Option<IpAddr>,

    /// Port to listen on when bound
    #[arg(long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub servers: HashMap<String, ServerSection>,
}

/// The `[proxy]` table: listener defaults and logging.
#[derive(Debug, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_addr")]
    pub addr: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

/// One `[servers.<name>]` table, before `_base` resolution. Every field is
/// optional here; requirements are enforced on the flattened profile.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ServerSection {
    /// Name of another server section to inherit unset keys from.
    #[serde(rename = "_base")]
    pub base: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub object_uris: Option<Vec<String>>,
    pub extension_uris: Option<Vec<String>>,
    pub lang: Option<String>,
}

fn default_addr() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_port() -> u16 {
    EPP_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A fully resolved backend server profile.
#[derive(Debug, Clone)]
pub struct ServerProfile {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub object_uris: Vec<String>,
    pub extension_uris: Vec<String>,
    pub lang: String,
}

impl ServerProfile {
    /// The backend address in `host:port` form.
    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Final resolved daemon settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: SocketAddr,
    pub log_level: String,
    pub profile: ServerProfile,
}

impl Settings {
    /// Load the configuration file named by the CLI and resolve the
    /// requested server profile. CLI arguments take precedence over file
    /// values.
    pub fn load(cli: &CliArgs) -> Result<Self> {
        let contents = std::fs::read_to_string(&cli.config).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {e}",
                cli.config.display()
            ))
        })?;
        let file: TomlConfig = toml::from_str(&contents).map_err(|e| {
            Error::Config(format!(
                "failed to parse config file '{}': {e}",
                cli.config.display()
            ))
        })?;
        Self::from_sources(cli, &file)
    }

    /// Merge CLI arguments with parsed file contents.
    pub fn from_sources(cli: &CliArgs, file: &TomlConfig) -> Result<Self> {
        let addr = cli.addr.unwrap_or(file.proxy.addr);
        let port = cli.port.unwrap_or(file.proxy.port);
        let log_level = cli
            .log_level
            .clone()
            .unwrap_or_else(|| file.proxy.log_level.clone());
        let profile = resolve_profile(&file.servers, &cli.server)?;

        Ok(Self {
            listen: SocketAddr::new(addr, port),
            log_level,
            profile,
        })
    }
}

/// Flatten the `_base` inheritance chain of `name` into a complete profile.
///
/// The chain is walked with a visited set, so a section whose `_base` chain
/// revisits any earlier section fails with a configuration-loop error
/// naming it rather than looping forever. Keys set closer to `name` win.
pub fn resolve_profile(
    servers: &HashMap<String, ServerSection>,
    name: &str,
) -> Result<ServerProfile> {
    let mut visited: Vec<&str> = Vec::new();
    let mut chain: Vec<&ServerSection> = Vec::new();
    let mut current = name;

    loop {
        if visited.contains(&current) {
            return Err(Error::Config(format!(
                "configuration loop in section 'servers.{current}'"
            )));
        }
        let section = servers.get(current).ok_or_else(|| {
            if visited.is_empty() {
                Error::Config(format!("no such server: '{current}'"))
            } else {
                Error::Config(format!(
                    "section 'servers.{}' inherits from unknown section '{current}'",
                    visited[visited.len() - 1]
                ))
            }
        })?;
        visited.push(current);
        chain.push(section);
        match &section.base {
            Some(base) => current = base,
            None => break,
        }
    }

    // Merge base-first so sections nearer the requested name override.
    let mut merged = ServerSection::default();
    for section in chain.into_iter().rev() {
        if section.host.is_some() {
            merged.host.clone_from(&section.host);
        }
        if section.port.is_some() {
            merged.port = section.port;
        }
        if section.username.is_some() {
            merged.username.clone_from(&section.username);
        }
        if section.password.is_some() {
            merged.password.clone_from(&section.password);
        }
        if section.object_uris.is_some() {
            merged.object_uris.clone_from(&section.object_uris);
        }
        if section.extension_uris.is_some() {
            merged.extension_uris.clone_from(&section.extension_uris);
        }
        if section.lang.is_some() {
            merged.lang.clone_from(&section.lang);
        }
    }

    let require = |field: Option<String>, key: &str| {
        field.ok_or_else(|| {
            Error::Config(format!(
                "section 'servers.{name}' is missing required key '{key}'"
            ))
        })
    };

    Ok(ServerProfile {
        name: name.to_string(),
        host: require(merged.host, "host")?,
        port: merged.port.unwrap_or(EPP_PORT),
        username: require(merged.username, "username")?,
        password: require(merged.password, "password")?,
        object_uris: merged
            .object_uris
            .unwrap_or_else(|| DEFAULT_OBJECT_URIS.iter().map(|s| s.to_string()).collect()),
        extension_uris: merged.extension_uris.unwrap_or_default(),
        lang: merged.lang.unwrap_or_else(|| "en".to_string()),
    })
}
