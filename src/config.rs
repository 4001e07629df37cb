//! Configuration management for Procman.
//!
//! This module defines the persisted JSON config document (listen settings
//! plus the named process definitions) and the `ConfigStore` that owns it.
//! The store is constructed once at startup and passed by reference; saves
//! are atomic replace-on-write.

use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = "procman.json";

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    6969
}

fn default_log_retention_lines() -> usize {
    10_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

/// Top-level server settings persisted alongside the process definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Address the control plane binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Port the control plane binds to.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Maximum number of lines retained per output stream.
    #[serde(default = "default_log_retention_lines")]
    pub log_retention_lines: usize,
    /// How long to wait for a graceful exit before force-killing (ms).
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            log_retention_lines: default_log_retention_lines(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl Settings {
    /// The `host:port` string the server binds and the client connects to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }
}

/// Durable description of a manageable process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Unique name, also the map key in the persisted document.
    #[serde(default)]
    pub name: String,
    /// Absolute working directory for the process.
    #[serde(rename = "cwd")]
    pub directory: PathBuf,
    /// Shell command line to execute.
    #[serde(rename = "cmd")]
    pub command: String,
    /// Whether to source the directory-local direnv environment first.
    #[serde(default)]
    pub use_direnv: bool,
    /// Extra environment variables merged into the process environment.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl ProcessDefinition {
    /// Checks the fields a definition must have before it can be persisted
    /// or spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".into()));
        }
        if self.name.contains('/') || self.name.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "name '{}' must not contain slashes or whitespace",
                self.name
            )));
        }
        if !self.directory.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "directory '{}' must be an absolute path",
                self.directory.display()
            )));
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid("command must not be empty".into()));
        }
        Ok(())
    }
}

/// The persisted configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    /// Definitions keyed by name in the document, insertion-ordered here.
    #[serde(default, with = "servers_map")]
    pub servers: Vec<ProcessDefinition>,
}

/// Serializes the definition list as a JSON object keyed by name, and reads
/// it back preserving document order. The map key is authoritative for the
/// definition name.
mod servers_map {
    use super::ProcessDefinition;
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(servers: &[ProcessDefinition], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(servers.len()))?;
        for def in servers {
            map.serialize_entry(&def.name, def)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<ProcessDefinition>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ServersVisitor;

        impl<'de> Visitor<'de> for ServersVisitor {
            type Value = Vec<ProcessDefinition>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of server name to process definition")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut servers = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, mut def)) =
                    access.next_entry::<String, ProcessDefinition>()?
                {
                    def.name = name;
                    servers.push(def);
                }
                Ok(servers)
            }
        }

        deserializer.deserialize_map(ServersVisitor)
    }
}

/// Owner of the persisted configuration.
///
/// All mutations go through `upsert`/`remove`, which persist durably before
/// returning success.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    /// Loads the config from the default path, creating a default file when
    /// none exists yet.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_from(default_config_path())
    }

    /// Loads the config from an explicit path, creating a default file when
    /// none exists yet.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            let store = Self {
                path: path.clone(),
                config: Config::default(),
            };
            tracing::debug!(path = %path.display(), "creating default configuration file");
            store.save()?;
            return Ok(store);
        }
        let raw = fs::read_to_string(&path).map_err(|err| ConfigError::Load {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|err| ConfigError::Load {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Looks up a definition by name.
    pub fn get(&self, name: &str) -> Option<&ProcessDefinition> {
        self.config.servers.iter().find(|def| def.name == name)
    }

    /// All definitions in insertion order.
    pub fn list(&self) -> &[ProcessDefinition] {
        &self.config.servers
    }

    /// Inserts or replaces a definition, persisting before returning.
    ///
    /// A replaced definition keeps its position in the document.
    pub fn upsert(&mut self, def: ProcessDefinition) -> Result<(), ConfigError> {
        def.validate()?;
        match self
            .config
            .servers
            .iter_mut()
            .find(|existing| existing.name == def.name)
        {
            Some(existing) => *existing = def,
            None => self.config.servers.push(def),
        }
        self.save()
    }

    /// Removes a definition, persisting before returning.
    pub fn remove(&mut self, name: &str) -> Result<(), ConfigError> {
        let before = self.config.servers.len();
        self.config.servers.retain(|def| def.name != name);
        if self.config.servers.len() == before {
            return Err(ConfigError::UnknownServer { name: name.into() });
        }
        self.save()
    }

    // Write-to-temp-then-rename so readers never observe a partial file.
    fn save(&self) -> Result<(), ConfigError> {
        let save_err = |source: std::io::Error| ConfigError::Save {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(save_err)?;
        }
        let serialized = serde_json::to_string_pretty(&self.config)
            .map_err(|err| save_err(std::io::Error::other(err)))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized).map_err(save_err)?;
        fs::rename(&tmp, &self.path).map_err(save_err)?;
        Ok(())
    }
}

/// Resolves the config file path: `$XDG_CONFIG_HOME`, else
/// `$HOME/.config`, else the system temp directory.
pub fn default_config_path() -> PathBuf {
    resolve_config_path(env::var_os("XDG_CONFIG_HOME"), env::var_os("HOME"))
}

fn resolve_config_path(xdg_config_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    if let Some(dir) = xdg_config_home.filter(|dir| !dir.is_empty()) {
        return PathBuf::from(dir).join(CONFIG_FILE_NAME);
    }
    if let Some(home) = home.filter(|home| !home.is_empty()) {
        return PathBuf::from(home).join(".config").join(CONFIG_FILE_NAME);
    }
    env::temp_dir().join(CONFIG_FILE_NAME)
}
