use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile { err: std::io::Error, path: String },

    #[error("parse {path}: {err}")]
    Parse { err: toml::de::Error, path: String },

    #[error("merged settings: {0}")]
    Merge(#[from] toml::de::Error),
}

/// Runtime settings: where the image is served from, how the sidecar is run,
/// and how long to wait on the control plane.
#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    pub server: Server,
    pub sidecar: Sidecar,
    pub watch: Polling,
    pub job: Polling,
    pub registration: Registration,
}

impl Default for Settings {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }
}

impl Settings {
    /// Read a user settings file and lay it over the built-in defaults.
    /// Keys missing from the user file keep their default values.
    pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
        let user = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
            err,
            path: path.to_string(),
        })?;
        Self::default_with_user_config(&user).map_err(|err| Error::Parse {
            err,
            path: path.to_string(),
        })
    }

    pub fn default_with_user_config(user: &str) -> Result<Self, toml::de::Error> {
        let mut base: toml::Value = toml::from_str(DEFAULT_CONFIG)?;
        let overlay: toml::Value = toml::from_str(user)?;
        merge(&mut base, overlay);
        base.try_into()
    }
}

/// Recursively replace values in `base` with those from `overlay`.
/// Tables are merged key by key, everything else is overwritten.
fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Server {
    pub web_root: PathBuf,
    pub port: u16,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Sidecar {
    /// Name or path of the docker CLI.
    pub runtime: String,
    pub image: String,
    pub container_name: String,
    pub document_root: String,
    pub probe_interval_secs: u64,
    pub ready_timeout_secs: u64,
}

impl Sidecar {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// Fixed-interval polling with a bounded number of attempts.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct Polling {
    pub interval_secs: u64,
    pub attempts: u32,
}

impl Polling {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Registration {
    /// Send a SHA-256 checksum of the staged image along with the registration.
    pub checksum: bool,
}
