use crate::utils::validation::{AllowedExtensions, UploadPolicy};
use serde::Serialize;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use validator::Validate;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

pub const DEFAULT_ADDRESS: &str = "http://localhost:8080/upload";
pub const UPLOAD_PATH: &str = "/upload";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown config option '{0}'")]
    UnknownKey(String),

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: ConfigKey,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("maximum file size overflows: {size} x {unit}")]
    SizeOverflow { size: u64, unit: u64 },

    #[error("invalid server address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
}

/// Named server options. Every key maps onto exactly one `ServerConfig` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    Port,
    SaveDir,
    FileExt,
    FileSize,
    FileUnit,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 5] = [
        ConfigKey::Port,
        ConfigKey::SaveDir,
        ConfigKey::FileExt,
        ConfigKey::FileSize,
        ConfigKey::FileUnit,
    ];

    pub fn env_var(self) -> &'static str {
        match self {
            ConfigKey::Port => "THOR_SERVER_PORT",
            ConfigKey::SaveDir => "THOR_SAVE_DIR",
            ConfigKey::FileExt => "THOR_FILE_EXT",
            ConfigKey::FileSize => "THOR_FILE_SIZE",
            ConfigKey::FileUnit => "THOR_FILE_UNIT",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::Port => "port",
            ConfigKey::SaveDir => "dir",
            ConfigKey::FileExt => "ext",
            ConfigKey::FileSize => "size",
            ConfigKey::FileUnit => "unit",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p" | "port" => Ok(ConfigKey::Port),
            "d" | "dir" | "save_dir" => Ok(ConfigKey::SaveDir),
            "e" | "ext" | "file_ext" => Ok(ConfigKey::FileExt),
            "s" | "size" | "file_size" => Ok(ConfigKey::FileSize),
            "u" | "unit" | "file_unit" => Ok(ConfigKey::FileUnit),
            other => Err(ConfigError::UnknownKey(other.to_string())),
        }
    }
}

/// Server configuration, frozen into an [`UploadPolicy`] at startup.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[validate(range(min = 1, message = "port must be between 1 and 65535"))]
    pub port: u16,

    /// Directory uploads are stored under (default: current directory)
    pub save_dir: PathBuf,

    /// `|`-delimited extension list, or `*` for any (default: "*")
    #[validate(length(min = 1, message = "extension list cannot be empty"))]
    pub file_ext: String,

    /// Maximum upload size, in `file_unit`s (default: 2)
    #[validate(range(min = 1, message = "file size must be positive"))]
    pub file_size: u64,

    /// Size unit in bytes (default: 1 MiB)
    #[validate(range(min = 1, message = "file unit must be positive"))]
    pub file_unit: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            save_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            file_ext: "*".to_string(),
            file_size: 2,
            file_unit: MIB,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Applies every non-empty variable returned by `lookup` over the
    /// defaults. Unparseable values are logged and the default is kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        for key in ConfigKey::ALL {
            let Some(value) = lookup(key.env_var()) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            if let Err(e) = config.set(key, &value) {
                tracing::warn!("Ignoring {}: {}", key.env_var(), e);
            }
        }
        config
    }

    pub fn set(&mut self, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
        match key {
            ConfigKey::Port => self.port = parse_value(key, value)?,
            ConfigKey::SaveDir => self.save_dir = PathBuf::from(value),
            ConfigKey::FileExt => self.file_ext = value.to_string(),
            ConfigKey::FileSize => self.file_size = parse_value(key, value)?,
            ConfigKey::FileUnit => self.file_unit = parse_value(key, value)?,
        }
        Ok(())
    }

    /// Applies `(option, value)` pairs, e.g. `[("p", "9000"), ("ext", ".pdf")]`.
    pub fn update<I, K, V>(&mut self, pairs: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in pairs {
            let key: ConfigKey = key.as_ref().parse()?;
            self.set(key, value.as_ref())?;
        }
        Ok(())
    }

    pub fn max_bytes(&self) -> Result<u64, ConfigError> {
        self.file_size
            .checked_mul(self.file_unit)
            .ok_or(ConfigError::SizeOverflow {
                size: self.file_size,
                unit: self.file_unit,
            })
    }

    /// Validates the configuration and builds the admission policy.
    pub fn policy(&self) -> Result<UploadPolicy, ConfigError> {
        self.validate()?;
        Ok(UploadPolicy::new(
            AllowedExtensions::parse(&self.file_ext),
            self.max_bytes()?,
        ))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn parse_value<T>(key: ConfigKey, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Upload client configuration
#[derive(Debug, Clone, Validate)]
pub struct ClientConfig {
    /// Number of transfers in flight at once (default: 4)
    #[validate(range(min = 1, max = 256, message = "concurrency must be between 1 and 256"))]
    pub concurrency: usize,

    /// Per-request timeout (default: 300 s)
    pub timeout: Duration,

    /// Send an `md5` field with every upload (default: true)
    pub checksum: bool,

    /// Recreate the local directory layout on the server (default: false)
    pub preserve_tree: bool,

    /// Send files larger than this as sequential merge chunks
    #[validate(range(min = 1, message = "split size must be positive"))]
    pub split_size: Option<u64>,

    /// Multipart field carrying the file bytes (default: "file")
    #[validate(length(min = 1))]
    pub field_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout: Duration::from_secs(300),
            checksum: true,
            preserve_tree: false,
            split_size: None,
            field_name: "file".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        Self {
            concurrency: lookup("THOR_UPLOAD_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.concurrency),

            timeout: lookup("THOR_UPLOAD_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.timeout),

            checksum: lookup("THOR_UPLOAD_CHECKSUM")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(default.checksum),

            preserve_tree: default.preserve_tree,

            split_size: lookup("THOR_UPLOAD_SPLIT_SIZE")
                .and_then(|v| v.parse().ok())
                .or(default.split_size),

            field_name: default.field_name,
        }
    }
}

/// Turns `host:port`, `http://host:port` or a full URL into the upload
/// endpoint. A missing scheme becomes `http://` and an empty path becomes
/// `/upload`.
pub fn normalize_address(raw: &str) -> Result<Url, ConfigError> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| ConfigError::InvalidAddress {
        address: raw.to_string(),
        reason: e.to_string(),
    })?;

    if url.host_str().is_none() {
        return Err(ConfigError::InvalidAddress {
            address: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }

    if url.path().is_empty() || url.path() == "/" {
        url.set_path(UPLOAD_PATH);
    }
    Ok(url)
}
