//! Typed configuration descriptors and their on-disk loading.
//!
//! The grammar of the on-disk files is intentionally simple TOML — the spec
//! treats detailed config-file parsing as an external collaborator's
//! concern and only specifies the typed descriptors the core consumes
//! (spec §6). Layout on disk, mirroring that collaborator's contract:
//!
//! ```text
//! <config-root>/
//!   warden.conf        supervisor + retention-sweep settings
//!   storage.conf        one [name] section per storage backend
//!   cameras.d/*.conf     one file per camera
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Everything the supervisor needs to start: where its control socket and
/// pid file live, and the full set of camera/storage descriptors.
#[derive(Debug, Clone)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub cameras: Vec<CameraDescriptor>,
    pub storage: HashMap<String, StorageDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            pid_file: default_pid_file(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/warden/warden.sock")
}
fn default_pid_file() -> PathBuf {
    PathBuf::from("/run/warden/warden.pid")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/warden")
}

/// Immutable after load (spec §3 "Camera descriptor").
#[derive(Debug, Clone, Deserialize)]
pub struct CameraDescriptor {
    /// Unique key, also the directory/key component under each sink's root.
    pub name: String,
    pub url: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    pub resolution: Option<(u32, u32)>,
    /// Opaque key/value transcoder options, passed straight through.
    #[serde(default)]
    pub transcoder_options: HashMap<String, String>,
    /// Seconds to wait for the first byte (or probe) before giving up.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    pub motion: Option<MotionConfig>,
    pub log_path: PathBuf,
    /// Names of storage descriptors (keys of `Config::storage`) this camera
    /// fans its encoded bytes out to.
    pub sinks: Vec<String>,
}

fn default_transport() -> String {
    "tcp".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    pub resolution_scale: f64,
    pub threshold: f64,
    pub min_area: f64,
    pub cooldown_secs: u64,
}

/// Immutable after load (spec §3 "Storage descriptor").
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StorageDescriptor {
    Local {
        root: PathBuf,
        segment_length_secs: u64,
        retention_days: i64,
    },
    ObjectStore {
        bucket: String,
        key_prefix: String,
        region: Option<String>,
        access_key_id: String,
        secret_access_key: String,
        #[serde(default = "default_connect_timeout_secs")]
        connect_timeout_secs: u64,
        segment_length_secs: u64,
        retention_days: i64,
    },
    Broadcast {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        segment_length_secs: u64,
        retention_days: i64,
    },
}

impl StorageDescriptor {
    pub fn segment_length_secs(&self) -> u64 {
        match self {
            StorageDescriptor::Local {
                segment_length_secs,
                ..
            } => *segment_length_secs,
            StorageDescriptor::ObjectStore {
                segment_length_secs,
                ..
            } => *segment_length_secs,
            StorageDescriptor::Broadcast {
                segment_length_secs,
                ..
            } => *segment_length_secs,
        }
    }

    pub fn retention_days(&self) -> i64 {
        match self {
            StorageDescriptor::Local { retention_days, .. } => *retention_days,
            StorageDescriptor::ObjectStore { retention_days, .. } => *retention_days,
            StorageDescriptor::Broadcast { retention_days, .. } => *retention_days,
        }
    }
}

/// On-disk shape of `storage.conf`: a map from descriptor name to its body.
#[derive(Debug, Deserialize)]
struct StorageFile {
    #[serde(flatten)]
    backends: HashMap<String, StorageDescriptor>,
}

#[derive(Debug, Deserialize)]
struct SupervisorFile {
    #[serde(default)]
    supervisor: SupervisorConfig,
}

impl Config {
    /// Load the whole config directory: `warden.conf`, `storage.conf`, and
    /// every `cameras.d/*.conf` file.
    pub fn load_dir(root: &Path) -> Result<Self> {
        let supervisor = Self::load_supervisor(&root.join("warden.conf"))?;
        let storage = Self::load_storage(&root.join("storage.conf"))?;
        let cameras = Self::load_cameras(&root.join("cameras.d"))?;

        let config = Config {
            supervisor,
            cameras,
            storage,
        };
        config.validate()?;
        Ok(config)
    }

    fn load_supervisor(path: &Path) -> Result<SupervisorConfig> {
        if !path.exists() {
            return Ok(SupervisorConfig::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let file: SupervisorFile = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(file.supervisor)
    }

    fn load_storage(path: &Path) -> Result<HashMap<String, StorageDescriptor>> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let file: StorageFile = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(file.backends)
    }

    fn load_cameras(dir: &Path) -> Result<Vec<CameraDescriptor>> {
        let mut cameras = Vec::new();
        if !dir.exists() {
            return Ok(cameras);
        }
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| ConfigError::Read {
                path: dir.display().to_string(),
                source: e,
            })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("conf"))
            .collect();
        entries.sort();
        for path in entries {
            let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
            let cam: CameraDescriptor = toml::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                source: e,
            })?;
            cameras.push(cam);
        }
        Ok(cameras)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(ConfigError::Invalid("no cameras configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for cam in &self.cameras {
            if !seen.insert(&cam.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate camera name '{}'",
                    cam.name
                )));
            }
            if cam.sinks.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "camera '{}' has no sinks configured",
                    cam.name
                )));
            }
            for sink_name in &cam.sinks {
                if !self.storage.contains_key(sink_name) {
                    return Err(ConfigError::Invalid(format!(
                        "camera '{}' references unknown storage '{}'",
                        cam.name, sink_name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn camera(&self, name: &str) -> Option<&CameraDescriptor> {
        self.cameras.iter().find(|c| c.name == name)
    }
}
