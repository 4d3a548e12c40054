use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn, Level};

use crate::error::{Error, Result};
use crate::events::{SandboxDomain, SandboxEvent};
use crate::snapshot::Snapshot;

const MAX_CONFIG_BYTES: u64 = 1024 * 1024;
const MAX_SNAPSHOT_BYTES: u64 = 256 * 1024 * 1024;
const MAX_HEAP_MB: usize = 16 * 1024;
const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;
const MIN_SAMPLE_INTERVAL_MS: u64 = 1;
const MAX_SAMPLE_INTERVAL_MS: u64 = 10_000;
const MAX_MARSHAL_DEPTH: usize = 1024;
const MAX_MARSHAL_VALUES: usize = 10_000_000;
const MAX_MARSHAL_BYTES: usize = 1024 * 1024 * 1024;

/// Settings fixed when an isolate is created.
#[derive(Debug, Clone)]
pub struct IsolateConfig {
    /// Hard heap ceiling. Never raised for the isolate's lifetime.
    pub max_heap_mb: usize,
    pub initial_heap_mb: usize,
    pub snapshot: Option<Snapshot>,
    /// Capture detailed stack traces for uncaught exceptions and trace every
    /// execution at debug level.
    pub enable_debugger: bool,
    /// Used when a request carries no timeout. `None` means unlimited.
    pub default_timeout: Option<Duration>,
    pub default_max_memory_delta: Option<usize>,
    /// How often heap usage is sampled while a script runs.
    pub memory_sample_interval: Duration,
    pub marshal_max_depth: usize,
    pub marshal_max_values: usize,
    /// Largest string or byte buffer copied out of the engine. Longer ones
    /// become value-limit placeholders.
    pub marshal_max_bytes: usize,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            max_heap_mb: 128,
            initial_heap_mb: 4,
            snapshot: None,
            enable_debugger: false,
            default_timeout: None,
            default_max_memory_delta: None,
            memory_sample_interval: Duration::from_millis(10),
            marshal_max_depth: 64,
            marshal_max_values: 100_000,
            marshal_max_bytes: 64 * 1024 * 1024,
        }
    }
}

impl IsolateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_heap_mb == 0 || self.max_heap_mb > MAX_HEAP_MB {
            return Err(Error::EngineInit(format!(
                "max_heap_mb must be between 1 and {}, got {}",
                MAX_HEAP_MB, self.max_heap_mb
            )));
        }
        if self.initial_heap_mb == 0 || self.initial_heap_mb > self.max_heap_mb {
            return Err(Error::EngineInit(format!(
                "initial_heap_mb must be between 1 and max_heap_mb ({}), got {}",
                self.max_heap_mb, self.initial_heap_mb
            )));
        }
        if self.memory_sample_interval.is_zero() {
            return Err(Error::EngineInit("memory_sample_interval must be positive".into()));
        }
        if self.marshal_max_depth == 0
            || self.marshal_max_values == 0
            || self.marshal_max_bytes == 0
        {
            return Err(Error::EngineInit("marshalling limits must be positive".into()));
        }
        if self.default_max_memory_delta == Some(0) {
            return Err(Error::EngineInit("default_max_memory_delta must be positive".into()));
        }
        Ok(())
    }
}

/// File configuration, TOML or YAML.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub isolate: Option<IsolateSection>,
    pub profiles: Option<HashMap<String, Profile>>,
    pub engine: Option<EngineConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Profile {
    pub isolate: Option<IsolateSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub flags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct IsolateSection {
    pub max_heap_mb: Option<usize>,
    pub initial_heap_mb: Option<usize>,
    pub enable_debugger: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub max_memory_delta_bytes: Option<usize>,
    pub memory_sample_interval_ms: Option<u64>,
    pub marshal_max_depth: Option<usize>,
    pub marshal_max_values: Option<usize>,
    pub marshal_max_bytes: Option<usize>,
    /// Path to a file written by `Snapshot::to_bytes`.
    pub snapshot: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if let Ok(meta) = fs::metadata(path) {
            if meta.len() > MAX_CONFIG_BYTES {
                return Err(anyhow::anyhow!(
                    "config {} exceeds {} bytes",
                    path.display(),
                    MAX_CONFIG_BYTES
                ));
            }
        }
        let data = fs::read_to_string(path)?;
        let cfg = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str::<Config>(&data)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str::<Config>(&data)?,
            _ => toml::from_str::<Config>(&data)
                .or_else(|_| serde_yaml::from_str::<Config>(&data))?,
        };
        Ok(cfg)
    }

    /// Applies the base `[isolate]` section, then the named profile on top.
    /// Invalid values are skipped with a warning.
    pub fn apply(&self, config: &mut IsolateConfig, profile: Option<&str>) {
        if let Some(section) = &self.isolate {
            apply_isolate(section, config);
        }
        if let Some(name) = profile {
            match self.profiles.as_ref().and_then(|profiles| profiles.get(name)) {
                Some(Profile { isolate: Some(section) }) => apply_isolate(section, config),
                Some(_) => {}
                None => warn!(profile = name, "Unknown config profile"),
            }
        }
    }

    /// Engine flags joined into one string for `platform::set_flags`.
    pub fn engine_flags(&self) -> Option<String> {
        let flags = self.engine.as_ref()?.flags.as_ref()?;
        let valid: Vec<&str> = flags
            .iter()
            .map(|flag| flag.trim())
            .filter(|flag| {
                let ok = flag.starts_with("--") && !flag.contains(char::is_whitespace);
                if !ok {
                    reject("invalid_engine_flag", "Invalid engine flag in config");
                    warn!(flag = *flag, "Invalid engine flag in config");
                }
                ok
            })
            .collect();
        (!valid.is_empty()).then(|| valid.join(" "))
    }

    pub fn logging_level(&self) -> Option<&str> {
        self.logging.as_ref()?.level.as_deref()
    }
}

fn reject(kind: &str, message: &str) {
    SandboxEvent::new(Level::WARN, SandboxDomain::Config, kind, message).emit();
}

fn apply_isolate(section: &IsolateSection, config: &mut IsolateConfig) {
    if let Some(v) = section.max_heap_mb {
        if v == 0 || v > MAX_HEAP_MB {
            reject("invalid_max_heap_mb", "Invalid max_heap_mb in config");
            warn!(value = v, limit = MAX_HEAP_MB, "Invalid max_heap_mb in config");
        } else {
            info!(value = v, "Config override max_heap_mb");
            config.max_heap_mb = v;
            config.initial_heap_mb = config.initial_heap_mb.min(v);
        }
    }
    if let Some(v) = section.initial_heap_mb {
        if v == 0 || v > config.max_heap_mb {
            reject("invalid_initial_heap_mb", "Invalid initial_heap_mb in config");
            warn!(value = v, max_heap_mb = config.max_heap_mb, "Invalid initial_heap_mb in config");
        } else {
            info!(value = v, "Config override initial_heap_mb");
            config.initial_heap_mb = v;
        }
    }
    if let Some(v) = section.enable_debugger {
        config.enable_debugger = v;
    }
    if let Some(v) = section.timeout_ms {
        if v == 0 || v > MAX_TIMEOUT_MS {
            reject("invalid_timeout_ms", "Invalid timeout_ms in config");
            warn!(value = v, limit = MAX_TIMEOUT_MS, "Invalid timeout_ms in config");
        } else {
            info!(value = v, "Config override timeout_ms");
            config.default_timeout = Some(Duration::from_millis(v));
        }
    }
    if let Some(v) = section.max_memory_delta_bytes {
        if v == 0 {
            reject("invalid_max_memory_delta_bytes", "Invalid max_memory_delta_bytes in config");
            warn!(value = v, "Invalid max_memory_delta_bytes in config");
        } else {
            info!(value = v, "Config override max_memory_delta_bytes");
            config.default_max_memory_delta = Some(v);
        }
    }
    if let Some(v) = section.memory_sample_interval_ms {
        if !(MIN_SAMPLE_INTERVAL_MS..=MAX_SAMPLE_INTERVAL_MS).contains(&v) {
            reject(
                "invalid_memory_sample_interval_ms",
                "Invalid memory_sample_interval_ms in config",
            );
            warn!(value = v, "Invalid memory_sample_interval_ms in config");
        } else {
            info!(value = v, "Config override memory_sample_interval_ms");
            config.memory_sample_interval = Duration::from_millis(v);
        }
    }
    if let Some(v) = section.marshal_max_depth {
        if v == 0 || v > MAX_MARSHAL_DEPTH {
            reject("invalid_marshal_max_depth", "Invalid marshal_max_depth in config");
            warn!(value = v, limit = MAX_MARSHAL_DEPTH, "Invalid marshal_max_depth in config");
        } else {
            info!(value = v, "Config override marshal_max_depth");
            config.marshal_max_depth = v;
        }
    }
    if let Some(v) = section.marshal_max_values {
        if v == 0 || v > MAX_MARSHAL_VALUES {
            reject("invalid_marshal_max_values", "Invalid marshal_max_values in config");
            warn!(value = v, limit = MAX_MARSHAL_VALUES, "Invalid marshal_max_values in config");
        } else {
            info!(value = v, "Config override marshal_max_values");
            config.marshal_max_values = v;
        }
    }
    if let Some(v) = section.marshal_max_bytes {
        if v == 0 || v > MAX_MARSHAL_BYTES {
            reject("invalid_marshal_max_bytes", "Invalid marshal_max_bytes in config");
            warn!(value = v, limit = MAX_MARSHAL_BYTES, "Invalid marshal_max_bytes in config");
        } else {
            info!(value = v, "Config override marshal_max_bytes");
            config.marshal_max_bytes = v;
        }
    }
    if let Some(path) = &section.snapshot {
        match load_snapshot(Path::new(path)) {
            Ok(snapshot) => {
                info!(path = %path, bytes = snapshot.len(), "Config override snapshot");
                config.snapshot = Some(snapshot);
            }
            Err(err) => {
                reject("invalid_snapshot", "Invalid snapshot in config");
                warn!(path = %path, error = %err, "Invalid snapshot in config");
            }
        }
    }
}

fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let meta = fs::metadata(path)?;
    if meta.len() > MAX_SNAPSHOT_BYTES {
        return Err(Error::EngineInit(format!("snapshot exceeds {} bytes", MAX_SNAPSHOT_BYTES)));
    }
    Snapshot::from_bytes(&fs::read(path)?)
}
