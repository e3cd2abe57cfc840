// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Engine-level configuration via `flowlib.yaml`.

use crate::core::error::{FlowError, Result};
use crate::core::record::RecordSink;
use crate::core::session::ContainerKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_cache_window_secs() -> u64 {
    60
}

fn default_max_session_secs() -> u64 {
    600
}

/// Recording defaults from `flowlib.yaml`.
#[derive(Debug, Deserialize)]
pub struct RecordDefaults {
    /// Pre-event history to retain, in seconds.
    #[serde(default = "default_cache_window_secs")]
    pub cache_window_secs: u64,
    /// Ceiling on one session, in seconds.
    #[serde(default = "default_max_session_secs")]
    pub max_session_secs: u64,
    #[serde(default)]
    pub container: ContainerKind,
    /// Directory recordings land in. Unset means the sink keeps the
    /// directory it was built with.
    #[serde(default)]
    pub outdir: Option<PathBuf>,
}

impl Default for RecordDefaults {
    fn default() -> Self {
        Self {
            cache_window_secs: default_cache_window_secs(),
            max_session_secs: default_max_session_secs(),
            container: ContainerKind::default(),
            outdir: None,
        }
    }
}

/// Engine configuration from `flowlib.yaml`.
#[derive(Debug, Default, Deserialize)]
pub struct EngineConfig {
    /// Recording defaults applied to new record sinks.
    #[serde(default)]
    pub record: RecordDefaults,

    /// Frames buffered per link when no explicit capacity is given.
    #[serde(default)]
    pub link_capacity: Option<usize>,

    /// Fan-out consumer slots per tee.
    #[serde(default)]
    pub fanout_capacity: Option<usize>,
}

impl EngineConfig {
    /// Configuration file name.
    pub const FILE_NAME: &'static str = "flowlib.yaml";

    /// Load engine configuration from a directory. Returns error if the file
    /// is missing or cannot be parsed.
    pub fn load(project_path: &Path) -> Result<Self> {
        let config_path = project_path.join(Self::FILE_NAME);

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            FlowError::Configuration(format!("Failed to read {}: {}", config_path.display(), e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            FlowError::Configuration(format!("Failed to parse {}: {}", config_path.display(), e))
        })?;

        tracing::info!("Loaded engine config from {}", config_path.display());
        Ok(config)
    }

    /// Load engine configuration from a directory, returning defaults if the
    /// file is missing or unparseable.
    pub fn load_or_default(project_path: &Path) -> Self {
        let config_path = project_path.join(Self::FILE_NAME);

        if !config_path.exists() {
            tracing::debug!(
                "No {} found in {}, using defaults",
                Self::FILE_NAME,
                project_path.display()
            );
            return Self::default();
        }

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded engine config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read {}: {}, using defaults",
                    config_path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn cache_window(&self) -> Duration {
        Duration::from_secs(self.record.cache_window_secs)
    }

    pub fn max_session(&self) -> Duration {
        Duration::from_secs(self.record.max_session_secs)
    }

    /// Push the recording defaults onto a sink. Fails if the sink is
    /// mid-session or the configured directory does not exist.
    pub fn apply_record_defaults(&self, sink: &mut RecordSink) -> Result<()> {
        sink.set_cache_window(self.cache_window())?;
        sink.set_max_session(self.max_session())?;
        sink.set_container(self.record.container);
        if let Some(outdir) = &self.record.outdir {
            sink.set_outdir(outdir.clone())?;
        }
        Ok(())
    }
}
