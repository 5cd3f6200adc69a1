// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for hyprlofs administration.
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file,
//! then `HYPRLOFS_*` environment variables. Nested keys use `__` in variable
//! names, e.g. `HYPRLOFS_LISTING__MAX_ATTEMPTS=8`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "HYPRLOFS";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HyprlofsConfig {
    /// Emit open/control/close events for every handle at INFO.
    pub debug: bool,
    pub mount: MountOptions,
    pub listing: ListingPolicy,
}

/// Arguments passed to `mount(2)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Special device argument; hyprlofs ignores it.
    pub special: String,
    pub fstype: String,
    pub options: String,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            special: "swap".to_string(),
            fstype: "hyprlofs".to_string(),
            options: "ro".to_string(),
        }
    }
}

/// Bounds for the listing retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingPolicy {
    /// Maximum number of sized `GET_ENTRIES` attempts; `0` retries forever.
    pub max_attempts: u32,
}

impl ListingPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 64;

    pub fn unbounded() -> Self {
        Self { max_attempts: 0 }
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

impl Default for ListingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl HyprlofsConfig {
    /// Load defaults, then `file` (when given), then the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_with_env(file, None)
    }

    /// Like [`HyprlofsConfig::load`], reading variables from `env` instead of
    /// the process environment when provided.
    pub fn load_with_env(
        file: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        // Absent keys fall back to `Default` through `#[serde(default)]`.
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let built = builder.build().with_context(|| match file {
            Some(path) => format!("loading configuration from {}", path.display()),
            None => "loading configuration".to_string(),
        })?;
        built.try_deserialize().context("invalid hyprlofs configuration")
    }

    /// Render the effective configuration as TOML, in the same shape
    /// [`HyprlofsConfig::load`] reads.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing hyprlofs configuration")
    }
}
