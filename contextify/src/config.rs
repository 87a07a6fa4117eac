//! Engine and runner configuration loaded through Figment
//!
//! Sources are merged in precedence order (later sources override earlier ones):
//! 1. Default values
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `CONTEXTIFY_`

use crate::error::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "CONTEXTIFY_";

/// Filename label used when `run` is not given one
pub const DEFAULT_ANONYMOUS_FILENAME: &str = "evalmachine.<anonymous>";

/// Default native stack guard for the runtime (512 KB)
pub const DEFAULT_MAX_STACK_SIZE: usize = 512 * 1024;

/// Settings applied to the engine runtime and to every `run`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextifyConfig {
    /// Filename label attributed to anonymous sources
    pub anonymous_filename: String,

    /// Runtime-wide allocation limit in bytes; `None` leaves QuickJS unlimited
    pub memory_limit: Option<usize>,

    /// Runtime native stack limit in bytes
    pub max_stack_size: Option<usize>,

    /// Run queued promise jobs before a `run` call exits its context
    pub drain_pending_jobs: bool,
}

impl Default for ContextifyConfig {
    fn default() -> Self {
        Self {
            anonymous_filename: DEFAULT_ANONYMOUS_FILENAME.to_string(),
            memory_limit: None,
            max_stack_size: Some(DEFAULT_MAX_STACK_SIZE),
            drain_pending_jobs: true,
        }
    }
}

impl ContextifyConfig {
    /// Load defaults overridden by `CONTEXTIFY_*` environment variables
    pub fn load() -> Result<Self> {
        Self::extract(Self::figment())
    }

    /// Load defaults, then `path` as TOML, then environment overrides
    ///
    /// A missing file is not an error; Figment treats it as an empty source.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading contextify configuration from {}", path.display());

        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));
        Self::extract(figment)
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract()?;
        debug!(?config, "Resolved contextify configuration");
        Ok(config)
    }

    /// Label for a `run` call, falling back to the anonymous filename
    pub fn filename_label<'a>(&'a self, filename: Option<&'a str>) -> &'a str {
        match filename {
            Some(name) if !name.is_empty() => name,
            _ => &self.anonymous_filename,
        }
    }
}
