use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use orin_backend::LlamaCppConfig;
use orin_core::{
    GenerationParams, Markers, ReasoningDisplay, VerificationConfig, DEFAULT_SYSTEM_PROMPT,
    DEFAULT_WINDOW_SIZE,
};

/// Prefix of environment variables that override the config file.
pub const ENV_PREFIX: &str = "ORIN_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: LlamaCppConfig,

    #[serde(default)]
    pub generation: GenerationParams,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub markers: Markers,

    #[serde(default)]
    pub verification: VerificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Number of recent question/answer pairs sent with each prompt
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default)]
    pub thinking: ReasoningDisplay,

    /// Critique and revise answers before showing them as final
    #[serde(default)]
    pub verify: bool,

    /// Per-call timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Write a JSON-lines transcript of each session
    #[serde(default = "default_true")]
    pub transcript: bool,

    /// Transcript directory (supports $VAR, ${VAR}, ~)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_dir: Option<String>,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            window_size: default_window_size(),
            thinking: ReasoningDisplay::default(),
            verify: false,
            timeout_secs: None,
            transcript: true,
            transcript_dir: None, // Will default to <data dir>/orin/sessions
        }
    }
}

/// Expand environment variables in a path string
/// Supports: $VAR, ${VAR}, ~
pub fn expand_path(path: &str) -> PathBuf {
    let mut result = path.to_string();

    // Expand ~ at the start
    if result.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            result = format!("{}{}", home.display(), &result[1..]);
        }
    } else if result == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    // Expand $VAR and ${VAR}
    let re = match regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") {
        Ok(re) => re,
        Err(_) => return PathBuf::from(result),
    };
    let expanded = re.replace_all(&result, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    });

    PathBuf::from(expanded.to_string())
}

fn expand_path_buf(path: &Path) -> PathBuf {
    expand_path(&path.to_string_lossy())
}

impl Config {
    /// Load defaults, then the config file, then `ORIN_*` environment variables.
    ///
    /// An explicitly given file must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Configuration file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => Self::config_path()?,
        };

        tracing::debug!(path = %config_path.display(), "Loading configuration");
        Self::from_figment(Self::figment(&config_path))
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: Config = figment.extract().context("Invalid configuration")?;
        config.expand_paths();
        config
            .markers
            .validate()
            .context("Invalid [markers] configuration")?;
        Ok(config)
    }

    fn expand_paths(&mut self) {
        self.backend.binary = expand_path_buf(&self.backend.binary);
        if !self.backend.model.as_os_str().is_empty() {
            self.backend.model = expand_path_buf(&self.backend.model);
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("orin"))
    }

    /// Line-editor history file.
    pub fn history_path() -> Option<PathBuf> {
        Self::config_dir().ok().map(|d| d.join("history"))
    }

    pub fn transcript_dir(&self) -> Option<PathBuf> {
        match &self.session.transcript_dir {
            Some(dir) => Some(expand_path(dir)),
            None => dirs::data_dir().map(|d| d.join("orin").join("sessions")),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
