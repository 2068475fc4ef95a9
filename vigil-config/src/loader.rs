use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};

use crate::models::VigilConfig;

pub const CONFIG_PATH_ENV: &str = "VIGIL_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "VIGIL_CONFIG_JSON";

const CANDIDATES: &[&str] = &[
    "vigil.toml",
    "vigil.json",
    "config/vigil.toml",
    "config/vigil.json",
];

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    Explicit(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => f.write_str("built-in defaults"),
            ConfigSource::Explicit(path) => write!(f, "{}", path.display()),
            ConfigSource::EnvPath(path) => write!(f, "${CONFIG_PATH_ENV} ({})", path.display()),
            ConfigSource::EnvInline => write!(f, "${CONFIG_JSON_ENV}"),
            ConfigSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

impl VigilConfig {
    /// Load configuration from the environment.
    /// Evaluation order:
    /// 1) `$VIGIL_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$VIGIL_CONFIG_JSON` (inline JSON),
    /// 3) the first of `vigil.toml`, `vigil.json`, `config/vigil.{toml,json}`
    ///    relative to the working directory,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        let cwd = env::current_dir().context("cannot determine working directory")?;
        Self::load_with(|key| env::var(key).ok(), &cwd)
    }

    /// Same resolution as [`VigilConfig::load_from_env`] with an injectable
    /// variable lookup and base directory for default files.
    pub fn load_with(
        lookup: impl Fn(&str) -> Option<String>,
        base_dir: &Path,
    ) -> anyhow::Result<(Self, ConfigSource)> {
        if let Some(path_str) = lookup(CONFIG_PATH_ENV)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            tracing::debug!(path = %path.display(), "loading config from {CONFIG_PATH_ENV}");
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = lookup(CONFIG_JSON_ENV)
            && !raw.trim().is_empty()
        {
            tracing::debug!(bytes = raw.len(), "loading inline config from {CONFIG_JSON_ENV}");
            let parsed = Self::parse_json(&raw).with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file(base_dir) {
            tracing::debug!(path = %path.display(), "found config file");
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        tracing::info!(base_dir = %base_dir.display(), "no config file found, using built-in defaults");
        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read vigil config from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid vigil config {}", path.display())),
            Some("toml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid vigil config {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    /// Try TOML, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            tracing::debug!(origin, "not valid toml, trying json: {toml_err}");
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse vigil config {origin}: toml error: {toml_err}; json error: {json_err}"
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid vigil config json: {err}"))
    }

    fn find_default_file(base_dir: &Path) -> Option<PathBuf> {
        CANDIDATES
            .iter()
            .map(|candidate| base_dir.join(candidate))
            .find(|path| path.exists())
    }
}
