pub mod error;

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    models::{
        Config, ConfigMetadata, ConfigSource, FileConfig, RedisConfig,
    },
    validation::{ConfigWarnings, apply_guard_rails},
};
use error::ConfigLoadError;

const DEFAULT_FILE_CANDIDATES: &[&str] = &[
    "perimeter.toml",
    "perimeter.json",
    "config/perimeter.toml",
    "config/perimeter.json",
];

/// Result of a successful load.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

/// Resolves [`Config`] from the environment, an optional `.env` file and
/// TOML/JSON config files.
///
/// Evaluation order for the file-level settings:
/// 1) `$PERIMETER_CONFIG_PATH` (TOML or JSON file),
/// 2) `$PERIMETER_CONFIG_JSON` (inline JSON),
/// 3) the first of `perimeter.toml`, `perimeter.json`,
///    `config/perimeter.toml`, `config/perimeter.json` under the search root,
/// 4) defaults.
///
/// `REDIS_URL` and `PERIMETER_REDIS_PREFIX` override whatever the file
/// says. Values in the process environment win over the `.env` file; the
/// `.env` file is read but never written into the process environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    env_file: Option<PathBuf>,
    search_root: PathBuf,
    env: Option<HashMap<String, String>>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            env_file: Some(PathBuf::from(".env")),
            search_root: PathBuf::from("."),
            env: None,
        }
    }

    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    pub fn without_env_file(mut self) -> Self {
        self.env_file = None;
        self
    }

    /// Directory the default file candidates are resolved against.
    pub fn with_search_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.search_root = root.into();
        self
    }

    /// Use `vars` instead of the process environment.
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let (dotenv, env_file_loaded) = self.read_env_file()?;
        let lookup = |name: &str| -> Option<String> {
            let value = match &self.env {
                Some(vars) => vars.get(name).cloned(),
                None => std::env::var(name).ok(),
            };
            value
                .or_else(|| dotenv.get(name).cloned())
                .filter(|value| !value.trim().is_empty())
        };

        let (file, source) = self.resolve_file(&lookup)?;

        let mut redis = RedisConfig::default();
        if let Some(file_redis) = file.redis {
            if let Some(url) = file_redis.url {
                redis.url = url;
            }
            if let Some(prefix) = file_redis.prefix {
                redis.prefix = prefix;
            }
        }
        let redis_url_from_env = match lookup("REDIS_URL") {
            Some(url) => {
                redis.url = url.trim().to_string();
                true
            }
            None => false,
        };
        if let Some(prefix) = lookup("PERIMETER_REDIS_PREFIX") {
            redis.prefix = prefix.trim().to_string();
        }

        let config = Config {
            redis,
            pipeline: file.pipeline.unwrap_or_default(),
            metadata: ConfigMetadata {
                source,
                env_file_loaded,
                redis_url_from_env,
            },
        };
        let warnings = apply_guard_rails(&config)?;
        debug!(
            source = ?config.metadata.source,
            warnings = warnings.len(),
            "configuration loaded"
        );
        Ok(ConfigLoad { config, warnings })
    }

    fn read_env_file(
        &self,
    ) -> Result<(HashMap<String, String>, bool), ConfigLoadError> {
        let Some(path) = &self.env_file else {
            return Ok((HashMap::new(), false));
        };
        if !path.exists() {
            return Ok((HashMap::new(), false));
        }
        let mut vars = HashMap::new();
        for item in dotenvy::from_path_iter(path)? {
            let (key, value) = item?;
            vars.insert(key, value);
        }
        Ok((vars, true))
    }

    fn resolve_file(
        &self,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<(FileConfig, ConfigSource), ConfigLoadError> {
        if let Some(raw_path) = lookup("PERIMETER_CONFIG_PATH") {
            let path = PathBuf::from(raw_path.trim());
            let file = load_file(&path)?;
            return Ok((file, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = lookup("PERIMETER_CONFIG_JSON") {
            let file = parse_json(&raw, "PERIMETER_CONFIG_JSON")?;
            return Ok((file, ConfigSource::EnvInline));
        }

        if let Some(path) = DEFAULT_FILE_CANDIDATES
            .iter()
            .map(|candidate| self.search_root.join(candidate))
            .find(|path| path.exists())
        {
            let file = load_file(&path)?;
            return Ok((file, ConfigSource::File(path)));
        }

        Ok((FileConfig::default(), ConfigSource::Default))
    }
}

pub fn load_file(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|source| ConfigLoadError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    let origin = path.display().to_string();

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents, &origin),
        Some("toml") | Some("tml") => toml::from_str(&contents).map_err(|err| {
            ConfigLoadError::Parse {
                origin,
                message: err.to_string(),
            }
        }),
        _ => parse_from_str(&contents, &origin),
    }
}

/// Try TOML first, then JSON.
pub fn parse_from_str(
    contents: &str,
    origin: &str,
) -> Result<FileConfig, ConfigLoadError> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            ConfigLoadError::Parse {
                origin: origin.to_string(),
                message: format!(
                    "toml error: {toml_err}; json error: {json_err}"
                ),
            }
        })
    })
}

fn parse_json(raw: &str, origin: &str) -> Result<FileConfig, ConfigLoadError> {
    serde_json::from_str(raw).map_err(|err| ConfigLoadError::Parse {
        origin: origin.to_string(),
        message: err.to_string(),
    })
}

