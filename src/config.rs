//! Brain-home layout and configuration loading.
//!
//! The brain home (default `${HOME}/.ragforge`) holds `config.yaml` (ports,
//! embedding config, cleanup policy — never credentials), `.env` (credentials
//! and provider keys, generated on first run), `docker-compose.yml` for the
//! graph-store container, and the `brain/`, `cache/`, `logs/` directories.
//! Priority: shell env (`RAGFORGE_*`) > `config.yaml` > built-in defaults;
//! `.env` only feeds credentials into the environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Error, Result};

/// Supported embedding provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EmbeddingProviderType {
    OpenAI,
    Ollama,
    Custom,
    Mock,
}

impl FromStr for EmbeddingProviderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            "custom" => Ok(Self::Custom),
            "mock" => Ok(Self::Mock),
            other => Err(Error::Config(format!(
                "unknown embedding provider '{other}': expected openai, ollama, custom, or mock"
            ))),
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Brain home directory.
    pub home: PathBuf,

    pub embedding_provider: EmbeddingProviderType,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embedding_batch_size: usize,
    pub openai_api_key: Option<String>,
    pub ollama_host: String,
    pub embedding_endpoint: Option<String>,

    /// Default include globs for ingestion (empty = all indexable files).
    pub include: Vec<String>,
    /// Default exclude globs for ingestion.
    pub exclude: Vec<String>,

    /// Filesystem watcher batch window.
    pub watch_batch_ms: u64,
    /// Agent edit-queue debounce.
    pub edit_debounce_ms: u64,
    /// Lock acquisition timeout (0 = wait forever).
    pub lock_timeout_ms: u64,
    /// `wait_for_pending_edits` default timeout.
    pub edit_wait_timeout_ms: u64,

    pub chunk_max_tokens: usize,
    pub chunk_overlap_tokens: usize,

    pub search_default_limit: usize,
    pub search_min_score: f64,

    /// Quick-ingest retention before GC, in days.
    pub retention_days: i64,

    /// Graph-store container ports (written into docker-compose.yml).
    pub bolt_port: u16,
    pub http_port: u16,
}

/// Shape of `config.yaml`. Everything optional; absent keys fall back.
#[derive(Debug, Clone, Default, Deserialize)]
struct YamlConfig {
    #[serde(default)]
    ports: YamlPorts,
    #[serde(default)]
    embedding: YamlEmbedding,
    #[serde(default)]
    ingestion: YamlIngestion,
    #[serde(default)]
    search: YamlSearch,
    #[serde(default)]
    cleanup: YamlCleanup,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct YamlPorts {
    bolt: Option<u16>,
    http: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct YamlEmbedding {
    provider: Option<String>,
    model: Option<String>,
    dimensions: Option<usize>,
    batch_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct YamlIngestion {
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
    watch_batch_ms: Option<u64>,
    edit_debounce_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct YamlSearch {
    default_limit: Option<usize>,
    min_score: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct YamlCleanup {
    retention_days: Option<i64>,
}

const DEFAULT_CONFIG_YAML: &str = "\
# ragforge configuration (credentials live in .env, never here)

ports:
  bolt: 7687
  http: 7474

embedding:
  provider: openai
  model: text-embedding-3-large
  dimensions: 3072
  batch_size: 100

ingestion:
  include: []
  exclude: []
  watch_batch_ms: 1000
  edit_debounce_ms: 500

search:
  default_limit: 10
  min_score: 0.3

cleanup:
  retention_days: 30
";

const DOCKER_COMPOSE_YML: &str = "\
services:
  graph:
    image: neo4j:5
    restart: unless-stopped
    ports:
      - \"${RAGFORGE_BOLT_PORT:-7687}:7687\"
      - \"${RAGFORGE_HTTP_PORT:-7474}:7474\"
    environment:
      - NEO4J_AUTH=neo4j/${RAGFORGE_GRAPH_PASSWORD}
    volumes:
      - ./brain/neo4j:/data
";

impl Config {
    /// Resolve the brain home: explicit argument, then `RAGFORGE_HOME`, then
    /// `${HOME}/.ragforge`.
    pub fn resolve_home(home: Option<&Path>) -> Result<PathBuf> {
        if let Some(h) = home {
            return Ok(h.to_path_buf());
        }
        if let Ok(h) = std::env::var("RAGFORGE_HOME") {
            return Ok(PathBuf::from(h));
        }
        dirs::home_dir()
            .map(|h| h.join(".ragforge"))
            .ok_or_else(|| Error::Init("could not resolve home directory".into()))
    }

    /// Load configuration, creating the brain-home layout on first run.
    pub fn load(home: Option<&Path>) -> Result<Self> {
        let home = Self::resolve_home(home)?;
        ensure_layout(&home)?;

        // .env carries credentials only; it never overrides shell env.
        let _ = dotenvy::from_path(home.join(".env"));

        let yaml = read_yaml(&home.join("config.yaml"))?;

        let embedding_provider = env_or(
            "RAGFORGE_EMBEDDING_PROVIDER",
            yaml.embedding.provider.as_deref().unwrap_or("openai"),
        )
        .parse::<EmbeddingProviderType>()?;

        let embedding_model = env_or(
            "RAGFORGE_EMBEDDING_MODEL",
            yaml.embedding
                .model
                .as_deref()
                .unwrap_or("text-embedding-3-large"),
        );

        let embedding_dimensions = parse_env(
            "RAGFORGE_EMBEDDING_DIMENSIONS",
            yaml.embedding.dimensions.unwrap_or(3072),
        )?;
        let embedding_batch_size = parse_env(
            "RAGFORGE_EMBEDDING_BATCH_SIZE",
            yaml.embedding.batch_size.unwrap_or(100),
        )?;

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let ollama_host = env_or("OLLAMA_HOST", "http://localhost:11434");
        let embedding_endpoint = std::env::var("RAGFORGE_EMBEDDING_ENDPOINT").ok();

        let include = list_env("RAGFORGE_INCLUDE", yaml.ingestion.include.unwrap_or_default());
        let exclude = list_env("RAGFORGE_EXCLUDE", yaml.ingestion.exclude.unwrap_or_default());

        let watch_batch_ms = parse_env(
            "RAGFORGE_WATCH_BATCH_MS",
            yaml.ingestion.watch_batch_ms.unwrap_or(1000),
        )?;
        let edit_debounce_ms = parse_env(
            "RAGFORGE_EDIT_DEBOUNCE_MS",
            yaml.ingestion.edit_debounce_ms.unwrap_or(500),
        )?;
        let lock_timeout_ms = parse_env("RAGFORGE_LOCK_TIMEOUT_MS", 300_000u64)?;
        let edit_wait_timeout_ms = parse_env("RAGFORGE_EDIT_WAIT_TIMEOUT_MS", 30_000u64)?;

        let chunk_max_tokens = parse_env("RAGFORGE_CHUNK_MAX_TOKENS", 512usize)?;
        let chunk_overlap_tokens = parse_env("RAGFORGE_CHUNK_OVERLAP_TOKENS", 50usize)?;

        let search_default_limit = parse_env(
            "RAGFORGE_SEARCH_DEFAULT_LIMIT",
            yaml.search.default_limit.unwrap_or(10),
        )?;
        let search_min_score = parse_env(
            "RAGFORGE_SEARCH_MIN_SCORE",
            yaml.search.min_score.unwrap_or(0.3),
        )?;

        let retention_days = parse_env(
            "RAGFORGE_RETENTION_DAYS",
            yaml.cleanup.retention_days.unwrap_or(30),
        )?;

        let bolt_port = parse_env("RAGFORGE_BOLT_PORT", yaml.ports.bolt.unwrap_or(7687))?;
        let http_port = parse_env("RAGFORGE_HTTP_PORT", yaml.ports.http.unwrap_or(7474))?;

        let config = Self {
            home,
            embedding_provider,
            embedding_model,
            embedding_dimensions,
            embedding_batch_size,
            openai_api_key,
            ollama_host,
            embedding_endpoint,
            include,
            exclude,
            watch_batch_ms,
            edit_debounce_ms,
            lock_timeout_ms,
            edit_wait_timeout_ms,
            chunk_max_tokens,
            chunk_overlap_tokens,
            search_default_limit,
            search_min_score,
            retention_days,
            bolt_port,
            http_port,
        };
        config.validate()?;
        Ok(config)
    }

    /// A config suitable for tests: mock provider, small vectors, everything
    /// rooted in the given directory.
    pub fn for_tests(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            embedding_provider: EmbeddingProviderType::Mock,
            embedding_model: "mock-model".into(),
            embedding_dimensions: 16,
            embedding_batch_size: 32,
            openai_api_key: None,
            ollama_host: "http://localhost:11434".into(),
            embedding_endpoint: None,
            include: Vec::new(),
            exclude: Vec::new(),
            watch_batch_ms: 50,
            edit_debounce_ms: 30,
            lock_timeout_ms: 5_000,
            edit_wait_timeout_ms: 5_000,
            chunk_max_tokens: 128,
            chunk_overlap_tokens: 16,
            search_default_limit: 10,
            search_min_score: 0.0,
            retention_days: 30,
            bolt_port: 7687,
            http_port: 7474,
        }
    }

    pub fn brain_dir(&self) -> PathBuf {
        self.home.join("brain")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    fn validate(&self) -> Result<()> {
        if self.embedding_dimensions == 0 {
            return Err(Error::Config("embedding dimensions must be > 0".into()));
        }
        if self.embedding_batch_size == 0 {
            return Err(Error::Config("embedding batch_size must be > 0".into()));
        }
        if self.chunk_overlap_tokens >= self.chunk_max_tokens {
            return Err(Error::Config(format!(
                "chunk overlap ({}) must be less than chunk max tokens ({})",
                self.chunk_overlap_tokens, self.chunk_max_tokens
            )));
        }
        if !(0.0..=1.0).contains(&self.search_min_score) {
            return Err(Error::Config(format!(
                "search min_score ({}) must be in [0.0, 1.0]",
                self.search_min_score
            )));
        }
        if self.retention_days <= 0 {
            return Err(Error::Config("retention_days must be > 0".into()));
        }
        Ok(())
    }
}

/// Create the brain-home directory layout and seed files on first run.
pub fn ensure_layout(home: &Path) -> Result<()> {
    for dir in ["brain", "cache", "logs"] {
        std::fs::create_dir_all(home.join(dir))?;
    }

    let config_path = home.join("config.yaml");
    if !config_path.exists() {
        std::fs::write(&config_path, DEFAULT_CONFIG_YAML)?;
        info!(path = %config_path.display(), "created default config.yaml");
    }

    let env_path = home.join(".env");
    if !env_path.exists() {
        let password = generate_password();
        let contents = format!(
            "# ragforge credentials — generated, do not commit\nRAGFORGE_GRAPH_PASSWORD={password}\n# OPENAI_API_KEY=\n"
        );
        std::fs::write(&env_path, contents)?;
        info!(path = %env_path.display(), "generated .env with graph-store password");
    }

    let compose_path = home.join("docker-compose.yml");
    if !compose_path.exists() {
        std::fs::write(&compose_path, DOCKER_COMPOSE_YML)?;
    }
    Ok(())
}

/// Random 16-char alphanumeric password, seeded from the clock and pid.
fn generate_password() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .map(|b| {
            const ALPHABET: &[u8] =
                b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";
            ALPHABET[(*b as usize) % ALPHABET.len()] as char
        })
        .take(16)
        .collect()
}

fn read_yaml(path: &Path) -> Result<YamlConfig> {
    if !path.exists() {
        return Ok(YamlConfig::default());
    }
    let raw = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid config.yaml: {e}")))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| Error::Config(format!("failed to parse {key}='{val}': {e}"))),
        Err(_) => Ok(default),
    }
}

fn list_env(key: &str, default: Vec<String>) -> Vec<String> {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => {
            val.split(',').map(|s| s.trim().to_string()).collect()
        }
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serializes tests that read/write environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const RAGFORGE_VARS: &[&str] = &[
        "RAGFORGE_HOME",
        "RAGFORGE_EMBEDDING_PROVIDER",
        "RAGFORGE_EMBEDDING_MODEL",
        "RAGFORGE_EMBEDDING_DIMENSIONS",
        "RAGFORGE_EMBEDDING_BATCH_SIZE",
        "RAGFORGE_EMBEDDING_ENDPOINT",
        "RAGFORGE_INCLUDE",
        "RAGFORGE_EXCLUDE",
        "RAGFORGE_WATCH_BATCH_MS",
        "RAGFORGE_EDIT_DEBOUNCE_MS",
        "RAGFORGE_LOCK_TIMEOUT_MS",
        "RAGFORGE_EDIT_WAIT_TIMEOUT_MS",
        "RAGFORGE_CHUNK_MAX_TOKENS",
        "RAGFORGE_CHUNK_OVERLAP_TOKENS",
        "RAGFORGE_SEARCH_DEFAULT_LIMIT",
        "RAGFORGE_SEARCH_MIN_SCORE",
        "RAGFORGE_RETENTION_DAYS",
        "RAGFORGE_BOLT_PORT",
        "RAGFORGE_HTTP_PORT",
        "OPENAI_API_KEY",
    ];

    fn clear_env() {
        for var in RAGFORGE_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn provider_type_case_insensitive() {
        assert_eq!(
            "openai".parse::<EmbeddingProviderType>().unwrap(),
            EmbeddingProviderType::OpenAI
        );
        assert_eq!(
            "OLLAMA".parse::<EmbeddingProviderType>().unwrap(),
            EmbeddingProviderType::Ollama
        );
        assert_eq!(
            "Mock".parse::<EmbeddingProviderType>().unwrap(),
            EmbeddingProviderType::Mock
        );
        assert!("unknown".parse::<EmbeddingProviderType>().is_err());
    }

    #[test]
    fn first_run_creates_layout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let home = dir.path().join(".ragforge");

        let config = Config::load(Some(&home)).unwrap();
        assert!(home.join("brain").is_dir());
        assert!(home.join("cache").is_dir());
        assert!(home.join("logs").is_dir());
        assert!(home.join("config.yaml").is_file());
        assert!(home.join(".env").is_file());
        assert!(home.join("docker-compose.yml").is_file());
        assert_eq!(config.embedding_dimensions, 3072);
        assert_eq!(config.watch_batch_ms, 1000);
        assert_eq!(config.edit_debounce_ms, 500);
        assert_eq!(config.lock_timeout_ms, 300_000);
        assert_eq!(config.edit_wait_timeout_ms, 30_000);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.search_min_score, 0.3);
    }

    #[test]
    fn generated_env_has_password() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let home = dir.path().join(".ragforge");
        Config::load(Some(&home)).unwrap();

        let env = std::fs::read_to_string(home.join(".env")).unwrap();
        let password = env
            .lines()
            .find_map(|l| l.strip_prefix("RAGFORGE_GRAPH_PASSWORD="))
            .unwrap();
        assert_eq!(password.len(), 16);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn existing_env_is_not_regenerated() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let home = dir.path().join(".ragforge");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join(".env"), "RAGFORGE_GRAPH_PASSWORD=keepme12345678\n").unwrap();

        Config::load(Some(&home)).unwrap();
        let env = std::fs::read_to_string(home.join(".env")).unwrap();
        assert!(env.contains("keepme12345678"));
    }

    #[test]
    fn yaml_values_override_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let home = dir.path().join(".ragforge");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(
            home.join("config.yaml"),
            "embedding:\n  dimensions: 768\n  provider: ollama\nsearch:\n  min_score: 0.5\n",
        )
        .unwrap();

        let config = Config::load(Some(&home)).unwrap();
        assert_eq!(config.embedding_dimensions, 768);
        assert_eq!(config.embedding_provider, EmbeddingProviderType::Ollama);
        assert_eq!(config.search_min_score, 0.5);
    }

    #[test]
    fn env_overrides_yaml() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let home = dir.path().join(".ragforge");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join("config.yaml"), "embedding:\n  dimensions: 768\n").unwrap();

        std::env::set_var("RAGFORGE_EMBEDDING_DIMENSIONS", "1536");
        let config = Config::load(Some(&home));
        std::env::remove_var("RAGFORGE_EMBEDDING_DIMENSIONS");
        assert_eq!(config.unwrap().embedding_dimensions, 1536);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let home = dir.path().join(".ragforge");

        std::env::set_var("RAGFORGE_EMBEDDING_DIMENSIONS", "0");
        let result = Config::load(Some(&home));
        std::env::remove_var("RAGFORGE_EMBEDDING_DIMENSIONS");
        assert!(result.is_err());

        std::env::set_var("RAGFORGE_SEARCH_MIN_SCORE", "1.5");
        let result = Config::load(Some(&home));
        std::env::remove_var("RAGFORGE_SEARCH_MIN_SCORE");
        assert!(result.is_err());

        std::env::set_var("RAGFORGE_CHUNK_MAX_TOKENS", "10");
        std::env::set_var("RAGFORGE_CHUNK_OVERLAP_TOKENS", "20");
        let result = Config::load(Some(&home));
        std::env::remove_var("RAGFORGE_CHUNK_MAX_TOKENS");
        std::env::remove_var("RAGFORGE_CHUNK_OVERLAP_TOKENS");
        assert!(result.is_err());
    }

    #[test]
    fn comma_separated_globs() {
        let _lock = ENV_MUTEX.lock().unwrap();
        std::env::set_var("RAGFORGE_INCLUDE", " src/**/*.ts , docs/**/*.md ");
        let globs = list_env("RAGFORGE_INCLUDE", vec![]);
        std::env::remove_var("RAGFORGE_INCLUDE");
        assert_eq!(globs, vec!["src/**/*.ts".to_string(), "docs/**/*.md".to_string()]);
    }

    #[test]
    fn parse_error_mentions_key() {
        let _lock = ENV_MUTEX.lock().unwrap();
        std::env::set_var("RAGFORGE_BOLT_PORT", "not-a-port");
        let result: Result<u16> = parse_env("RAGFORGE_BOLT_PORT", 7687);
        std::env::remove_var("RAGFORGE_BOLT_PORT");
        assert!(result.unwrap_err().to_string().contains("RAGFORGE_BOLT_PORT"));
    }
}
