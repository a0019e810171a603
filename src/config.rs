use serde::Deserialize;
use std::{env, fs, io, path::Path};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/invoice_intake.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0} env var required for the {1} backend")]
    MissingKey(&'static str, &'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Lifetime of cached `/records` and `/duplicates` responses.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub llm: LlmSection,
}

fn default_db_path() -> String {
    "data/invoices.db".to_string()
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_max_upload() -> usize {
    25 * 1024 * 1024
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// Google Gemini, reads the PDF itself.
    #[default]
    Gemini,
    /// Local Ollama server speaking the OpenAI chat API.
    Ollama,
    /// Any hosted OpenAI-compatible endpoint.
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub backend: LlmBackend,
    #[serde(default = "default_gemini")]
    pub gemini: Endpoint,
    #[serde(default = "default_ollama")]
    pub ollama: Endpoint,
    #[serde(default = "default_remote")]
    pub remote: Endpoint,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            backend: LlmBackend::default(),
            gemini: default_gemini(),
            ollama: default_ollama(),
            remote: default_remote(),
        }
    }
}

fn default_gemini() -> Endpoint {
    Endpoint {
        base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        model: "gemini-3-flash-preview".to_string(),
    }
}

fn default_ollama() -> Endpoint {
    Endpoint {
        base_url: "http://localhost:11434/v1".to_string(),
        model: "qwen3:8b".to_string(),
    }
}

fn default_remote() -> Endpoint {
    Endpoint {
        base_url: "https://api.openai.com/v1".to_string(),
        model: "gpt-4o-mini".to_string(),
    }
}

impl LlmSection {
    /// The endpoint of the selected backend.
    pub fn active(&self) -> &Endpoint {
        match self.backend {
            LlmBackend::Gemini => &self.gemini,
            LlmBackend::Ollama => &self.ollama,
            LlmBackend::Remote => &self.remote,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            upload_dir: default_upload_dir(),
            bind_addr: default_bind_addr(),
            cache_ttl_secs: default_cache_ttl(),
            max_upload_bytes: default_max_upload(),
            llm: LlmSection::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load the file if it exists, otherwise start from defaults, then
    /// apply `INVOICE_*` environment overrides.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_or_default_with(path, |key| env::var(key).ok())
    }

    fn load_or_default_with(
        path: impl AsRef<Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut cfg = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        cfg.apply_overrides(lookup);
        Ok(cfg)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("INVOICE_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = lookup("INVOICE_UPLOAD_DIR") {
            self.upload_dir = v;
        }
        if let Some(v) = lookup("INVOICE_BIND_ADDR") {
            self.bind_addr = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let cfg = Config::default();
        assert_eq!(cfg.db_path, "data/invoices.db");
        assert_eq!(cfg.upload_dir, "uploads");
        assert_eq!(cfg.cache_ttl_secs, 3600);
        assert_eq!(cfg.llm.backend, LlmBackend::Gemini);
        assert_eq!(cfg.llm.active().model, "gemini-3-flash-preview");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_or_default_with(dir.path().join("absent.toml"), |_| None).unwrap();
        assert_eq!(cfg.db_path, "data/invoices.db");
        assert_eq!(cfg.bind_addr, "127.0.0.1:5000");
        assert_eq!(cfg.max_upload_bytes, 25 * 1024 * 1024);
        assert_eq!(cfg.llm.backend, LlmBackend::Gemini);

        // Overrides still apply on top of defaults
        let cfg = Config::load_or_default_with(dir.path().join("absent.toml"), |key| {
            (key == "INVOICE_UPLOAD_DIR").then(|| "/srv/uploads".to_string())
        })
        .unwrap();
        assert_eq!(cfg.upload_dir, "/srv/uploads");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
db_path = "/tmp/inv.db"
cache_ttl_secs = 60

[llm]
backend = "ollama"

[llm.ollama]
base_url = "http://box:11434/v1"
model = "llama3"
"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.db_path, "/tmp/inv.db");
        assert_eq!(cfg.cache_ttl_secs, 60);
        assert_eq!(cfg.upload_dir, "uploads");
        assert_eq!(cfg.llm.backend, LlmBackend::Ollama);
        assert_eq!(cfg.llm.active().base_url, "http://box:11434/v1");
        // Untouched sections keep their defaults
        assert_eq!(cfg.llm.gemini.model, "gemini-3-flash-preview");
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "db_path = [").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_overrides(|key| match key {
            "INVOICE_DB_PATH" => Some("override.db".to_string()),
            "INVOICE_BIND_ADDR" => Some("0.0.0.0:8080".to_string()),
            _ => None,
        });
        assert_eq!(cfg.db_path, "override.db");
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.upload_dir, "uploads");
    }
}
