// Runner configuration: command line / environment and the language image map
use anyhow::{bail, Context, Result};
use clap::Parser;
use mycode_common::config::{DEFAULT_PARALLELISM, DEFAULT_REDIS_URL};
use mycode_common::types::Language;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug, Clone)]
#[command(name = "mycode-runner", about = "Executes queued code jobs in sandboxed containers")]
pub struct RunnerConfig {
    #[arg(long, env = "DOCKER_HOST", default_value = "unix:///var/run/docker.sock")]
    pub docker_host: String,

    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Code jobs handled at once
    #[arg(long, env = "CODE_HANDLING_PARALLELISM", default_value_t = DEFAULT_PARALLELISM)]
    pub code_handling_parallelism: usize,

    #[arg(long, env = "LANGUAGES_CONFIG", default_value = "config/languages.json")]
    pub languages_config: PathBuf,

    /// Entrypoint binary inside the language images
    #[arg(long, env = "MYCODE_LAUNCHER", default_value = "mycode-run")]
    pub launcher: String,

    /// Where submitted sources are written before being mounted
    #[arg(long, env = "SOURCE_DIR")]
    pub source_dir: Option<PathBuf>,

    #[arg(long, env = "STATUS_ADDRESS")]
    pub status_address: Option<SocketAddr>,

    #[arg(long, env = "CONSUMER_NAME")]
    pub consumer_name: Option<String>,
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.code_handling_parallelism == 0 {
            bail!("code handling parallelism must be greater than zero");
        }
        if self.launcher.is_empty() {
            bail!("launcher must not be empty");
        }
        Ok(())
    }

    pub fn source_dir(&self) -> PathBuf {
        self.source_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub image: String,
}

#[derive(Debug, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Container image per language
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    images: HashMap<Language, String>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages config")?;

        let mut images = HashMap::new();
        for lang in languages_json.languages {
            let language: Language = lang
                .name
                .parse()
                .with_context(|| format!("Invalid entry in languages config: {}", lang.name))?;
            if lang.image.is_empty() {
                bail!("No image configured for language: {}", lang.name);
            }
            images.insert(language, lang.image);
        }

        Ok(Self { images })
    }

    /// Get Docker image for a language
    pub fn get_image(&self, language: Language) -> Result<&str> {
        self.images
            .get(&language)
            .map(String::as_str)
            .ok_or_else(|| anyhow::anyhow!("unsupported language: {}", language))
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.images.keys().copied().collect();
        languages.sort_by_key(|l| l.code());
        languages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_shipped_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
        let manager = LanguageConfigManager::load(&path).unwrap();

        assert_eq!(manager.list_languages(), Language::ALL.to_vec());
        assert_eq!(manager.get_image(Language::Pascal).unwrap(), "mycode-pascal");
    }

    #[test]
    fn test_missing_language_is_unsupported() {
        let manager =
            LanguageConfigManager::from_json(r#"{"languages":[{"name":"c","image":"gcc"}]}"#).unwrap();

        assert_eq!(manager.get_image(Language::C).unwrap(), "gcc");
        let err = manager.get_image(Language::Java).unwrap_err();
        assert!(err.to_string().contains("unsupported language"));
    }

    #[test]
    fn test_unknown_language_name_is_rejected() {
        let result = LanguageConfigManager::from_json(r#"{"languages":[{"name":"cobol","image":"x"}]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_parallelism_is_rejected() {
        let config = RunnerConfig::parse_from(["mycode-runner", "--code-handling-parallelism", "0"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::parse_from(["mycode-runner"]);
        assert_eq!(config.launcher, "mycode-run");
        assert_eq!(config.languages_config, PathBuf::from("config/languages.json"));
    }
}
