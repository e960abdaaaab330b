use crate::constants::{
    BIS_DEFAULT_URL, BIS_SOURCE, DEFAULT_CONFIG_PATH, DEFAULT_DB_PATH, DEFAULT_FETCH_TIMEOUT_SECS,
    DEFAULT_PORT, EU_DEFAULT_URL, EU_SOURCE, OFAC_DEFAULT_URL, OFAC_SOURCE,
};
use crate::error::{Result, WatchError};
use crate::parser::ParserKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One publisher: where to fetch it and how to read it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
    pub parser: ParserKind,
    /// Field separator for delimited sources, one ASCII byte (written as `";"` in TOML)
    #[serde(default = "default_delimiter", with = "ascii_delimiter")]
    pub delimiter: u8,
    #[serde(default)]
    pub list_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SourceConfig {
    pub fn new(id: &str, url: &str, parser: ParserKind) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            parser,
            delimiter: default_delimiter(),
            list_name: None,
            enabled: true,
        }
    }

    /// Human-facing list name stored on every entity from this source
    pub fn list_name(&self) -> &str {
        self.list_name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trigger_token: Option<String>,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub parallel: bool,
    /// Hard deadline for one invocation; outstanding runs are finalized as errors when it expires
    #[serde(default)]
    pub invocation_deadline_secs: Option<u64>,
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trigger_token: None,
            db_path: default_db_path(),
            port: default_port(),
            fetch_timeout_secs: default_fetch_timeout(),
            parallel: true,
            invocation_deadline_secs: None,
            sources: default_sources(),
        }
    }
}

impl Config {
    /// Load from `path` (or the default config file when present), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            WatchError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(token) = std::env::var("WATCH_TRIGGER_TOKEN") {
            self.trigger_token = Some(token);
        }
        if let Ok(db_path) = std::env::var("WATCH_DB_PATH") {
            self.db_path = db_path;
        }
        if let Ok(port) = std::env::var("WATCH_PORT") {
            self.port = port
                .parse()
                .map_err(|_| WatchError::Config(format!("WATCH_PORT is not a valid port: {port}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch_timeout_secs == 0 {
            return Err(WatchError::Config("fetch_timeout_secs must be positive".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.id.is_empty() || source.id.contains(':') {
                return Err(WatchError::Config(format!(
                    "invalid source id '{}': must be non-empty and must not contain ':'",
                    source.id
                )));
            }
            if !source.delimiter.is_ascii() || matches!(source.delimiter, b'"' | b'\n' | b'\r') {
                return Err(WatchError::Config(format!(
                    "invalid delimiter {:?} for source '{}': must be one ASCII byte other than a quote or line break",
                    char::from(source.delimiter),
                    source.id
                )));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(WatchError::Config(format!("duplicate source id '{}'", source.id)));
            }
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Enabled sources restricted to `ids` (case-insensitive); all enabled sources when `ids` is empty.
    pub fn select_sources(&self, ids: &[String]) -> Vec<SourceConfig> {
        self.enabled_sources()
            .filter(|s| ids.is_empty() || ids.iter().any(|id| id.eq_ignore_ascii_case(&s.id)))
            .cloned()
            .collect()
    }
}

fn default_delimiter() -> u8 {
    b','
}

mod ascii_delimiter {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(delimiter: &u8, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&char::from(*delimiter).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.as_bytes() {
            [b] if b.is_ascii() => Ok(*b),
            _ => Err(de::Error::custom(format!(
                "delimiter must be a single ASCII character, got {raw:?}"
            ))),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_fetch_timeout() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            list_name: Some("OFAC Specially Designated Nationals".into()),
            ..SourceConfig::new(OFAC_SOURCE, OFAC_DEFAULT_URL, ParserKind::Delimited)
        },
        SourceConfig {
            list_name: Some("BIS Entity List".into()),
            ..SourceConfig::new(BIS_SOURCE, BIS_DEFAULT_URL, ParserKind::HtmlTable)
        },
        SourceConfig {
            list_name: Some("EU Consolidated Financial Sanctions".into()),
            ..SourceConfig::new(EU_SOURCE, EU_DEFAULT_URL, ParserKind::Opaque)
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_three_sources() {
        let config = Config::default();
        let ids: Vec<&str> = config.sources.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["OFAC", "BIS", "EU"]);
        assert_eq!(config.fetch_timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_toml_with_partial_fields() {
        let config = Config::from_toml(
            r#"
            trigger_token = "s3cret"
            fetch_timeout_secs = 5
            parallel = false

            [[sources]]
            id = "UK"
            url = "https://example.org/uk.csv"
            parser = "delimited"
            delimiter = ";"
            "#,
        )
        .unwrap();
        assert_eq!(config.trigger_token.as_deref(), Some("s3cret"));
        assert!(!config.parallel);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].delimiter, b';');
        assert_eq!(config.sources[0].list_name(), "UK");
        assert_eq!(config.db_path, DEFAULT_DB_PATH);
    }

    #[test]
    fn rejects_colon_in_source_id() {
        let mut config = Config::default();
        config.sources[0].id = "OF:AC".into();
        assert!(matches!(config.validate(), Err(WatchError::Config(_))));
    }

    #[test]
    fn delimiter_must_be_one_ascii_byte() {
        let source = |delimiter: &str| {
            format!(
                "[[sources]]\nid = \"UK\"\nurl = \"https://example.org/uk.csv\"\nparser = \"delimited\"\ndelimiter = \"{delimiter}\"\n"
            )
        };
        assert_eq!(Config::from_toml(&source("|")).unwrap().sources[0].delimiter, b'|');
        assert!(Config::from_toml(&source("§")).is_err());
        assert!(Config::from_toml(&source(";;")).is_err());

        let mut config = Config::default();
        config.sources[0].delimiter = 0xA7;
        assert!(matches!(config.validate(), Err(WatchError::Config(_))));
        config.sources[0].delimiter = b'"';
        assert!(matches!(config.validate(), Err(WatchError::Config(_))));
    }

    #[test]
    fn select_sources_filters_case_insensitively() {
        let config = Config::default();
        let picked = config.select_sources(&["ofac".to_string(), "eu".to_string()]);
        assert_eq!(picked.len(), 2);
        assert_eq!(config.select_sources(&[]).len(), 3);
    }
}
