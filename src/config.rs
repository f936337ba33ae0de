//! YAML configuration: paths, notifier definitions, and watch definitions.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_ROOT: &str = "/etc/noidd";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/noidd/config.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("unknown timezone {0:?}")]
    Timezone(String),

    #[error("invalid glob {pattern:?} for watch {watch:?}: {source}")]
    Glob {
        watch: String,
        pattern: String,
        source: globset::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_root")]
    pub noidd_root: PathBuf,
    /// Store file path; defaults to `<noidd_root>/noidd.db`.
    #[serde(default)]
    pub leveldb: Option<PathBuf>,
    #[serde(default)]
    pub leveldb_recreate: bool,
    /// Log file path; defaults to `<noidd_root>/noidd.log`.
    #[serde(default)]
    pub logfile: Option<PathBuf>,
    /// Display zone for event timestamps.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Seconds between passes. Absent means a single pass.
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub notifiers: Vec<NotifierConfig>,
    #[serde(default)]
    pub watchers: Vec<WatchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotifierConfig {
    Stdout {
        #[serde(default)]
        batch: bool,
        #[serde(default = "default_message_limit")]
        message_limit: usize,
    },
    Twilio {
        twilio_account_sid: String,
        twilio_auth_token: String,
        twilio_from_number: String,
        recipients: Vec<String>,
        #[serde(default)]
        batch: bool,
        #[serde(default = "default_message_limit")]
        message_limit: usize,
        #[serde(default = "default_live")]
        live: bool,
    },
    Pushover {
        pushover_user_key: String,
        pushover_api_token: String,
        #[serde(default)]
        batch: bool,
        #[serde(default = "default_message_limit")]
        message_limit: usize,
        #[serde(default = "default_live")]
        live: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    pub name: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub directories: Vec<DirectoryWatch>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryWatch {
    pub path: PathBuf,
    pub glob: String,
}

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_timezone() -> String {
    "US/Eastern".to_string()
}

fn default_message_limit() -> usize {
    5
}

fn default_live() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.leveldb
            .clone()
            .unwrap_or_else(|| self.noidd_root.join("noidd.db"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.logfile
            .clone()
            .unwrap_or_else(|| self.noidd_root.join("noidd.log"))
    }

    pub fn display_zone(&self) -> Result<Tz, ConfigError> {
        Tz::from_str(&self.timezone).map_err(|_| ConfigError::Timezone(self.timezone.clone()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.watchers.is_empty() {
            return Err(ConfigError::Invalid("no watchers configured".to_string()));
        }

        let mut names = HashSet::new();
        for watch in &self.watchers {
            if watch.name.is_empty() {
                return Err(ConfigError::Invalid("watch with an empty name".to_string()));
            }
            if !names.insert(watch.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate watch name {:?}",
                    watch.name
                )));
            }
            if watch.files.is_empty() && watch.directories.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "watch {:?} covers no files and no directories",
                    watch.name
                )));
            }
            for dir in &watch.directories {
                globset::Glob::new(&dir.glob).map_err(|source| ConfigError::Glob {
                    watch: watch.name.clone(),
                    pattern: dir.glob.clone(),
                    source,
                })?;
            }
        }

        self.display_zone()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    const FULL: &str = r#"
noidd_root: /var/lib/noidd
leveldb: /var/lib/noidd/baseline.db
leveldb_recreate: true
logfile: /var/log/noidd.log
timezone: US/Eastern
interval: 300
notifiers:
  - type: stdout
    batch: true
    message_limit: 3
  - type: twilio
    twilio_account_sid: ACxxxx
    twilio_auth_token: token
    twilio_from_number: "+15550100"
    recipients: ["+15550101", "+15550102"]
    batch: true
  - type: pushover
    pushover_user_key: user
    pushover_api_token: token
    live: false
watchers:
  - name: etc
    files: [/etc/passwd, /etc/shadow]
  - name: www
    directories:
      - path: /var/www
        glob: "**/*.php"
"#;

    #[test]
    fn test_full_config_parses() {
        let config = parse(FULL).unwrap();
        assert_eq!(config.noidd_root, PathBuf::from("/var/lib/noidd"));
        assert!(config.leveldb_recreate);
        assert_eq!(config.interval, Some(300));
        assert_eq!(config.notifiers.len(), 3);
        assert_eq!(config.watchers.len(), 2);
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/noidd/baseline.db"));

        match &config.notifiers[1] {
            NotifierConfig::Twilio { recipients, batch, message_limit, live, .. } => {
                assert_eq!(recipients.len(), 2);
                assert!(*batch);
                assert_eq!(*message_limit, 5);
                assert!(*live);
            }
            other => panic!("expected twilio, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = parse("watchers:\n  - name: w\n    files: [/etc/hosts]\n").unwrap();
        assert_eq!(config.noidd_root, PathBuf::from("/etc/noidd"));
        assert_eq!(config.db_path(), PathBuf::from("/etc/noidd/noidd.db"));
        assert_eq!(config.log_path(), PathBuf::from("/etc/noidd/noidd.log"));
        assert_eq!(config.timezone, "US/Eastern");
        assert!(!config.leveldb_recreate);
        assert_eq!(config.interval, None);
        assert!(config.notifiers.is_empty());
        assert_eq!(config.display_zone().unwrap(), chrono_tz::US::Eastern);
    }

    #[test]
    fn test_watch_without_coverage_is_rejected() {
        let err = parse("watchers:\n  - name: w\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_duplicate_watch_names_are_rejected() {
        let yaml = "watchers:\n  - name: w\n    files: [/a]\n  - name: w\n    files: [/b]\n";
        assert!(matches!(parse(yaml).unwrap_err(), ConfigError::Invalid(_)));
    }

    #[test]
    fn test_no_watchers_is_rejected() {
        assert!(matches!(parse("notifiers: []\n").unwrap_err(), ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_notifier_type_is_rejected() {
        let yaml = "notifiers:\n  - type: carrier_pigeon\nwatchers:\n  - name: w\n    files: [/a]\n";
        assert!(matches!(parse(yaml).unwrap_err(), ConfigError::Parse(_)));
    }

    #[test]
    fn test_bad_timezone_is_rejected() {
        let yaml = "timezone: Mars/Olympus\nwatchers:\n  - name: w\n    files: [/a]\n";
        assert!(matches!(parse(yaml).unwrap_err(), ConfigError::Timezone(_)));
    }

    #[test]
    fn test_bad_glob_is_rejected() {
        let yaml =
            "watchers:\n  - name: w\n    directories:\n      - path: /tmp\n        glob: \"a{b\"\n";
        assert!(matches!(parse(yaml).unwrap_err(), ConfigError::Glob { .. }));
    }
}
