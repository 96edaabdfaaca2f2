//! Application configuration: database connection, the directory watched
//! for `.DBF` files, and logging verbosity.
//!
//! Loaded the same way the original service's configuration was: a config
//! file for the defaults, overridden by the `DATABASE_URL`, `DBF_WATCH_PATH`,
//! and `LOG_LEVEL` environment variables — a precedence order that is also
//! convenient for container deployments where secrets like `DATABASE_URL`
//! are injected as env vars rather than baked into a file.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Connection string for the target SQL database. The scheme
    /// (`postgres://`, `mysql://`, `sqlite://`) selects the backend at
    /// runtime via `sqlx`'s `Any` driver.
    pub database_url: String,
    /// Directory scanned on startup and watched afterwards for `.DBF`
    /// changes.
    pub dbf_watch_path: PathBuf,
    /// `tracing_subscriber` env-filter directive, e.g. "info" or "dbfsync_engine=debug".
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://dbfsync.db".to_string(),
            dbf_watch_path: PathBuf::from("./data"),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Loads configuration with the following precedence, highest first:
    /// 1. `DBFSYNC_CONFIG` env var naming a TOML file.
    /// 2. `config.toml` in the current directory.
    /// 3. built-in defaults.
    ///
    /// Then applies `DATABASE_URL`, `DBF_WATCH_PATH`, and `LOG_LEVEL`
    /// overrides on top, in that order. Creates `dbf_watch_path` if it
    /// doesn't exist yet, since the watcher requires a real directory to
    /// arm its watch on.
    pub fn load() -> anyhow::Result<Self> {
        let mut settings = if let Ok(path) = std::env::var("DBFSYNC_CONFIG") {
            Self::from_path(&path)?
        } else if PathBuf::from("config.toml").exists() {
            Self::from_path("config.toml")?
        } else {
            Settings::default()
        };

        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            settings.database_url = database_url;
        }
        if let Ok(watch_path) = std::env::var("DBF_WATCH_PATH") {
            settings.dbf_watch_path = PathBuf::from(watch_path);
        }
        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            settings.log_level = log_level;
        }

        std::fs::create_dir_all(&settings.dbf_watch_path).with_context(|| {
            format!(
                "could not create watch directory: {:?}",
                settings.dbf_watch_path
            )
        })?;

        Ok(settings)
    }

    pub fn from_path(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file: {path:?}"))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("invalid config file: {path:?}"))?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_for_local_development() {
        let settings = Settings::default();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.dbf_watch_path, PathBuf::from("./data"));
    }

    #[test]
    fn from_path_reads_a_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"
            database_url = "postgres://localhost/erp"
            dbf_watch_path = "/srv/dbf"
            log_level = "debug"
            "#,
        )
        .unwrap();

        let settings = Settings::from_path(file.path()).unwrap();
        assert_eq!(settings.database_url, "postgres://localhost/erp");
        assert_eq!(settings.dbf_watch_path, PathBuf::from("/srv/dbf"));
        assert_eq!(settings.log_level, "debug");
    }
}
