use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/chainvault/config.toml";
const ENV_PREFIX: &str = "CHAINVAULT_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Live chain-data directory of the node.
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_prefix: String,
    pub backup_suffix: String,
    /// Backups kept after a successful backup; 0 keeps everything.
    pub max_backups: usize,
    /// Companion container stopped around backup/restore when none is given.
    pub container: Option<String>,
    pub stop_grace_secs: u64,
    pub terminate_grace_secs: u64,
    pub poll_interval_ms: u64,
    /// Archiver program followed by any leading arguments.
    pub tar_command: Vec<String>,
    /// Use the docker CLI; otherwise containers are simulated in memory.
    pub docker_enabled: bool,
    pub http_bind: SocketAddr,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/bdag/chaindata"),
            backup_dir: PathBuf::from("/var/backups/bdag"),
            backup_prefix: "chaindata".to_string(),
            backup_suffix: ".tar.gz".to_string(),
            max_backups: 5,
            container: None,
            stop_grace_secs: 10,
            terminate_grace_secs: 3,
            poll_interval_ms: 1000,
            tar_command: vec!["tar".to_string()],
            docker_enabled: false,
            http_bind: SocketAddr::from(([127, 0, 0, 1], 8787)),
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Defaults, then the TOML file (if present), then `CHAINVAULT_*`
    /// environment variables, then whatever the CLI set explicitly.
    pub fn load<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
        if config_file.is_some() && !path.exists() {
            bail!("Config file not found: {}", path.display());
        }

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.data_dir.is_absolute() {
            bail!("data_dir must be absolute: {}", self.data_dir.display());
        }
        if !self.backup_dir.is_absolute() {
            bail!("backup_dir must be absolute: {}", self.backup_dir.display());
        }
        // A restore replaces data_dir wholesale, and a backup would archive itself.
        if self.backup_dir.starts_with(&self.data_dir) {
            bail!(
                "backup_dir must be outside data_dir: {} is inside {}",
                self.backup_dir.display(),
                self.data_dir.display()
            );
        }
        if self.backup_prefix.trim().is_empty() {
            bail!("backup_prefix must not be empty");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.tar_command.is_empty() {
            bail!("tar_command must name a program");
        }
        Ok(())
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        max_backups: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        container: Option<String>,
    }

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn file_env_and_overrides_layer_in_order() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "chainvault.toml",
                r#"
                data_dir = "/srv/node/chain"
                backup_dir = "/srv/backups"
                max_backups = 9
                "#,
            )?;
            jail.set_env("CHAINVAULT_MAX_BACKUPS", "7");
            jail.set_env("CHAINVAULT_STOP_GRACE_SECS", "30");

            let overrides = Overrides {
                max_backups: Some(2),
                container: None,
            };
            let config =
                AppConfig::load(Some(Path::new("chainvault.toml")), Some(&overrides)).unwrap();

            assert_eq!(config.data_dir, PathBuf::from("/srv/node/chain"));
            assert_eq!(config.backup_dir, PathBuf::from("/srv/backups"));
            assert_eq!(config.max_backups, 2);
            assert_eq!(config.stop_grace_secs, 30);
            assert_eq!(config.container, None);
            Ok(())
        });
    }

    #[test]
    fn relative_paths_are_rejected() {
        let config = AppConfig {
            data_dir: PathBuf::from("chain"),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            backup_dir: PathBuf::from("backups"),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backup_dir_inside_data_dir_is_rejected() {
        for backup_dir in ["/srv/chain", "/srv/chain/backups"] {
            let config = AppConfig {
                data_dir: PathBuf::from("/srv/chain"),
                backup_dir: PathBuf::from(backup_dir),
                ..Default::default()
            };
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("outside data_dir"), "{err}");
        }

        // Siblings sharing a name prefix are fine.
        let config = AppConfig {
            data_dir: PathBuf::from("/srv/chain"),
            backup_dir: PathBuf::from("/srv/chain-backups"),
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn missing_explicit_config_file_fails() {
        let err = AppConfig::load::<Overrides>(Some(Path::new("/nonexistent/cv.toml")), None)
            .unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}
