use std::path::PathBuf;
use transfer_engine::Config;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// TOML file with the engine configuration; defaults apply when unset
    pub engine_config: Option<PathBuf>,
    pub admin_token: Option<String>,
    pub log_level: String,
    pub sweep_cron: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/site-transfer".into()),
        );

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            db_path: data_dir.join("transfer-server.db"),
            data_dir,
            engine_config: std::env::var("TRANSFER_CONFIG").ok().map(PathBuf::from),
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            // sec min hour day month weekday
            sweep_cron: std::env::var("SWEEP_CRON").unwrap_or_else(|_| "0 0 * * * *".into()),
        }
    }

    /// Engine configuration. `DATA_DIR` wins over the file's storage section.
    pub fn engine(&self) -> anyhow::Result<Config> {
        let mut config = match &self.engine_config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.storage.data_dir = self.data_dir.clone();
        if std::env::var("LOG_LEVEL").is_ok() {
            config.log.level = self.log_level.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_uses_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("transfer.toml");
        std::fs::write(
            &file,
            "[site]\nsite_url = \"https://example.test\"\n\n[storage]\ndata_dir = \"/elsewhere\"\n",
        )
        .unwrap();

        let config = AppConfig {
            port: 3000,
            data_dir: dir.path().join("data"),
            db_path: dir.path().join("data/transfer-server.db"),
            engine_config: Some(file),
            admin_token: None,
            log_level: "info".into(),
            sweep_cron: "0 0 * * * *".into(),
        };
        let engine = config.engine().unwrap();
        assert_eq!(engine.site.site_url, "https://example.test");
        assert_eq!(engine.storage.data_dir, dir.path().join("data"));
    }
}
