//! File provider.
//!
//! Reads a dynamic-configuration YAML file and re-emits it whenever the
//! file's modification time changes, polling on a fixed interval.

use super::{Provider, ShutdownSignal, FILE_PROVIDER_NAME};
use crate::config::dynamic::{Configuration, Message};
use crate::config::FileProviderConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info};

pub struct FileProvider {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileProvider {
    pub fn new(config: &FileProviderConfig) -> Self {
        Self {
            path: PathBuf::from(&config.path),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }

    fn load(&self) -> Result<Configuration> {
        let content = fs::read_to_string(&self.path)?;
        let configuration: Configuration = serde_yaml::from_str(&content)?;
        Ok(configuration)
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        FILE_PROVIDER_NAME
    }

    fn init(&self) -> Result<()> {
        // Fail fast on an unreadable file so the aggregator can skip us.
        self.load().map(|_| ())
    }

    async fn provide(&self, tx: mpsc::Sender<Message>, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut last_modified: Option<SystemTime> = None;
        let mut ticker = interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("File provider stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let modified = fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());
                    if modified == last_modified && last_modified.is_some() {
                        continue;
                    }
                    last_modified = modified;

                    match self.load() {
                        Ok(configuration) => {
                            info!(path = %self.path.display(), "Configuration file loaded");
                            if tx
                                .send(Message {
                                    source_name: FILE_PROVIDER_NAME.to_string(),
                                    configuration,
                                })
                                .await
                                .is_err()
                            {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            error!(path = %self.path.display(), "Failed to load configuration file: {}", e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn test_file_provider_emits_initial_configuration() {
        let dir = std::env::temp_dir().join("fluxgate-file-provider-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dynamic.yml");
        fs::write(
            &path,
            r#"
http:
  routers:
    web:
      rule: "Host(`example.com`)"
      service: backend
  services:
    backend:
      loadBalancer:
        servers:
          - url: "http://127.0.0.1:8080"
"#,
        )
        .unwrap();

        let provider = FileProvider::new(&FileProviderConfig {
            path: path.to_string_lossy().into_owned(),
            poll_interval_secs: 1,
        });
        provider.init().unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(async move {
            let _ = provider.provide(tx, shutdown_rx).await;
        });

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.source_name, "file");
        assert!(msg.configuration.http.routers.contains_key("web"));
        let _ = shutdown_tx.send(());
    }
}
