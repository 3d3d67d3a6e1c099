use crate::config::AppConfig;
use crate::config_loader::ConfigLoader;
use anyhow::Result;
use notify::{Event, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::watch;

/// Reloads the config file on modification and publishes each successfully
/// parsed version. A file that fails to parse keeps the previous version live.
pub struct ConfigWatcher {
    tx: watch::Sender<AppConfig>,
    path: PathBuf,
    profile: Option<String>,
}

impl ConfigWatcher {
    #[must_use]
    pub fn new(
        initial_config: AppConfig,
        path: impl Into<PathBuf>,
        profile: Option<String>,
    ) -> (Self, watch::Receiver<AppConfig>) {
        let (tx, rx) = watch::channel(initial_config);
        (
            Self {
                tx,
                path: path.into(),
                profile,
            },
            rx,
        )
    }

    /// Blocks a worker thread watching the file until the receivers are dropped
    /// or the watcher fails.
    ///
    /// # Errors
    ///
    /// Returns an error if file watching cannot be initiated or if the watcher task fails.
    pub async fn watch(self) -> Result<()> {
        let Self { tx, path, profile } = self;

        tokio::task::spawn_blocking(move || {
            let (notify_tx, notify_rx) = std::sync::mpsc::channel();

            let mut watcher = notify::recommended_watcher(move |res: Result<Event, _>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            })?;

            watcher.watch(&path, RecursiveMode::NonRecursive)?;

            for event in notify_rx {
                if !event.kind.is_modify() {
                    continue;
                }
                tracing::info!(path = %path.display(), "Config file changed, reloading");
                match ConfigLoader::load_from(&path, profile.as_deref()) {
                    Ok(new_config) => {
                        let problems = new_config.validate();
                        if !problems.is_empty() {
                            tracing::error!(?problems, "Reloaded config is invalid, keeping previous");
                            continue;
                        }
                        if tx.send(new_config).is_err() {
                            break;
                        }
                        tracing::info!("Config reloaded successfully");
                    }
                    Err(e) => {
                        tracing::error!("Failed to reload config: {:#}", e);
                    }
                }
            }

            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }
}
