//! Configuration hot-reload.
//!
//! Watches the configuration file and, on change, parses and validates the
//! new topology before installing it. A reload failure leaves the running
//! snapshot untouched.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::StorageConfig;
use crate::engine::StorageEngine;
use crate::error::{StoreError, StoreResult};

/// Watch `config_path` and reload the engine whenever the file changes.
/// Events are debounced so editors that write in several steps trigger one
/// reload.
pub fn spawn_config_watcher(
    config_path: PathBuf,
    engine: Arc<StorageEngine>,
) -> StoreResult<JoinHandle<()>> {
    let (tx, mut rx) = mpsc::channel::<Event>(16);

    let mut watcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        })
        .map_err(|e| StoreError::Config(format!("failed to create file watcher: {}", e)))?;

    let watch_dir = config_path
        .parent()
        .ok_or_else(|| StoreError::Config("config path has no parent directory".to_string()))?;
    watcher
        .watch(watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| StoreError::Config(format!("failed to watch config file: {}", e)))?;

    info!(path = %config_path.display(), "watching configuration file for changes");

    let handle = tokio::spawn(async move {
        // Keep the watcher alive for the lifetime of the task.
        let _watcher = watcher;
        let mut debounce = tokio::time::interval(Duration::from_millis(500));
        let mut pending_reload = false;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                                && event.paths.iter().any(|p| p == &config_path)
                            {
                                pending_reload = true;
                            }
                        }
                        None => break,
                    }
                }
                _ = debounce.tick() => {
                    if pending_reload {
                        pending_reload = false;
                        reload(&config_path, &engine);
                    }
                }
            }
        }
    });

    Ok(handle)
}

fn reload(config_path: &PathBuf, engine: &Arc<StorageEngine>) {
    match StorageConfig::from_file(config_path) {
        Ok(config) => match engine.reload(config) {
            Ok(()) => info!("configuration reloaded, new topology installed"),
            Err(e) => error!(error = %e, "failed to install reloaded configuration"),
        },
        Err(e) => warn!(error = %e, "ignoring invalid configuration change"),
    }
}
