//! Wires configuration into running watchers: owns the store handle, builds
//! the shared notifiers, and drives every watcher to completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::{Config, ConfigError};
use crate::notifier::{Notifier, NotifyError};
use crate::store::{Store, StoreError};
use crate::watcher::{WatchError, Watcher};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("could not create {path}: {source}")]
    Root {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub struct Supervisor {
    notifiers: Vec<Arc<Notifier>>,
    watchers: Vec<Watcher>,
    interval: Option<Duration>,
    // The supervisor owns the process-singleton store handle; watchers only
    // hold prefixed views of it.
    _store: Store,
}

impl Supervisor {
    pub async fn from_config(config: &Config) -> Result<Self, SetupError> {
        tokio::fs::create_dir_all(&config.noidd_root)
            .await
            .map_err(|source| SetupError::Root { path: config.noidd_root.clone(), source })?;

        let store = Store::open(config.db_path(), config.leveldb_recreate).await?;
        let tz = config.display_zone()?;

        let mut notifiers = Vec::with_capacity(config.notifiers.len());
        for notifier_config in &config.notifiers {
            notifiers.push(Arc::new(Notifier::from_config(notifier_config)?));
        }

        let mut watchers = Vec::with_capacity(config.watchers.len());
        for watch in &config.watchers {
            let view = store.prefixed(format!("{}_", watch.name));
            watchers.push(Watcher::new(watch, view, notifiers.clone(), tz)?);
        }

        Ok(Supervisor {
            notifiers,
            watchers,
            interval: config.interval.map(Duration::from_secs),
            _store: store,
        })
    }

    /// Run one pass of every watcher concurrently. A failing watcher is
    /// logged and does not abort the others. Returns the failure count.
    pub async fn run_pass(&mut self) -> usize {
        let mut tasks = JoinSet::new();
        for mut watcher in self.watchers.drain(..) {
            tasks.spawn(async move {
                let result = watcher.run().await;
                (watcher, result)
            });
        }

        let mut failures = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((watcher, Ok(_report))) => self.watchers.push(watcher),
                Ok((watcher, Err(e))) => {
                    error!(watch = %watcher.name(), error = %e, "watcher pass failed");
                    failures += 1;
                    self.watchers.push(watcher);
                }
                Err(e) => {
                    error!(error = %e, "watcher task aborted");
                    failures += 1;
                }
            }
        }

        for notifier in &self.notifiers {
            info!(
                sink = notifier.sink_kind(),
                received = notifier.notifications_received(),
                sent = notifier.notifications_sent(),
                failures = notifier.delivery_failures(),
                "notifier totals"
            );
        }
        failures
    }

    /// Run forever on the configured interval, or a single pass when no
    /// interval is set. In interval mode, an interrupt between passes shuts
    /// down cleanly; a pass already in flight completes first.
    pub async fn run(mut self) -> usize {
        let Some(every) = self.interval else {
            return self.run_pass().await;
        };
        loop {
            let failures = self.run_pass().await;
            tokio::select! {
                _ = tokio::time::sleep(every) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    return failures;
                }
            }
        }
    }
}
