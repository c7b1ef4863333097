use crate::core::models::*;
use crate::core::services::{Bundler, CancelHandle};
use crate::utils::{Result, SokuError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Build service interface
#[async_trait]
pub trait BuildService: Send + Sync {
    async fn build(&self, entries: Vec<EntryPoint>) -> Result<BuildResult>;
    async fn rebuild(&self, changed: Vec<PathBuf>) -> Result<BuildResult>;
    /// Cancel whatever build is in flight. Returns immediately.
    fn cancel(&self);
}

/// Runs a `Bundler` on tokio's blocking pool. Builds are serialized; a second
/// call waits for the first to finish.
pub struct SokuBuildService {
    bundler: Arc<Mutex<Bundler>>,
    cancel: CancelHandle,
}

impl SokuBuildService {
    pub fn new(config: BuildConfig) -> Result<Self> {
        let bundler = Bundler::new(config)?;
        Ok(Self {
            cancel: bundler.cancel_handle(),
            bundler: Arc::new(Mutex::new(bundler)),
        })
    }

    async fn run<F>(&self, job: F) -> Result<BuildResult>
    where
        F: FnOnce(&mut Bundler) -> Result<BuildResult> + Send + 'static,
    {
        let bundler = Arc::clone(&self.bundler);
        tokio::task::spawn_blocking(move || job(&mut bundler.blocking_lock()))
            .await
            .map_err(|e| SokuError::Io(std::io::Error::other(e.to_string())))?
    }
}

#[async_trait]
impl BuildService for SokuBuildService {
    async fn build(&self, entries: Vec<EntryPoint>) -> Result<BuildResult> {
        self.run(move |bundler| bundler.build(entries)).await
    }

    async fn rebuild(&self, changed: Vec<PathBuf>) -> Result<BuildResult> {
        self.run(move |bundler| bundler.rebuild(changed)).await
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
