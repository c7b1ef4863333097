use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

pub struct Logger;

impl Logger {
    pub fn init() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("soku_core=info,soku=info"));

        // A second init (tests, embedding) keeps the first subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }

    pub fn build_start(root: &str, outdir: &str, entries: usize) {
        info!("🔨 Soku build");
        info!("📁 Root: {}", root);
        info!("📦 Output: {}", outdir);
        info!("🎯 Entries: {}", entries);
    }

    pub fn rebuild_start(changed: usize) {
        info!("🔁 Rebuilding after {} changed file(s)", changed);
    }

    pub fn graph_built(modules: usize, cycles: usize) {
        info!("🕸️  Module graph: {} modules, {} cycle(s)", modules, cycles);
    }

    pub fn transforms_done(transformed: usize, cache_hits: usize) {
        info!(
            "⚡ Transformed {} module(s), {} served from cache",
            transformed, cache_hits
        );
    }

    pub fn chunks_planned(entry: usize, shared: usize, asynchronous: usize) {
        info!(
            "🧩 Chunks: {} entry, {} shared, {} async",
            entry, shared, asynchronous
        );
    }

    pub fn emitted(files: usize, outdir: &str, build_time: std::time::Duration) {
        info!("✅ Emitted {} file(s) to {} in {:.2?}", files, outdir, build_time);
    }

    pub fn info(msg: &str) {
        info!("{}", msg);
    }

    pub fn debug(msg: &str) {
        debug!("{}", msg);
    }

    pub fn error(msg: &str) {
        error!("❌ {}", msg);
    }

    pub fn warn(msg: &str) {
        warn!("⚠️  {}", msg);
    }
}

pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    pub fn start(name: &str) -> Self {
        debug!("⏱️  Starting: {}", name);
        Self {
            start: Instant::now(),
            name: name.to_string(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!("⏱️  Completed: {} in {:.2?}", self.name, self.elapsed());
    }
}
