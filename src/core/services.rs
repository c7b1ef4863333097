use crate::core::graph::{GraphBuilder, GraphReport, ModuleGraph};
use crate::core::models::*;
use crate::core::pipeline::{TransformOutcome, TransformPipeline};
use crate::infrastructure::cache::TransformCache;
use crate::infrastructure::emitter::Emitter;
use crate::infrastructure::node_resolver::NodeModuleResolver;
use crate::infrastructure::processors::code_splitter::ChunkPlanner;
use crate::utils::{
    BuildFailure, ContentHasher, Diagnostic, IncrementalState, Logger, Result, SokuError, Timer,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancels the build currently running on a `Bundler`. Cheap to clone and
/// usable from any thread.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.lock().cancel();
    }

    fn current(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    /// A cancelled token stays cancelled; the next build gets a fresh one.
    fn reset(&self) {
        *self.token.lock() = CancellationToken::new();
    }
}

/// Graph and entries of the last successful build.
struct BuildState {
    entries: Vec<EntryPoint>,
    graph: ModuleGraph,
}

#[derive(Default)]
struct TransformTally {
    transformed: usize,
    cache_hits: usize,
}

/// Build driver. Owns the worker pool, the transform cache and the state an
/// incremental rebuild needs.
pub struct Bundler {
    config: Arc<BuildConfig>,
    resolver: NodeModuleResolver,
    pipeline: TransformPipeline,
    cache: TransformCache,
    hasher: ContentHasher,
    pool: rayon::ThreadPool,
    emitter: Emitter,
    cancel: CancelHandle,
    state: Option<BuildState>,
    incremental: IncrementalState,
}

impl Bundler {
    pub fn new(config: BuildConfig) -> Result<Self> {
        let root = std::fs::canonicalize(&config.root).map_err(|e| {
            SokuError::config(format!("root {} is not accessible: {}", config.root.display(), e))
        })?;
        let outdir = Self::absolute_outdir(&root, &config.outdir);
        let config = BuildConfig {
            root,
            outdir,
            ..config
        };
        config.validate()?;
        let config = Arc::new(config);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("soku-worker-{}", i))
            .build()
            .map_err(|e| SokuError::config(format!("cannot start worker pool: {}", e)))?;

        let cache = TransformCache::open(&config.cache).unwrap_or_else(|err| {
            Logger::warn(&format!("{}; falling back to an in-memory cache", err));
            TransformCache::in_memory(&config.cache)
        });

        let hasher = ContentHasher::new(config.output.hash_algorithm);
        Ok(Self {
            resolver: NodeModuleResolver::new(config.root.clone(), config.resolve.clone()),
            pipeline: TransformPipeline::new(
                config
                    .transforms
                    .iter()
                    .cloned()
                    .map(|step| step.with_output(&config.output))
                    .collect(),
                hasher,
            ),
            emitter: Emitter::new(config.output.clone()),
            cache,
            hasher,
            pool,
            cancel: CancelHandle::default(),
            state: None,
            incremental: IncrementalState::new(),
            config,
        })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &TransformCache {
        &self.cache
    }

    /// Module graph of the last successful build.
    pub fn graph(&self) -> Option<&ModuleGraph> {
        self.state.as_ref().map(|state| &state.graph)
    }

    /// Full build from `entries`.
    pub fn build(&mut self, entries: Vec<EntryPoint>) -> Result<BuildResult> {
        let started = Instant::now();
        Self::check_entries(&entries)?;
        Logger::build_start(
            &self.config.root.display().to_string(),
            &self.config.outdir.display().to_string(),
            entries.len(),
        );

        let token = self.cancel.current();
        let mut report = GraphReport::default();
        let graph = {
            let _timer = Timer::start("Module graph");
            self.graph_builder(&token).build(&entries, &mut report)
        };

        let outcome = graph.and_then(|graph| self.complete(graph, report, &token, started));
        self.commit(entries, outcome, Vec::new())
    }

    /// Rebuild after `changed` files were modified, created or deleted. Only
    /// modules whose content hash changed, or whose output was built from a
    /// changed file, are re-transformed; everything else is reused from the
    /// previous build. A created file re-resolves imports it may shadow.
    pub fn rebuild(&mut self, changed: Vec<PathBuf>) -> Result<BuildResult> {
        let started = Instant::now();
        let Some(state) = &self.state else {
            return Err(SokuError::config("rebuild requires a completed build"));
        };
        let entries = state.entries.clone();
        let mut graph = state.graph.clone();

        let root = &self.config.root;
        let changed: Vec<PathBuf> = changed
            .into_iter()
            .map(|path| {
                let path = if path.is_absolute() { path } else { root.join(path) };
                std::fs::canonicalize(&path).unwrap_or(path)
            })
            .collect();
        let paths = self.incremental.take_with(changed);
        let changes = IncrementalState::changes(&graph, &self.hasher, &paths);
        Logger::rebuild_start(paths.len());
        for id in &changes.stale {
            graph.invalidate_output(*id);
        }

        let token = self.cancel.current();
        let mut report = GraphReport::default();
        let updated = {
            let _timer = Timer::start("Module graph update");
            self.graph_builder(&token).update(
                &mut graph,
                &entries,
                &changes.dirty,
                changes.relink,
                &mut report,
            )
        };

        let outcome = updated.and_then(|removed| {
            if !removed.is_empty() {
                Logger::debug(&format!("{} module(s) no longer reachable", removed.len()));
            }
            self.complete(graph, report, &token, started)
        });
        self.commit(entries, outcome, paths)
    }

    /// `outdir` made absolute against `root`, with `.` and `..` removed and
    /// symlinks followed where the directory already exists.
    fn absolute_outdir(root: &Path, outdir: &Path) -> PathBuf {
        let joined = root.join(outdir);
        if let Ok(path) = std::fs::canonicalize(&joined) {
            return path;
        }
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    normalized.pop();
                }
                other => normalized.push(other),
            }
        }
        normalized
    }

    fn check_entries(entries: &[EntryPoint]) -> Result<()> {
        if entries.is_empty() {
            return Err(SokuError::config("at least one entry is required"));
        }
        let mut names = HashSet::new();
        for entry in entries {
            if !names.insert(entry.name.as_str()) {
                return Err(SokuError::config(format!(
                    "duplicate entry name '{}'",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    fn graph_builder<'a>(&'a self, token: &'a CancellationToken) -> GraphBuilder<'a> {
        GraphBuilder::new(&self.config, &self.resolver, self.hasher, &self.pool, token)
    }

    /// Keep the new graph on success; on failure remember the changed paths
    /// so the next rebuild retries them.
    fn commit(
        &mut self,
        entries: Vec<EntryPoint>,
        outcome: Result<(BuildResult, ModuleGraph)>,
        paths: Vec<PathBuf>,
    ) -> Result<BuildResult> {
        match outcome {
            Ok((result, graph)) => {
                self.state = Some(BuildState { entries, graph });
                Ok(result)
            }
            Err(err) => {
                if matches!(err, SokuError::Cancelled) {
                    self.cancel.reset();
                    Logger::warn("build cancelled; previous output left in place");
                }
                self.incremental.defer(paths);
                Err(err)
            }
        }
    }

    fn checkpoint(token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(SokuError::Cancelled);
        }
        Ok(())
    }

    /// Transform, plan and emit. Runs only once the graph is complete.
    fn complete(
        &mut self,
        mut graph: ModuleGraph,
        report: GraphReport,
        token: &CancellationToken,
        started: Instant,
    ) -> Result<(BuildResult, ModuleGraph)> {
        Logger::graph_built(graph.len(), graph.cycles().len());
        let GraphReport {
            mut errors,
            mut warnings,
        } = report;
        Self::checkpoint(token)?;

        let tally = {
            let _timer = Timer::start("Transform");
            self.transform_modules(&mut graph, token, &mut warnings)?
        };
        Logger::transforms_done(tally.transformed, tally.cache_hits);

        for node in graph.nodes() {
            let Some(failure) = &node.failure else {
                continue;
            };
            let diagnostic = Diagnostic::for_module(node.key.clone(), failure.clone());
            match self.config.failure_mode {
                FailureMode::Strict => errors.push(diagnostic),
                FailureMode::BestEffort => {
                    Logger::warn(&format!("excluding {}: {}", node.key, failure));
                    warnings.push(diagnostic);
                }
            }
        }
        if !errors.is_empty() {
            return Err(SokuError::Build(BuildFailure::new(errors)));
        }
        Self::checkpoint(token)?;

        let mut plan = {
            let _timer = Timer::start("Chunk planning");
            ChunkPlanner::new(&graph, &self.config.split).plan()?
        };
        Logger::chunks_planned(
            plan.count(ChunkKind::Entry),
            plan.count(ChunkKind::Shared),
            plan.count(ChunkKind::Async),
        );
        Self::checkpoint(token)?;

        let emitted = {
            let _timer = Timer::start("Emit");
            self.emitter.emit(&graph, &mut plan, &self.config.outdir)?
        };

        if let Err(err) = self.cache.evict().and_then(|_| self.cache.flush()) {
            Logger::warn(&err.to_string());
            warnings.push(Diagnostic::new(None, err));
        }

        let duration = started.elapsed();
        Logger::emitted(
            emitted.output_files.len(),
            &self.config.outdir.display().to_string(),
            duration,
        );

        let stats = BuildStats {
            modules_total: graph.len(),
            modules_transformed: tally.transformed,
            cache_hits: tally.cache_hits,
            chunks_total: plan.chunks.len(),
            chunks_rendered: emitted.chunks_rendered,
            duration,
        };
        let result = BuildResult {
            manifest: emitted.manifest,
            warnings,
            stats,
            output_files: emitted.output_files,
        };
        Ok((result, graph))
    }

    /// Run the pipeline for every module without an output, in parallel.
    /// Results are applied in id order once all workers are done.
    fn transform_modules(
        &self,
        graph: &mut ModuleGraph,
        token: &CancellationToken,
        warnings: &mut Vec<Diagnostic>,
    ) -> Result<TransformTally> {
        let pending: Vec<ModuleId> = graph
            .nodes()
            .filter(|node| node.needs_transform())
            .map(|node| node.id)
            .collect();

        let pipeline = &self.pipeline;
        let cache = &self.cache;
        let shared: &ModuleGraph = graph;
        let outcomes: Vec<(ModuleId, Option<TransformOutcome>)> = self.pool.install(|| {
            pending
                .par_iter()
                .map(|id| {
                    if token.is_cancelled() {
                        return (*id, None);
                    }
                    let outcome = shared
                        .node(*id)
                        .map(|node| pipeline.transform_cached(node, cache));
                    (*id, outcome)
                })
                .collect()
        });
        Self::checkpoint(token)?;

        let mut tally = TransformTally::default();
        for (id, outcome) in outcomes {
            let (Some(outcome), Some(node)) = (outcome, graph.node_mut(id)) else {
                continue;
            };
            for err in outcome.cache_errors {
                Logger::warn(&format!("{}: {}", node.key, err));
                warnings.push(Diagnostic::for_module(node.key.clone(), err));
            }
            if outcome.cache_hit {
                tally.cache_hits += 1;
            } else {
                tally.transformed += 1;
            }
            node.fingerprint = Some(outcome.fingerprint);
            match outcome.result {
                Ok(output) => node.output = Some(output),
                Err(err) => node.failure = Some(err),
            }
        }
        Ok(tally)
    }
}

/// One-shot build with a fresh driver.
pub fn build(entries: Vec<EntryPoint>, config: BuildConfig) -> Result<BuildResult> {
    Bundler::new(config)?.build(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_duplicate_entry_names_are_rejected() {
        let entries = vec![EntryPoint::from("./a/main.js"), EntryPoint::from("./b/main.js")];
        assert!(matches!(
            Bundler::check_entries(&entries),
            Err(SokuError::Config(_))
        ));
        assert!(Bundler::check_entries(&[]).is_err());
    }

    #[test]
    fn test_outdir_above_root_is_rejected() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("app");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("main.js"), "export const a = 1;").unwrap();

        for outdir in ["..", ".", "../app/..", "/"] {
            let config = BuildConfig::new(&root, SplitConfig::new(2))
                .with_outdir(outdir)
                .with_workers(1);
            assert!(
                matches!(Bundler::new(config), Err(SokuError::Config(_))),
                "{}",
                outdir
            );
        }
        assert!(root.join("main.js").exists());

        let config = BuildConfig::new(&root, SplitConfig::new(2))
            .with_outdir("../dist")
            .with_workers(1);
        let bundler = Bundler::new(config).unwrap();
        assert_eq!(
            bundler.config().outdir,
            fs::canonicalize(dir.path()).unwrap().join("dist")
        );
    }

    #[test]
    fn test_rebuild_requires_a_build() {
        let dir = tempdir().unwrap();
        let config = BuildConfig::new(dir.path(), SplitConfig::new(2)).with_workers(1);
        let mut bundler = Bundler::new(config).unwrap();
        assert!(matches!(
            bundler.rebuild(vec![PathBuf::from("a.js")]),
            Err(SokuError::Config(_))
        ));
    }

    #[test]
    fn test_cancelled_build_keeps_previous_output() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.js"), "export const a = 1;").unwrap();
        let config = BuildConfig::new(dir.path(), SplitConfig::new(2)).with_workers(1);
        let mut bundler = Bundler::new(config).unwrap();

        bundler.build(vec![EntryPoint::from("./main.js")]).unwrap();
        let manifest = fs::read_to_string(dir.path().join("dist/manifest.json")).unwrap();

        bundler.cancel_handle().cancel();
        let result = bundler.build(vec![EntryPoint::from("./main.js")]);
        assert!(matches!(result, Err(SokuError::Cancelled)));
        assert_eq!(
            fs::read_to_string(dir.path().join("dist/manifest.json")).unwrap(),
            manifest
        );

        // The handle is re-armed for the next build.
        assert!(bundler.build(vec![EntryPoint::from("./main.js")]).is_ok());
    }
}
