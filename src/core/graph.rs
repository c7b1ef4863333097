use crate::core::models::{
    BuildConfig, DependencyEdge, EntryPoint, ImportRecord, MissingDependencyMode,
    ModuleId, ModuleNode, ModuleType,
};
use crate::infrastructure::node_resolver::{NodeModuleResolver, ResolvedModule};
use crate::infrastructure::processors::DependencyScanner;
use crate::utils::{ContentHasher, Diagnostic, GraphError, Logger, ResolutionError, SokuError};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Arena of modules reachable from the build's entries. Ids are assigned by the
/// coordinating thread in discovery order and never reused.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    nodes: BTreeMap<ModuleId, ModuleNode>,
    by_key: HashMap<String, ModuleId>,
    entries: Vec<(EntryPoint, ModuleId)>,
    next_id: u32,
    cycles: Vec<Vec<ModuleId>>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: ModuleId) -> Option<&ModuleNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: ModuleId) -> Option<&mut ModuleNode> {
        self.nodes.get_mut(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ModuleNode> {
        self.nodes.values()
    }

    pub fn ids(&self) -> Vec<ModuleId> {
        self.nodes.keys().copied().collect()
    }

    pub fn id_for_key(&self, key: &str) -> Option<ModuleId> {
        self.by_key.get(key).copied()
    }

    /// Every module backed by `path`, whatever its query.
    pub fn ids_for_path(&self, path: &Path) -> Vec<ModuleId> {
        self.nodes
            .values()
            .filter(|node| node.path == path)
            .map(|node| node.id)
            .collect()
    }

    /// Entries in configuration order.
    pub fn entries(&self) -> &[(EntryPoint, ModuleId)] {
        &self.entries
    }

    pub fn set_entries(&mut self, entries: Vec<(EntryPoint, ModuleId)>) {
        for node in self.nodes.values_mut() {
            node.is_entry = false;
        }
        for (_, id) in &entries {
            if let Some(node) = self.nodes.get_mut(id) {
                node.is_entry = true;
            }
        }
        self.entries = entries;
    }

    /// Module cycles found by the last `detect_cycles`.
    pub fn cycles(&self) -> &[Vec<ModuleId>] {
        &self.cycles
    }

    fn allocate_id(&mut self) -> ModuleId {
        let id = ModuleId(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, loaded: LoadedModule) -> ModuleId {
        let id = self.allocate_id();
        self.by_key.insert(loaded.key.clone(), id);
        self.nodes.insert(
            id,
            ModuleNode {
                id,
                key: loaded.key,
                path: loaded.resolved.path,
                query: loaded.resolved.query,
                module_type: loaded.module_type,
                content: loaded.content,
                content_hash: loaded.content_hash,
                imports: loaded.imports,
                opaque_imports: loaded.opaque,
                dependencies: Vec::new(),
                unresolved: Vec::new(),
                fingerprint: None,
                output: None,
                failure: None,
                is_entry: false,
                is_async_split_point: false,
            },
        );
        id
    }

    /// Replace a node's source in place. Transform results survive only when
    /// the content is unchanged.
    fn replace(&mut self, id: ModuleId, loaded: LoadedModule) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.content_hash != loaded.content_hash {
                node.output = None;
                node.failure = None;
                node.fingerprint = None;
            }
            node.content = loaded.content;
            node.content_hash = loaded.content_hash;
            node.imports = loaded.imports;
            node.opaque_imports = loaded.opaque;
            node.dependencies.clear();
            node.unresolved.clear();
        }
    }

    /// Drop a module's transform result so the next build runs its steps
    /// again.
    pub fn invalidate_output(&mut self, id: ModuleId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.output = None;
            node.failure = None;
            node.fingerprint = None;
        }
    }

    pub fn remove(&mut self, id: ModuleId) -> Option<ModuleNode> {
        let node = self.nodes.remove(&id)?;
        self.by_key.remove(&node.key);
        Some(node)
    }

    /// Modules that import `id`, in id order.
    pub fn dependents(&self, id: ModuleId) -> Vec<ModuleId> {
        self.nodes
            .values()
            .filter(|node| node.dependencies.iter().any(|edge| edge.to == id))
            .map(|node| node.id)
            .collect()
    }

    /// Drop modules no entry reaches any more. Returns the removed ids.
    pub fn prune_unreachable(&mut self) -> Vec<ModuleId> {
        let mut reachable = HashSet::new();
        let mut queue: VecDeque<ModuleId> = self.entries.iter().map(|(_, id)| *id).collect();
        while let Some(id) = queue.pop_front() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                queue.extend(node.dependencies.iter().map(|edge| edge.to));
            }
        }

        let removed: Vec<ModuleId> = self
            .nodes
            .keys()
            .filter(|id| !reachable.contains(id))
            .copied()
            .collect();
        for id in &removed {
            self.remove(*id);
        }
        removed
    }

    /// Strongly connected components over the modules accepted by `include`,
    /// following both edge kinds. Each component is sorted by id; components
    /// come out in id order of their first member.
    pub fn strongly_connected_components(
        &self,
        include: impl Fn(&ModuleNode) -> bool,
    ) -> Vec<Vec<ModuleId>> {
        let mut graph: DiGraph<ModuleId, ()> = DiGraph::new();
        let mut index = HashMap::new();
        for node in self.nodes.values().filter(|n| include(n)) {
            index.insert(node.id, graph.add_node(node.id));
        }
        for node in self.nodes.values() {
            let Some(&from) = index.get(&node.id) else {
                continue;
            };
            for edge in &node.dependencies {
                if let Some(&to) = index.get(&edge.to) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut components: Vec<Vec<ModuleId>> = tarjan_scc(&graph)
            .into_iter()
            .map(|component| {
                let mut ids: Vec<ModuleId> = component.into_iter().map(|ix| graph[ix]).collect();
                ids.sort();
                ids
            })
            .collect();
        components.sort();
        components
    }

    /// Record module-level cycles: components with more than one member, or a
    /// module importing itself.
    pub fn detect_cycles(&mut self) -> &[Vec<ModuleId>] {
        let cycles: Vec<Vec<ModuleId>> = self
            .strongly_connected_components(|_| true)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || self
                        .nodes
                        .get(&component[0])
                        .map_or(false, |n| n.dependencies.iter().any(|e| e.to == n.id))
            })
            .collect();
        self.cycles = cycles;
        &self.cycles
    }

    /// Execution rank of every module: depth-first post-order over static
    /// edges from each root in turn, so dependencies precede their importers
    /// and cycle members keep their discovery order.
    pub fn execution_order(&self, roots: &[ModuleId]) -> HashMap<ModuleId, usize> {
        let mut rank = HashMap::new();
        let mut visited = HashSet::new();

        for &root in roots {
            if !visited.insert(root) {
                continue;
            }
            let mut stack: Vec<(ModuleId, usize)> = vec![(root, 0)];
            while let Some((id, next)) = stack.pop() {
                let deps: Vec<ModuleId> = self
                    .nodes
                    .get(&id)
                    .map(|n| n.static_dependencies().collect())
                    .unwrap_or_default();
                match deps.get(next) {
                    Some(&dep) => {
                        stack.push((id, next + 1));
                        if visited.insert(dep) {
                            stack.push((dep, 0));
                        }
                    }
                    None => {
                        let position = rank.len();
                        rank.insert(id, position);
                    }
                }
            }
        }

        for id in self.nodes.keys() {
            if !rank.contains_key(id) {
                let position = rank.len();
                rank.insert(*id, position);
            }
        }
        rank
    }

    /// Mark every target of a dynamic edge as a split point.
    fn refresh_split_points(&mut self) {
        let targets: HashSet<ModuleId> = self
            .nodes
            .values()
            .flat_map(|node| node.dynamic_dependencies())
            .collect();
        for node in self.nodes.values_mut() {
            node.is_async_split_point = targets.contains(&node.id);
        }
    }
}

/// A module read and scanned by a worker, not yet part of the graph.
#[derive(Debug)]
pub struct LoadedModule {
    resolved: ResolvedModule,
    key: String,
    module_type: ModuleType,
    content: Arc<Vec<u8>>,
    content_hash: String,
    imports: Vec<ImportRecord>,
    opaque: Vec<String>,
    resolutions: Vec<Result<ResolvedModule, ResolutionError>>,
}

/// Problems found while building the graph, split by severity.
#[derive(Debug, Default)]
pub struct GraphReport {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

enum Work {
    New(ResolvedModule),
    Reload(ModuleId, ResolvedModule),
}

impl Work {
    fn resolved(&self) -> &ResolvedModule {
        match self {
            Work::New(resolved) | Work::Reload(_, resolved) => resolved,
        }
    }
}

/// Discovers modules in breadth-first waves. Each wave is read, hashed,
/// scanned and resolved in parallel on the worker pool; the coordinator then
/// merges results in wave order so ids and edges come out the same on every
/// run.
pub struct GraphBuilder<'a> {
    config: &'a BuildConfig,
    resolver: &'a NodeModuleResolver,
    hasher: ContentHasher,
    pool: &'a rayon::ThreadPool,
    cancel: &'a CancellationToken,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        config: &'a BuildConfig,
        resolver: &'a NodeModuleResolver,
        hasher: ContentHasher,
        pool: &'a rayon::ThreadPool,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            config,
            resolver,
            hasher,
            pool,
            cancel,
        }
    }

    /// Build the full graph reachable from `entries`.
    pub fn build(
        &self,
        entries: &[EntryPoint],
        report: &mut GraphReport,
    ) -> Result<ModuleGraph, SokuError> {
        let mut graph = ModuleGraph::new();
        let resolved = self.resolve_entries(entries, report);
        let root = self.resolver.root();
        let mut seen = HashSet::new();
        let work = resolved
            .iter()
            .filter(|(_, resolved)| seen.insert(resolved.key(root)))
            .map(|(_, resolved)| Work::New(resolved.clone()))
            .collect();
        self.process(&mut graph, work, report)?;
        self.attach_entries(&mut graph, resolved);
        graph.prune_unreachable();
        graph.detect_cycles();
        Ok(graph)
    }

    /// Re-read `dirty` modules and re-resolve imports of every module with
    /// unresolved specifiers, then discover whatever became reachable. With
    /// `relink`, modules whose imports now resolve elsewhere are re-read too.
    ///
    /// A dirty module that can no longer be read is dropped; that is only an
    /// error while something still imports it.
    pub fn update(
        &self,
        graph: &mut ModuleGraph,
        entries: &[EntryPoint],
        dirty: &[ModuleId],
        relink: bool,
        report: &mut GraphReport,
    ) -> Result<Vec<ModuleId>, SokuError> {
        let mut targets: Vec<ModuleId> = dirty.to_vec();
        targets.extend(
            graph
                .nodes()
                .filter(|node| !node.unresolved.is_empty())
                .map(|node| node.id),
        );
        if relink {
            targets.extend(self.moved_resolutions(graph));
        }
        targets.sort();
        targets.dedup();

        let resolved = self.resolve_entries(entries, report);
        let mut work: Vec<Work> = targets
            .iter()
            .filter_map(|id| graph.node(*id))
            .map(|node| {
                Work::Reload(
                    node.id,
                    ResolvedModule {
                        path: node.path.clone(),
                        query: node.query.clone(),
                    },
                )
            })
            .collect();
        let root = self.resolver.root();
        let mut seen = HashSet::new();
        for (_, entry) in &resolved {
            let key = entry.key(root);
            if graph.id_for_key(&key).is_none() && seen.insert(key) {
                work.push(Work::New(entry.clone()));
            }
        }

        let lost = self.process(graph, work, report)?;
        self.attach_entries(graph, resolved);
        let mut removed = graph.prune_unreachable();
        for (id, diagnostic) in lost {
            if graph.dependents(id).is_empty() {
                removed.push(id);
            } else {
                report.errors.push(diagnostic);
            }
        }
        graph.detect_cycles();
        Ok(removed)
    }

    /// Modules with an import that would now resolve to a different module
    /// than the one it is linked to, checked in parallel.
    fn moved_resolutions(&self, graph: &ModuleGraph) -> Vec<ModuleId> {
        let root = self.resolver.root();
        let nodes: Vec<&ModuleNode> = graph.nodes().collect();
        self.pool.install(|| {
            nodes
                .par_iter()
                .filter(|node| !self.links_current(graph, node, root))
                .map(|node| node.id)
                .collect()
        })
    }

    fn links_current(&self, graph: &ModuleGraph, node: &ModuleNode, root: &Path) -> bool {
        let from_dir = node.path.parent().unwrap_or(root);
        node.imports.iter().all(|record| {
            let resolved = self
                .resolver
                .resolve(&record.specifier, from_dir)
                .ok()
                .map(|module| module.key(root));
            let linked = node
                .dependencies
                .iter()
                .find(|edge| edge.specifier == record.specifier && edge.kind == record.kind)
                .and_then(|edge| graph.node(edge.to))
                .map(|target| target.key.clone());
            resolved == linked
        })
    }

    fn resolve_entries(
        &self,
        entries: &[EntryPoint],
        report: &mut GraphReport,
    ) -> Vec<(EntryPoint, ResolvedModule)> {
        let root = self.resolver.root();
        entries
            .iter()
            .filter_map(|entry| match self.resolver.resolve(&entry.specifier, root) {
                Ok(resolved) => Some((entry.clone(), resolved)),
                Err(cause) => {
                    report.errors.push(Diagnostic::new(
                        None,
                        GraphError::UnresolvedEntry {
                            specifier: entry.specifier.clone(),
                            cause,
                        },
                    ));
                    None
                }
            })
            .collect()
    }

    fn attach_entries(&self, graph: &mut ModuleGraph, resolved: Vec<(EntryPoint, ResolvedModule)>) {
        let root = self.resolver.root();
        let entries = resolved
            .into_iter()
            .filter_map(|(entry, module)| {
                graph
                    .id_for_key(&module.key(root))
                    .map(|id| (entry, id))
            })
            .collect();
        graph.set_entries(entries);
    }

    /// Load every wave, then link. Returns reloaded modules whose file could
    /// not be read; they are already out of the graph.
    fn process(
        &self,
        graph: &mut ModuleGraph,
        mut wave: Vec<Work>,
        report: &mut GraphReport,
    ) -> Result<Vec<(ModuleId, Diagnostic)>, SokuError> {
        let root = self.resolver.root().to_path_buf();
        let mut scheduled: HashSet<String> =
            wave.iter().map(|work| work.resolved().key(&root)).collect();
        let mut pending_links = Vec::new();
        let mut lost = Vec::new();

        while !wave.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(SokuError::Cancelled);
            }

            let loaded: Vec<Result<LoadedModule, GraphError>> = self.pool.install(|| {
                wave.par_iter()
                    .map(|work| self.load(work.resolved(), &root))
                    .collect()
            });

            let mut next = Vec::new();
            for (work, loaded) in wave.into_iter().zip(loaded) {
                let mut loaded = match loaded {
                    Ok(loaded) => loaded,
                    Err(err) => {
                        let diagnostic = Diagnostic::for_module(work.resolved().key(&root), err);
                        match work {
                            Work::New(_) => report.errors.push(diagnostic),
                            Work::Reload(id, _) => {
                                graph.remove(id);
                                lost.push((id, diagnostic));
                            }
                        }
                        continue;
                    }
                };

                let resolutions = std::mem::take(&mut loaded.resolutions);
                for resolved in resolutions.iter().flatten() {
                    let key = resolved.key(&root);
                    if graph.id_for_key(&key).is_none() && scheduled.insert(key) {
                        next.push(Work::New(resolved.clone()));
                    }
                }

                let id = match work {
                    Work::New(_) => graph.insert(loaded),
                    Work::Reload(id, _) => {
                        graph.replace(id, loaded);
                        id
                    }
                };
                pending_links.push((id, resolutions));
            }
            wave = next;
        }

        for (id, resolutions) in pending_links {
            self.link(graph, id, resolutions, report);
        }
        graph.refresh_split_points();
        Ok(lost)
    }

    /// Turn a module's resolutions into edges once every target has an id.
    fn link(
        &self,
        graph: &mut ModuleGraph,
        id: ModuleId,
        resolutions: Vec<Result<ResolvedModule, ResolutionError>>,
        report: &mut GraphReport,
    ) {
        let root = self.resolver.root();
        let Some(node) = graph.node(id) else {
            return;
        };
        let from_key = node.key.clone();
        let records = node.imports.clone();

        let mut dependencies = Vec::new();
        let mut unresolved = Vec::new();
        for (record, resolution) in records.into_iter().zip(resolutions) {
            match resolution {
                Ok(resolved) => {
                    // Targets whose read failed were never inserted.
                    if let Some(to) = graph.id_for_key(&resolved.key(root)) {
                        dependencies.push(DependencyEdge {
                            from: id,
                            to,
                            specifier: record.specifier,
                            kind: record.kind,
                        });
                    }
                }
                Err(cause) => {
                    let diagnostic = Diagnostic::for_module(
                        from_key.clone(),
                        GraphError::UnresolvedDependency {
                            specifier: record.specifier.clone(),
                            from: from_key.clone(),
                            cause,
                        },
                    );
                    match self.config.missing_dependency {
                        MissingDependencyMode::Error => report.errors.push(diagnostic),
                        MissingDependencyMode::Warn => report.warnings.push(diagnostic),
                    }
                    unresolved.push(record);
                }
            }
        }

        if let Some(node) = graph.node_mut(id) {
            node.dependencies = dependencies;
            node.unresolved = unresolved;
            if !node.opaque_imports.is_empty() {
                Logger::debug(&format!(
                    "{} keeps {} runtime import(s)",
                    node.key,
                    node.opaque_imports.len()
                ));
            }
        }
    }

    /// Read, hash, scan and resolve one module. Runs on a worker.
    fn load(&self, resolved: &ResolvedModule, root: &Path) -> Result<LoadedModule, GraphError> {
        let bytes = std::fs::read(&resolved.path).map_err(|e| GraphError::ReadFailed {
            path: resolved.path.clone(),
            cause: e.to_string(),
        })?;
        let content_hash = self.hasher.digest(&bytes);
        let module_type = ModuleType::from_path(&resolved.path);

        let scan = if module_type.is_script() || module_type == ModuleType::Css {
            DependencyScanner::scan(module_type, &resolved.path, &String::from_utf8_lossy(&bytes))
        } else {
            Default::default()
        };

        let from_dir: PathBuf = resolved
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        let resolutions = scan
            .imports
            .iter()
            .map(|record| self.resolver.resolve(&record.specifier, &from_dir))
            .collect();

        Ok(LoadedModule {
            key: resolved.key(root),
            resolved: resolved.clone(),
            module_type,
            content: Arc::new(bytes),
            content_hash,
            imports: scan.imports,
            opaque: scan.opaque,
            resolutions,
        })
    }
}
