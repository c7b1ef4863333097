use crate::core::graph::ModuleGraph;
use crate::core::models::{Chunk, ChunkId, ChunkKind, ImportKind, ModuleId, SplitConfig};
use crate::utils::GraphError;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// A module that seeds a chunk: an entry, or the target of a dynamic import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRoot {
    pub name: String,
    pub kind: ChunkKind,
    pub module: ModuleId,
    /// The root's own chunk; async roots whose modules all moved into shared
    /// chunks have none.
    pub chunk: Option<ChunkId>,
    /// Chunks to load, in order, before the root module can run.
    pub loads: Vec<ChunkId>,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    pub roots: Vec<SplitRoot>,
    module_chunks: HashMap<ModuleId, Vec<ChunkId>>,
}

impl ChunkPlan {
    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id.0 as usize)
    }

    /// Chunks holding `module`; more than one only under duplication.
    pub fn chunks_of(&self, module: ModuleId) -> &[ChunkId] {
        self.module_chunks
            .get(&module)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The root a dynamic import of `module` loads.
    pub fn root_for_module(&self, module: ModuleId) -> Option<&SplitRoot> {
        self.roots.iter().find(|root| root.module == module)
    }

    pub fn count(&self, kind: ChunkKind) -> usize {
        self.chunks.iter().filter(|c| c.kind == kind).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    Root(usize),
    Shared(Vec<usize>),
    Duplicate(Vec<usize>),
}

/// Partitions the module graph into entry, shared and async chunks.
///
/// Module cycles are collapsed into components first and placed as a unit.
/// A component loaded by a single root stays in that root's chunk; one loaded
/// by at least `min_reuse` roots goes to the shared chunk for exactly that set
/// of roots. Components in between join the smallest shared chunk whose root
/// set covers theirs, else are duplicated or given their own shared chunk.
pub struct ChunkPlanner<'a> {
    graph: &'a ModuleGraph,
    config: &'a SplitConfig,
}

impl<'a> ChunkPlanner<'a> {
    pub fn new(graph: &'a ModuleGraph, config: &'a SplitConfig) -> Self {
        Self { graph, config }
    }

    pub fn plan(&self) -> Result<ChunkPlan, GraphError> {
        let components = self
            .graph
            .strongly_connected_components(|node| !node.is_excluded());
        let component_of = self.index_components(&components)?;

        let roots = self.find_roots(&component_of);
        let consumers = self.consumers(&components, &component_of, &roots);
        let placements = self.place(&consumers);

        let root_modules: Vec<ModuleId> = roots.iter().map(|(_, _, module)| *module).collect();
        let rank = self.graph.execution_order(&root_modules);

        let plan = self.assemble(&components, &placements, roots, &rank);
        self.verify_cycles(&components, &plan)?;
        Ok(plan)
    }

    fn index_components(
        &self,
        components: &[Vec<ModuleId>],
    ) -> Result<HashMap<ModuleId, usize>, GraphError> {
        let mut component_of = HashMap::new();
        for (index, component) in components.iter().enumerate() {
            for &module in component {
                if component_of.insert(module, index).is_some() {
                    return Err(GraphError::InconsistentCycle(format!(
                        "module {} belongs to more than one component",
                        module
                    )));
                }
            }
        }
        Ok(component_of)
    }

    /// Entries in configuration order, then dynamic-import targets in
    /// breadth-first discovery order. A dynamic import inside the importer's
    /// own cycle is not a split point.
    fn find_roots(&self, component_of: &HashMap<ModuleId, usize>) -> Vec<(String, ChunkKind, ModuleId)> {
        let mut roots: Vec<(String, ChunkKind, ModuleId)> = Vec::new();
        let mut used_names = HashSet::new();
        let mut root_modules = HashSet::new();

        for (entry, module) in self.graph.entries() {
            if !component_of.contains_key(module) {
                continue;
            }
            let name = unique_name(sanitize(&entry.name), &mut used_names);
            roots.push((name, ChunkKind::Entry, *module));
            root_modules.insert(*module);
        }

        let mut queue: VecDeque<ModuleId> = roots.iter().map(|(_, _, m)| *m).collect();
        let mut seen: HashSet<ModuleId> = queue.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.graph.node(id) else {
                continue;
            };
            let Some(&from_component) = component_of.get(&id) else {
                continue;
            };
            for edge in &node.dependencies {
                let Some(&to_component) = component_of.get(&edge.to) else {
                    continue;
                };
                if edge.kind == ImportKind::Dynamic
                    && to_component != from_component
                    && root_modules.insert(edge.to)
                {
                    let stem = self
                        .graph
                        .node(edge.to)
                        .and_then(|n| n.path.file_stem())
                        .and_then(|s| s.to_str())
                        .unwrap_or("async");
                    let name = unique_name(sanitize(stem), &mut used_names);
                    roots.push((name, ChunkKind::Async, edge.to));
                }
                if seen.insert(edge.to) {
                    queue.push_back(edge.to);
                }
            }
        }

        roots
    }

    /// For every component, the sorted indices of roots that statically reach it.
    fn consumers(
        &self,
        components: &[Vec<ModuleId>],
        component_of: &HashMap<ModuleId, usize>,
        roots: &[(String, ChunkKind, ModuleId)],
    ) -> Vec<Vec<usize>> {
        let successors: Vec<BTreeSet<usize>> = components
            .iter()
            .enumerate()
            .map(|(index, members)| {
                members
                    .iter()
                    .filter_map(|m| self.graph.node(*m))
                    .flat_map(|node| node.static_dependencies())
                    .filter_map(|to| component_of.get(&to).copied())
                    .filter(|to| *to != index)
                    .collect()
            })
            .collect();

        let mut consumers = vec![Vec::new(); components.len()];
        for (root_index, (_, _, module)) in roots.iter().enumerate() {
            let start = component_of[module];
            let mut visited = HashSet::from([start]);
            let mut queue = VecDeque::from([start]);
            while let Some(component) = queue.pop_front() {
                consumers[component].push(root_index);
                for &next in &successors[component] {
                    if visited.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        consumers
    }

    fn place(&self, consumers: &[Vec<usize>]) -> Vec<Option<Placement>> {
        let min_reuse = self.config.min_reuse;
        let qualified: BTreeSet<&Vec<usize>> = consumers
            .iter()
            .filter(|set| set.len() >= min_reuse)
            .collect();

        consumers
            .iter()
            .map(|set| match set.len() {
                0 => None,
                1 => Some(Placement::Root(set[0])),
                n if n >= min_reuse => Some(Placement::Shared(set.clone())),
                _ => {
                    let covering = qualified
                        .iter()
                        .filter(|candidate| set.iter().all(|root| candidate.contains(root)))
                        .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
                    Some(match covering {
                        Some(candidate) => Placement::Shared((*candidate).clone()),
                        None if self.config.duplicate_below_threshold => {
                            Placement::Duplicate(set.clone())
                        }
                        None => Placement::Shared(set.clone()),
                    })
                }
            })
            .collect()
    }

    fn assemble(
        &self,
        components: &[Vec<ModuleId>],
        placements: &[Option<Placement>],
        roots: Vec<(String, ChunkKind, ModuleId)>,
        rank: &HashMap<ModuleId, usize>,
    ) -> ChunkPlan {
        let mut used_names: HashSet<String> = roots.iter().map(|(n, _, _)| n.clone()).collect();

        // Staging order: root chunks in root order, then shared chunks by root set.
        let mut staged: Vec<Chunk> = roots
            .iter()
            .enumerate()
            .map(|(index, (name, kind, module))| {
                let mut chunk = Chunk::new(ChunkId(index as u32), name.clone(), *kind, vec![index]);
                if *kind == ChunkKind::Entry {
                    chunk.entry_module = Some(*module);
                }
                chunk
            })
            .collect();

        let shared_sets: BTreeSet<&Vec<usize>> = placements
            .iter()
            .flatten()
            .filter_map(|p| match p {
                Placement::Shared(set) => Some(set),
                _ => None,
            })
            .collect();
        let mut shared_index: BTreeMap<Vec<usize>, usize> = BTreeMap::new();
        for set in shared_sets {
            let joined: Vec<&str> = set.iter().map(|r| roots[*r].0.as_str()).collect();
            let mut name = format!("shared-{}", joined.join("-"));
            if name.len() > 48 {
                name = format!("shared-{}", &blake3::hash(name.as_bytes()).to_hex()[..8]);
            }
            let name = unique_name(name, &mut used_names);
            shared_index.insert(set.clone(), staged.len());
            staged.push(Chunk::new(
                ChunkId(staged.len() as u32),
                name,
                ChunkKind::Shared,
                set.clone(),
            ));
        }

        for (component, placement) in components.iter().zip(placements) {
            let targets: Vec<usize> = match placement {
                None => continue,
                Some(Placement::Root(root)) => vec![*root],
                Some(Placement::Shared(set)) => vec![shared_index[set]],
                Some(Placement::Duplicate(set)) => set.clone(),
            };
            for target in targets {
                staged[target].modules.extend(component.iter().copied());
            }
        }

        // Drop async chunks left empty; entry chunks always stay.
        let mut renumber: HashMap<usize, ChunkId> = HashMap::new();
        let mut chunks = Vec::new();
        for (old, mut chunk) in staged.into_iter().enumerate() {
            if chunk.kind == ChunkKind::Async && chunk.is_empty() {
                continue;
            }
            let id = ChunkId(chunks.len() as u32);
            renumber.insert(old, id);
            chunk.id = id;
            chunk
                .modules
                .sort_by_key(|m| (rank.get(m).copied().unwrap_or(usize::MAX), *m));
            chunk.retains_runtime_imports = chunk.modules.iter().any(|m| {
                self.graph
                    .node(*m)
                    .map_or(false, |n| !n.opaque_imports.is_empty())
            });
            chunks.push(chunk);
        }

        let mut module_chunks: HashMap<ModuleId, Vec<ChunkId>> = HashMap::new();
        for chunk in &chunks {
            for module in &chunk.modules {
                module_chunks.entry(*module).or_default().push(chunk.id);
            }
        }

        let split_roots: Vec<SplitRoot> = roots
            .into_iter()
            .enumerate()
            .map(|(index, (name, kind, module))| {
                let own = renumber.get(&index).copied();
                let mut loads: Vec<ChunkId> = chunks
                    .iter()
                    .filter(|c| c.kind == ChunkKind::Shared && c.consumers.contains(&index))
                    .map(|c| c.id)
                    .collect();
                loads.extend(own);
                SplitRoot {
                    name,
                    kind,
                    module,
                    chunk: own,
                    loads,
                }
            })
            .collect();

        for root in &split_roots {
            if let Some(id) = root.chunk {
                chunks[id.0 as usize].loads = root.loads.clone();
            }
        }

        ChunkPlan {
            chunks,
            roots: split_roots,
            module_chunks,
        }
    }

    fn verify_cycles(&self, components: &[Vec<ModuleId>], plan: &ChunkPlan) -> Result<(), GraphError> {
        for component in components.iter().filter(|c| c.len() > 1) {
            let expected = plan.chunks_of(component[0]);
            if let Some(stray) = component.iter().find(|m| plan.chunks_of(**m) != expected) {
                return Err(GraphError::InconsistentCycle(format!(
                    "cycle member {} is not co-located with {}",
                    stray, component[0]
                )));
            }
        }
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "chunk".to_string()
    } else {
        cleaned
    }
}

fn unique_name(base: String, used: &mut HashSet<String>) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{}-{}", base, counter);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}
