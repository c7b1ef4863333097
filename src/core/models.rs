use crate::core::pipeline::TransformStepKind;
use crate::utils::{HashAlgorithm, Result, SokuError, TransformError};
use crate::utils::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Stable arena index of a module. Ids are handed out once per build context and
/// never reused for a different file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleType {
    JavaScript,
    TypeScript,
    Css,
    Json,
    Asset,
    Unknown,
}

impl ModuleType {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "js" | "jsx" | "mjs" | "cjs" => ModuleType::JavaScript,
            "ts" | "tsx" | "mts" | "cts" => ModuleType::TypeScript,
            "css" | "scss" | "sass" => ModuleType::Css,
            "json" => ModuleType::Json,
            "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" | "eot" | "ttf" | "woff"
            | "woff2" | "otf" => ModuleType::Asset,
            _ => ModuleType::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|s| s.to_str())
            .map(Self::from_extension)
            .unwrap_or(ModuleType::Unknown)
    }

    pub fn is_script(&self) -> bool {
        matches!(self, ModuleType::JavaScript | ModuleType::TypeScript)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportKind {
    Static,
    Dynamic,
}

/// A dependency specifier as written in the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImportRecord {
    pub specifier: String,
    pub kind: ImportKind,
}

impl ImportRecord {
    pub fn new(specifier: impl Into<String>, kind: ImportKind) -> Self {
        Self {
            specifier: specifier.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: ModuleId,
    pub to: ModuleId,
    pub specifier: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideAssetKind {
    /// Stylesheet text merged into the owning chunk's CSS file.
    Style,
    /// A file copied verbatim to `name` under the output directory.
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideAsset {
    pub kind: SideAssetKind,
    pub name: String,
    pub content: Vec<u8>,
}

/// A file a transform read besides its module, with the content hash seen at
/// transform time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDependency {
    pub path: PathBuf,
    pub hash: String,
}

/// What the transform pipeline produces for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompiledOutput {
    pub code: String,
    pub assets: Vec<SideAsset>,
    pub file_dependencies: Vec<FileDependency>,
    pub data_url: Option<String>,
}

impl CompiledOutput {
    pub fn size(&self) -> usize {
        self.code.len()
            + self.assets.iter().map(|a| a.content.len() + a.name.len()).sum::<usize>()
            + self.data_url.as_ref().map_or(0, |url| url.len())
    }

    pub fn styles(&self) -> impl Iterator<Item = &SideAsset> {
        self.assets.iter().filter(|a| a.kind == SideAssetKind::Style)
    }

    /// The file copied to the output directory for this module, if any.
    pub fn static_asset(&self) -> Option<&SideAsset> {
        self.assets.iter().find(|a| a.kind == SideAssetKind::Static)
    }

    pub fn depends_on(&self, path: &Path) -> bool {
        self.file_dependencies.iter().any(|dep| dep.path == path)
    }
}

/// Borrowed view of a module handed to transform steps.
#[derive(Debug, Clone, Copy)]
pub struct ModuleSource<'a> {
    pub id: ModuleId,
    pub key: &'a str,
    pub path: &'a Path,
    pub query: Option<&'a str>,
    pub module_type: ModuleType,
    pub raw: &'a [u8],
}

impl ModuleSource<'_> {
    /// Lowercase file extension without the dot.
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase()
    }

    pub fn has_extension(&self, exts: &[&str]) -> bool {
        let ext = self.extension();
        exts.iter().any(|e| *e == ext)
    }

    pub fn file_stem(&self) -> &str {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("asset")
    }
}

#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub id: ModuleId,
    /// Root-relative path plus `?query`, used in output and the manifest.
    pub key: String,
    pub path: PathBuf,
    pub query: Option<String>,
    pub module_type: ModuleType,
    pub content: Arc<Vec<u8>>,
    pub content_hash: String,
    pub imports: Vec<ImportRecord>,
    /// `import(expr)` calls whose target cannot be determined statically.
    pub opaque_imports: Vec<String>,
    pub dependencies: Vec<DependencyEdge>,
    pub unresolved: Vec<ImportRecord>,
    pub fingerprint: Option<String>,
    pub output: Option<CompiledOutput>,
    pub failure: Option<TransformError>,
    pub is_entry: bool,
    pub is_async_split_point: bool,
}

impl ModuleNode {
    pub fn source(&self) -> ModuleSource<'_> {
        ModuleSource {
            id: self.id,
            key: &self.key,
            path: &self.path,
            query: self.query.as_deref(),
            module_type: self.module_type,
            raw: &self.content,
        }
    }

    pub fn static_dependencies(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.dependencies
            .iter()
            .filter(|e| e.kind == ImportKind::Static)
            .map(|e| e.to)
    }

    pub fn dynamic_dependencies(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.dependencies
            .iter()
            .filter(|e| e.kind == ImportKind::Dynamic)
            .map(|e| e.to)
    }

    pub fn is_excluded(&self) -> bool {
        self.failure.is_some()
    }

    pub fn needs_transform(&self) -> bool {
        self.output.is_none() && self.failure.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Entry,
    Shared,
    Async,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    pub name: String,
    pub kind: ChunkKind,
    /// Members in execution order.
    pub modules: Vec<ModuleId>,
    /// Indices of the roots (entries first, then split points) that load this chunk.
    pub consumers: Vec<usize>,
    /// Chunks that must be loaded before this one, in load order. Only root chunks
    /// carry a load list.
    pub loads: Vec<ChunkId>,
    /// Module executed when an entry chunk finishes loading.
    pub entry_module: Option<ModuleId>,
    pub retains_runtime_imports: bool,
    pub content_hash: Option<String>,
    pub filename: Option<String>,
    pub css_filename: Option<String>,
}

impl Chunk {
    pub fn new(id: ChunkId, name: String, kind: ChunkKind, consumers: Vec<usize>) -> Self {
        Self {
            id,
            name,
            kind,
            modules: Vec::new(),
            consumers,
            loads: Vec::new(),
            entry_module: None,
            retains_runtime_imports: false,
            content_hash: None,
            filename: None,
            css_filename: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// A named build root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub name: String,
    pub specifier: String,
}

impl EntryPoint {
    pub fn new(name: impl Into<String>, specifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            specifier: specifier.into(),
        }
    }
}

impl From<&str> for EntryPoint {
    fn from(specifier: &str) -> Self {
        let without_query = specifier.split('?').next().unwrap_or(specifier);
        let name = Path::new(without_query)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("main")
            .to_string();
        Self::new(name, specifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestChunk {
    pub kind: ChunkKind,
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub css: Option<String>,
    pub modules: Vec<String>,
    /// Files to load, in order, before this chunk can run.
    pub loads: Vec<String>,
    #[serde(default)]
    pub retains_runtime_imports: bool,
}

/// Stable, diffable description of one build's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub entries: BTreeMap<String, Vec<String>>,
    pub modules: BTreeMap<String, String>,
    pub chunks: BTreeMap<String, ManifestChunk>,
    pub assets: BTreeMap<String, String>,
    /// Loader file every page includes before its entry chunks.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub runtime: Option<String>,
}

impl Manifest {
    pub const FILE_NAME: &'static str = "manifest.json";

    pub fn to_json(&self) -> String {
        // BTreeMaps of strings always serialize.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| SokuError::config(format!("invalid manifest: {}", e)))
    }

    pub fn chunk_for_module(&self, key: &str) -> Option<&str> {
        self.modules.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveConfig {
    /// Alias prefix → target (relative to root, or absolute). Checked before the
    /// filesystem.
    pub alias: BTreeMap<String, String>,
    /// Probed in order; the first existing candidate wins.
    pub extensions: Vec<String>,
    pub main_fields: Vec<String>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            alias: BTreeMap::new(),
            extensions: [".tsx", ".ts", ".js", ".jsx", ".mjs", ".json"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            main_fields: ["browser", "module", "main"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitConfig {
    /// A shared chunk is only created when at least this many roots load it.
    pub min_reuse: usize,
    /// Copy under-reused shared modules into each consumer instead of forcing an
    /// extra chunk when no covering shared chunk exists.
    pub duplicate_below_threshold: bool,
}

impl SplitConfig {
    pub fn new(min_reuse: usize) -> Self {
        Self {
            min_reuse,
            duplicate_below_threshold: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub js_filename: String,
    pub css_filename: String,
    pub hash_algorithm: HashAlgorithm,
    pub hash_length: usize,
    pub public_path: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            js_filename: "js/[name].[hash].js".to_string(),
            css_filename: "css/[name].[hash].css".to_string(),
            hash_algorithm: HashAlgorithm::Blake3,
            hash_length: 8,
            public_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Persistent store location; `None` keeps the cache in memory only.
    pub dir: Option<PathBuf>,
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_entries: 10_000,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum FailureMode {
    #[default]
    Strict,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum MissingDependencyMode {
    #[default]
    Error,
    Warn,
}

/// Immutable configuration shared by every phase of a build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub root: PathBuf,
    pub outdir: PathBuf,
    pub resolve: ResolveConfig,
    pub transforms: Vec<TransformStepKind>,
    pub split: SplitConfig,
    pub output: OutputConfig,
    pub cache: CacheConfig,
    pub workers: usize,
    pub failure_mode: FailureMode,
    pub missing_dependency: MissingDependencyMode,
}

impl BuildConfig {
    pub fn new(root: impl Into<PathBuf>, split: SplitConfig) -> Self {
        let root = root.into();
        Self {
            outdir: root.join("dist"),
            root,
            resolve: ResolveConfig::default(),
            transforms: TransformStepKind::default_chain(false),
            split,
            output: OutputConfig::default(),
            cache: CacheConfig::default(),
            workers: num_cpus::get(),
            failure_mode: FailureMode::Strict,
            missing_dependency: MissingDependencyMode::Error,
        }
    }

    pub fn with_outdir(mut self, outdir: impl Into<PathBuf>) -> Self {
        self.outdir = outdir.into();
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.resolve.alias.insert(alias.into(), target.into());
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<TransformStepKind>) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_step(mut self, step: TransformStepKind) -> Self {
        self.transforms.push(step);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_missing_dependency(mut self, mode: MissingDependencyMode) -> Self {
        self.missing_dependency = mode;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = Some(dir.into());
        self
    }

    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.output.hash_algorithm = algorithm;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.split.min_reuse < 2 {
            return Err(SokuError::config(format!(
                "split.minReuse must be at least 2, got {}",
                self.split.min_reuse
            )));
        }
        if self.workers == 0 {
            return Err(SokuError::config("workers must be at least 1"));
        }
        if !(4..=64).contains(&self.output.hash_length) {
            return Err(SokuError::config(format!(
                "output.hashLength must be between 4 and 64, got {}",
                self.output.hash_length
            )));
        }
        for pattern in [&self.output.js_filename, &self.output.css_filename] {
            if !pattern.contains("[name]") || !pattern.contains("[hash]") {
                return Err(SokuError::config(format!(
                    "output filename '{}' must contain [name] and [hash]",
                    pattern
                )));
            }
        }
        if self.root.starts_with(&self.outdir) {
            return Err(SokuError::config(format!(
                "outdir {} must not be the project root or one of its parents",
                self.outdir.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub modules_total: usize,
    pub modules_transformed: usize,
    pub cache_hits: usize,
    pub chunks_total: usize,
    pub chunks_rendered: usize,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct BuildResult {
    pub manifest: Manifest,
    pub warnings: Vec<Diagnostic>,
    pub stats: BuildStats,
    /// Emitted files relative to the output directory, with sizes in bytes.
    pub output_files: Vec<OutputFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub name: String,
    pub size: usize,
}
