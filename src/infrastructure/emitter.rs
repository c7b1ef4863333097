use crate::core::graph::ModuleGraph;
use crate::core::models::{
    Chunk, ChunkKind, ImportKind, Manifest, ManifestChunk, ModuleId, ModuleNode, ModuleType,
    OutputConfig, OutputFile, SideAssetKind,
};
use crate::infrastructure::processors::code_splitter::{ChunkPlan, SplitRoot};
use crate::infrastructure::processors::dependency_scanner::{DependencyScanner, CSS_URL_REGEX};
use crate::utils::{ContentHasher, EmitError, Logger};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

static REQUIRE_CALL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(^|[^\w$.])require\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).unwrap()
});

static IMPORT_CALL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(^|[^\w$.])import\s*\(\s*(?:['"]([^'"\n]+)['"]|`([^`$\n]+)`)\s*\)"#).unwrap()
});

/// Module registry and chunk loader. `__SOKU_CONFIG__` is replaced with the
/// chunk, root and stylesheet maps of the build.
const RUNTIME_TEMPLATE: &str = r#"(function (global) {
  var config = __SOKU_CONFIG__;
  var definitions = Object.create(null);
  var instances = Object.create(null);
  var loaded = Object.create(null);
  var pending = Object.create(null);

  function require(key) {
    var instance = instances[key];
    if (instance) return instance.exports;
    var factory = definitions[key];
    if (!factory) throw new Error("soku: module '" + key + "' is not loaded");
    var module = { exports: {} };
    instances[key] = module;
    factory.call(module.exports, module, module.exports, require);
    return module.exports;
  }

  function loadStyle(name) {
    var href = config.css[name];
    if (!href || typeof document === "undefined") return;
    var link = document.createElement("link");
    link.rel = "stylesheet";
    link.href = config.publicPath + href;
    document.head.appendChild(link);
  }

  function loadChunk(name) {
    if (loaded[name]) return Promise.resolve();
    if (pending[name]) return pending[name].promise;
    var request = {};
    request.promise = new Promise(function (resolve, reject) {
      request.resolve = resolve;
      request.reject = reject;
    });
    pending[name] = request;
    loadStyle(name);
    if (typeof document !== "undefined") {
      var script = document.createElement("script");
      script.src = config.publicPath + config.chunks[name];
      script.onerror = function () {
        delete pending[name];
        request.reject(new Error("soku: failed to load chunk '" + name + "'"));
      };
      document.head.appendChild(script);
    }
    return request.promise;
  }

  global.__soku_define = function (key, factory) {
    if (!(key in definitions)) definitions[key] = factory;
  };
  global.__soku_require = require;
  global.__soku_loaded = function (name) {
    loaded[name] = true;
    var request = pending[name];
    if (request) {
      delete pending[name];
      request.resolve();
    }
  };
  global.__soku_import = function (root, key) {
    var chunks = config.roots[root] || [];
    return Promise.all(chunks.map(loadChunk)).then(function () {
      return require(key);
    });
  };
  global.__soku_default = function (m) {
    return m && m.__esModule ? m.default : m;
  };
  global.__soku_export = function (exports, getters) {
    Object.keys(getters).forEach(function (name) {
      Object.defineProperty(exports, name, { enumerable: true, get: getters[name] });
    });
  };
  global.__soku_export_star = function (exports, m) {
    Object.keys(m).forEach(function (name) {
      if (name === "default" || Object.prototype.hasOwnProperty.call(exports, name)) return;
      Object.defineProperty(exports, name, {
        enumerable: true,
        get: function () {
          return m[name];
        },
      });
    });
  };
})(typeof globalThis !== "undefined" ? globalThis : this);
"#;

#[derive(Debug, Clone)]
struct RenderedChunk {
    code: String,
    css: Option<String>,
}

#[derive(Debug)]
pub struct EmitOutcome {
    pub manifest: Manifest,
    pub output_files: Vec<OutputFile>,
    pub chunks_rendered: usize,
}

/// Serializes a chunk plan into hashed files and publishes them atomically.
///
/// Rendered chunk bodies are kept between builds keyed by a digest of
/// everything that goes into them, so an incremental rebuild only renders
/// chunks whose members changed.
pub struct Emitter {
    output: OutputConfig,
    hasher: ContentHasher,
    /// Prefix that turns an emitted asset name into a URL valid from a CSS file.
    asset_base: String,
    rendered: HashMap<String, RenderedChunk>,
}

impl Emitter {
    pub fn new(output: OutputConfig) -> Self {
        let hasher = ContentHasher::new(output.hash_algorithm);
        let asset_base = if output.public_path.is_empty() {
            "../".repeat(output.css_filename.matches('/').count())
        } else {
            output.public_path.clone()
        };
        Self {
            output,
            hasher,
            asset_base,
            rendered: HashMap::new(),
        }
    }

    pub fn emit(
        &mut self,
        graph: &ModuleGraph,
        plan: &mut ChunkPlan,
        outdir: &Path,
    ) -> Result<EmitOutcome, EmitError> {
        let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut rendered = HashMap::new();
        let mut chunks_rendered = 0;
        let roots = root_names(&plan.roots);

        for chunk in plan.chunks.iter_mut() {
            let inputs = self.chunk_inputs(graph, &roots, chunk);
            let body = match self.rendered.get(&inputs) {
                Some(body) => body.clone(),
                None => {
                    chunks_rendered += 1;
                    render_chunk(graph, &roots, chunk, &self.asset_base)
                }
            };

            let hash = self.hasher.short(body.code.as_bytes(), self.output.hash_length);
            let filename = fill_pattern(&self.output.js_filename, &chunk.name, &hash);
            files.insert(filename.clone(), body.code.clone().into_bytes());
            chunk.content_hash = Some(hash);
            chunk.filename = Some(filename);

            chunk.css_filename = body.css.as_ref().map(|css| {
                let hash = self.hasher.short(css.as_bytes(), self.output.hash_length);
                let filename = fill_pattern(&self.output.css_filename, &chunk.name, &hash);
                files.insert(filename.clone(), css.clone().into_bytes());
                filename
            });

            rendered.insert(inputs, body);
        }
        self.rendered = rendered;

        let mut manifest = Manifest::default();
        for node in graph.nodes().filter(|n| !n.is_excluded()) {
            let Some(output) = &node.output else {
                continue;
            };
            for asset in output.assets.iter().filter(|a| a.kind == SideAssetKind::Static) {
                files.insert(asset.name.clone(), asset.content.clone());
                manifest.assets.insert(node.key.clone(), asset.name.clone());
            }
        }

        let runtime = self.render_runtime(plan);
        let runtime_hash = self.hasher.short(runtime.as_bytes(), self.output.hash_length);
        let runtime_file = fill_pattern(&self.output.js_filename, "runtime", &runtime_hash);
        files.insert(runtime_file.clone(), runtime.into_bytes());

        self.fill_manifest(&mut manifest, graph, plan, &runtime_file);
        files.insert(Manifest::FILE_NAME.to_string(), manifest.to_json().into_bytes());

        let output_files = files
            .iter()
            .map(|(name, content)| OutputFile {
                name: name.clone(),
                size: content.len(),
            })
            .collect();

        write_and_publish(&files, outdir)?;

        Ok(EmitOutcome {
            manifest,
            output_files,
            chunks_rendered,
        })
    }

    /// Digest of every input that determines a chunk's rendered bytes.
    fn chunk_inputs(&self, graph: &ModuleGraph, roots: &RootNames, chunk: &Chunk) -> String {
        let mut state = self.hasher.start();
        state.part(b"soku-chunk-v1").part(chunk.name.as_bytes());
        state.part(format!("{:?}", chunk.kind).as_bytes());
        for node in chunk.modules.iter().filter_map(|m| graph.node(*m)) {
            state.part(node.key.as_bytes());
            state.part(node.content_hash.as_bytes());
            state.part(node.fingerprint.as_deref().unwrap_or("").as_bytes());
            for dep in node.output.iter().flat_map(|out| &out.file_dependencies) {
                state.part(dep.hash.as_bytes());
            }
            for edge in &node.dependencies {
                let target = graph.node(edge.to);
                let key = target.map_or("", |n| n.key.as_str());
                state.part(edge.specifier.as_bytes()).part(key.as_bytes());
                // Stylesheets embed the hashed names of the assets they use.
                if let Some(asset) = target.filter(|n| n.module_type == ModuleType::Asset) {
                    state.part(asset.content_hash.as_bytes());
                }
                if edge.kind == ImportKind::Dynamic {
                    state.part(roots.get(&edge.to).map_or("", String::as_str).as_bytes());
                }
            }
        }
        if let Some(entry) = chunk.entry_module.and_then(|m| graph.node(m)) {
            state.part(b"entry").part(entry.key.as_bytes());
        }
        state.finish()
    }

    fn render_runtime(&self, plan: &ChunkPlan) -> String {
        let chunks: BTreeMap<&str, &str> = plan
            .chunks
            .iter()
            .filter_map(|c| Some((c.name.as_str(), c.filename.as_deref()?)))
            .collect();
        let css: BTreeMap<&str, &str> = plan
            .chunks
            .iter()
            .filter_map(|c| Some((c.name.as_str(), c.css_filename.as_deref()?)))
            .collect();
        let roots: BTreeMap<&str, Vec<&str>> = plan
            .roots
            .iter()
            .map(|root| {
                let loads = root
                    .loads
                    .iter()
                    .filter_map(|id| plan.chunk(*id))
                    .map(|c| c.name.as_str())
                    .collect();
                (root.name.as_str(), loads)
            })
            .collect();

        let config = json!({
            "chunks": chunks,
            "css": css,
            "roots": roots,
            "publicPath": self.output.public_path,
        });
        RUNTIME_TEMPLATE.replace("__SOKU_CONFIG__", &config.to_string())
    }

    fn fill_manifest(
        &self,
        manifest: &mut Manifest,
        graph: &ModuleGraph,
        plan: &ChunkPlan,
        runtime_file: &str,
    ) {
        let file_of = |id| plan.chunk(id).and_then(|c| c.filename.clone());

        for root in plan.roots.iter().filter(|r| r.kind == ChunkKind::Entry) {
            let mut files = vec![runtime_file.to_string()];
            files.extend(root.loads.iter().filter_map(|id| file_of(*id)));
            files.extend(
                root.loads
                    .iter()
                    .filter_map(|id| plan.chunk(*id)?.css_filename.clone()),
            );
            manifest.entries.insert(root.name.clone(), files);
        }

        for chunk in &plan.chunks {
            let Some(file) = chunk.filename.clone() else {
                continue;
            };
            let mut keys = Vec::with_capacity(chunk.modules.len());
            for node in chunk.modules.iter().filter_map(|m| graph.node(*m)) {
                manifest
                    .modules
                    .entry(node.key.clone())
                    .or_insert_with(|| file.clone());
                keys.push(node.key.clone());
            }
            manifest.chunks.insert(
                chunk.name.clone(),
                ManifestChunk {
                    kind: chunk.kind,
                    file,
                    css: chunk.css_filename.clone(),
                    modules: keys,
                    loads: chunk.loads.iter().filter_map(|id| file_of(*id)).collect(),
                    retains_runtime_imports: chunk.retains_runtime_imports,
                },
            );
        }

        manifest.runtime = Some(runtime_file.to_string());
    }
}

type RootNames = HashMap<ModuleId, String>;

/// Root name per split-point module, used to address `__soku_import`.
fn root_names(roots: &[SplitRoot]) -> RootNames {
    let mut names = RootNames::new();
    for root in roots {
        names.entry(root.module).or_insert_with(|| root.name.clone());
    }
    names
}

fn fill_pattern(pattern: &str, name: &str, hash: &str) -> String {
    pattern.replace("[name]", name).replace("[hash]", hash)
}

fn render_chunk(
    graph: &ModuleGraph,
    roots: &RootNames,
    chunk: &Chunk,
    asset_base: &str,
) -> RenderedChunk {
    let mut code = String::new();
    let mut css = String::new();

    for node in chunk.modules.iter().filter_map(|m| graph.node(*m)) {
        let Some(output) = &node.output else {
            continue;
        };
        code.push_str(&format!(
            "__soku_define({}, function (module, exports, require) {{\n{}\n}});\n",
            json!(node.key),
            link_module(graph, roots, node, &output.code)
        ));
        for style in output.styles() {
            css.push_str(&link_style(
                graph,
                node,
                &String::from_utf8_lossy(&style.content),
                asset_base,
            ));
            if !css.ends_with('\n') {
                css.push('\n');
            }
        }
    }

    code.push_str(&format!("__soku_loaded({});\n", json!(chunk.name)));
    if let Some(entry) = chunk.entry_module.and_then(|m| graph.node(m)) {
        code.push_str(&format!("__soku_require({});\n", json!(entry.key)));
    }

    RenderedChunk {
        code,
        css: (!css.is_empty()).then_some(css),
    }
}

/// Point `require`/`import()` specifiers at registry keys. Specifiers without
/// an edge (unresolved in warning mode) are left as written.
fn link_module(graph: &ModuleGraph, roots: &RootNames, node: &ModuleNode, code: &str) -> String {
    let target = |specifier: &str, kind: ImportKind| {
        node.dependencies
            .iter()
            .find(|edge| edge.kind == kind && edge.specifier == specifier)
            .and_then(|edge| Some((edge.to, graph.node(edge.to)?.key.as_str())))
    };

    let linked = REQUIRE_CALL_REGEX.replace_all(code, |caps: &Captures| {
        match target(&caps[2], ImportKind::Static) {
            Some((_, key)) => format!("{}require({})", &caps[1], json!(key)),
            None => caps[0].to_string(),
        }
    });

    IMPORT_CALL_REGEX
        .replace_all(&linked, |caps: &Captures| {
            let specifier = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
            match target(specifier, ImportKind::Dynamic) {
                Some((id, key)) => match roots.get(&id) {
                    Some(root) => format!(
                        "{}__soku_import({}, {})",
                        &caps[1],
                        json!(root),
                        json!(key)
                    ),
                    // Same cycle as the importer, so already in this chunk.
                    None => format!(
                        "{}Promise.resolve().then(function () {{ return require({}); }})",
                        &caps[1],
                        json!(key)
                    ),
                },
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Point `url()` references at emitted asset files, or inline them when the
/// asset was small enough to become a data URL. Unlinked URLs stay as written.
fn link_style(graph: &ModuleGraph, node: &ModuleNode, css: &str, asset_base: &str) -> String {
    CSS_URL_REGEX
        .replace_all(css, |caps: &Captures| {
            let raw = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map_or("", |m| m.as_str());
            let Some((specifier, fragment)) = DependencyScanner::css_url_specifier(raw) else {
                return caps[0].to_string();
            };
            let output = node
                .dependencies
                .iter()
                .find(|edge| edge.kind == ImportKind::Static && edge.specifier == specifier)
                .and_then(|edge| graph.node(edge.to))
                .and_then(|target| target.output.as_ref());
            let url = match output {
                Some(out) => match (out.static_asset(), &out.data_url) {
                    (Some(asset), _) => format!("{}{}", asset_base, asset.name),
                    (None, Some(data_url)) => data_url.clone(),
                    (None, None) => return caps[0].to_string(),
                },
                None => return caps[0].to_string(),
            };
            format!("url(\"{}{}\")", url, fragment)
        })
        .into_owned()
}

fn staging_sibling(outdir: &Path, label: &str) -> PathBuf {
    let name = outdir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dist".to_string());
    let parent = outdir.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{}.{}-{}", name, label, uuid::Uuid::new_v4().simple()))
}

/// Write every file into a fresh staging directory, then swap it into place.
/// Nothing is visible under `outdir` until all writes have succeeded.
fn write_and_publish(files: &BTreeMap<String, Vec<u8>>, outdir: &Path) -> Result<(), EmitError> {
    let staging = staging_sibling(outdir, "staging");

    let written = files.iter().try_for_each(|(name, content)| {
        let path = staging.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|cause| EmitError::WriteFailed {
                path: parent.to_path_buf(),
                cause,
            })?;
        }
        fs::write(&path, content).map_err(|cause| EmitError::WriteFailed { path, cause })
    });
    if let Err(err) = written {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    publish(&staging, outdir)
}

fn publish(staging: &Path, outdir: &Path) -> Result<(), EmitError> {
    let failed = |cause| EmitError::PublishFailed {
        path: outdir.to_path_buf(),
        cause,
    };

    let previous = if outdir.exists() {
        let backup = staging_sibling(outdir, "old");
        if let Err(cause) = fs::rename(outdir, &backup) {
            let _ = fs::remove_dir_all(staging);
            return Err(failed(cause));
        }
        Some(backup)
    } else {
        None
    };

    if let Err(cause) = fs::rename(staging, outdir) {
        if let Some(backup) = &previous {
            let _ = fs::rename(backup, outdir);
        }
        let _ = fs::remove_dir_all(staging);
        return Err(failed(cause));
    }

    if let Some(backup) = previous {
        if let Err(err) = fs::remove_dir_all(&backup) {
            Logger::warn(&format!(
                "could not remove previous output {}: {}",
                backup.display(),
                err
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(name, content)| (name.to_string(), content.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_fill_pattern() {
        assert_eq!(
            fill_pattern("js/[name].[hash].js", "main", "abcd1234"),
            "js/main.abcd1234.js"
        );
    }

    #[test]
    fn test_asset_base_follows_css_location() {
        assert_eq!(Emitter::new(OutputConfig::default()).asset_base, "../");

        let flat = OutputConfig {
            css_filename: "[name].[hash].css".to_string(),
            ..Default::default()
        };
        assert_eq!(Emitter::new(flat).asset_base, "");

        let cdn = OutputConfig {
            public_path: "https://cdn.example.com/".to_string(),
            ..Default::default()
        };
        assert_eq!(Emitter::new(cdn).asset_base, "https://cdn.example.com/");
    }

    #[test]
    fn test_publish_replaces_previous_output() {
        let dir = tempdir().unwrap();
        let outdir = dir.path().join("dist");

        write_and_publish(&files(&[("js/a.js", "a"), ("stale.txt", "old")]), &outdir).unwrap();
        assert!(outdir.join("stale.txt").exists());

        write_and_publish(&files(&[("js/b.js", "b")]), &outdir).unwrap();
        assert!(!outdir.join("stale.txt").exists());
        assert_eq!(fs::read_to_string(outdir.join("js/b.js")).unwrap(), "b");

        // No staging or backup directories are left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_failed_write_leaves_output_untouched() {
        let dir = tempdir().unwrap();
        let outdir = dir.path().join("dist");
        write_and_publish(&files(&[("keep.js", "v1")]), &outdir).unwrap();

        // A file and a directory with the same path cannot both be written.
        let result = write_and_publish(&files(&[("x", "file"), ("x/y.js", "nested")]), &outdir);
        assert!(matches!(result, Err(EmitError::WriteFailed { .. })));
        assert_eq!(fs::read_to_string(outdir.join("keep.js")).unwrap(), "v1");
    }
}
