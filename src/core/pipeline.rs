use crate::core::models::{CompiledOutput, FileDependency, ModuleNode, ModuleSource, OutputConfig};
use crate::core::plugin::{StepInput, StepOutput, TransformStep};
use crate::infrastructure::cache::TransformCache;
use crate::infrastructure::processors::{
    AssetStep, CssExtractStep, CssMinifyStep, EsmInteropStep, JsMinifyStep, JsonStep, ScssStep,
    TypeScriptStep,
};
use crate::utils::{CacheError, ContentHasher, TransformError};
use std::path::PathBuf;
use std::sync::Arc;

/// Registry of transform steps. Built-in steps are concrete variants; anything
/// else plugs in through `Custom`.
#[derive(Debug, Clone)]
pub enum TransformStepKind {
    Scss(ScssStep),
    CssMinify(CssMinifyStep),
    CssExtract(CssExtractStep),
    Json(JsonStep),
    Asset(AssetStep),
    TypeScript(TypeScriptStep),
    EsmInterop(EsmInteropStep),
    JsMinify(JsMinifyStep),
    Custom(Arc<dyn TransformStep>),
}

impl TransformStepKind {
    pub fn as_step(&self) -> &dyn TransformStep {
        match self {
            TransformStepKind::Scss(step) => step,
            TransformStepKind::CssMinify(step) => step,
            TransformStepKind::CssExtract(step) => step,
            TransformStepKind::Json(step) => step,
            TransformStepKind::Asset(step) => step,
            TransformStepKind::TypeScript(step) => step,
            TransformStepKind::EsmInterop(step) => step,
            TransformStepKind::JsMinify(step) => step,
            TransformStepKind::Custom(step) => step.as_ref(),
        }
    }

    pub fn custom(step: impl TransformStep + 'static) -> Self {
        TransformStepKind::Custom(Arc::new(step))
    }

    /// Apply build-wide output settings to steps that name files.
    pub fn with_output(self, output: &OutputConfig) -> Self {
        match self {
            TransformStepKind::Asset(step) => TransformStepKind::Asset(AssetStep {
                hash_algorithm: output.hash_algorithm,
                ..step
            }),
            other => other,
        }
    }

    /// Styles are compiled, optionally minified, then extracted; scripts have
    /// their types stripped, are rewritten for the module registry and
    /// optionally minified.
    pub fn default_chain(minify: bool) -> Vec<Self> {
        let mut chain = vec![TransformStepKind::Scss(ScssStep::default())];
        if minify {
            chain.push(TransformStepKind::CssMinify(CssMinifyStep));
        }
        chain.extend([
            TransformStepKind::CssExtract(CssExtractStep),
            TransformStepKind::Json(JsonStep),
            TransformStepKind::Asset(AssetStep::default()),
            TransformStepKind::TypeScript(TypeScriptStep),
            TransformStepKind::EsmInterop(EsmInteropStep),
        ]);
        if minify {
            chain.push(TransformStepKind::JsMinify(JsMinifyStep));
        }
        chain
    }
}

/// Outcome of transforming one module, with or without the cache.
#[derive(Debug)]
pub struct TransformOutcome {
    pub fingerprint: String,
    pub result: Result<CompiledOutput, TransformError>,
    pub cache_hit: bool,
    /// Cache problems met on the way; they never fail the module.
    pub cache_errors: Vec<CacheError>,
}

#[derive(Debug, Clone)]
pub struct TransformPipeline {
    steps: Vec<TransformStepKind>,
    hasher: ContentHasher,
}

impl TransformPipeline {
    pub fn new(steps: Vec<TransformStepKind>, hasher: ContentHasher) -> Self {
        Self { steps, hasher }
    }

    fn steps(&self) -> impl Iterator<Item = &dyn TransformStep> {
        self.steps.iter().map(TransformStepKind::as_step)
    }

    /// Digest of the steps that apply to `module`, in order, with their options.
    /// Steps that do not apply leave the fingerprint untouched.
    pub fn fingerprint(&self, module: &ModuleSource<'_>) -> String {
        let mut state = self.hasher.start();
        state.part(b"soku-pipeline-v2");
        state.part(module.key.as_bytes());
        for step in self.steps().filter(|step| step.test(module)) {
            state.part(step.name().as_bytes());
            state.part(step.fingerprint().as_bytes());
        }
        state.finish()
    }

    /// Run every applicable step in order, each consuming the previous code.
    pub fn transform(&self, module: &ModuleSource<'_>) -> Result<CompiledOutput, TransformError> {
        let mut output = CompiledOutput {
            code: String::from_utf8_lossy(module.raw).into_owned(),
            ..Default::default()
        };

        let mut read: Vec<PathBuf> = Vec::new();
        for step in self.steps().filter(|step| step.test(module)) {
            let StepOutput {
                code,
                assets,
                file_dependencies,
                data_url,
            } = step
                .apply(StepInput {
                    module: *module,
                    code: &output.code,
                })
                .map_err(|cause| TransformError::StepFailed {
                    step: step.name().to_string(),
                    module: module.key.to_string(),
                    cause: format!("{:#}", cause),
                })?;

            output.code = code;
            output.assets.extend(assets);
            read.extend(file_dependencies);
            if data_url.is_some() {
                output.data_url = data_url;
            }
        }

        read.sort();
        read.dedup();
        output.file_dependencies = read
            .into_iter()
            .filter(|path| path != module.path)
            .map(|path| FileDependency {
                hash: self.file_hash(&path).unwrap_or_default(),
                path,
            })
            .collect();
        Ok(output)
    }

    fn file_hash(&self, path: &std::path::Path) -> Option<String> {
        std::fs::read(path).ok().map(|bytes| self.hasher.digest(&bytes))
    }

    /// Whether every file the output was built from still has the recorded
    /// content.
    pub fn dependencies_current(&self, output: &CompiledOutput) -> bool {
        output
            .file_dependencies
            .iter()
            .all(|dep| self.file_hash(&dep.path).as_deref() == Some(dep.hash.as_str()))
    }

    /// Transform through the cache: a hit on (raw hash, fingerprint) whose file
    /// dependencies are unchanged skips the steps; a fresh output is stored for
    /// the next build.
    pub fn transform_cached(&self, node: &ModuleNode, cache: &TransformCache) -> TransformOutcome {
        let module = node.source();
        let fingerprint = self.fingerprint(&module);
        let mut cache_errors = Vec::new();

        match cache.get(&node.content_hash, &fingerprint) {
            Ok(Some(output)) if self.dependencies_current(&output) => {
                return TransformOutcome {
                    fingerprint,
                    result: Ok(output),
                    cache_hit: true,
                    cache_errors,
                }
            }
            Ok(_) => {}
            Err(err) => cache_errors.push(err),
        }

        let result = self.transform(&module);
        if let Ok(output) = &result {
            if let Err(err) = cache.put(&node.content_hash, &fingerprint, output) {
                cache_errors.push(err);
            }
        }

        TransformOutcome {
            fingerprint,
            result,
            cache_hit: false,
            cache_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{ModuleId, ModuleType, SideAsset, SideAssetKind};
    use crate::utils::HashAlgorithm;
    use anyhow::bail;
    use std::path::Path;

    #[derive(Debug)]
    struct Append(&'static str);

    impl TransformStep for Append {
        fn name(&self) -> &str {
            "append"
        }

        fn fingerprint(&self) -> String {
            self.0.to_string()
        }

        fn test(&self, module: &ModuleSource<'_>) -> bool {
            module.module_type.is_script()
        }

        fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput> {
            Ok(StepOutput::code(format!("{}{}", input.code, self.0)).with_asset(SideAsset {
                kind: SideAssetKind::Static,
                name: format!("{}.txt", self.0),
                content: Vec::new(),
            }))
        }
    }

    #[derive(Debug)]
    struct Explode;

    impl TransformStep for Explode {
        fn name(&self) -> &str {
            "explode"
        }

        fn test(&self, _module: &ModuleSource<'_>) -> bool {
            true
        }

        fn apply(&self, _input: StepInput<'_>) -> anyhow::Result<StepOutput> {
            bail!("boom")
        }
    }

    fn script<'a>(raw: &'a [u8]) -> ModuleSource<'a> {
        ModuleSource {
            id: ModuleId(0),
            key: "src/a.js",
            path: Path::new("/p/src/a.js"),
            query: None,
            module_type: ModuleType::JavaScript,
            raw,
        }
    }

    fn pipeline(steps: Vec<TransformStepKind>) -> TransformPipeline {
        TransformPipeline::new(steps, ContentHasher::new(HashAlgorithm::Blake3))
    }

    #[test]
    fn test_steps_chain_in_order() {
        let pipeline = pipeline(vec![
            TransformStepKind::custom(Append("-one")),
            TransformStepKind::custom(Append("-two")),
        ]);
        let output = pipeline.transform(&script(b"code")).unwrap();

        assert_eq!(output.code, "code-one-two");
        assert_eq!(output.assets.len(), 2);
    }

    #[test]
    fn test_failure_names_step_and_module() {
        let pipeline = pipeline(vec![
            TransformStepKind::custom(Append("-one")),
            TransformStepKind::custom(Explode),
        ]);
        let err = pipeline.transform(&script(b"code")).unwrap_err();

        assert_eq!(err.step(), "explode");
        assert_eq!(err.module(), "src/a.js");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_fingerprint_follows_step_options() {
        let module = script(b"code");
        let a = pipeline(vec![TransformStepKind::custom(Append("x"))]).fingerprint(&module);
        let b = pipeline(vec![TransformStepKind::custom(Append("y"))]).fingerprint(&module);
        assert_ne!(a, b);

        // A step that does not apply to CSS leaves CSS fingerprints alone.
        let css = ModuleSource {
            module_type: ModuleType::Css,
            ..module
        };
        let a = pipeline(vec![TransformStepKind::custom(Append("x"))]).fingerprint(&css);
        let b = pipeline(vec![TransformStepKind::custom(Append("y"))]).fingerprint(&css);
        assert_eq!(a, b);
    }

    #[test]
    fn test_default_chain_order() {
        let names: Vec<String> = TransformStepKind::default_chain(true)
            .iter()
            .map(|kind| kind.as_step().name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "scss",
                "css-minify",
                "css-extract",
                "json",
                "asset",
                "typescript",
                "esm-interop",
                "js-minify"
            ]
        );
        assert_eq!(TransformStepKind::default_chain(false).len(), 6);
    }

    #[test]
    fn test_output_settings_reach_asset_step() {
        let output = OutputConfig {
            hash_algorithm: HashAlgorithm::Sha256,
            ..Default::default()
        };
        let kind = TransformStepKind::Asset(AssetStep::default()).with_output(&output);
        let TransformStepKind::Asset(step) = kind else {
            panic!("asset step expected");
        };
        assert_eq!(step.hash_algorithm, HashAlgorithm::Sha256);
    }

    #[derive(Debug)]
    struct ReadsFile(PathBuf);

    impl TransformStep for ReadsFile {
        fn name(&self) -> &str {
            "reads-file"
        }

        fn test(&self, _module: &ModuleSource<'_>) -> bool {
            true
        }

        fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput> {
            let extra = std::fs::read_to_string(&self.0)?;
            Ok(StepOutput::code(format!("{}{}", input.code, extra))
                .with_file_dependencies([self.0.clone()]))
        }
    }

    #[test]
    fn test_cache_hit_requires_unchanged_file_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let extra = dir.path().join("extra.txt");
        std::fs::write(&extra, "-v1").unwrap();

        let pipeline = pipeline(vec![TransformStepKind::custom(ReadsFile(extra.clone()))]);
        let cache = TransformCache::in_memory(&Default::default());
        let node = ModuleNode {
            id: ModuleId(0),
            key: "src/a.js".into(),
            path: dir.path().join("a.js"),
            query: None,
            module_type: ModuleType::JavaScript,
            content: Arc::new(b"code".to_vec()),
            content_hash: "h".into(),
            imports: Vec::new(),
            opaque_imports: Vec::new(),
            dependencies: Vec::new(),
            unresolved: Vec::new(),
            fingerprint: None,
            output: None,
            failure: None,
            is_entry: true,
            is_async_split_point: false,
        };

        let first = pipeline.transform_cached(&node, &cache);
        assert!(!first.cache_hit);
        let output = first.result.unwrap();
        assert_eq!(output.code, "code-v1");
        assert_eq!(output.file_dependencies.len(), 1);
        assert!(pipeline.transform_cached(&node, &cache).cache_hit);

        std::fs::write(&extra, "-v2").unwrap();
        let stale = pipeline.transform_cached(&node, &cache);
        assert!(!stale.cache_hit);
        assert_eq!(stale.result.unwrap().code, "code-v2");
    }
}
