use crate::core::models::{
    BuildConfig, EntryPoint, FailureMode, MissingDependencyMode, SplitConfig,
};
use crate::core::pipeline::TransformStepKind;
use crate::infrastructure::processors::{
    AssetStep, CssExtractStep, CssMinifyStep, EsmInteropStep, JsMinifyStep, JsonStep, ScssStep,
    TypeScriptStep,
};
use crate::utils::{HashAlgorithm, Logger, Result, SokuError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "soku.config.json";

/// Configuration file format (soku.config.json)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SokuConfig {
    /// Entry name → specifier, relative to the root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outdir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_fields: Option<Vec<String>>,

    /// Explicit transform chain. When absent the default chain is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transforms: Option<Vec<StepConfig>>,

    /// Adds the minify steps to the default chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minify: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub split: Option<SplitFileConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputFileConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheFileConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<FailureMode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_dependency: Option<MissingDependencyMode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitFileConfig {
    pub min_reuse: Option<usize>,
    pub duplicate_below_threshold: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFileConfig {
    pub js_filename: Option<String>,
    pub css_filename: Option<String>,
    pub hash_algorithm: Option<HashAlgorithm>,
    pub hash_length: Option<usize>,
    pub public_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheFileConfig {
    pub dir: Option<String>,
    pub max_entries: Option<usize>,
    pub max_bytes: Option<u64>,
}

/// A built-in transform step as declared in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepConfig {
    Scss {
        #[serde(default)]
        compressed: bool,
    },
    CssMinify,
    CssExtract,
    Json,
    Asset(AssetStep),
    TypeScript,
    EsmInterop,
    JsMinify,
}

impl StepConfig {
    pub fn into_kind(self) -> TransformStepKind {
        match self {
            StepConfig::Scss { compressed } => TransformStepKind::Scss(ScssStep { compressed }),
            StepConfig::CssMinify => TransformStepKind::CssMinify(CssMinifyStep),
            StepConfig::CssExtract => TransformStepKind::CssExtract(CssExtractStep),
            StepConfig::Json => TransformStepKind::Json(JsonStep),
            StepConfig::Asset(step) => TransformStepKind::Asset(step),
            StepConfig::TypeScript => TransformStepKind::TypeScript(TypeScriptStep),
            StepConfig::EsmInterop => TransformStepKind::EsmInterop(EsmInteropStep),
            StepConfig::JsMinify => TransformStepKind::JsMinify(JsMinifyStep),
        }
    }
}

/// Values given on the command line. Anything set here beats the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub outdir: Option<String>,
    pub min_reuse: Option<usize>,
    pub minify: Option<bool>,
    pub workers: Option<usize>,
    pub best_effort: Option<bool>,
    pub cache_dir: Option<String>,
    pub hash_algorithm: Option<HashAlgorithm>,
}

/// Config loader that supports config files with CLI override
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file if it exists
    /// Searches for soku.config.json in the project root
    pub fn load_from_file(root: &Path) -> Result<Option<SokuConfig>> {
        let config_path = root.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            Logger::debug("No soku.config.json found, using defaults");
            return Ok(None);
        }

        Logger::debug(&format!("Loading config from {}", config_path.display()));

        let content = std::fs::read_to_string(&config_path)?;
        let config: SokuConfig = serde_json::from_str(&content).map_err(|e| {
            SokuError::config(format!("Failed to parse {}: {}", CONFIG_FILE_NAME, e))
        })?;

        Ok(Some(config))
    }

    fn resolve_dir(root: &Path, dir: &str) -> PathBuf {
        if Path::new(dir).is_absolute() {
            PathBuf::from(dir)
        } else {
            root.join(dir)
        }
    }

    /// Merge file config with CLI arguments (CLI > config file > defaults).
    /// `minReuse` has no default and must come from one of the two.
    pub fn merge_with_cli(
        file_config: Option<SokuConfig>,
        root: PathBuf,
        cli: &CliOverrides,
    ) -> Result<BuildConfig> {
        let base = file_config.unwrap_or_default();
        let split = base.split.unwrap_or_default();
        let output = base.output.unwrap_or_default();
        let cache = base.cache.unwrap_or_default();

        let min_reuse = cli.min_reuse.or(split.min_reuse).ok_or_else(|| {
            SokuError::config("split.minReuse is required (config file or --min-reuse)")
        })?;

        let outdir = cli
            .outdir
            .as_deref()
            .or(base.outdir.as_deref())
            .unwrap_or("dist");
        let mut config = BuildConfig::new(root.clone(), SplitConfig {
            min_reuse,
            duplicate_below_threshold: split.duplicate_below_threshold.unwrap_or(false),
        })
        .with_outdir(Self::resolve_dir(&root, outdir));

        if let Some(alias) = base.alias {
            config.resolve.alias = alias;
        }
        if let Some(extensions) = base.extensions {
            config.resolve.extensions = extensions;
        }
        if let Some(main_fields) = base.main_fields {
            config.resolve.main_fields = main_fields;
        }

        let minify = cli.minify.or(base.minify).unwrap_or(false);
        config.transforms = match base.transforms {
            Some(steps) => steps.into_iter().map(StepConfig::into_kind).collect(),
            None => TransformStepKind::default_chain(minify),
        };

        if let Some(js) = output.js_filename {
            config.output.js_filename = js;
        }
        if let Some(css) = output.css_filename {
            config.output.css_filename = css;
        }
        if let Some(algorithm) = cli.hash_algorithm.or(output.hash_algorithm) {
            config.output.hash_algorithm = algorithm;
        }
        if let Some(length) = output.hash_length {
            config.output.hash_length = length;
        }
        if let Some(public_path) = output.public_path {
            config.output.public_path = public_path;
        }

        if let Some(dir) = cli.cache_dir.as_deref().or(cache.dir.as_deref()) {
            config.cache.dir = Some(Self::resolve_dir(&root, dir));
        }
        if let Some(max_entries) = cache.max_entries {
            config.cache.max_entries = max_entries;
        }
        if let Some(max_bytes) = cache.max_bytes {
            config.cache.max_bytes = max_bytes;
        }

        if let Some(workers) = cli.workers.or(base.workers) {
            config.workers = workers;
        }
        config.failure_mode = match cli.best_effort {
            Some(true) => FailureMode::BestEffort,
            Some(false) => FailureMode::Strict,
            None => base.failure_mode.unwrap_or_default(),
        };
        config.missing_dependency = base.missing_dependency.unwrap_or_default();

        config.validate()?;
        Ok(config)
    }

    /// Entries from the command line, else from the file.
    pub fn entries(file_config: Option<&SokuConfig>, cli_entries: &[String]) -> Vec<EntryPoint> {
        if !cli_entries.is_empty() {
            return cli_entries
                .iter()
                .map(|spec| EntryPoint::from(spec.as_str()))
                .collect();
        }
        file_config
            .and_then(|config| config.entries.as_ref())
            .map(|entries| {
                entries
                    .iter()
                    .map(|(name, spec)| EntryPoint::new(name.clone(), spec.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_from_file_not_exists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = ConfigLoader::load_from_file(temp_dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_load_from_file_valid() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            r#"{
                "entries": { "app": "./src/app.js" },
                "outdir": "build",
                "split": { "minReuse": 3 },
                "transforms": [
                    { "type": "scss", "compressed": true },
                    { "type": "cssExtract" },
                    { "type": "asset", "inlineLimit": 0 },
                    { "type": "typeScript" },
                    { "type": "esmInterop" }
                ],
                "failureMode": "bestEffort"
            }"#,
        )
        .unwrap();

        let config = ConfigLoader::load_from_file(temp_dir.path()).unwrap().unwrap();
        assert_eq!(config.outdir.as_deref(), Some("build"));
        let steps = config.transforms.clone().unwrap();
        assert_eq!(steps[0], StepConfig::Scss { compressed: true });
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[3], StepConfig::TypeScript);

        let entries = ConfigLoader::entries(Some(&config), &[]);
        assert_eq!(entries, vec![EntryPoint::new("app", "./src/app.js")]);

        let merged = ConfigLoader::merge_with_cli(
            Some(config),
            temp_dir.path().to_path_buf(),
            &CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(merged.split.min_reuse, 3);
        assert_eq!(merged.transforms.len(), 4);
        assert_eq!(merged.failure_mode, FailureMode::BestEffort);
        assert_eq!(merged.outdir, temp_dir.path().join("build"));
    }

    #[test]
    fn test_invalid_file_is_a_config_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join(CONFIG_FILE_NAME), r#"{ "outDirectory": "x" }"#).unwrap();
        assert!(matches!(
            ConfigLoader::load_from_file(temp_dir.path()),
            Err(SokuError::Config(_))
        ));
    }

    #[test]
    fn test_merge_with_cli_override() {
        let file_config = SokuConfig {
            outdir: Some("build".to_string()),
            minify: Some(false),
            split: Some(SplitFileConfig {
                min_reuse: Some(4),
                duplicate_below_threshold: Some(true),
            }),
            ..Default::default()
        };
        let cli = CliOverrides {
            outdir: Some("dist-override".to_string()),
            min_reuse: Some(2),
            minify: Some(true),
            ..Default::default()
        };

        let merged =
            ConfigLoader::merge_with_cli(Some(file_config), PathBuf::from("/project"), &cli).unwrap();

        assert_eq!(merged.outdir, PathBuf::from("/project/dist-override"));
        assert_eq!(merged.split.min_reuse, 2);
        assert!(merged.split.duplicate_below_threshold);
        assert_eq!(merged.transforms.len(), TransformStepKind::default_chain(true).len());
    }

    #[test]
    fn test_min_reuse_is_required() {
        let result =
            ConfigLoader::merge_with_cli(None, PathBuf::from("/project"), &CliOverrides::default());
        assert!(matches!(result, Err(SokuError::Config(_))));
    }
}
