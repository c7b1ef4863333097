// Transform step contract: the only extension surface of the bundler.
// External transformations implement `TransformStep` and are registered as
// `TransformStepKind::Custom`.

use crate::core::models::{ModuleSource, SideAsset};
use std::fmt::Debug;
use std::path::PathBuf;

/// Input handed to a step: the module being transformed plus the code produced
/// by the previous step (the raw file decoded as UTF-8 for the first step).
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub module: ModuleSource<'a>,
    pub code: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    pub code: String,
    pub assets: Vec<SideAsset>,
    /// Files read besides the module itself, such as Sass partials. A change
    /// to any of them invalidates the output.
    pub file_dependencies: Vec<PathBuf>,
    /// Inline `data:` URL standing in for the module in stylesheets.
    pub data_url: Option<String>,
}

impl StepOutput {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_asset(mut self, asset: SideAsset) -> Self {
        self.assets.push(asset);
        self
    }

    pub fn with_file_dependencies(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.file_dependencies.extend(paths);
        self
    }

    pub fn with_data_url(mut self, url: impl Into<String>) -> Self {
        self.data_url = Some(url.into());
        self
    }
}

/// A single stage of the per-module transform chain.
///
/// Steps must be pure with respect to the module they receive: `apply` may not
/// look at other modules, which is what allows the pipeline to run modules on
/// any worker.
pub trait TransformStep: Send + Sync + Debug {
    /// Unique name for this step, reported in errors.
    fn name(&self) -> &str;

    /// Stable description of the step's options. Changing it invalidates every
    /// cached output the step contributed to.
    fn fingerprint(&self) -> String {
        String::new()
    }

    /// Whether this step handles the module.
    fn test(&self, module: &ModuleSource<'_>) -> bool;

    /// Transform the previous step's code.
    fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{ModuleId, ModuleType};
    use std::path::Path;

    #[derive(Debug)]
    struct UppercaseStep;

    impl TransformStep for UppercaseStep {
        fn name(&self) -> &str {
            "uppercase"
        }

        fn test(&self, module: &ModuleSource<'_>) -> bool {
            module.has_extension(&["js"])
        }

        fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput> {
            Ok(StepOutput::code(input.code.to_uppercase()))
        }
    }

    #[test]
    fn test_step_contract() {
        let source = ModuleSource {
            id: ModuleId(0),
            key: "test.js",
            path: Path::new("/tmp/test.js"),
            query: None,
            module_type: ModuleType::JavaScript,
            raw: b"hello world",
        };

        let step = UppercaseStep;
        assert!(step.test(&source));
        assert_eq!(step.fingerprint(), "");

        let output = step
            .apply(StepInput {
                module: source,
                code: "hello world",
            })
            .unwrap();
        assert_eq!(output.code, "HELLO WORLD");
    }
}
