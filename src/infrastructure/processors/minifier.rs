use crate::core::models::ModuleSource;
use crate::core::plugin::{StepInput, StepOutput, TransformStep};
use anyhow::bail;
use oxc_allocator::Allocator;
use oxc_codegen::{Codegen, CodegenOptions};
use oxc_parser::Parser;
use oxc_span::SourceType;
use serde::{Deserialize, Serialize};

/// Reprints scripts through oxc's code generator in minify mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsMinifyStep;

impl JsMinifyStep {
    /// Minify JavaScript code
    pub fn minify(&self, source_code: &str, filename: &str) -> anyhow::Result<String> {
        let allocator = Allocator::default();
        let source_type = SourceType::from_path(filename).unwrap_or_else(|_| SourceType::default());

        let parse_result = Parser::new(&allocator, source_code, source_type).parse();

        if !parse_result.errors.is_empty() {
            let errors: Vec<String> = parse_result
                .errors
                .iter()
                .map(|e| format!("Parse error: {}", e))
                .collect();
            bail!(errors.join("\n"));
        }

        let codegen_options = CodegenOptions {
            minify: true,
            ..Default::default()
        };

        Ok(Codegen::new()
            .with_options(codegen_options)
            .build(&parse_result.program)
            .code)
    }
}

impl TransformStep for JsMinifyStep {
    fn name(&self) -> &str {
        "js-minify"
    }

    fn fingerprint(&self) -> String {
        "oxc-codegen:minify".to_string()
    }

    fn test(&self, module: &ModuleSource<'_>) -> bool {
        module.module_type.is_script()
    }

    fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput> {
        let filename = input.module.path.to_string_lossy();
        self.minify(input.code, &filename).map(StepOutput::code)
    }
}
