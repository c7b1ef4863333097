use crate::core::models::{ModuleSource, ModuleType};
use crate::core::plugin::{StepInput, StepOutput, TransformStep};
use anyhow::{anyhow, bail};
use oxc_allocator::Allocator;
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;
use oxc_transformer::{TransformOptions, Transformer};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Erases TypeScript syntax (annotations, interfaces, type-only imports,
/// enums lowered to objects) with oxc's transformer. Module syntax is left in
/// place for the interop step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeScriptStep;

impl TypeScriptStep {
    pub fn strip_types(&self, source: &str, path: &Path) -> anyhow::Result<String> {
        let allocator = Allocator::default();
        let source_type = SourceType::from_path(path)
            .map_err(|_| anyhow!("not a TypeScript file: {}", path.display()))?;

        let parsed = Parser::new(&allocator, source, source_type).parse();
        if !parsed.errors.is_empty() {
            let errors: Vec<String> = parsed
                .errors
                .iter()
                .map(|e| format!("Parse error: {}", e))
                .collect();
            bail!(errors.join("\n"));
        }
        let mut program = parsed.program;

        let scoping = SemanticBuilder::new()
            .build(&program)
            .semantic
            .into_scoping();
        let transformed = Transformer::new(&allocator, path, &TransformOptions::default())
            .build_with_scoping(scoping, &mut program);
        if !transformed.errors.is_empty() {
            let errors: Vec<String> = transformed
                .errors
                .iter()
                .map(|e| format!("Transform error: {}", e))
                .collect();
            bail!(errors.join("\n"));
        }

        Ok(Codegen::new().build(&program).code)
    }
}

impl TransformStep for TypeScriptStep {
    fn name(&self) -> &str {
        "typescript"
    }

    fn fingerprint(&self) -> String {
        "oxc-transformer:default".to_string()
    }

    fn test(&self, module: &ModuleSource<'_>) -> bool {
        module.module_type == ModuleType::TypeScript
    }

    fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput> {
        self.strip_types(input.code, input.module.path)
            .map(StepOutput::code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ModuleId;

    #[test]
    fn test_annotations_and_interfaces_are_removed() {
        let source = r#"
interface Point { x: number; y: number }
type Id = string;
const a: number = 1;
export function norm(p: Point): number {
    return Math.sqrt(p.x * p.x + p.y * p.y) + a;
}
"#;
        let code = TypeScriptStep
            .strip_types(source, Path::new("/p/src/math.ts"))
            .unwrap();

        assert!(code.contains("const a = 1;"));
        assert!(code.contains("export function norm(p) {"));
        assert!(!code.contains("interface"));
        assert!(!code.contains("type Id"));
        assert!(!code.contains(": number"));
    }

    #[test]
    fn test_only_typescript_modules_are_handled() {
        let module = |path: &'static str| ModuleSource {
            id: ModuleId(0),
            key: path,
            path: Path::new(path),
            query: None,
            module_type: ModuleType::from_path(Path::new(path)),
            raw: b"",
        };
        assert!(TypeScriptStep.test(&module("/p/a.ts")));
        assert!(TypeScriptStep.test(&module("/p/a.tsx")));
        assert!(TypeScriptStep.test(&module("/p/a.mts")));
        assert!(!TypeScriptStep.test(&module("/p/a.js")));
    }

    #[test]
    fn test_syntax_error_fails_the_step() {
        let result = TypeScriptStep.strip_types("const a: = ;", Path::new("/p/broken.ts"));
        assert!(result.is_err());
    }
}
