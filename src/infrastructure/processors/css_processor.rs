use crate::core::models::{ModuleSource, ModuleType, SideAsset, SideAssetKind};
use crate::core::plugin::{StepInput, StepOutput, TransformStep};
use anyhow::anyhow;
use lightningcss::{
    printer::PrinterOptions,
    stylesheet::{ParserOptions as CssParserOptions, StyleSheet},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

// `@import` rules are graph edges; the imported sheet is emitted on its own.
static CSS_IMPORT_RULE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@import\s+(?:url\s*\(\s*)?['"][^'"]+['"]\s*\)?[^;]*;"#).unwrap()
});

/// Reprints a stylesheet with lightningcss in minify mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CssMinifyStep;

impl TransformStep for CssMinifyStep {
    fn name(&self) -> &str {
        "css-minify"
    }

    fn fingerprint(&self) -> String {
        "lightningcss:minify".to_string()
    }

    fn test(&self, module: &ModuleSource<'_>) -> bool {
        module.module_type == ModuleType::Css
    }

    fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput> {
        let stylesheet = StyleSheet::parse(input.code, CssParserOptions::default())
            .map_err(|e| anyhow!("CSS parse error: {}", e))?;

        let printed = stylesheet
            .to_css(PrinterOptions {
                minify: true,
                ..Default::default()
            })
            .map_err(|e| anyhow!("CSS print error: {}", e))?;

        Ok(StepOutput::code(printed.code))
    }
}

/// Moves stylesheet text out of the script bundle into a `Style` side asset,
/// leaving an empty module behind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CssExtractStep;

impl CssExtractStep {
    pub fn strip_imports(css: &str) -> String {
        CSS_IMPORT_RULE_REGEX.replace_all(css, "").trim().to_string()
    }
}

impl TransformStep for CssExtractStep {
    fn name(&self) -> &str {
        "css-extract"
    }

    fn test(&self, module: &ModuleSource<'_>) -> bool {
        module.module_type == ModuleType::Css
    }

    fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput> {
        let css = Self::strip_imports(input.code);

        Ok(StepOutput::code("module.exports = {};").with_asset(SideAsset {
            kind: SideAssetKind::Style,
            name: input.module.key.to_string(),
            content: css.into_bytes(),
        }))
    }
}
