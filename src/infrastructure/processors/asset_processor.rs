use crate::core::models::{ModuleSource, ModuleType, SideAsset, SideAssetKind};
use crate::core::plugin::{StepInput, StepOutput, TransformStep};
use crate::utils::{ContentHasher, HashAlgorithm};
use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

/// Types of assets that can be processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetType {
    Image,
    Font,
}

impl AssetType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" => Some(AssetType::Image),
            "woff" | "woff2" | "ttf" | "otf" | "eot" => Some(AssetType::Font),
            _ => None,
        }
    }
}

fn mime_type(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        _ => "application/octet-stream",
    }
}

/// JS string literal for `value`.
fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value))
}

/// Static files (images, fonts). Small files are inlined as base64 data URLs;
/// larger ones are emitted under a content-hashed name and the module exports
/// their public URL. A `?inline` or `?resource` query forces either behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssetStep {
    pub inline_limit: usize,
    pub image_dir: String,
    pub font_dir: String,
    pub public_path: String,
    /// Digest used in emitted file names; set from the build's output config.
    pub hash_algorithm: HashAlgorithm,
}

impl Default for AssetStep {
    fn default() -> Self {
        Self {
            inline_limit: 8000,
            image_dir: "img".to_string(),
            font_dir: "fonts".to_string(),
            public_path: String::new(),
            hash_algorithm: HashAlgorithm::default(),
        }
    }
}

impl AssetStep {
    fn should_inline(&self, module: &ModuleSource<'_>) -> bool {
        match module.query {
            Some("inline") => true,
            Some("resource") => false,
            _ => module.raw.len() <= self.inline_limit,
        }
    }

    fn output_name(&self, module: &ModuleSource<'_>, ext: &str) -> String {
        let dir = match AssetType::from_extension(ext) {
            Some(AssetType::Font) => &self.font_dir,
            _ => &self.image_dir,
        };
        let hash = ContentHasher::new(self.hash_algorithm).short(module.raw, 8);
        format!("{}/{}.{}.{}", dir, module.file_stem(), hash, ext)
    }
}

impl TransformStep for AssetStep {
    fn name(&self) -> &str {
        "asset"
    }

    fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn test(&self, module: &ModuleSource<'_>) -> bool {
        module.module_type == ModuleType::Asset
    }

    fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput> {
        let module = input.module;
        let ext = module.extension();

        if self.should_inline(&module) {
            let url = format!("data:{};base64,{}", mime_type(&ext), STANDARD.encode(module.raw));
            return Ok(
                StepOutput::code(format!("module.exports = {};", js_string(&url))).with_data_url(url),
            );
        }

        let name = self.output_name(&module, &ext);
        let url = format!("{}{}", self.public_path, name);
        Ok(
            StepOutput::code(format!("module.exports = {};", js_string(&url))).with_asset(
                SideAsset {
                    kind: SideAssetKind::Static,
                    name,
                    content: module.raw.to_vec(),
                },
            ),
        )
    }
}

/// Validates JSON and exposes it as the module's exports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonStep;

impl TransformStep for JsonStep {
    fn name(&self) -> &str {
        "json"
    }

    fn test(&self, module: &ModuleSource<'_>) -> bool {
        module.module_type == ModuleType::Json
    }

    fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput> {
        let value: serde_json::Value =
            serde_json::from_str(input.code).context("invalid JSON")?;
        Ok(StepOutput::code(format!(
            "module.exports = {};",
            serde_json::to_string(&value)?
        )))
    }
}
