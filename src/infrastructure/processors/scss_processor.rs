use crate::core::models::ModuleSource;
use crate::core::plugin::{StepInput, StepOutput, TransformStep};
use anyhow::anyhow;
use grass::Fs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

/// Filesystem handed to grass that remembers every file it reads.
#[derive(Debug, Default)]
struct RecordingFs {
    read: Mutex<BTreeSet<PathBuf>>,
}

impl RecordingFs {
    fn into_paths(self) -> Vec<PathBuf> {
        self.read.into_inner().into_iter().collect()
    }
}

impl Fs for RecordingFs {
    fn is_dir(&self, path: &Path) -> bool {
        grass::StdFs.is_dir(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        grass::StdFs.is_file(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let bytes = grass::StdFs.read(path)?;
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.read.lock().insert(canonical);
        Ok(bytes)
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        grass::StdFs.canonicalize(path)
    }
}

/// SCSS/SASS preprocessor using the grass crate.
///
/// `@use` and `@import` of partials are inlined by the compiler relative to the
/// stylesheet's directory; they are not module graph edges. Every partial read
/// is reported as a file dependency of the stylesheet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScssStep {
    pub compressed: bool,
}

impl ScssStep {
    pub fn new(compressed: bool) -> Self {
        Self { compressed }
    }

    /// Check if a file is SCSS/SASS
    pub fn is_scss_file(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("scss") | Some("sass")
        )
    }

    /// Compiled CSS plus the partials the compiler loaded.
    fn compile(&self, content: &str, path: &Path) -> anyhow::Result<(String, Vec<PathBuf>)> {
        // Detect syntax based on file extension
        let syntax = if path.extension().and_then(|s| s.to_str()) == Some("sass") {
            grass::InputSyntax::Sass
        } else {
            grass::InputSyntax::Scss
        };

        let fs = RecordingFs::default();
        let css = {
            let mut options = grass::Options::default()
                .fs(&fs)
                .input_syntax(syntax)
                .style(if self.compressed {
                    grass::OutputStyle::Compressed
                } else {
                    grass::OutputStyle::Expanded
                });
            if let Some(dir) = path.parent() {
                options = options.load_path(dir);
            }
            grass::from_string(content.to_string(), &options)
                .map_err(|e| anyhow!("SCSS compilation error: {}", e))?
        };
        Ok((css, fs.into_paths()))
    }
}

impl TransformStep for ScssStep {
    fn name(&self) -> &str {
        "scss"
    }

    fn fingerprint(&self) -> String {
        format!("grass:compressed={}", self.compressed)
    }

    fn test(&self, module: &ModuleSource<'_>) -> bool {
        Self::is_scss_file(module.path)
    }

    fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput> {
        let (css, partials) = self.compile(input.code, input.module.path)?;
        Ok(StepOutput::code(css).with_file_dependencies(partials))
    }
}
