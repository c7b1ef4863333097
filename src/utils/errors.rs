use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to map a specifier to a module on disk.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("cannot resolve '{specifier}' from {from_dir}")]
    NotFound { specifier: String, from_dir: PathBuf },

    #[error("invalid package manifest {path}: {reason}")]
    InvalidPackage { path: PathBuf, reason: String },
}

#[derive(Error, Debug, Clone)]
pub enum GraphError {
    #[error("entry '{specifier}' could not be resolved: {cause}")]
    UnresolvedEntry {
        specifier: String,
        cause: ResolutionError,
    },

    #[error("unresolved dependency '{specifier}' imported by {from}")]
    UnresolvedDependency {
        specifier: String,
        from: String,
        cause: ResolutionError,
    },

    #[error("failed to read {path}: {cause}")]
    ReadFailed { path: PathBuf, cause: String },

    #[error("inconsistent cycle metadata: {0}")]
    InconsistentCycle(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("transform step '{step}' failed for {module}: {cause}")]
    StepFailed {
        step: String,
        module: String,
        cause: String,
    },
}

impl TransformError {
    pub fn step(&self) -> &str {
        match self {
            TransformError::StepFailed { step, .. } => step,
        }
    }

    pub fn module(&self) -> &str {
        match self {
            TransformError::StepFailed { module, .. } => module,
        }
    }
}

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("failed to write {path}: {cause}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("failed to publish output into {path}: {cause}")]
    PublishFailed {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },
}

/// Cache problems are never fatal; callers treat them as a miss.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("corrupt cache entry {key}")]
    Corrupt { key: String },

    #[error("cache storage error: {0}")]
    Storage(String),
}

impl From<sled::Error> for CacheError {
    fn from(err: sled::Error) -> Self {
        CacheError::Storage(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum SokuError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("{0}")]
    Build(BuildFailure),
}

impl SokuError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// The failure report, when this error ended a build.
    pub fn as_build_failure(&self) -> Option<&BuildFailure> {
        match self {
            SokuError::Build(failure) => Some(failure),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SokuError>;

/// One problem found during a build, attributed to a module when possible.
#[derive(Debug)]
pub struct Diagnostic {
    pub module: Option<String>,
    pub error: SokuError,
}

impl Diagnostic {
    pub fn new(module: Option<String>, error: impl Into<SokuError>) -> Self {
        Self {
            module,
            error: error.into(),
        }
    }

    pub fn for_module(module: impl Into<String>, error: impl Into<SokuError>) -> Self {
        Self::new(Some(module.into()), error)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{}: {}", module, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

/// Every error accumulated by a failed build.
#[derive(Debug, Default)]
pub struct BuildFailure {
    pub diagnostics: Vec<Diagnostic>,
}

impl BuildFailure {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        Self { diagnostics }
    }

    /// Diagnostics grouped by module key; build-level problems are keyed by `None`
    /// and sort first.
    pub fn grouped(&self) -> BTreeMap<Option<&str>, Vec<&SokuError>> {
        let mut groups: BTreeMap<Option<&str>, Vec<&SokuError>> = BTreeMap::new();
        for diagnostic in &self.diagnostics {
            groups
                .entry(diagnostic.module.as_deref())
                .or_default()
                .push(&diagnostic.error);
        }
        groups
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "build failed with {} error(s)", self.diagnostics.len())?;
        for (module, errors) in self.grouped() {
            writeln!(f, "  {}", module.unwrap_or("<build>"))?;
            for error in errors {
                writeln!(f, "    - {}", error)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_groups_by_module() {
        let failure = BuildFailure::new(vec![
            Diagnostic::for_module(
                "src/a.js",
                TransformError::StepFailed {
                    step: "json".to_string(),
                    module: "src/a.js".to_string(),
                    cause: "bad".to_string(),
                },
            ),
            Diagnostic::new(None, SokuError::config("no entries")),
            Diagnostic::for_module(
                "src/a.js",
                GraphError::ReadFailed {
                    path: PathBuf::from("src/a.js"),
                    cause: "denied".to_string(),
                },
            ),
        ]);

        let groups = failure.grouped();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&Some("src/a.js")].len(), 2);

        let rendered = failure.to_string();
        assert!(rendered.starts_with("build failed with 3 error(s)"));
        assert!(rendered.find("<build>").unwrap() < rendered.find("src/a.js").unwrap());
        assert!(rendered.contains("transform step 'json' failed"));
    }
}
