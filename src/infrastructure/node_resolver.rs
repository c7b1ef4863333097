use crate::core::models::ResolveConfig;
use crate::utils::{PathAliasResolver, ResolutionError};
use dashmap::DashMap;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// A resolved module identity: canonical file plus optional `?query`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedModule {
    pub path: PathBuf,
    pub query: Option<String>,
}

impl ResolvedModule {
    /// Root-relative, `/`-separated key with the query appended. Files outside
    /// the root keep their absolute path.
    pub fn key(&self, root: &Path) -> String {
        let relative = self.path.strip_prefix(root).unwrap_or(&self.path);
        let mut key = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        if relative.is_absolute() {
            key.insert(0, '/');
        }
        if let Some(query) = &self.query {
            key.push('?');
            key.push_str(query);
        }
        key
    }
}

/// Parsed package manifest. Only string-valued entry fields are consulted, in
/// the configured `main_fields` order.
#[derive(Debug, Clone)]
pub struct PackageJson {
    fields: serde_json::Value,
}

impl PackageJson {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }
}

/// Node.js-style module resolution implementation.
///
/// Resolution only reads the filesystem; package manifests are memoized so
/// concurrent workers share lookups.
pub struct NodeModuleResolver {
    root: PathBuf,
    config: ResolveConfig,
    aliases: PathAliasResolver,
    package_cache: DashMap<PathBuf, Option<Arc<PackageJson>>>,
}

impl NodeModuleResolver {
    pub fn new(root: PathBuf, config: ResolveConfig) -> Self {
        let aliases = PathAliasResolver::new(config.alias.clone(), root.clone());
        Self {
            root,
            config,
            aliases,
            package_cache: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a module import following Node.js resolution algorithm
    pub fn resolve(
        &self,
        specifier: &str,
        from_dir: &Path,
    ) -> Result<ResolvedModule, ResolutionError> {
        let not_found = || ResolutionError::NotFound {
            specifier: specifier.to_string(),
            from_dir: from_dir.to_path_buf(),
        };

        let (request, query) = match specifier.split_once('?') {
            Some((request, query)) => (request, Some(query.to_string())),
            None => (specifier, None),
        };
        if request.is_empty() {
            return Err(not_found());
        }

        let found = if let Some(target) = self.aliases.resolve(request) {
            self.resolve_file_or_directory(&target)?
        } else if Self::is_relative(request) {
            self.resolve_file_or_directory(&from_dir.join(request))?
        } else if request.starts_with('/') {
            match self.resolve_file_or_directory(Path::new(request))? {
                Some(path) => Some(path),
                None => {
                    let in_root = self.root.join(request.trim_start_matches('/'));
                    self.resolve_file_or_directory(&in_root)?
                }
            }
        } else {
            self.resolve_node_module(request, from_dir)?
        };

        let path = found.ok_or_else(not_found)?;
        let path = std::fs::canonicalize(&path).map_err(|_| not_found())?;
        Ok(ResolvedModule { path, query })
    }

    pub fn is_relative(request: &str) -> bool {
        request == "."
            || request == ".."
            || request.starts_with("./")
            || request.starts_with("../")
    }

    /// Walk up from `from_dir` looking for `node_modules/<package>`.
    fn resolve_node_module(
        &self,
        request: &str,
        from_dir: &Path,
    ) -> Result<Option<PathBuf>, ResolutionError> {
        let (package_name, subpath) = Self::parse_package_specifier(request);

        for dir in from_dir.ancestors() {
            let package_dir = dir.join("node_modules").join(&package_name);
            if !package_dir.is_dir() {
                continue;
            }

            let entry = match &subpath {
                Some(subpath) => self.resolve_file_or_directory(&package_dir.join(subpath))?,
                None => self.resolve_directory(&package_dir)?,
            };
            if entry.is_some() {
                return Ok(entry);
            }
        }

        Ok(None)
    }

    /// Parse package specifier into package name and subpath
    pub fn parse_package_specifier(specifier: &str) -> (String, Option<String>) {
        let mut parts = specifier.splitn(if specifier.starts_with('@') { 3 } else { 2 }, '/');
        let name = if specifier.starts_with('@') {
            let scope = parts.next().unwrap_or_default();
            match parts.next() {
                Some(package) => format!("{}/{}", scope, package),
                None => scope.to_string(),
            }
        } else {
            parts.next().unwrap_or_default().to_string()
        };
        let subpath = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        (name, subpath)
    }

    fn resolve_file_or_directory(&self, path: &Path) -> Result<Option<PathBuf>, ResolutionError> {
        if let Some(file) = self.resolve_as_file(path) {
            return Ok(Some(file));
        }
        if path.is_dir() {
            return self.resolve_directory(path);
        }
        Ok(None)
    }

    /// Exact file, then each configured extension in order.
    fn resolve_as_file(&self, path: &Path) -> Option<PathBuf> {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        self.config.extensions.iter().find_map(|ext| {
            let mut candidate = OsString::from(path.as_os_str());
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);
            candidate.is_file().then_some(candidate)
        })
    }

    /// Package entry fields first, then `index` with each extension.
    fn resolve_directory(&self, dir: &Path) -> Result<Option<PathBuf>, ResolutionError> {
        if let Some(package) = self.read_package_json(dir)? {
            for field in &self.config.main_fields {
                let Some(entry) = package.field(field) else {
                    continue;
                };
                let target = dir.join(entry);
                if let Some(file) = self.resolve_as_file(&target) {
                    return Ok(Some(file));
                }
                if target.is_dir() {
                    if let Some(index) = self.resolve_as_file(&target.join("index")) {
                        return Ok(Some(index));
                    }
                }
            }
        }

        Ok(self.resolve_as_file(&dir.join("index")))
    }

    fn read_package_json(&self, dir: &Path) -> Result<Option<Arc<PackageJson>>, ResolutionError> {
        if let Some(cached) = self.package_cache.get(dir) {
            return Ok(cached.clone());
        }

        let manifest = dir.join("package.json");
        let package = if manifest.is_file() {
            let text =
                std::fs::read_to_string(&manifest).map_err(|e| ResolutionError::InvalidPackage {
                    path: manifest.clone(),
                    reason: e.to_string(),
                })?;
            let fields = serde_json::from_str::<serde_json::Value>(&text).map_err(|e| {
                ResolutionError::InvalidPackage {
                    path: manifest.clone(),
                    reason: e.to_string(),
                }
            })?;
            Some(Arc::new(PackageJson { fields }))
        } else {
            None
        };

        self.package_cache.insert(dir.to_path_buf(), package.clone());
        Ok(package)
    }
}
