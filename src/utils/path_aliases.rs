use crate::utils::Logger;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Path alias resolver for import path resolution
#[derive(Debug, Clone)]
pub struct PathAliasResolver {
    aliases: BTreeMap<String, String>,
    root: PathBuf,
}

impl PathAliasResolver {
    pub fn new(aliases: BTreeMap<String, String>, root: PathBuf) -> Self {
        if !aliases.is_empty() {
            Logger::debug(&format!("🔗 {} path alias(es) configured", aliases.len()));
        }
        Self { aliases, root }
    }

    /// Target path for `import_path` when an alias matches. The longest
    /// matching alias wins, so `@app` and `@` can coexist.
    pub fn resolve(&self, import_path: &str) -> Option<PathBuf> {
        let (alias, target) = self
            .aliases
            .iter()
            .filter(|(alias, _)| Self::matches(alias, import_path))
            .max_by_key(|(alias, _)| alias.len())?;

        let resolved = self.resolve_target(target);
        let rest = import_path[alias.len()..].trim_start_matches('/');
        let final_path = if rest.is_empty() {
            resolved
        } else {
            resolved.join(rest)
        };

        Logger::debug(&format!(
            "🔗 Resolved alias: {} → {}",
            import_path,
            final_path.display()
        ));
        Some(final_path)
    }

    fn matches(alias: &str, import_path: &str) -> bool {
        import_path == alias
            || import_path
                .strip_prefix(alias)
                .map_or(false, |rest| rest.starts_with('/'))
    }

    /// Resolve a target path relative to root
    fn resolve_target(&self, target: &str) -> PathBuf {
        let path = Path::new(target);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(target.strip_prefix("./").unwrap_or(target))
        }
    }

    pub fn matches_alias(&self, import_path: &str) -> bool {
        self.aliases
            .keys()
            .any(|alias| Self::matches(alias, import_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(pairs: &[(&str, &str)]) -> PathAliasResolver {
        let aliases = pairs
            .iter()
            .map(|(a, t)| (a.to_string(), t.to_string()))
            .collect();
        PathAliasResolver::new(aliases, PathBuf::from("/project"))
    }

    #[test]
    fn test_exact_alias_match() {
        let resolver = resolver(&[("@", "./src")]);
        assert_eq!(resolver.resolve("@"), Some(PathBuf::from("/project/src")));
    }

    #[test]
    fn test_pattern_alias_match() {
        let resolver = resolver(&[("@", "./src")]);
        assert_eq!(
            resolver.resolve("@/components/Button.js"),
            Some(PathBuf::from("/project/src/components/Button.js"))
        );
    }

    #[test]
    fn test_longest_alias_wins() {
        let resolver = resolver(&[("@", "./src"), ("@/components", "./ui"), ("~", "/abs")]);

        assert_eq!(
            resolver.resolve("@/components/Button.js"),
            Some(PathBuf::from("/project/ui/Button.js"))
        );
        assert_eq!(
            resolver.resolve("@/utils/helpers.js"),
            Some(PathBuf::from("/project/src/utils/helpers.js"))
        );
        assert_eq!(resolver.resolve("~/main.js"), Some(PathBuf::from("/abs/main.js")));
    }

    #[test]
    fn test_no_alias_match() {
        let resolver = resolver(&[("@", "./src")]);

        assert_eq!(resolver.resolve("react"), None);
        assert_eq!(resolver.resolve("@scope/package"), None);
        assert!(!resolver.matches_alias("./local"));
        assert!(resolver.matches_alias("@/x"));
    }
}
