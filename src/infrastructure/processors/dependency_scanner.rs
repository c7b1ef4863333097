// Lightweight dependency scan: enumerates import-like expressions without
// compiling the module.

use crate::core::models::{ImportKind, ImportRecord, ModuleType};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

static JS_COMMENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s:/\*.*?\*/)|(?m:^\s*//.*$)").unwrap());

static STATIC_FROM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:^|[^\w$.])(?:import|export)\s+(type\s+)?[\w$*{},\s]*?\s*from\s*['"]([^'"\n]+)['"]"#,
    )
    .unwrap()
});

static SIDE_EFFECT_IMPORT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:^|[^\w$.])import\s*['"]([^'"\n]+)['"]"#).unwrap());

static REQUIRE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:^|[^\w$.])require\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).unwrap()
});

static DYNAMIC_IMPORT_START_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\w$.])import\s*\(").unwrap());

// Applied to the text right after `import(`.
static DYNAMIC_LITERAL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(?:['"]([^'"\n]+)['"]|`([^`$]*)`)\s*[,)]"#).unwrap()
});

static CSS_COMMENT_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());

static CSS_IMPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@import\s+(?:url\s*\(\s*)?['"]([^'"]+)['"]"#).unwrap()
});

static CSS_IMPORT_RULE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"@import[^;]*;?").unwrap());

/// `url(...)` with a double-quoted, single-quoted or bare argument.
pub static CSS_URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"url\(\s*(?:"([^"]*)"|'([^']*)'|([^'"()\s]+))\s*\)"#).unwrap()
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Specifiers in source order, deduplicated per kind.
    pub imports: Vec<ImportRecord>,
    /// Source text of `import(...)` arguments that are not string constants.
    pub opaque: Vec<String>,
}

pub struct DependencyScanner;

impl DependencyScanner {
    pub fn scan(module_type: ModuleType, path: &Path, content: &str) -> ScanResult {
        match module_type {
            ModuleType::JavaScript | ModuleType::TypeScript => Self::scan_script(content),
            ModuleType::Css if Self::is_plain_css(path) => Self::scan_css(content),
            // Sass partials are inlined by the compiler, not linked.
            ModuleType::Css => Self::scan_css_urls(content),
            _ => ScanResult::default(),
        }
    }

    fn is_plain_css(path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("css"))
            .unwrap_or(false)
    }

    pub fn scan_script(content: &str) -> ScanResult {
        let source = JS_COMMENT_REGEX.replace_all(content, " ");
        let source = source.as_ref();

        let mut found: Vec<(usize, ImportRecord)> = Vec::new();
        let mut opaque = Vec::new();

        for cap in STATIC_FROM_REGEX.captures_iter(source) {
            // `import type` / `export type` are erased by the compiler.
            if cap.get(1).is_some() {
                continue;
            }
            if let Some(spec) = cap.get(2) {
                found.push((spec.start(), ImportRecord::new(spec.as_str(), ImportKind::Static)));
            }
        }

        for regex in [&*SIDE_EFFECT_IMPORT_REGEX, &*REQUIRE_REGEX] {
            for cap in regex.captures_iter(source) {
                if let Some(spec) = cap.get(1) {
                    found.push((spec.start(), ImportRecord::new(spec.as_str(), ImportKind::Static)));
                }
            }
        }

        for m in DYNAMIC_IMPORT_START_REGEX.find_iter(source) {
            let rest = &source[m.end()..];
            match DYNAMIC_LITERAL_REGEX.captures(rest) {
                Some(cap) => {
                    if let Some(spec) = cap.get(1).or_else(|| cap.get(2)) {
                        found.push((
                            m.end() + spec.start(),
                            ImportRecord::new(spec.as_str(), ImportKind::Dynamic),
                        ));
                    }
                }
                None => opaque.push(Self::call_argument(rest)),
            }
        }

        found.sort_by_key(|(pos, _)| *pos);

        let mut seen = HashSet::new();
        let imports = found
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| seen.insert(record.clone()))
            .collect();

        ScanResult { imports, opaque }
    }

    /// `@import` rules followed by `url()` references, both as static edges.
    pub fn scan_css(content: &str) -> ScanResult {
        let source = CSS_COMMENT_REGEX.replace_all(content, " ");

        let mut seen = HashSet::new();
        let mut imports: Vec<ImportRecord> = CSS_IMPORT_REGEX
            .captures_iter(&source)
            .filter_map(|cap| cap.get(1))
            .map(|m| m.as_str())
            .filter(|spec| !Self::is_remote(spec))
            .map(|spec| ImportRecord::new(Self::css_specifier(spec), ImportKind::Static))
            .filter(|record| seen.insert(record.clone()))
            .collect();

        let rules_removed = CSS_IMPORT_RULE_REGEX.replace_all(&source, " ");
        imports.extend(
            Self::url_specifiers(&rules_removed)
                .map(|spec| ImportRecord::new(spec, ImportKind::Static))
                .filter(|record| seen.insert(record.clone())),
        );

        ScanResult {
            imports,
            opaque: Vec::new(),
        }
    }

    /// Only the `url()` references of a stylesheet.
    pub fn scan_css_urls(content: &str) -> ScanResult {
        let source = CSS_COMMENT_REGEX.replace_all(content, " ");
        let source = CSS_IMPORT_RULE_REGEX.replace_all(&source, " ");

        let mut seen = HashSet::new();
        let imports = Self::url_specifiers(&source)
            .map(|spec| ImportRecord::new(spec, ImportKind::Static))
            .filter(|record| seen.insert(record.clone()))
            .collect();

        ScanResult {
            imports,
            opaque: Vec::new(),
        }
    }

    fn url_specifiers(source: &str) -> impl Iterator<Item = String> + '_ {
        CSS_URL_REGEX
            .captures_iter(source)
            .filter_map(|cap| cap.get(1).or_else(|| cap.get(2)).or_else(|| cap.get(3)))
            .filter_map(|m| Self::css_url_specifier(m.as_str()))
            .map(|(spec, _)| spec)
    }

    /// Specifier of a local `url()` argument plus its `#fragment`. Remote,
    /// inline, fragment-only and Sass-interpolated values yield `None`.
    pub fn css_url_specifier(raw: &str) -> Option<(String, &str)> {
        let raw = raw.trim();
        if raw.is_empty()
            || raw.starts_with('#')
            || Self::is_remote(raw)
            || raw.contains('$')
            || raw.contains("#{")
        {
            return None;
        }
        let (path, fragment) = match raw.find('#') {
            Some(at) => raw.split_at(at),
            None => (raw, ""),
        };
        Some((Self::css_specifier(path), fragment))
    }

    fn is_remote(spec: &str) -> bool {
        spec.starts_with("http:")
            || spec.starts_with("https:")
            || spec.starts_with("//")
            || spec.starts_with("data:")
    }

    /// CSS treats bare specifiers as relative; `~pkg` addresses a package.
    pub fn css_specifier(spec: &str) -> String {
        if let Some(package) = spec.strip_prefix('~') {
            package.to_string()
        } else if spec.starts_with('.') || spec.starts_with('/') {
            spec.to_string()
        } else {
            format!("./{}", spec)
        }
    }

    /// Text of a call argument up to the matching closing parenthesis.
    fn call_argument(rest: &str) -> String {
        let mut depth = 1usize;
        for (i, c) in rest.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return rest[..i].trim().to_string();
                    }
                }
                _ => {}
            }
        }
        rest.lines().next().unwrap_or("").trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specifiers(result: &ScanResult, kind: ImportKind) -> Vec<&str> {
        result
            .imports
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.specifier.as_str())
            .collect()
    }

    #[test]
    fn test_static_imports_in_source_order() {
        let source = r#"
import React, { useState } from 'react';
import './styles.css';
export { helper } from "./helper";
export * from './all';
const fs = require('./legacy');
import {
  a,
  b,
} from './multi';
"#;
        let result = DependencyScanner::scan_script(source);
        assert_eq!(
            specifiers(&result, ImportKind::Static),
            vec!["react", "./styles.css", "./helper", "./all", "./legacy", "./multi"]
        );
        assert!(result.opaque.is_empty());
    }

    #[test]
    fn test_type_only_imports_are_skipped() {
        let source = "import type { Props } from './types';\nimport { type A, run } from './run';";
        let result = DependencyScanner::scan_script(source);
        assert_eq!(specifiers(&result, ImportKind::Static), vec!["./run"]);
    }

    #[test]
    fn test_dynamic_and_opaque_imports() {
        let source = r#"
const page = await import('./pages/about');
const tpl = import(`./pages/contact`);
const lazy = import(`./locale/${lang}.js`);
const other = import(name + '.js');
"#;
        let result = DependencyScanner::scan_script(source);
        assert_eq!(
            specifiers(&result, ImportKind::Dynamic),
            vec!["./pages/about", "./pages/contact"]
        );
        assert_eq!(result.opaque, vec!["`./locale/${lang}.js`", "name + '.js'"]);
    }

    #[test]
    fn test_comments_are_ignored() {
        let source = "// import './gone';\n/* import('./also-gone') */\nimport './kept';";
        let result = DependencyScanner::scan_script(source);
        assert_eq!(result.imports, vec![ImportRecord::new("./kept", ImportKind::Static)]);
    }

    #[test]
    fn test_duplicate_specifiers_collapse() {
        let source = "import a from './x';\nimport b from './x';\nimport('./x');";
        let result = DependencyScanner::scan_script(source);
        assert_eq!(result.imports.len(), 2);
    }

    #[test]
    fn test_css_imports() {
        let source = r#"@import "base.css";
@import url('./theme.css');
@import url("https://fonts.example.com/x.css");
@import '~normalize.css/normalize.css';
/* @import "commented.css"; */
body { color: red; }"#;
        let result = DependencyScanner::scan_css(source);
        assert_eq!(
            specifiers(&result, ImportKind::Static),
            vec!["./base.css", "./theme.css", "normalize.css/normalize.css"]
        );
    }

    #[test]
    fn test_css_urls_are_static_edges() {
        let source = r#"@import url("./theme.css");
.logo { background: url(img/logo.png) no-repeat; }
.icon { background-image: url( "../icons/star.svg#solid" ); }
@font-face { src: url('~fonts/inter.woff2') format("woff2"), url(data:font/woff2;base64,AAAA); }
.remote { background: url(https://cdn.example.com/bg.png); }
.filter { filter: url(#shadow); }
.again { background: url("./img/logo.png"); }"#;
        let result = DependencyScanner::scan_css(source);
        assert_eq!(
            specifiers(&result, ImportKind::Static),
            vec!["./theme.css", "./img/logo.png", "../icons/star.svg", "fonts/inter.woff2"]
        );
    }

    #[test]
    fn test_url_specifier_keeps_fragment_apart() {
        assert_eq!(
            DependencyScanner::css_url_specifier("font.svg#icons"),
            Some(("./font.svg".to_string(), "#icons"))
        );
        assert_eq!(DependencyScanner::css_url_specifier("#shadow"), None);
        assert_eq!(DependencyScanner::css_url_specifier("$base/x.png"), None);
        assert_eq!(DependencyScanner::css_url_specifier("#{$dir}/x.png"), None);
    }

    #[test]
    fn test_scss_partials_are_not_edges() {
        let result = DependencyScanner::scan(
            ModuleType::Css,
            Path::new("/p/main.scss"),
            "@import 'partial';\n.hero { background: url(./hero.jpg); }",
        );
        assert_eq!(specifiers(&result, ImportKind::Static), vec!["./hero.jpg"]);
    }
}
