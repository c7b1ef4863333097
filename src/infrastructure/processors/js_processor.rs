use crate::core::models::ModuleSource;
use crate::core::plugin::{StepInput, StepOutput, TransformStep};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

static IMPORT_FROM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^[ \t]*import\s+(type\s+)?([\w$*{},\s]+?)\s*from\s*['"]([^'"\n]+)['"][ \t]*;?"#)
        .unwrap()
});

static IMPORT_SIDE_EFFECT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^[ \t]*import\s*['"]([^'"\n]+)['"][ \t]*;?"#).unwrap()
});

static EXPORT_FROM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*export\s+(type\s+)?(\*(?:\s+as\s+[\w$]+)?|\{[^}]*\})\s*from\s*['"]([^'"\n]+)['"][ \t]*;?"#,
    )
    .unwrap()
});

static EXPORT_LIST_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*export\s*\{([^}]*)\}[ \t]*;?").unwrap());

static EXPORT_DEFAULT_DECL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^([ \t]*)export\s+default\s+((?:async\s+)?function\b\s*\*?|class\b)\s*([\w$]+)?")
        .unwrap()
});

static EXPORT_DECL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^([ \t]*)export\s+((?:async\s+)?function\b\s*\*?|class\b|const\b|let\b|var\b)\s*([\w$]+)",
    )
    .unwrap()
});

static EXPORT_DEFAULT_EXPR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^([ \t]*)export\s+default\s+").unwrap());

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value))
}

/// Splits `a, b as c` into (imported, local) pairs, dropping `type` members.
fn parse_bindings(list: &str) -> Vec<(String, String)> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty() && !item.starts_with("type "))
        .filter_map(|item| {
            let mut parts = item.split_whitespace();
            let imported = parts.next()?.to_string();
            let local = match (parts.next(), parts.next()) {
                (Some("as"), Some(alias)) => alias.to_string(),
                _ => imported.clone(),
            };
            Some((imported, local))
        })
        .collect()
}

/// Rewrites ES module syntax into calls against the bundle's module registry:
/// `import` becomes `require`, exports become getters on `exports`.
///
/// Specifiers are kept as written; the emitter maps them to module keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EsmInteropStep;

#[derive(Default)]
struct Rewrite {
    exports: Vec<(String, String)>,
    temporaries: usize,
    is_module: bool,
}

impl Rewrite {
    fn temporary(&mut self, prefix: &str) -> String {
        let name = format!("__soku_{}{}", prefix, self.temporaries);
        self.temporaries += 1;
        name
    }

    fn import_clause(&mut self, clause: &str, specifier: &str) -> String {
        let require = format!("require({})", js_string(specifier));
        let clause = clause.trim();

        let (head, named) = match clause.find('{') {
            Some(open) => {
                let close = clause
                    .rfind('}')
                    .filter(|close| *close > open)
                    .unwrap_or(clause.len());
                (&clause[..open], Some(&clause[open + 1..close]))
            }
            None => (clause, None),
        };

        let mut default = None;
        let mut namespace = None;
        for part in head.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.strip_prefix('*') {
                Some(rest) => {
                    namespace = rest.trim().strip_prefix("as").map(|n| n.trim().to_string());
                }
                None => default = Some(part.to_string()),
            }
        }
        let named: Vec<String> = named
            .map(parse_bindings)
            .unwrap_or_default()
            .into_iter()
            .map(|(imported, local)| {
                if imported == local {
                    local
                } else {
                    format!("{}: {}", imported, local)
                }
            })
            .collect();

        let mut statements = Vec::new();
        let source = match (&default, &namespace, named.is_empty()) {
            (None, Some(ns), true) => return format!("const {} = {};", ns, require),
            (None, None, false) => {
                return format!("const {{ {} }} = {};", named.join(", "), require)
            }
            (None, None, true) => return format!("{};", require),
            _ => {
                let temporary = namespace.clone().unwrap_or_else(|| self.temporary("m"));
                statements.push(format!("const {} = {};", temporary, require));
                temporary
            }
        };
        if let Some(default) = default {
            statements.push(format!("const {} = __soku_default({});", default, source));
        }
        if !named.is_empty() {
            statements.push(format!("const {{ {} }} = {};", named.join(", "), source));
        }
        statements.join(" ")
    }

    fn export_from(&mut self, clause: &str, specifier: &str) -> String {
        let require = format!("require({})", js_string(specifier));
        let clause = clause.trim();

        if let Some(rest) = clause.strip_prefix('*') {
            return match rest.trim().strip_prefix("as") {
                Some(name) => {
                    let temporary = self.temporary("reexport");
                    self.exports.push((name.trim().to_string(), temporary.clone()));
                    format!("const {} = {};", temporary, require)
                }
                None => format!("__soku_export_star(exports, {});", require),
            };
        }

        let temporary = self.temporary("reexport");
        let list = clause.trim_start_matches('{').trim_end_matches('}');
        for (imported, exported) in parse_bindings(list) {
            self.exports
                .push((exported, format!("{}.{}", temporary, imported)));
        }
        format!("const {} = {};", temporary, require)
    }

    fn header(&self) -> String {
        let mut header = String::from("Object.defineProperty(exports, \"__esModule\", { value: true });\n");
        if !self.exports.is_empty() {
            let getters: Vec<String> = self
                .exports
                .iter()
                .map(|(name, local)| {
                    format!("{}: function () {{ return {}; }}", js_string(name), local)
                })
                .collect();
            header.push_str(&format!("__soku_export(exports, {{ {} }});\n", getters.join(", ")));
        }
        header
    }
}

impl EsmInteropStep {
    pub fn rewrite(&self, source: &str) -> String {
        let mut state = Rewrite::default();

        let code = IMPORT_FROM_REGEX.replace_all(source, |caps: &Captures| {
            state.is_module = true;
            if caps.get(1).is_some() {
                return String::new();
            }
            state.import_clause(&caps[2], &caps[3])
        });

        let code = IMPORT_SIDE_EFFECT_REGEX.replace_all(&code, |caps: &Captures| {
            state.is_module = true;
            format!("require({});", js_string(&caps[1]))
        });

        let code = EXPORT_FROM_REGEX.replace_all(&code, |caps: &Captures| {
            state.is_module = true;
            if caps.get(1).is_some() {
                return String::new();
            }
            state.export_from(&caps[2], &caps[3])
        });

        let code = EXPORT_LIST_REGEX.replace_all(&code, |caps: &Captures| {
            state.is_module = true;
            for (local, exported) in parse_bindings(&caps[1]) {
                state.exports.push((exported, local));
            }
            String::new()
        });

        let code = EXPORT_DEFAULT_DECL_REGEX.replace_all(&code, |caps: &Captures| {
            state.is_module = true;
            let indent = &caps[1];
            let keyword = &caps[2];
            match caps.get(3) {
                Some(name) => {
                    state
                        .exports
                        .push(("default".to_string(), name.as_str().to_string()));
                    format!("{}{} {}", indent, keyword, name.as_str())
                }
                None => format!("{}exports.default = {} ", indent, keyword),
            }
        });

        let code = EXPORT_DECL_REGEX.replace_all(&code, |caps: &Captures| {
            state.is_module = true;
            let name = caps[3].to_string();
            state.exports.push((name.clone(), name.clone()));
            format!("{}{} {}", &caps[1], &caps[2], name)
        });

        let code = EXPORT_DEFAULT_EXPR_REGEX.replace_all(&code, |caps: &Captures| {
            state.is_module = true;
            format!("{}exports.default = ", &caps[1])
        });

        if !state.is_module {
            return code.into_owned();
        }

        let mut output = state.header();
        output.push_str(&code);
        output
    }
}

impl TransformStep for EsmInteropStep {
    fn name(&self) -> &str {
        "esm-interop"
    }

    fn fingerprint(&self) -> String {
        "registry-v1".to_string()
    }

    fn test(&self, module: &ModuleSource<'_>) -> bool {
        module.module_type.is_script()
    }

    fn apply(&self, input: StepInput<'_>) -> anyhow::Result<StepOutput> {
        Ok(StepOutput::code(self.rewrite(input.code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imports_become_requires() {
        let source = r#"import React, { useState as useLocal } from 'react';
import * as utils from "./utils";
import { helper } from './helper.js';
import type { Props } from './types';
import './styles.css';
"#;
        let output = EsmInteropStep.rewrite(source);

        assert!(output.contains(r#"const __soku_m0 = require("react");"#));
        assert!(output.contains("const React = __soku_default(__soku_m0);"));
        assert!(output.contains("const { useState: useLocal } = __soku_m0;"));
        assert!(output.contains(r#"const utils = require("./utils");"#));
        assert!(output.contains(r#"const { helper } = require("./helper.js");"#));
        assert!(output.contains(r#"require("./styles.css");"#));
        assert!(!output.contains("./types"));
        assert!(!output.contains("import "));
    }

    #[test]
    fn test_malformed_clause_does_not_panic() {
        let mut rewrite = Rewrite::default();
        let output = rewrite.import_clause("} a, { b", "./x");
        assert!(output.contains(r#"require("./x")"#));

        let output = Rewrite::default().import_clause("{ a", "./y");
        assert!(output.contains(r#"require("./y")"#));
    }

    #[test]
    fn test_exports_become_getters() {
        let source = r#"export const answer = 42;
export function greet(name) { return `hi ${name}`; }
const hidden = 1;
export { hidden as visible };
export default class Widget {}
"#;
        let output = EsmInteropStep.rewrite(source);

        assert!(output.starts_with("Object.defineProperty(exports, \"__esModule\""));
        assert!(output.contains(r#""answer": function () { return answer; }"#));
        assert!(output.contains(r#""greet": function () { return greet; }"#));
        assert!(output.contains(r#""visible": function () { return hidden; }"#));
        assert!(output.contains(r#""default": function () { return Widget; }"#));
        assert!(output.contains("const answer = 42;"));
        assert!(output.contains("class Widget {}"));
        assert!(!output.contains("export "));
    }

    #[test]
    fn test_reexports() {
        let source = "export * from './all';\nexport { a, b as c } from './some';\nexport * as ns from './ns';\n";
        let output = EsmInteropStep.rewrite(source);

        assert!(output.contains(r#"__soku_export_star(exports, require("./all"));"#));
        assert!(output.contains(r#"const __soku_reexport0 = require("./some");"#));
        assert!(output.contains(r#""c": function () { return __soku_reexport0.b; }"#));
        assert!(output.contains(r#""ns": function () { return __soku_reexport1; }"#));
    }

    #[test]
    fn test_default_expression() {
        let output = EsmInteropStep.rewrite("export default { name: 'app' };\n");
        assert!(output.contains("exports.default = { name: 'app' };"));
    }

    #[test]
    fn test_commonjs_is_untouched() {
        let source = "const a = require('./a');\nmodule.exports = a;\n";
        assert_eq!(EsmInteropStep.rewrite(source), source);
    }
}
