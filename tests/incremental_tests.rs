use anyhow::Result as AnyResult;
use soku_core::core::{ModuleSource, StepInput, StepOutput};
use soku_core::{build, BuildConfig, Bundler, EntryPoint, SplitConfig, TransformStep, TransformStepKind};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn project(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    for (path, content) in files {
        fs::write(root.join(path), content).unwrap();
    }
    (dir, root)
}

fn entries(specifiers: &[&str]) -> Vec<EntryPoint> {
    specifiers.iter().map(|s| EntryPoint::from(*s)).collect()
}

const APP: &[(&str, &str)] = &[
    (
        "main.js",
        "import { util } from './util';\nimport { leaf } from './leaf';\nconsole.log(util, leaf);",
    ),
    ("admin.js", "import { util } from './util';\nconsole.log(util);"),
    ("util.js", "export const util = 'util';"),
    ("leaf.js", "export const leaf = 1;"),
];

#[derive(Debug)]
struct Banner(&'static str);

impl TransformStep for Banner {
    fn name(&self) -> &str {
        "banner"
    }

    fn fingerprint(&self) -> String {
        self.0.to_string()
    }

    fn test(&self, module: &ModuleSource<'_>) -> bool {
        module.module_type.is_script()
    }

    fn apply(&self, input: StepInput<'_>) -> AnyResult<StepOutput> {
        Ok(StepOutput::code(format!("/* {} */\n{}", self.0, input.code)))
    }
}

#[test]
fn test_leaf_change_rebuilds_one_module_and_one_chunk() {
    let (_dir, root) = project(APP);
    let config = BuildConfig::new(&root, SplitConfig::new(2)).with_workers(2);
    let mut bundler = Bundler::new(config).unwrap();

    let first = bundler.build(entries(&["./main.js", "./admin.js"])).unwrap();
    assert_eq!(first.stats.modules_transformed, 4);
    assert_eq!(first.stats.chunks_rendered, 3);

    fs::write(root.join("leaf.js"), "export const leaf = 2;").unwrap();
    let second = bundler.rebuild(vec![root.join("leaf.js")]).unwrap();

    assert_eq!(second.stats.modules_transformed, 1);
    assert_eq!(second.stats.cache_hits, 0);
    assert_eq!(second.stats.chunks_rendered, 1);

    let before = &first.manifest.chunks;
    let after = &second.manifest.chunks;
    assert_ne!(before["main"].file, after["main"].file);
    assert_eq!(before["admin"].file, after["admin"].file);
    assert_eq!(before["shared-main-admin"].file, after["shared-main-admin"].file);
}

#[test]
fn test_unchanged_file_is_not_rebuilt() {
    let (_dir, root) = project(APP);
    let config = BuildConfig::new(&root, SplitConfig::new(2)).with_workers(1);
    let mut bundler = Bundler::new(config).unwrap();

    let first = bundler.build(entries(&["./main.js", "./admin.js"])).unwrap();
    let second = bundler.rebuild(vec![PathBuf::from("leaf.js")]).unwrap();

    assert_eq!(second.stats.modules_transformed, 0);
    assert_eq!(second.stats.chunks_rendered, 0);
    assert_eq!(first.manifest, second.manifest);
}

#[test]
fn test_new_import_is_discovered_on_rebuild() {
    let (_dir, root) = project(APP);
    let config = BuildConfig::new(&root, SplitConfig::new(2)).with_workers(2);
    let mut bundler = Bundler::new(config).unwrap();
    bundler.build(entries(&["./main.js", "./admin.js"])).unwrap();

    fs::write(root.join("extra.js"), "export const extra = true;").unwrap();
    fs::write(
        root.join("leaf.js"),
        "export { extra } from './extra';\nexport const leaf = 3;",
    )
    .unwrap();
    let result = bundler.rebuild(vec![root.join("leaf.js")]).unwrap();

    assert_eq!(result.stats.modules_total, 5);
    assert_eq!(result.stats.modules_transformed, 2);
    assert_eq!(
        result.manifest.chunks["main"].modules,
        vec!["extra.js", "leaf.js", "main.js"]
    );
}

#[test]
fn test_failed_rebuild_is_retried() {
    let (_dir, root) = project(APP);
    let config = BuildConfig::new(&root, SplitConfig::new(2)).with_workers(2);
    let mut bundler = Bundler::new(config).unwrap();
    bundler.build(entries(&["./main.js", "./admin.js"])).unwrap();

    fs::write(root.join("leaf.js"), "import './gone';\nexport const leaf = 4;").unwrap();
    assert!(bundler.rebuild(vec![root.join("leaf.js")]).is_err());

    // Fixed without reporting the path again: the deferred change is picked up.
    fs::write(root.join("leaf.js"), "export const leaf = 5;").unwrap();
    let result = bundler.rebuild(Vec::new()).unwrap();
    assert_eq!(result.stats.modules_transformed, 1);
}

#[test]
fn test_persistent_cache_hits_and_fingerprint_misses() {
    let (_dir, root) = project(APP);
    let cache_dir = root.join(".soku-cache");
    let specs = ["./main.js", "./admin.js"];
    let config = || {
        BuildConfig::new(&root, SplitConfig::new(2))
            .with_workers(2)
            .with_cache_dir(&cache_dir)
    };

    let cold = build(entries(&specs), config()).unwrap();
    assert_eq!(cold.stats.modules_transformed, 4);
    assert_eq!(cold.stats.cache_hits, 0);

    let warm = build(entries(&specs), config()).unwrap();
    assert_eq!(warm.stats.modules_transformed, 0);
    assert_eq!(warm.stats.cache_hits, 4);
    assert_eq!(cold.manifest, warm.manifest);

    let changed = build(
        entries(&specs),
        config().with_step(TransformStepKind::custom(Banner("v1"))),
    )
    .unwrap();
    assert_eq!(changed.stats.modules_transformed, 4);
    assert_ne!(changed.manifest.chunks["main"].file, cold.manifest.chunks["main"].file);
}

fn stylesheet(root: &std::path::Path, result: &soku_core::BuildResult) -> String {
    let css = result.manifest.chunks["main"].css.clone().unwrap();
    fs::read_to_string(root.join("dist").join(css)).unwrap()
}

#[test]
fn test_partial_edit_invalidates_stylesheet() {
    let (_dir, root) = project(&[
        ("main.js", "import './style.scss';"),
        ("style.scss", "@import 'colors';\n.button { color: $primary; }"),
        ("_colors.scss", "$primary: #336699;"),
    ]);
    let config = BuildConfig::new(&root, SplitConfig::new(2)).with_workers(2);
    let mut bundler = Bundler::new(config).unwrap();

    let first = bundler.build(entries(&["./main.js"])).unwrap();
    assert!(stylesheet(&root, &first).contains("#336699"));

    fs::write(root.join("_colors.scss"), "$primary: #cc0000;").unwrap();
    let second = bundler.rebuild(vec![root.join("_colors.scss")]).unwrap();
    assert_eq!(second.stats.modules_transformed, 1);
    assert!(stylesheet(&root, &second).contains("#cc0000"));
    assert_ne!(first.manifest.chunks["main"].css, second.manifest.chunks["main"].css);

    // A full build on the same bundler checks partials behind cache hits too.
    fs::write(root.join("_colors.scss"), "$primary: #00aa00;").unwrap();
    let third = bundler.build(entries(&["./main.js"])).unwrap();
    assert_eq!(third.stats.modules_transformed, 1);
    assert_eq!(third.stats.cache_hits, 1);
    assert!(stylesheet(&root, &third).contains("#00aa00"));
}

#[test]
fn test_partial_edit_misses_persistent_cache() {
    let (_dir, root) = project(&[
        ("main.js", "import './style.scss';"),
        ("style.scss", "@use 'colors';\n.button { color: colors.$primary; }"),
        ("_colors.scss", "$primary: #336699;"),
    ]);
    let cache_dir = root.join(".soku-cache");
    let config = || {
        BuildConfig::new(&root, SplitConfig::new(2))
            .with_workers(1)
            .with_cache_dir(&cache_dir)
    };

    build(entries(&["./main.js"]), config()).unwrap();
    fs::write(root.join("_colors.scss"), "$primary: #cc0000;").unwrap();
    let result = build(entries(&["./main.js"]), config()).unwrap();

    assert_eq!(result.stats.cache_hits, 1);
    assert_eq!(result.stats.modules_transformed, 1);
    assert!(stylesheet(&root, &result).contains("#cc0000"));
}

#[test]
fn test_removed_import_of_deleted_file() {
    let (_dir, root) = project(APP);
    let config = BuildConfig::new(&root, SplitConfig::new(2)).with_workers(2);
    let mut bundler = Bundler::new(config).unwrap();
    bundler.build(entries(&["./main.js", "./admin.js"])).unwrap();

    fs::write(root.join("main.js"), "import { util } from './util';\nconsole.log(util);").unwrap();
    fs::remove_file(root.join("leaf.js")).unwrap();
    let result = bundler
        .rebuild(vec![root.join("main.js"), root.join("leaf.js")])
        .unwrap();

    assert_eq!(result.stats.modules_total, 3);
    assert!(!result.manifest.modules.contains_key("leaf.js"));

    // Nothing was deferred: an empty rebuild is a no-op.
    let again = bundler.rebuild(Vec::new()).unwrap();
    assert_eq!(again.stats.modules_transformed, 0);
    assert_eq!(again.manifest, result.manifest);
}

#[test]
fn test_deleted_file_still_imported_fails_until_restored() {
    let (_dir, root) = project(APP);
    let config = BuildConfig::new(&root, SplitConfig::new(2)).with_workers(2);
    let mut bundler = Bundler::new(config).unwrap();
    bundler.build(entries(&["./main.js", "./admin.js"])).unwrap();

    fs::remove_file(root.join("util.js")).unwrap();
    let err = bundler.rebuild(vec![root.join("util.js")]).unwrap_err();
    let failure = err.as_build_failure().unwrap();
    assert!(failure.grouped().contains_key(&Some("util.js")));

    fs::write(root.join("util.js"), "export const util = 'back';").unwrap();
    let result = bundler.rebuild(Vec::new()).unwrap();
    assert_eq!(result.stats.modules_total, 4);
    assert!(result.manifest.modules.contains_key("util.js"));
}

#[test]
fn test_created_file_shadows_previous_resolution() {
    let files: &[(&str, &str)] = &[
        ("main.js", "import { x } from './x';\nconsole.log(x);"),
        ("x.js", "export const x = 'js';"),
    ];
    let (_dir, root) = project(files);
    let config = || BuildConfig::new(&root, SplitConfig::new(2)).with_workers(2);
    let mut bundler = Bundler::new(config()).unwrap();

    let first = bundler.build(entries(&["./main.js"])).unwrap();
    assert!(first.manifest.modules.contains_key("x.js"));

    // `.ts` comes before `.js` in the extension order.
    fs::write(root.join("x.ts"), "export const x: string = 'ts';").unwrap();
    let rebuilt = bundler.rebuild(vec![root.join("x.ts")]).unwrap();
    assert_eq!(rebuilt.stats.modules_transformed, 1);
    assert!(rebuilt.manifest.modules.contains_key("x.ts"));
    assert!(!rebuilt.manifest.modules.contains_key("x.js"));

    let fresh = build(entries(&["./main.js"]), config()).unwrap();
    assert_eq!(
        rebuilt.manifest.chunks["main"].modules,
        fresh.manifest.chunks["main"].modules
    );
}
