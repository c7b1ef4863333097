use soku_core::{BuildConfig, BuildService, EntryPoint, SokuBuildService, SokuError, SplitConfig};
use std::fs;
use std::sync::Arc;

#[tokio::test]
async fn test_service_builds_and_rebuilds() {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    fs::write(root.join("main.js"), "import { a } from './a';\nconsole.log(a);").unwrap();
    fs::write(root.join("a.js"), "export const a = 1;").unwrap();

    let config = BuildConfig::new(&root, SplitConfig::new(2)).with_workers(2);
    let service = SokuBuildService::new(config).unwrap();

    let first = service
        .build(vec![EntryPoint::from("./main.js")])
        .await
        .unwrap();
    assert_eq!(first.stats.modules_total, 2);
    assert!(root.join("dist/manifest.json").exists());

    fs::write(root.join("a.js"), "export const a = 2;").unwrap();
    let second = service.rebuild(vec![root.join("a.js")]).await.unwrap();
    assert_eq!(second.stats.modules_transformed, 1);
    assert_ne!(
        first.manifest.chunks["main"].file,
        second.manifest.chunks["main"].file
    );
}

#[tokio::test]
async fn test_service_cancel_is_reported_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    fs::write(root.join("main.js"), "export const a = 1;").unwrap();

    let config = BuildConfig::new(&root, SplitConfig::new(2)).with_workers(1);
    let service: Arc<dyn BuildService> = Arc::new(SokuBuildService::new(config).unwrap());

    service.cancel();
    let cancelled = service.build(vec![EntryPoint::from("./main.js")]).await;
    assert!(matches!(cancelled, Err(SokuError::Cancelled)));
    assert!(!root.join("dist").exists());

    let result = service
        .build(vec![EntryPoint::from("./main.js")])
        .await
        .unwrap();
    assert_eq!(result.manifest.chunks.len(), 1);
}
