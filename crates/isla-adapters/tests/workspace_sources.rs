use std::path::PathBuf;

use isla_adapters::{drain_source, load_registry_file, AdapterContext, FixtureAdapter, SourceAdapter, SourceKind};
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn alojamientos_fixture_drains_in_pages() {
    let adapter = FixtureAdapter::new(workspace_root().join("fixtures/alojamientos/records.json"));
    assert_eq!(adapter.kind(), SourceKind::Fixture);
    let ctx = AdapterContext::new(Uuid::new_v4(), "alojamientos");

    let drained = drain_source(&adapter, &ctx, "alojamientos-fixture", 3).await.unwrap();
    assert!(drained.rows.len() >= 3);
    assert_eq!(drained.pages, drained.rows.len() / 3 + 1);
    assert!(drained.rows.iter().all(|row| row.contains_key("municipio")));
}

#[tokio::test]
async fn island_registry_lists_every_municipality_once() {
    let entries = load_registry_file(workspace_root().join("registry/municipalities.yaml"))
        .await
        .unwrap();
    assert_eq!(entries.len(), 31);
    assert!(entries
        .iter()
        .any(|e| e.code == "38026" && e.canonical_name == "La Orotava"));
}
