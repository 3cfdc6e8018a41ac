//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use weftdb::{Collection, CollectionConfig, FieldSpec, IndexOpts, Registry, TypeSpec};

/// A registry with the types the tests write:
///
/// - `test/entity@1` with a basic-indexed `name` field
/// - `test/file@1` whose `name` refines `test/entity@1#name`
/// - `test/doc@1` with a basic-indexed `title` and a search-only `body`
pub fn test_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .define(TypeSpec {
            namespace: "test".into(),
            name: "entity".into(),
            version: 1,
            fields: vec![FieldSpec {
                name: "name".into(),
                refines: None,
                index: IndexOpts {
                    basic: true,
                    search: false,
                },
            }],
        })
        .unwrap();
    registry
        .define(TypeSpec {
            namespace: "test".into(),
            name: "file".into(),
            version: 1,
            fields: vec![
                FieldSpec {
                    name: "name".into(),
                    refines: Some("test/entity@1#name".into()),
                    index: IndexOpts {
                        basic: true,
                        search: false,
                    },
                },
                FieldSpec {
                    name: "size".into(),
                    refines: None,
                    index: IndexOpts {
                        basic: true,
                        search: false,
                    },
                },
            ],
        })
        .unwrap();
    registry
        .define(TypeSpec {
            namespace: "test".into(),
            name: "doc".into(),
            version: 1,
            fields: vec![
                FieldSpec {
                    name: "title".into(),
                    refines: None,
                    index: IndexOpts {
                        basic: true,
                        search: false,
                    },
                },
                FieldSpec {
                    name: "body".into(),
                    refines: None,
                    index: IndexOpts {
                        basic: false,
                        search: true,
                    },
                },
            ],
        })
        .unwrap();
    registry
}

/// A config with a short sync budget so a wedged test fails fast.
pub fn test_config() -> CollectionConfig {
    CollectionConfig {
        sync_timeout: Some(Duration::from_secs(5)),
        ..CollectionConfig::default()
    }
}

/// Opens an in-memory collection over [`test_registry`].
pub async fn open_collection() -> Collection {
    init_tracing();
    Collection::open_in_memory(test_registry(), test_config())
        .await
        .expect("open in-memory collection")
}

/// A temp directory plus a db path inside it. Keep the `TempDir` alive for
/// the duration of the test.
pub fn create_temp_db_file() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("weft.db");
    (dir, path)
}

/// Installs a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
