//! Concurrent-write semantics: conflicts are exposed, never auto-resolved,
//! and collapse once a write links every head.

mod common;

use std::sync::Arc;

use serde_json::json;
use weftdb::codec::{current_time_ms, encode_header, encode_record};
use weftdb::feed::default_header;
use weftdb::{Address, Feed, LogId, MemoryFeed, RecordVersion, Seq};

/// A replica feed carrying one record for `path` that was written without
/// seeing any local version (empty links = concurrent).
fn replica_with_record(key_byte: u8, typ: &str, id: &str, title: &str) -> Arc<MemoryFeed> {
    let key = LogId::from_bytes([key_byte; 32]);
    let feed = Arc::new(MemoryFeed::replica(key));
    feed.supply(
        Seq::HEADER,
        encode_header(&default_header("replica")).unwrap(),
    );
    let version = RecordVersion {
        typ: typ.into(),
        id: id.into(),
        value: Some(json!({ "title": title })),
        links: vec![],
        deleted: false,
        timestamp: current_time_ms(),
        address: Address::new(key, Seq::from_raw(1)),
    };
    feed.supply(Seq::from_raw(1), encode_record(&version).unwrap());
    feed
}

#[tokio::test]
async fn test_concurrent_writes_surface_as_conflict() {
    let db = common::open_collection().await;

    let local = db
        .put_with_id("test/doc@1", Some("c1"), json!({ "title": "local" }))
        .await
        .unwrap();

    let replica = replica_with_record(0x07, "test/doc@1", "c1", "remote");
    db.add_feed(replica, "replica").await.unwrap();
    db.sync().await.unwrap();

    let record = db.get("test/doc@1", "c1").await.unwrap().unwrap();
    assert!(record.conflict());
    assert_eq!(record.heads.len(), 2);
    assert!(record.heads.iter().any(|h| h.address == local.address));

    // latest() is deterministic even under a timestamp tie.
    let a = record.latest().unwrap().address;
    let b = record.latest().unwrap().address;
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_linking_every_head_collapses_conflict() {
    let db = common::open_collection().await;

    let local = db
        .put_with_id("test/doc@1", Some("c2"), json!({ "title": "local" }))
        .await
        .unwrap();
    let replica = replica_with_record(0x08, "test/doc@1", "c2", "remote");
    let remote_addr = Address::new(replica.key(), Seq::from_raw(1));
    db.add_feed(replica, "replica").await.unwrap();
    db.sync().await.unwrap();
    assert!(db
        .get("test/doc@1", "c2")
        .await
        .unwrap()
        .unwrap()
        .conflict());

    // A fresh put links the whole current frontier.
    let merged = db
        .put_with_id("test/doc@1", Some("c2"), json!({ "title": "merged" }))
        .await
        .unwrap();
    assert_eq!(merged.links.len(), 2);
    assert!(merged.links.contains(&local.address));
    assert!(merged.links.contains(&remote_addr));

    let record = db.get("test/doc@1", "c2").await.unwrap().unwrap();
    assert!(!record.conflict());
    assert_eq!(record.latest().unwrap().address, merged.address);
}

#[tokio::test]
async fn test_replica_records_flow_into_queries() {
    let db = common::open_collection().await;

    let replica = replica_with_record(0x09, "test/doc@1", "r1", "from afar");
    db.add_feed(replica, "replica").await.unwrap();
    db.sync().await.unwrap();

    let results = db
        .query(
            "records",
            json!({ "type": "test/doc@1" }),
            weftdb::QueryOpts::default(),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].version.id, "r1");
}
