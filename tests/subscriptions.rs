//! Durable subscription semantics: at-least-once paging over the lseq
//! stream.

mod common;

use serde_json::json;
use weftdb::Lseq;

#[tokio::test]
async fn test_pull_on_empty_collection_is_finished() {
    let db = common::open_collection().await;
    let sub = db.subscribe("worker").unwrap();

    let pull = sub.pull(10).await.unwrap();
    assert!(pull.messages.is_empty());
    assert!(pull.finished);
    assert_eq!(pull.cursor, Lseq::ZERO);
}

#[tokio::test]
async fn test_pull_pages_in_order_and_acks_advance() {
    let db = common::open_collection().await;
    for i in 0..5 {
        db.put("test/doc@1", json!({ "title": format!("t{i}") }))
            .await
            .unwrap();
    }

    let sub = db.subscribe("worker").unwrap();
    let first = sub.pull(3).await.unwrap();
    assert_eq!(first.messages.len(), 3);
    assert!(!first.finished);
    assert_eq!(first.messages[0].lseq.as_raw(), 1);
    assert_eq!(first.cursor.as_raw(), 3);

    sub.ack(first.cursor).await.unwrap();
    let second = sub.pull(3).await.unwrap();
    assert_eq!(second.messages.len(), 2);
    assert!(second.finished);
    assert_eq!(second.messages[0].lseq.as_raw(), 4);
}

#[tokio::test]
async fn test_unacked_page_is_redelivered() {
    let db = common::open_collection().await;
    db.put_with_id("test/doc@1", Some("a"), json!({ "title": "once" }))
        .await
        .unwrap();

    let sub = db.subscribe("worker").unwrap();
    let first = sub.pull(10).await.unwrap();
    // No ack: the same page comes back, including after "restart"
    // (a fresh handle to the same named subscription).
    let again = sub.pull(10).await.unwrap();
    assert_eq!(first.messages.len(), again.messages.len());
    assert_eq!(first.messages[0].lseq, again.messages[0].lseq);

    let resumed = db.subscribe("worker").unwrap();
    let replay = resumed.pull(10).await.unwrap();
    assert_eq!(replay.messages[0].lseq, first.messages[0].lseq);
}

#[tokio::test]
async fn test_independent_subscriptions_have_independent_cursors() {
    let db = common::open_collection().await;
    db.put("test/doc@1", json!({ "title": "x" })).await.unwrap();

    let fast = db.subscribe("fast").unwrap();
    let slow = db.subscribe("slow").unwrap();

    let page = fast.pull(10).await.unwrap();
    fast.ack(page.cursor).await.unwrap();
    assert!(fast.pull(10).await.unwrap().messages.is_empty());

    // The other subscription still sees everything.
    assert_eq!(slow.pull(10).await.unwrap().messages.len(), 1);
}

#[tokio::test]
async fn test_ack_rewind_replays() {
    let db = common::open_collection().await;
    for i in 0..3 {
        db.put("test/doc@1", json!({ "title": format!("t{i}") }))
            .await
            .unwrap();
    }

    let sub = db.subscribe("worker").unwrap();
    let page = sub.pull(10).await.unwrap();
    sub.ack(page.cursor).await.unwrap();
    assert!(sub.pull(10).await.unwrap().finished);

    sub.ack(Lseq::ZERO).await.unwrap();
    let replay = sub.pull(10).await.unwrap();
    assert_eq!(replay.messages.len(), 3);
}

#[tokio::test]
async fn test_subscription_sees_tombstones() {
    let db = common::open_collection().await;
    let put = db.put("test/doc@1", json!({ "title": "x" })).await.unwrap();
    db.del("test/doc@1", &put.id).await.unwrap();

    // Unlike head-filtered queries, the stream carries every version -
    // consumers replicating state need the tombstone.
    let sub = db.subscribe("mirror").unwrap();
    let page = sub.pull(10).await.unwrap();
    assert_eq!(page.messages.len(), 2);
    assert!(!page.messages[0].version.deleted);
    assert!(page.messages[1].version.deleted);
}
