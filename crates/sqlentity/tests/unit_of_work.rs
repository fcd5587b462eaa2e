mod common;

use common::{author, author_row, blog, post, post_row, tag};
use sqlentity::prelude::*;
use sqlentity::{EntityErrorKind, TransactionErrorKind};
use sqlentity_testkit::RecordingConnection;

#[test]
fn find_returns_one_instance_per_row() {
    let conn = RecordingConnection::new();
    conn.respond("SELECT * FROM \"authors\"", vec![author_row(1, "Ursula")]);
    let mut em = blog(&conn);

    let first = em.find("Author", 1_i64).unwrap().expect("row exists");
    let second = em.find("Author", 1_i64).unwrap().expect("row exists");
    let reference = em.get_reference("Author", 1_i64).unwrap();

    assert!(first.ptr_eq(&second));
    assert!(first.ptr_eq(&reference));
    assert_eq!(conn.statements_starting_with("SELECT").len(), 1);
}

#[test]
fn find_missing_row_returns_none() {
    let conn = RecordingConnection::new();
    let mut em = blog(&conn);
    assert!(em.find("Author", 99_i64).unwrap().is_none());
    assert!(em.find("Author", Value::Null).unwrap().is_none());
}

#[test]
fn unchanged_entities_flush_nothing() {
    let conn = RecordingConnection::new();
    conn.respond("SELECT * FROM \"authors\"", vec![author_row(1, "Ursula")]);
    let mut em = blog(&conn);
    let ursula = em.find("Author", 1_i64).unwrap().expect("row exists");

    let result = em.flush().unwrap();
    assert!(result.is_empty());
    assert!(conn.writes().is_empty());

    ursula.set("name", "Ursula K. Le Guin").unwrap();
    assert_eq!(em.pending_counts().unwrap().updates, 1);
    let result = em.flush().unwrap();
    assert_eq!(result.updated, 1);

    let writes = conn.committed_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].sql, "UPDATE \"authors\" SET \"name\" = $1 WHERE \"id\" = $2");
    assert_eq!(
        writes[0].params,
        vec![Value::from("Ursula K. Le Guin"), Value::BigInt(1)]
    );

    // Setting a field back to its flushed value is not a change.
    ursula.set("name", "Ursula K. Le Guin").unwrap();
    assert!(em.pending_counts().unwrap().is_empty());
}

#[test]
fn referenced_rows_are_inserted_first() {
    let conn = RecordingConnection::new();
    let mut em = blog(&conn);

    let writer = author("Octavia");
    let novel = post(10, "Kindred");
    novel
        .set_association("author", Association::one(&writer))
        .unwrap();
    em.persist(&novel).unwrap();
    assert!(em.contains(&writer));

    let result = em.flush().unwrap();
    assert_eq!(result.inserted, 2);

    let writes = conn.committed_writes();
    assert!(writes[0].starts_with("INSERT INTO \"authors\""));
    assert!(writes[1].starts_with("INSERT INTO \"posts\""));
    assert_eq!(
        writes[1].params,
        vec![Value::BigInt(10), Value::from("Kindred"), Value::BigInt(1)]
    );
    assert_eq!(writer.get("id").unwrap(), Value::BigInt(1));
    assert_eq!(novel.get("author_id").unwrap(), Value::BigInt(1));
}

#[test]
fn removal_deletes_dependents_first() {
    let conn = RecordingConnection::new();
    let mut em = blog(&conn);
    em.begin().unwrap();

    let writer = author("Octavia");
    let novel = post(10, "Kindred");
    novel
        .set_association("author", Association::one(&writer))
        .unwrap();
    em.persist(&novel).unwrap();
    em.flush().unwrap();
    conn.clear_log();

    em.remove(&writer).unwrap();
    em.remove(&novel).unwrap();
    let result = em.flush().unwrap();
    assert_eq!(result.deleted, 2);

    let deletes: Vec<String> = conn
        .statements_starting_with("DELETE")
        .into_iter()
        .map(|statement| statement.sql)
        .collect();
    assert_eq!(
        deletes,
        vec![
            "DELETE FROM \"post_tags\" WHERE \"post_id\" = $1".to_string(),
            "DELETE FROM \"posts\" WHERE \"id\" = $1".to_string(),
            "DELETE FROM \"authors\" WHERE \"id\" = $1".to_string(),
        ]
    );
    assert!(!em.contains(&writer));
    assert!(!em.contains(&novel));
    em.commit().unwrap();
}

#[test]
fn removing_unmanaged_entity_is_rejected_without_sql() {
    let conn = RecordingConnection::new();
    let mut em = blog(&conn);
    let stray = post(5, "Never persisted");

    let err = em.remove(&stray).unwrap_err();
    assert!(err.is_not_managed());
    assert!(conn.sql_log().is_empty());
}

#[test]
fn assigned_identifier_must_be_set_before_persist() {
    let conn = RecordingConnection::new();
    let mut em = blog(&conn);

    let err = em.persist(&tag(None, "draft")).unwrap_err();
    assert_eq!(err.entity_kind(), Some(EntityErrorKind::MissingIdentifier));
    assert!(em.pending_counts().unwrap().is_empty());
}

#[test]
fn failed_unit_of_work_keeps_sibling_work() {
    let conn = RecordingConnection::new();
    let mut em = blog(&conn);
    em.begin().unwrap();

    let first = em.unit_of_work().id();
    em.persist(&post(1, "Kept")).unwrap();
    em.flush().unwrap();

    em.create_unit_of_work();
    em.persist(&post(2, "Rejected")).unwrap();
    conn.fail_once("INSERT INTO \"posts\"", "duplicate key");
    let err = em.flush().unwrap_err();
    assert!(err.is_write_failure());
    // The failed unit still holds its work for a retry.
    assert_eq!(em.pending_counts().unwrap().insertions, 1);

    let third = em.create_unit_of_work();
    em.persist(&post(3, "Also kept")).unwrap();
    em.flush().unwrap();
    assert_eq!(em.unit_of_work().id(), third);

    em.set_unit_of_work(first).unwrap();
    em.commit().unwrap();

    let committed: Vec<Value> = conn
        .committed_writes()
        .into_iter()
        .map(|statement| statement.params[0].clone())
        .collect();
    assert_eq!(committed, vec![Value::BigInt(1), Value::BigInt(3)]);
    assert!(conn.open_savepoints().is_empty());
}

#[test]
fn commit_without_transaction_is_rejected() {
    let conn = RecordingConnection::new();
    let mut em = blog(&conn);
    let err = em.commit().unwrap_err();
    assert_eq!(
        err.transaction_kind(),
        Some(TransactionErrorKind::NoActiveTransaction)
    );
    // Rolling back with nothing open is harmless.
    em.rollback().unwrap();
}

#[test]
fn rollback_forgets_managed_state() {
    let conn = RecordingConnection::new();
    let mut em = blog(&conn);
    em.begin().unwrap();
    let novel = post(1, "Lost");
    em.persist(&novel).unwrap();
    em.flush().unwrap();

    em.rollback().unwrap();
    assert!(!em.contains(&novel));
    assert!(conn.committed_writes().is_empty());
    assert!(em.pending_counts().unwrap().is_empty());
}

#[test]
fn refresh_discards_local_changes() {
    let conn = RecordingConnection::new();
    conn.respond("SELECT * FROM \"posts\"", vec![post_row(4, "Stored", None)]);
    let mut em = blog(&conn);
    let stored = em.find("Post", 4_i64).unwrap().expect("row exists");

    stored.set("title", "Edited").unwrap();
    em.refresh(&stored).unwrap();
    assert_eq!(stored.get("title").unwrap(), Value::from("Stored"));
    assert!(em.pending_counts().unwrap().is_empty());
}

#[test]
fn merge_copies_detached_state_onto_managed_instance() {
    let conn = RecordingConnection::new();
    conn.respond("SELECT * FROM \"posts\"", vec![post_row(4, "Stored", None)]);
    let mut em = blog(&conn);
    let managed = em.find("Post", 4_i64).unwrap().expect("row exists");

    let detached = post(4, "From elsewhere");
    let merged = em.merge(&detached).unwrap();
    assert!(merged.ptr_eq(&managed));
    assert!(!em.contains(&detached));
    assert_eq!(managed.get("title").unwrap(), Value::from("From elsewhere"));
    assert_eq!(em.pending_counts().unwrap().updates, 1);
}

#[test]
fn detach_drops_pending_changes() {
    let conn = RecordingConnection::new();
    let mut em = blog(&conn);
    let draft = post(8, "Draft");
    em.persist(&draft).unwrap();

    assert!(em.detach(&draft));
    assert!(!em.contains(&draft));
    assert!(em.flush().unwrap().is_empty());
    assert!(conn.writes().is_empty());
}
