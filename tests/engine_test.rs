//! End-to-end scenarios through the database facade.

use basalt::engine::{recover, Database};
use basalt::heap::HeapTable;
use basalt::page::Page;
use basalt::value::{Column, DataType, Schema, Tuple, Value};
use basalt::wal::{WalManager, WalRecord};
use basalt::{Error, PAGE_SIZE};
use tempfile::{tempdir, TempDir};

fn users_schema() -> Schema {
    Schema::new(vec![
        Column::new("id", DataType::Integer, 0),
        Column::new("name", DataType::Varchar, 32),
    ])
}

fn open_db(dir: &TempDir) -> Database {
    Database::open(dir.path().join("db")).unwrap()
}

fn user(n: i32, name: &str) -> Vec<Value> {
    vec![Value::Integer(n), Value::Varchar(name.to_string())]
}

#[test]
fn insert_and_select_round_trip() {
    let dir = tempdir().unwrap();
    let mut db = open_db(&dir);

    db.create_table("users", users_schema()).unwrap();
    for (n, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        db.insert("users", user(n, name)).unwrap();
    }

    let rows = db.select_all("users").unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(
        rows[0].values,
        vec![Value::Integer(1), Value::Varchar("alice".to_string())]
    );
    assert_eq!(
        rows[2].values,
        vec![Value::Integer(3), Value::Varchar("carol".to_string())]
    );
}

#[test]
fn index_probe_returns_the_matching_row() {
    let dir = tempdir().unwrap();
    let mut db = open_db(&dir);

    db.create_table("users", users_schema()).unwrap();
    for (n, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        db.insert("users", user(n, name)).unwrap();
    }
    db.create_index("users", "name").unwrap();

    let rows = db
        .select_where("users", "name", &Value::Varchar("bob".to_string()))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, 2);
    assert_eq!(rows[0].values[0], Value::Integer(2));
}

#[test]
fn tables_survive_close_and_reopen() {
    let dir = tempdir().unwrap();
    {
        let mut db = open_db(&dir);
        db.create_table("users", users_schema()).unwrap();
        db.insert("users", user(1, "alice")).unwrap();
        db.insert("users", user(2, "bob")).unwrap();
        db.close().unwrap();
    }

    let db = open_db(&dir);
    assert_eq!(db.list_tables(), vec!["users".to_string()]);
    assert_eq!(db.table_schema("users").unwrap(), users_schema());

    let rows = db.select_all("users").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[1].values[1],
        Value::Varchar("bob".to_string())
    );
}

#[test]
fn duplicate_table_and_unknown_table_errors() {
    let dir = tempdir().unwrap();
    let mut db = open_db(&dir);

    db.create_table("users", users_schema()).unwrap();
    assert!(matches!(
        db.create_table("users", users_schema()),
        Err(Error::AlreadyExists(_))
    ));
    assert!(matches!(db.select_all("ghosts"), Err(Error::NotFound(_))));
    assert!(matches!(
        db.insert("ghosts", user(1, "x")),
        Err(Error::NotFound(_))
    ));

    db.drop_table("users").unwrap();
    assert!(db.list_tables().is_empty());
}

#[test]
fn single_session_transaction_discipline() {
    let dir = tempdir().unwrap();
    let mut db = open_db(&dir);

    assert!(matches!(
        db.commit(),
        Err(Error::TransactionState { .. })
    ));
    assert!(matches!(
        db.rollback(),
        Err(Error::TransactionState { .. })
    ));

    let tx = db.begin().unwrap();
    assert!(db.in_transaction());
    assert_eq!(db.current_transaction_id(), Some(tx));
    assert!(matches!(db.begin(), Err(Error::TransactionState { .. })));

    db.commit().unwrap();
    assert!(!db.in_transaction());
}

#[test]
fn transactional_insert_locks_and_logs() {
    let dir = tempdir().unwrap();
    let mut db = open_db(&dir);
    db.create_table("users", users_schema()).unwrap();

    let tx = db.begin().unwrap();
    db.insert("users", user(1, "alice")).unwrap();
    assert_eq!(db.transaction_manager().locked_pages(tx), vec![1]);
    db.commit().unwrap();
    assert!(db.transaction_manager().locked_pages(tx).is_empty());

    let rows = db.select_all("users").unwrap();
    assert_eq!(rows.len(), 1);
}

#[test]
fn conflicting_writer_is_denied() {
    let dir = tempdir().unwrap();
    let mut db = open_db(&dir);
    db.create_table("users", users_schema()).unwrap();

    // another transaction grabs the first data page directly
    let rival = db.transaction_manager().begin().unwrap();
    assert!(db
        .transaction_manager()
        .acquire_lock(rival, 1, basalt::lock_manager::LockMode::Exclusive)
        .unwrap());

    db.begin().unwrap();
    assert!(matches!(
        db.insert("users", user(1, "alice")),
        Err(Error::LockDenied(1))
    ));

    db.transaction_manager().commit(rival).unwrap();
    let id = db.insert("users", user(1, "alice")).unwrap();
    assert_eq!(id, 1);
    db.commit().unwrap();
}

#[test]
fn uncommitted_work_is_undone_on_reopen() {
    let dir = tempdir().unwrap();
    {
        let mut db = open_db(&dir);
        db.create_table("users", users_schema()).unwrap();
        db.insert("users", user(1, "durable")).unwrap();

        db.begin().unwrap();
        db.insert("users", user(2, "doomed")).unwrap();
        // no commit: dropping the handle stands in for a crash, and the
        // drop-time flush writes the uncommitted page to disk
    }

    let db = open_db(&dir);
    let rows = db.select_all("users").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values[1], Value::Varchar("durable".to_string()));
}

#[test]
fn committed_work_is_redone_from_the_log() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("db");

    // build the after-image of a page holding one committed row
    let mut page = Page::new(1);
    page.format();
    let row = Tuple::with_id(
        1,
        vec![Value::Integer(7), Value::Varchar("redone".to_string())],
    );
    assert!(page.append_tuple(&row).unwrap());

    // a log whose data file never saw the write
    let mut wal = WalManager::open(dir.path().join("db.log")).unwrap();
    wal.append(&WalRecord::Begin { tx_id: 1 }).unwrap();
    wal.append(&WalRecord::PageWrite {
        tx_id: 1,
        table: "users".to_string(),
        page_id: 1,
        before: vec![0; PAGE_SIZE],
        after: page.data.to_vec(),
    })
    .unwrap();
    wal.append(&WalRecord::Commit { tx_id: 1 }).unwrap();
    drop(wal);

    let highest = recover(&base).unwrap();
    assert_eq!(highest, 1);

    let table = HeapTable::open("users", users_schema(), dir.path().join("db.users")).unwrap();
    let rows = table.select_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, 1);
    assert_eq!(rows[0].values[1], Value::Varchar("redone".to_string()));
}

#[test]
fn checkpoint_truncates_the_log() {
    let dir = tempdir().unwrap();
    let mut db = open_db(&dir);
    db.create_table("users", users_schema()).unwrap();

    db.begin().unwrap();
    db.insert("users", user(1, "alice")).unwrap();
    db.commit().unwrap();

    let log_path = dir.path().join("db.log");
    assert!(std::fs::metadata(&log_path).unwrap().len() > 0);

    db.checkpoint().unwrap();
    assert_eq!(std::fs::metadata(&log_path).unwrap().len(), 0);

    // the data outlives the discarded log
    drop(db);
    let db = open_db(&dir);
    assert_eq!(db.select_all("users").unwrap().len(), 1);
}

#[test]
fn page_overflow_chains_through_the_facade() {
    let dir = tempdir().unwrap();
    let mut db = open_db(&dir);
    db.create_table("users", users_schema()).unwrap();

    // 524-byte rows: seven per page
    for n in 0..8 {
        db.insert(
            "users",
            vec![Value::Integer(n), Value::Varchar("x".repeat(500))],
        )
        .unwrap();
    }

    let rows = db.select_all("users").unwrap();
    assert_eq!(rows.len(), 8);
    let stats = db.stats().unwrap();
    assert_eq!(stats.tables.len(), 1);
    assert_eq!(stats.tables[0].tuple_count, 8);
}

#[test]
fn statistics_report_cache_and_transaction_activity() {
    let dir = tempdir().unwrap();
    let mut db = open_db(&dir);
    db.create_table("users", users_schema()).unwrap();
    db.insert("users", user(1, "alice")).unwrap();
    db.select_all("users").unwrap();

    let stats = db.stats().unwrap();
    let users = &stats.tables[0];
    assert_eq!(users.name, "users");
    assert_eq!(users.tuple_count, 1);
    assert!(users.page_hits > 0);
    assert!(users.page_misses > 0);
    assert!(users.hit_ratio > 0.0 && users.hit_ratio < 1.0);
    assert_eq!(stats.active_transactions, 0);

    db.begin().unwrap();
    assert_eq!(db.stats().unwrap().active_transactions, 1);
    db.rollback().unwrap();
    assert_eq!(db.stats().unwrap().active_transactions, 0);
}

#[test]
fn update_and_delete_through_the_facade() {
    let dir = tempdir().unwrap();
    let mut db = open_db(&dir);
    db.create_table("users", users_schema()).unwrap();
    db.insert("users", user(1, "alice")).unwrap();
    db.insert("users", user(2, "bob")).unwrap();

    db.update("users", 1, user(1, "alicia")).unwrap();
    db.delete("users", 2).unwrap();

    let rows = db.select_all("users").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, 1);
    assert_eq!(rows[0].values[1], Value::Varchar("alicia".to_string()));

    assert!(matches!(db.delete("users", 2), Err(Error::NotFound(_))));
    assert!(matches!(
        db.update("users", 1, vec![Value::Integer(1)]),
        Err(Error::SchemaMismatch(_))
    ));
}
