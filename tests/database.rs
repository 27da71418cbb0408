use litedb::{BackendKind, Database, KeyType, KeyValue};
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn populate(db: &Database) {
    let table = db
        .create_table(
            "people",
            &[("id", &[KeyType::Int]), ("name", &[KeyType::Str])],
        )
        .unwrap();
    let mut table = table.borrow_mut();
    for (id, name) in [(1i64, "ada"), (2, "grace"), (3, "alan")] {
        table
            .add_row(
                &[
                    ("id", &[KeyValue::Int(id)] as &[KeyValue]),
                    ("name", &[KeyValue::from(name)] as &[KeyValue]),
                ],
                name.as_bytes(),
                true,
            )
            .unwrap();
    }
}

fn verify(db: &Database) {
    let table = db.table("people").unwrap().unwrap();
    let mut table = table.borrow_mut();
    assert_eq!(table.num_rows(), 3);
    for (id, name) in [(1i64, "ada"), (2, "grace"), (3, "alan")] {
        assert_eq!(
            table
                .find_one_bytes("id", &[KeyValue::Int(id)])
                .unwrap()
                .unwrap(),
            name.as_bytes()
        );
        assert_eq!(
            table
                .find_one_bytes("name", &[KeyValue::from(name)])
                .unwrap()
                .unwrap(),
            name.as_bytes()
        );
    }
}

#[test]
fn tables_persist_across_reopen() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("normal.db");

    {
        let db = Database::open(&path, false, BackendKind::Normal).unwrap();
        populate(&db);
        verify(&db);
    }
    {
        let db = Database::open(&path, false, BackendKind::Normal).unwrap();
        assert!(db.is_table_exists("people").unwrap());
        verify(&db);
    }
}

#[test]
fn cached_backend_behaves_like_normal() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cached.db");

    {
        let db = Database::open(&path, false, BackendKind::Cached).unwrap();
        populate(&db);
    }
    {
        let db = Database::open(&path, false, BackendKind::Cached).unwrap();
        verify(&db);
    }
    // the two backends write the same format
    {
        let db = Database::open(&path, false, BackendKind::Normal).unwrap();
        verify(&db);
    }
}

#[test]
fn read_only_opens_see_data_but_cannot_write() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.db");

    {
        let db = Database::open(&path, false, BackendKind::Normal).unwrap();
        populate(&db);
    }

    let db = Database::open(&path, true, BackendKind::Normal).unwrap();
    assert!(db.is_read_only());
    verify(&db);

    let table = db.table("people").unwrap().unwrap();
    let result = table
        .borrow_mut()
        .add_row(&[("id", &[KeyValue::Int(9)] as &[KeyValue])], b"x", false);
    assert!(result.is_err());
}

#[test]
fn read_only_open_of_missing_file_fails() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.db");
    assert!(Database::open(&path, true, BackendKind::Normal).is_err());
}

#[test]
fn writable_open_reinitializes_garbage_files() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.db");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(&[0xA5u8; 64 * 1024])
        .unwrap();

    // read-only refuses a corrupt catalog
    assert!(Database::open(&path, true, BackendKind::Normal).is_err());

    // writable starts the file over
    let db = Database::open(&path, false, BackendKind::Normal).unwrap();
    populate(&db);
    verify(&db);
}

#[test]
fn table_handles_are_cached_per_name() {
    init_logging();
    let db = Database::open(Path::new("unused"), false, BackendKind::Memory).unwrap();
    let created = db.create_table("t", &[("id", &[KeyType::Int])]).unwrap();
    let opened = db.table("t").unwrap().unwrap();
    assert!(Rc::ptr_eq(&created, &opened));
}

#[test]
fn missing_tables_are_none_not_errors() {
    init_logging();
    let db = Database::open(Path::new("unused"), false, BackendKind::Memory).unwrap();
    assert!(db.table("ghost").unwrap().is_none());
    assert!(!db.is_table_exists("ghost").unwrap());
    assert!(!db.delete_table("ghost").unwrap());
    assert!(db.query("ghost", "id", &[KeyValue::Int(1)]).unwrap().is_empty());
}

#[test]
fn create_twice_is_an_error() {
    init_logging();
    let db = Database::open(Path::new("unused"), false, BackendKind::Memory).unwrap();
    db.create_table("t", &[("id", &[KeyType::Int])]).unwrap();
    assert!(db.create_table("t", &[("id", &[KeyType::Int])]).is_err());
}

#[test]
fn deleted_tables_disappear_and_stay_gone() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("del.db");

    {
        let db = Database::open(&path, false, BackendKind::Normal).unwrap();
        populate(&db);
        assert!(db.delete_table("people").unwrap());
        assert!(!db.is_table_exists("people").unwrap());
        assert!(db.table("people").unwrap().is_none());
    }
    {
        let db = Database::open(&path, false, BackendKind::Normal).unwrap();
        assert!(!db.is_table_exists("people").unwrap());

        // the name is free for a brand-new table
        let table = db.create_table("people", &[("id", &[KeyType::Int])]).unwrap();
        table
            .borrow_mut()
            .add_row(&[("id", &[KeyValue::Int(1)] as &[KeyValue])], b"new", true)
            .unwrap();
        assert_eq!(db.rows("people").unwrap(), vec![b"new".to_vec()]);
    }
}

#[test]
fn query_and_rows_pass_through() {
    init_logging();
    let db = Database::open(Path::new("unused"), false, BackendKind::Memory).unwrap();
    populate(&db);

    let hits = db.query("people", "name", &[KeyValue::from("ada")]).unwrap();
    assert_eq!(hits, vec![b"ada".to_vec()]);
    assert_eq!(db.rows("people").unwrap().len(), 3);
}

#[test]
fn interned_string_ids_are_stable_across_reopen() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("intern.db");

    {
        let db = Database::open(&path, false, BackendKind::Normal).unwrap();
        populate(&db);
    }

    // "grace" was interned in the first session; finding by it after
    // reopen exercises the persisted hash index end to end
    let db = Database::open(&path, false, BackendKind::Normal).unwrap();
    let table = db.table("people").unwrap().unwrap();
    let mut table = table.borrow_mut();
    assert_eq!(
        table
            .find_one_bytes("name", &[KeyValue::from("grace")])
            .unwrap()
            .unwrap(),
        b"grace"
    );
}
