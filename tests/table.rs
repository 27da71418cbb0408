use litedb::{BackendKind, Database, KeyType, KeyValue};
use std::path::Path;

fn memory_db() -> Database {
    let _ = env_logger::builder().is_test(true).try_init();
    Database::open(Path::new("unused"), false, BackendKind::Memory).unwrap()
}

fn int_keys(value: i64) -> [KeyValue; 1] {
    [KeyValue::Int(value)]
}

#[test]
fn integer_index_round_trip() {
    let db = memory_db();
    let table = db.create_table("numbers", &[("id", &[KeyType::Int])]).unwrap();
    let mut table = table.borrow_mut();

    let count = 65_536i64;
    for key in 0..count {
        let inserted = table
            .add_row(&[("id", &int_keys(key))], &key.to_le_bytes(), false)
            .unwrap();
        assert!(inserted);
    }
    assert_eq!(table.num_rows(), count as i32);

    for key in (0..count).step_by(131) {
        let payload = table.find_one_bytes("id", &int_keys(key)).unwrap().unwrap();
        assert_eq!(payload, key.to_le_bytes());
    }
    assert!(table.find_one_bytes("id", &int_keys(count)).unwrap().is_none());
    assert_eq!(table.get_rows().unwrap().len(), count as usize);
}

// the full-size variant of the round trip; takes a while
#[test]
#[ignore]
fn integer_index_round_trip_full() {
    let db = memory_db();
    let table = db.create_table("numbers", &[("id", &[KeyType::Int])]).unwrap();
    let mut table = table.borrow_mut();

    let count = 1_048_576i64;
    for key in 0..count {
        table
            .add_row(&[("id", &int_keys(key))], &key.to_le_bytes(), false)
            .unwrap();
    }

    for key in 0..count {
        let payload = table.find_one_bytes("id", &int_keys(key)).unwrap().unwrap();
        assert_eq!(payload, key.to_le_bytes());
    }
    assert_eq!(table.get_rows().unwrap().len(), count as usize);
}

#[test]
fn tombstoned_slots_are_reused_in_place() {
    let db = memory_db();
    let table = db.create_table("queue", &[("id", &[KeyType::Int])]).unwrap();
    let mut table = table.borrow_mut();

    table.add_row(&[("id", &int_keys(7))], b"A", false).unwrap();
    table.add_row(&[("id", &int_keys(7))], b"B", false).unwrap();
    table.add_row(&[("id", &int_keys(8))], b"D", false).unwrap();
    assert_eq!(table.num_rows(), 3);

    assert!(table.remove_row("id", &int_keys(7)).unwrap());
    assert_eq!(table.num_rows(), 1);
    assert!(table.find("id", &int_keys(7)).unwrap().is_empty());

    // C lands in the slot A vacated, so it precedes D in slot order
    table.add_row(&[("id", &int_keys(7))], b"C", false).unwrap();
    assert_eq!(table.num_rows(), 2);
    let rows = table.get_rows().unwrap();
    assert_eq!(rows, vec![b"C".to_vec(), b"D".to_vec()]);
}

#[test]
fn duplicate_keys_return_every_payload() {
    let db = memory_db();
    let table = db.create_table("multi", &[("id", &[KeyType::Int])]).unwrap();
    let mut table = table.borrow_mut();

    for payload in [b"one".as_slice(), b"two", b"three"] {
        table.add_row(&[("id", &int_keys(42))], payload, false).unwrap();
    }

    let rows = table.find("id", &int_keys(42)).unwrap();
    assert_eq!(rows, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);

    // visitation stops at the first acceptance
    let mut seen = 0;
    table
        .find_one("id", &int_keys(42), |_| {
            seen += 1;
            true
        })
        .unwrap();
    assert_eq!(seen, 1);
}

#[test]
fn unique_insert_rejects_existing_keys() {
    let db = memory_db();
    let table = db.create_table("users", &[("id", &[KeyType::Int])]).unwrap();
    let mut table = table.borrow_mut();

    assert!(table.add_row(&[("id", &int_keys(1))], b"first", true).unwrap());
    assert!(!table.add_row(&[("id", &int_keys(1))], b"second", true).unwrap());
    assert_eq!(table.num_rows(), 1);

    // a removed key can be inserted again
    table.remove_row("id", &int_keys(1)).unwrap();
    assert!(table.add_row(&[("id", &int_keys(1))], b"third", true).unwrap());
    assert_eq!(
        table.find_one_bytes("id", &int_keys(1)).unwrap().unwrap(),
        b"third"
    );
}

#[test]
fn string_keys_compare_by_content() {
    let db = memory_db();
    let table = db.create_table("names", &[("name", &[KeyType::Str])]).unwrap();
    let mut table = table.borrow_mut();

    table
        .add_row(&[("name", &[KeyValue::from("ada")] as &[KeyValue])], b"1815", true)
        .unwrap();
    table
        .add_row(&[("name", &[KeyValue::from("grace")] as &[KeyValue])], b"1906", true)
        .unwrap();

    assert_eq!(
        table
            .find_one_bytes("name", &[KeyValue::from("ada")])
            .unwrap()
            .unwrap(),
        b"1815"
    );
    // a string that was never interned cannot match anything
    assert!(table
        .find_one_bytes("name", &[KeyValue::from("alan")])
        .unwrap()
        .is_none());
}

#[test]
fn multiple_indexes_address_the_same_rows() {
    let db = memory_db();
    let table = db
        .create_table(
            "people",
            &[("id", &[KeyType::Int]), ("name", &[KeyType::Str])],
        )
        .unwrap();
    let mut table = table.borrow_mut();

    let rows: [(i64, &str, &[u8]); 3] = [
        (1, "ada", b"lovelace"),
        (2, "grace", b"hopper"),
        (3, "alan", b"turing"),
    ];
    for (id, name, payload) in rows {
        table
            .add_row(
                &[
                    ("id", &int_keys(id)),
                    ("name", &[KeyValue::from(name)] as &[KeyValue]),
                ],
                payload,
                true,
            )
            .unwrap();
    }

    for (id, name, payload) in rows {
        assert_eq!(
            table.find_one_bytes("id", &int_keys(id)).unwrap().unwrap(),
            payload
        );
        assert_eq!(
            table
                .find_one_bytes("name", &[KeyValue::from(name)])
                .unwrap()
                .unwrap(),
            payload
        );
    }

    // removal through one index is visible through the other
    table.remove_row("name", &[KeyValue::from("grace")]).unwrap();
    assert!(table.find_one_bytes("id", &int_keys(2)).unwrap().is_none());
    assert_eq!(table.num_rows(), 2);
}

#[test]
fn composite_keys_match_component_wise() {
    let db = memory_db();
    let table = db
        .create_table("events", &[("at", &[KeyType::Int, KeyType::Str])])
        .unwrap();
    let mut table = table.borrow_mut();

    let key_a = [KeyValue::Int(10), KeyValue::from("login")];
    let key_b = [KeyValue::Int(10), KeyValue::from("logout")];
    table.add_row(&[("at", &key_a)], b"a", false).unwrap();
    table.add_row(&[("at", &key_b)], b"b", false).unwrap();

    assert_eq!(table.find_one_bytes("at", &key_a).unwrap().unwrap(), b"a");
    assert_eq!(table.find_one_bytes("at", &key_b).unwrap().unwrap(), b"b");
    assert!(table
        .find_one_bytes("at", &[KeyValue::Int(11), KeyValue::from("login")])
        .unwrap()
        .is_none());
}

#[test]
fn update_row_replaces_the_payload() {
    let db = memory_db();
    let table = db.create_table("config", &[("key", &[KeyType::Str])]).unwrap();
    let mut table = table.borrow_mut();

    let key = [KeyValue::from("volume")];
    table.add_row(&[("key", &key)], b"30", true).unwrap();
    assert!(table.update_row("key", &key, b"80").unwrap());
    assert_eq!(table.find_one_bytes("key", &key).unwrap().unwrap(), b"80");
    assert_eq!(table.num_rows(), 1);

    assert!(!table
        .update_row("key", &[KeyValue::from("missing")], b"x")
        .unwrap());
}

#[test]
fn string_payload_helpers_round_trip() {
    let db = memory_db();
    let table = db.create_table("notes", &[("id", &[KeyType::Int])]).unwrap();
    let mut table = table.borrow_mut();

    table
        .add_row_str(&[("id", &int_keys(5))], "hello wörld", true)
        .unwrap();
    assert_eq!(
        table.find_one_str("id", &int_keys(5)).unwrap().unwrap(),
        "hello wörld"
    );
}

#[test]
fn unknown_index_is_an_error() {
    let db = memory_db();
    let table = db.create_table("t", &[("id", &[KeyType::Int])]).unwrap();
    let mut table = table.borrow_mut();
    assert!(table.find("nope", &int_keys(1)).is_err());
}

#[test]
fn empty_payload_rows_are_live() {
    let db = memory_db();
    let table = db.create_table("flags", &[("id", &[KeyType::Int])]).unwrap();
    let mut table = table.borrow_mut();

    table.add_row(&[("id", &int_keys(1))], b"", false).unwrap();
    assert_eq!(table.find_one_bytes("id", &int_keys(1)).unwrap().unwrap(), b"");
    assert_eq!(table.get_rows().unwrap(), vec![Vec::<u8>::new()]);
}
