use std::sync::Arc;

use idb_codec::key::{Key, KeyPath, KeyRange};
use idb_codec::value::Value;
use idb_storage::memory::MemoryBackend;
use idb_storage::sqlite::SqliteBackend;
use idb_storage::{Direction, TxMode};
use indexeddb::{EventKind, Factory, IdbError};
use pretty_assertions::assert_eq;

fn memory_factory() -> Factory<MemoryBackend> {
    Factory::new(Arc::new(MemoryBackend::new())).expect("factory construction cannot fail")
}

#[test]
fn put_and_get_round_trip_with_auto_increment_keys() {
    let factory = memory_factory();
    let conn = factory
        .open("shop", Some(1), |txn, _old, _new| {
            txn.create_object_store("widgets", KeyPath::None, true)?;
            Ok(())
        })
        .unwrap();

    let first_add = conn
        .transaction(&["widgets"], TxMode::ReadWrite, |txn| {
            let store = txn.object_store("widgets")?;
            store.add(Value::object(vec![("name".to_string(), Value::String("bolt".into()))]), None)
        })
        .unwrap();
    let first_key = first_add.result().expect("delivered").expect("add succeeded");
    assert_eq!(first_key, Key::Number(1.0));

    let second_add = conn
        .transaction(&["widgets"], TxMode::ReadWrite, |txn| {
            let store = txn.object_store("widgets")?;
            store.add(Value::object(vec![("name".to_string(), Value::String("nut".into()))]), None)
        })
        .unwrap();
    assert_eq!(second_add.result(), Some(Ok(Key::Number(2.0))));

    let get_request = conn
        .transaction(&["widgets"], TxMode::ReadOnly, |txn| txn.object_store("widgets")?.get(&first_key))
        .unwrap();
    let value = get_request.result().unwrap().unwrap().expect("record exists");
    match value {
        Value::Object(entries) => {
            let entries = entries.borrow();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].0, "name");
            match &entries[0].1 {
                Value::String(name) => assert_eq!(name, "bolt"),
                other => panic!("expected a string, got {other:?}", other = std::any::type_name_of_val(other)),
            }
        }
        _ => panic!("expected an object"),
    }
}

#[test]
fn a_unique_index_violation_aborts_the_whole_transaction() {
    let factory = memory_factory();
    let conn = factory
        .open("shop", Some(1), |txn, _old, _new| {
            txn.create_object_store("widgets", KeyPath::Single("sku".into()), false)?;
            txn.object_store("widgets")?
                .create_index("by_name", KeyPath::Single("name".into()), true, false)?;
            Ok(())
        })
        .unwrap();

    let (first, second) = conn
        .transaction(&["widgets"], TxMode::ReadWrite, |txn| {
            let store = txn.object_store("widgets")?;
            let first = store.add(
                Value::object(vec![
                    ("sku".to_string(), Value::String("a".into())),
                    ("name".to_string(), Value::String("bolt".into())),
                ]),
                None,
            )?;
            let second = store.add(
                Value::object(vec![
                    ("sku".to_string(), Value::String("b".into())),
                    ("name".to_string(), Value::String("bolt".into())),
                ]),
                None,
            )?;
            Ok((first, second))
        })
        .unwrap();

    // The first request had already reported success before the second
    // request's failure aborted the transaction; the backend mutation it
    // reported, though, is rolled back along with everything else.
    assert_eq!(first.result(), Some(Ok(Key::String("a".into()))));
    assert!(matches!(second.result(), Some(Err(IdbError::Constraint(_)))));

    let remaining = conn
        .transaction(&["widgets"], TxMode::ReadOnly, |txn| txn.object_store("widgets")?.count(None))
        .unwrap();
    assert_eq!(remaining.result(), Some(Ok(0)));
}

#[test]
fn a_multi_entry_index_indexes_each_array_element() {
    let factory = memory_factory();
    let conn = factory
        .open("catalog", Some(1), |txn, _old, _new| {
            txn.create_object_store("posts", KeyPath::None, true)?;
            txn.object_store("posts")?
                .create_index("by_tag", KeyPath::Single("tags".into()), false, true)?;
            Ok(())
        })
        .unwrap();

    conn.transaction(&["posts"], TxMode::ReadWrite, |txn| {
        let store = txn.object_store("posts")?;
        store.add(
            Value::object(vec![
                ("title".to_string(), Value::String("hello".into())),
                (
                    "tags".to_string(),
                    Value::array(vec![Value::String("rust".into()), Value::String("db".into())]),
                ),
            ]),
            None,
        )
    })
    .unwrap();

    for tag in ["rust", "db"] {
        let matches = conn
            .transaction(&["posts"], TxMode::ReadOnly, |txn| {
                txn.index("posts", "by_tag")?
                    .get_all_keys(Some(&KeyRange::only(&Key::String(tag.to_string()))), None)
            })
            .unwrap();
        assert_eq!(matches.result(), Some(Ok(vec![Key::Number(1.0)])));
    }
}

#[test]
fn cursor_continue_rejects_a_target_that_is_not_strictly_ahead() {
    let factory = memory_factory();
    let conn = factory
        .open("catalog", Some(1), |txn, _old, _new| {
            txn.create_object_store("items", KeyPath::None, false)?;
            Ok(())
        })
        .unwrap();

    conn.transaction(&["items"], TxMode::ReadWrite, |txn| {
        let store = txn.object_store("items")?;
        store.put(Value::String("a".into()), Some(Key::Number(1.0)))?;
        store.put(Value::String("b".into()), Some(Key::Number(2.0)))?;
        store.put(Value::String("c".into()), Some(Key::Number(3.0)))?;
        Ok(())
    })
    .unwrap();

    let advanced = conn
        .transaction(&["items"], TxMode::ReadOnly, |txn| {
            let store = txn.object_store("items")?;
            let cursor = store.open_cursor(None, Direction::Forward)?.expect("first record");
            assert_eq!(cursor.key().unwrap(), Key::Number(1.0));

            let rejected = cursor.continue_to(&Key::Number(1.0));
            assert!(matches!(rejected, Err(IdbError::Data(_))));

            cursor.continue_to(&Key::Number(3.0))
        })
        .unwrap();
    assert_eq!(advanced.result(), Some(Ok(true)));
}

#[test]
fn continue_primary_key_walks_a_non_unique_index_to_an_exact_position() {
    let factory = memory_factory();
    let conn = factory
        .open("catalog", Some(1), |txn, _old, _new| {
            txn.create_object_store("items", KeyPath::None, false)?;
            txn.object_store("items")?
                .create_index("by_group", KeyPath::Single("group".into()), false, false)?;
            Ok(())
        })
        .unwrap();

    conn.transaction(&["items"], TxMode::ReadWrite, |txn| {
        let store = txn.object_store("items")?;
        for n in 1..=3 {
            store.put(
                Value::object(vec![("group".to_string(), Value::String("x".into()))]),
                Some(Key::Number(n as f64)),
            )?;
        }
        Ok(())
    })
    .unwrap();

    let request = conn
        .transaction(&["items"], TxMode::ReadOnly, |txn| {
            let index = txn.index("items", "by_group")?;
            let cursor = index.open_cursor(None, Direction::Forward)?.expect("first match");
            assert_eq!(cursor.primary_key().unwrap(), Key::Number(1.0));
            cursor.continue_primary_key(&Key::String("x".into()), &Key::Number(3.0))
        })
        .unwrap();
    assert_eq!(request.result(), Some(Ok(true)));
}

#[test]
fn opening_a_newer_version_blocks_until_the_older_connection_closes() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = Factory::new(backend).unwrap();

    let v1 = factory
        .open("accounts", Some(1), |txn, _old, _new| {
            txn.create_object_store("users", KeyPath::None, true)?;
            Ok(())
        })
        .unwrap();

    // The connection closes itself as soon as it is asked to step aside;
    // `open` should block on that happening rather than fail immediately.
    let v1_for_listener = v1.clone();
    v1.events()
        .add_listener(EventKind::VersionChange, false, move |_event| v1_for_listener.close());

    let v2 = factory
        .open("accounts", Some(2), |txn, _old, _new| {
            txn.create_object_store("sessions", KeyPath::None, true)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(v2.version(), 2);
    assert!(v1.is_closed());
}

#[test]
fn opening_a_newer_version_times_out_if_the_blocker_never_closes() {
    let backend = Arc::new(MemoryBackend::new());
    let factory = Factory::new(backend).unwrap();

    let v1 = factory
        .open("accounts", Some(1), |txn, _old, _new| {
            txn.create_object_store("users", KeyPath::None, true)?;
            Ok(())
        })
        .unwrap();

    let err = factory
        .open("accounts", Some(2), |txn, _old, _new| {
            txn.create_object_store("sessions", KeyPath::None, true)?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, IdbError::InvalidState(_)));
    assert!(!v1.is_closed());
}

#[test]
fn deleting_while_iterating_sticks_on_commit_and_unwinds_on_abort() {
    let factory = memory_factory();
    let conn = factory
        .open("catalog", Some(1), |txn, _old, _new| {
            txn.create_object_store("items", KeyPath::None, false)?;
            Ok(())
        })
        .unwrap();

    conn.transaction(&["items"], TxMode::ReadWrite, |txn| {
        let store = txn.object_store("items")?;
        store.put(Value::String("a".into()), Some(Key::Number(1.0)))?;
        store.put(Value::String("b".into()), Some(Key::Number(2.0)))?;
        Ok(())
    })
    .unwrap();

    conn.transaction(&["items"], TxMode::ReadWrite, |txn| {
        let store = txn.object_store("items")?;
        let cursor = store.open_cursor(None, Direction::Forward)?.expect("first record");
        assert_eq!(cursor.primary_key().unwrap(), Key::Number(1.0));
        cursor.delete()?;
        Ok(())
    })
    .unwrap();

    let after_commit = conn
        .transaction(&["items"], TxMode::ReadOnly, |txn| txn.object_store("items")?.count(None))
        .unwrap();
    assert_eq!(after_commit.result(), Some(Ok(1)));

    let aborted = conn.transaction(&["items"], TxMode::ReadWrite, |txn| {
        let store = txn.object_store("items")?;
        let cursor = store.open_cursor(None, Direction::Forward)?.expect("remaining record");
        cursor.delete()?;
        txn.abort()?;
        Ok(())
    });
    assert!(aborted.is_ok());

    let after_abort = conn
        .transaction(&["items"], TxMode::ReadOnly, |txn| txn.object_store("items")?.count(None))
        .unwrap();
    assert_eq!(after_abort.result(), Some(Ok(1)));
}

#[test]
fn the_engine_behaves_the_same_over_the_sqlite_backend() {
    let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
    let factory = Factory::new(backend).unwrap();
    let conn = factory
        .open("shop", Some(1), |txn, _old, _new| {
            txn.create_object_store("widgets", KeyPath::None, true)?;
            Ok(())
        })
        .unwrap();

    let add_request = conn
        .transaction(&["widgets"], TxMode::ReadWrite, |txn| {
            txn.object_store("widgets")?.add(Value::String("bolt".into()), None)
        })
        .unwrap();
    assert_eq!(add_request.result(), Some(Ok(Key::Number(1.0))));
}
