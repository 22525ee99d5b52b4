use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::{json, Value};
use smartstore::{
    AlterSoupOperation, AlterSoupStep, Error, IndexSpec, IndexType, KeyValueCachedStore,
    KeyValueEncryptedFileStore, KeyValueStore, Order, QuerySpec, SmartStore, SoupFeature, SoupSpec,
    StoreConfig, StoreCursor, StoreEvent, StoreEventSink, SOUP_ENTRY_ID,
};
use tempfile::tempdir;

fn employee_specs() -> Vec<IndexSpec> {
    vec![
        IndexSpec::new("employeeId", IndexType::String),
        IndexSpec::new("firstName", IndexType::String),
        IndexSpec::new("lastName", IndexType::String),
        IndexSpec::new("salary", IndexType::Integer),
    ]
}

fn id_of(element: &Value) -> i64 {
    element[SOUP_ENTRY_ID].as_i64().unwrap()
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<StoreEvent>>,
}

impl StoreEventSink for RecordingSink {
    fn on_event(&self, event: &StoreEvent) {
        self.events.lock().push(event.clone());
    }
}

#[test]
fn test_round_trip_paging_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    {
        let store = SmartStore::open(StoreConfig::new(&path)).unwrap();
        store.register_soup("employees", &employee_specs()).unwrap();
        for i in 0..25 {
            store
                .create(
                    "employees",
                    json!({"employeeId": format!("e{:02}", i), "lastName": format!("L{:02}", 24 - i), "salary": i}),
                )
                .unwrap();
        }
    }

    let store = SmartStore::open(StoreConfig::new(&path)).unwrap();
    let first = store.retrieve("employees", &[1]).unwrap();
    assert_eq!(first[0]["employeeId"], json!("e00"));
    assert!(first[0]["_soupCreatedDate"].is_i64());

    let spec = QuerySpec::all("employees", Some("lastName"), Order::Ascending, 10);
    assert_eq!(store.count_query(&spec).unwrap(), 25);
    let mut seen = Vec::new();
    for page in 0..3 {
        let rows = store.query(&spec, page).unwrap();
        assert_eq!(rows.len(), if page < 2 { 10 } else { 5 });
        seen.extend(rows.into_iter().map(|r| r["lastName"].as_str().unwrap().to_string()));
    }
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted);
    assert_eq!(seen.len(), 25);
    assert!(store.query(&spec, 3).unwrap().is_empty());
}

#[test]
fn test_smart_sql_queries() {
    let store = SmartStore::open(StoreConfig::memory()).unwrap();
    store.register_soup("employees", &employee_specs()).unwrap();
    store.register_soup("departments", &[IndexSpec::new("code", IndexType::String)]).unwrap();
    store.create("employees", json!({"firstName": "Ann", "lastName": "Young", "dept": "eng"})).unwrap();
    store.create("employees", json!({"firstName": "Bob", "lastName": "Adams", "dept": "ops"})).unwrap();
    store.create("departments", json!({"code": "eng", "title": "Engineering"})).unwrap();

    let names = QuerySpec::smart(
        "select {employees:firstName} from {employees} order by {employees:lastName}",
        10,
    );
    assert_eq!(store.query_raw(&names, 0).unwrap(), r#"[["Bob"],["Ann"]]"#);

    // Unindexed paths and aliased joins go through json_extract.
    let join = QuerySpec::smart(
        "select e.{employees:firstName}, d.{departments:title} from {employees} e, {departments} d \
         where e.{employees:dept} = d.{departments:code}",
        10,
    );
    assert_eq!(store.query(&join, 0).unwrap(), vec![json!(["Ann", "Engineering"])]);
    assert_eq!(store.count_query(&join).unwrap(), 1);

    let err = store
        .query(&QuerySpec::smart("select {nosuch:x} from {nosuch}", 10), 0)
        .unwrap_err();
    assert!(matches!(err, Error::SmartSql { position: 7, .. }));
    assert!(matches!(
        store.query(&QuerySpec::smart("drop table {employees}", 10), 0),
        Err(Error::InvalidOperation(_))
    ));
}

#[test]
fn test_upsert_with_external_id() {
    let store = SmartStore::open(StoreConfig::memory()).unwrap();
    store.register_soup("employees", &employee_specs()).unwrap();

    let created = store
        .upsert("employees", json!({"employeeId": "007", "salary": 100}), "employeeId")
        .unwrap();
    let updated = store
        .upsert("employees", json!({"employeeId": "007", "salary": 200}), "employeeId")
        .unwrap();
    assert_eq!(id_of(&created), id_of(&updated));
    assert_eq!(store.retrieve("employees", &[id_of(&created)]).unwrap()[0]["salary"], json!(200));

    // Upsert by entry id.
    let mut changed = updated.clone();
    changed["salary"] = json!(300);
    let again = store.upsert("employees", changed, SOUP_ENTRY_ID).unwrap();
    assert_eq!(id_of(&again), id_of(&created));
    let fresh = store.upsert("employees", json!({"employeeId": "008"}), SOUP_ENTRY_ID).unwrap();
    assert_ne!(id_of(&fresh), id_of(&created));

    assert!(matches!(
        store.upsert("employees", json!({"employeeId": null}), "employeeId"),
        Err(Error::InvalidOperation(_))
    ));
}

#[test]
fn test_full_text_match() {
    let store = SmartStore::open(StoreConfig::memory()).unwrap();
    store
        .register_soup(
            "notes",
            &[IndexSpec::new("title", IndexType::String), IndexSpec::new("body", IndexType::FullText)],
        )
        .unwrap();
    let a = store.create("notes", json!({"title": "a", "body": "the quick brown fox"})).unwrap();
    store.create("notes", json!({"title": "b", "body": "lazy dogs sleep"})).unwrap();
    let c = store.create("notes", json!({"title": "c", "body": "quick thinking"})).unwrap();

    let quick = QuerySpec::full_text_match("notes", Some("body"), "quick", None, Order::Ascending, 10);
    assert_eq!(store.query(&quick, 0).unwrap(), vec![a.clone(), c.clone()]);
    assert_eq!(store.count_query(&quick).unwrap(), 2);

    let anywhere = QuerySpec::full_text_match("notes", None, "lazy", None, Order::Ascending, 10);
    assert_eq!(store.count_query(&anywhere).unwrap(), 1);

    let by_body = QuerySpec::full_text_match("notes", Some("body"), "quick", Some("body"), Order::Descending, 10);
    assert_eq!(store.query(&by_body, 0).unwrap(), vec![a.clone(), c.clone()]);
    assert_eq!(store.count_query(&by_body).unwrap(), 2);

    let titles = QuerySpec::full_text_match("notes", Some("body"), "quick", Some("body"), Order::Ascending, 10)
        .with_select_paths(&["title", "body"]);
    assert_eq!(
        store.query(&titles, 0).unwrap(),
        vec![json!(["c", "quick thinking"]), json!(["a", "the quick brown fox"])]
    );

    let mut slow = a.clone();
    slow["body"] = json!("slow turtle");
    store.update("notes", slow, id_of(&a)).unwrap();
    assert_eq!(store.query(&quick, 0).unwrap(), vec![c.clone()]);

    store.delete("notes", &[id_of(&c)]).unwrap();
    assert_eq!(store.count_query(&quick).unwrap(), 0);
}

#[test]
fn test_external_storage() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::new(dir.path().join("store.db")).with_encryption_key("secret");
    let store = SmartStore::open(config.clone()).unwrap();
    let spec = SoupSpec::with_features("attachments", &[SoupFeature::ExternalStorage]);
    store
        .register_soup_with_spec(
            &spec,
            &[IndexSpec::new("name", IndexType::String), IndexSpec::new("size", IndexType::Integer)],
        )
        .unwrap();
    assert!(matches!(
        store.register_soup_with_spec(
            &SoupSpec::with_features("bad", &[SoupFeature::ExternalStorage]),
            &[IndexSpec::new("x", IndexType::Json1)],
        ),
        Err(Error::InvalidOperation(_))
    ));

    let doc = store
        .create("attachments", json!({"name": "report.pdf", "size": 1200, "body": "TOP-SECRET-CONTENT"}))
        .unwrap();
    assert_eq!(store.retrieve("attachments", &[id_of(&doc)]).unwrap(), vec![doc.clone()]);

    let blob_dir = dir.path().join("store_external").join("TABLE_1");
    let mut files = 0;
    for entry in fs::read_dir(&blob_dir).unwrap() {
        let bytes = fs::read(entry.unwrap().path()).unwrap();
        assert!(!String::from_utf8_lossy(&bytes).contains("TOP-SECRET"));
        files += 1;
    }
    assert_eq!(files, 3);

    let by_name = QuerySpec::exact("attachments", "name", "report.pdf", None, Order::Ascending, 10);
    assert_eq!(store.query(&by_name, 0).unwrap(), vec![doc.clone()]);
    let smart = QuerySpec::smart("select {attachments:_soup}, {attachments:size} from {attachments}", 10);
    assert_eq!(store.query(&smart, 0).unwrap(), vec![json!([doc.clone(), 1200])]);
    assert!(matches!(
        store.query(&QuerySpec::smart("select {attachments:body} from {attachments}", 10), 0),
        Err(Error::SmartSql { .. })
    ));

    store.change_key("new-secret").unwrap();
    drop(store);

    let stale = SmartStore::open(config.clone()).unwrap();
    assert!(stale.retrieve("attachments", &[id_of(&doc)]).unwrap().is_empty());
    drop(stale);

    let store = SmartStore::open(config.with_encryption_key("new-secret")).unwrap();
    assert_eq!(store.retrieve("attachments", &[id_of(&doc)]).unwrap(), vec![doc.clone()]);
    assert!(store.get_database_size().unwrap() > 0);

    store.delete("attachments", &[id_of(&doc)]).unwrap();
    assert!(store.retrieve("attachments", &[id_of(&doc)]).unwrap().is_empty());

    store.drop_soup("attachments").unwrap();
    assert!(!blob_dir.exists());
}

fn external_soup(store: &SmartStore, name: &str) {
    store
        .register_soup_with_spec(
            &SoupSpec::with_features(name, &[SoupFeature::ExternalStorage]),
            &[IndexSpec::new("name", IndexType::String)],
        )
        .unwrap();
}

#[test]
fn test_external_reads_follow_rolled_back_rows() {
    let dir = tempdir().unwrap();
    let store = SmartStore::open(StoreConfig::new(dir.path().join("store.db"))).unwrap();
    external_soup(&store, "attachments");

    store.begin_transaction().unwrap();
    let ghost = store.create("attachments", json!({"name": "ghost"})).unwrap();
    store.end_transaction().unwrap();

    let all = QuerySpec::all("attachments", None, Order::Ascending, 10);
    assert_eq!(store.count_query(&all).unwrap(), 0);
    assert!(store.retrieve("attachments", &[id_of(&ghost)]).unwrap().is_empty());
    assert!(store.query(&all, 0).unwrap().is_empty());

    let kept = store.create("attachments", json!({"name": "kept"})).unwrap();
    let other = store.create("attachments", json!({"name": "other"})).unwrap();
    assert_eq!(
        store.retrieve("attachments", &[id_of(&other), 999, id_of(&kept)]).unwrap(),
        vec![other, kept]
    );
}

#[test]
fn test_change_key_failure_keeps_old_key() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::new(dir.path().join("store.db")).with_encryption_key("old");
    let store = SmartStore::open(config.clone()).unwrap();
    external_soup(&store, "photos");
    external_soup(&store, "videos");
    let photo = store.create("photos", json!({"name": "cat.png"})).unwrap();
    store.create("videos", json!({"name": "dog.mp4"})).unwrap();

    // Corrupt the only video so it cannot be decrypted during the rekey.
    let videos_dir = dir.path().join("store_external").join("TABLE_2");
    for entry in fs::read_dir(&videos_dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) == Some("value") {
            fs::write(&path, b"not encrypted").unwrap();
        }
    }

    assert!(matches!(store.change_key("new"), Err(Error::Encryption(_))));
    assert_eq!(store.retrieve("photos", &[id_of(&photo)]).unwrap(), vec![photo.clone()]);
    drop(store);

    let store = SmartStore::open(config).unwrap();
    assert_eq!(store.retrieve("photos", &[id_of(&photo)]).unwrap(), vec![photo]);
}

#[test]
fn test_drop_and_register_gets_fresh_table() {
    let sink = Arc::new(RecordingSink::default());
    let store = SmartStore::open_with_event_sink(StoreConfig::memory(), sink.clone()).unwrap();
    store.register_soup("employees", &employee_specs()).unwrap();
    store.create("employees", json!({"employeeId": "x"})).unwrap();
    assert_eq!(store.get_soup_table_name("employees").unwrap().as_deref(), Some("TABLE_1"));

    assert!(store.drop_soup("employees").unwrap());
    assert!(!store.drop_soup("employees").unwrap());
    assert!(!store.has_soup("employees").unwrap());
    assert!(matches!(store.retrieve("employees", &[1]), Err(Error::SoupNotFound(_))));

    store.register_soup("employees", &employee_specs()).unwrap();
    assert_eq!(store.get_soup_table_name("employees").unwrap().as_deref(), Some("TABLE_2"));
    assert_eq!(store.count_query(&QuerySpec::all("employees", None, Order::Ascending, 1)).unwrap(), 0);

    store.register_soup("other", &[IndexSpec::new("k", IndexType::String)]).unwrap();
    store.drop_all_soups().unwrap();
    assert!(store.get_all_soup_names().unwrap().is_empty());

    let events = sink.events.lock();
    assert!(matches!(&events[0], StoreEvent::SoupRegistered { soup_name, .. } if soup_name == "employees"));
    assert!(matches!(&events[1], StoreEvent::SoupDropped { soup_name } if soup_name == "employees"));
    assert_eq!(events.len(), 6);
}

#[test]
fn test_caller_transactions() {
    let store = SmartStore::open(StoreConfig::memory()).unwrap();
    store.register_soup("employees", &employee_specs()).unwrap();

    store.begin_transaction().unwrap();
    store.create("employees", json!({"employeeId": "a"})).unwrap();
    store.end_transaction().unwrap();
    assert_eq!(store.count_query(&QuerySpec::all("employees", None, Order::Ascending, 1)).unwrap(), 0);

    store.begin_transaction().unwrap();
    store.begin_transaction().unwrap();
    store.create("employees", json!({"employeeId": "b"})).unwrap();
    store.set_transaction_successful().unwrap();
    store.end_transaction().unwrap();
    assert!(store.in_transaction());
    store.set_transaction_successful().unwrap();
    store.end_transaction().unwrap();
    assert!(!store.in_transaction());
    assert_eq!(store.count_query(&QuerySpec::all("employees", None, Order::Ascending, 1)).unwrap(), 1);
}

#[test]
fn test_cursor_over_store() {
    let store = SmartStore::open(StoreConfig::memory()).unwrap();
    store.register_soup("employees", &employee_specs()).unwrap();
    for i in 0..5 {
        store.create("employees", json!({"salary": i})).unwrap();
    }
    let spec = QuerySpec::range("employees", Some("salary"), Some(json!(1)), None, Some("salary"), Order::Descending, 2);
    let mut cursor = StoreCursor::new(&store, spec).unwrap();
    assert_eq!((cursor.total_entries(), cursor.total_pages()), (4, 2));
    cursor.move_to_page_index(1);
    let data: Value = serde_json::from_str(&cursor.get_data(&store).unwrap()).unwrap();
    let salaries: Vec<&Value> = data["currentPageOrderedEntries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| &e["salary"])
        .collect();
    assert_eq!(salaries, vec![&json!(2), &json!(1)]);
    assert_eq!(data["totalPages"], json!(2));
    assert_eq!(data["pageSize"], json!(2));
}

#[test]
fn test_alter_soup_flips_external_storage() {
    let dir = tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let store = SmartStore::open_with_event_sink(StoreConfig::new(dir.path().join("store.db")), sink.clone()).unwrap();
    let specs = [IndexSpec::new("name", IndexType::String)];
    store.register_soup("files", &specs).unwrap();
    let docs: Vec<Value> = (0..3)
        .map(|i| store.create("files", json!({"name": format!("f{}", i), "data": i})).unwrap())
        .collect();

    let external = SoupSpec::with_features("files", &[SoupFeature::ExternalStorage]);
    store.alter_soup("files", &external, &specs, false).unwrap();
    assert_eq!(store.get_soup_spec("files").unwrap(), Some(external));
    assert_eq!(store.retrieve("files", &[1, 2, 3]).unwrap(), docs);
    let blob_dir = dir.path().join("store_external").join("TABLE_1");
    assert!(blob_dir.exists());

    store.alter_soup("files", &SoupSpec::new("files"), &specs, false).unwrap();
    assert_eq!(store.retrieve("files", &[1, 2, 3]).unwrap(), docs);
    assert!(!blob_dir.exists());

    let altered = sink
        .events
        .lock()
        .iter()
        .filter(|e| matches!(e, StoreEvent::SoupAltered { .. }))
        .count();
    assert_eq!(altered, 2);
}

fn populate(path: &Path) {
    let store = SmartStore::open(StoreConfig::new(path).with_wal_mode(false)).unwrap();
    store
        .register_soup(
            "employees",
            &[
                IndexSpec::new("employeeId", IndexType::String),
                IndexSpec::new("bio", IndexType::FullText),
                IndexSpec::new("salary", IndexType::String),
            ],
        )
        .unwrap();
    for i in 0..20 {
        store
            .create(
                "employees",
                json!({
                    "employeeId": format!("e{}", i),
                    "bio": format!("employee number {} likes {}", i, if i % 2 == 0 { "tea" } else { "coffee" }),
                    "salary": format!("{}", 1000 + i),
                    "dept": {"code": format!("d{}", i % 3)},
                }),
            )
            .unwrap();
    }
    store.delete("employees", &[20]).unwrap();
}

fn altered_specs() -> Vec<IndexSpec> {
    vec![
        IndexSpec::new("employeeId", IndexType::String),
        IndexSpec::new("bio", IndexType::FullText),
        IndexSpec::new("salary", IndexType::Integer),
        IndexSpec::new("dept.code", IndexType::Json1),
    ]
}

fn alter(store: &SmartStore) -> AlterSoupOperation<'_> {
    AlterSoupOperation::new(store, "employees", &SoupSpec::new("employees"), &altered_specs(), true).unwrap()
}

fn dump(conn: &Connection, sql: &str) -> Vec<String> {
    let mut stmt = conn.prepare(sql).unwrap();
    let columns = stmt.column_count();
    let rows = stmt
        .query_map([], |row| {
            let cells: Vec<String> = (0..columns)
                .map(|i| format!("{:?}", row.get::<_, SqlValue>(i).unwrap()))
                .collect();
            Ok(cells.join("|"))
        })
        .unwrap();
    rows.map(|r| r.unwrap()).collect()
}

fn snapshot(path: &Path) -> Vec<Vec<String>> {
    let conn = Connection::open(path).unwrap();
    vec![
        dump(&conn, "SELECT * FROM TABLE_1 ORDER BY id"),
        dump(&conn, "SELECT rowid, * FROM TABLE_1_fts ORDER BY rowid"),
        dump(&conn, "SELECT type, name, tbl_name, sql FROM sqlite_master WHERE name LIKE 'TABLE_1%' ORDER BY name"),
        dump(&conn, "SELECT * FROM soup_index_map ORDER BY rowid"),
        dump(&conn, "SELECT * FROM soup_attrs"),
        dump(&conn, "SELECT * FROM sqlite_sequence WHERE name LIKE 'TABLE_%' ORDER BY name"),
        dump(&conn, "SELECT * FROM long_operations_status"),
    ]
}

#[test]
fn test_alter_soup_resumes_after_every_step() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("base.db");
    populate(&base);

    let reference = dir.path().join("reference.db");
    fs::copy(&base, &reference).unwrap();
    {
        let store = SmartStore::open(StoreConfig::new(&reference).with_wal_mode(false)).unwrap();
        alter(&store).run().unwrap();

        let by_salary = QuerySpec::exact("employees", "salary", 1005, None, Order::Ascending, 10);
        assert_eq!(store.query(&by_salary, 0).unwrap()[0]["employeeId"], json!("e5"));
        let by_dept = QuerySpec::exact("employees", "dept.code", "d1", None, Order::Ascending, 10);
        // i % 3 == 1 for i in 0..19, minus the deleted id 20 (i = 19).
        assert_eq!(store.count_query(&by_dept).unwrap(), 6);
        let tea = QuerySpec::full_text_match("employees", Some("bio"), "tea", None, Order::Ascending, 10);
        assert_eq!(store.count_query(&tea).unwrap(), 10);
        assert_eq!(id_of(&store.create("employees", json!({"employeeId": "new"})).unwrap()), 21);
    }
    assert_eq!(snapshot(&reference)[0].len(), 20);

    // Resumed runs are compared with an uninterrupted run without extra writes.
    let clean = dir.path().join("clean.db");
    fs::copy(&base, &clean).unwrap();
    {
        let store = SmartStore::open(StoreConfig::new(&clean).with_wal_mode(false)).unwrap();
        alter(&store).run().unwrap();
    }
    let expected = snapshot(&clean);
    assert!(expected[6].is_empty());

    let stops = [
        None,
        Some(AlterSoupStep::RenameOldSoupTable),
        Some(AlterSoupStep::DropOldIndexes),
        Some(AlterSoupStep::RegisterSoupUsingTableName),
        Some(AlterSoupStep::CopyTable),
        Some(AlterSoupStep::ReIndexSoup),
    ];
    for (i, stop) in stops.iter().enumerate() {
        let path = dir.path().join(format!("resume_{}.db", i));
        fs::copy(&base, &path).unwrap();
        {
            let store = SmartStore::open(StoreConfig::new(&path).with_wal_mode(false)).unwrap();
            let mut operation = alter(&store);
            if let Some(stop) = stop {
                operation.run_to(*stop).unwrap();
                assert_eq!(operation.status(), *stop);
            }
            // Dropping the store here stands in for a crash.
        }
        {
            let store = SmartStore::open(StoreConfig::new(&path).with_wal_mode(false)).unwrap();
            assert!(store.get_long_operations().unwrap().is_empty());
        }
        assert_eq!(snapshot(&path), expected, "resumed after {:?}", stop);
    }
}

#[test]
fn test_cached_file_store() {
    let dir = tempdir().unwrap();
    let files = KeyValueEncryptedFileStore::new(dir.path(), "blobs", "key").unwrap();
    let store = KeyValueCachedStore::new(files, 2);

    assert!(store.save_value("a", "1"));
    assert!(store.save_value("b", "2"));
    assert!(store.save_value("c", "3"));
    assert_eq!(store.cached_len(), 2);
    assert!(!store.is_cached("a"));
    assert_eq!(store.get_value("a").as_deref(), Some("1"));
    assert!(store.is_cached("a"));

    assert!(store.delete_value("a"));
    assert_eq!(store.get_value("a"), None);
    assert_eq!(store.count(), 2);
    let mut keys = store.key_set();
    keys.sort();
    assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);

    store.delete_all();
    assert!(store.is_empty());
    assert_eq!(store.cached_len(), 0);
}
