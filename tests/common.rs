#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use shelfdb::{Action, ColumnKind, Db, Event, EventHandler, Labels, Record, TableDef};

/// The record type the suites exercise: a little of everything. Generated
/// pk, natural key, index group, every column kind, detail levels, labels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestObject {
    pub rowid: i64,
    pub pk: String,
    pub id: i64,
    pub name: String,
    pub age: i64,
    pub int8: i8,
    pub int16: i16,
    pub int32: i32,
    pub flag: bool,
    pub object: TestEncoded,
    pub slice: Vec<String>,
    pub map: std::collections::BTreeMap<String, i64>,
    pub d4: String,
    pub labels: Labels,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestEncoded {
    pub name: String,
}

impl Record for TestObject {
    fn table() -> &'static TableDef {
        static DEF: OnceLock<TableDef> = OnceLock::new();
        DEF.get_or_init(|| {
            TableDef::new("TestObject")
                .field("rowid", ColumnKind::Int, "virtual")
                .field("pk", ColumnKind::Text, "pk(id)")
                .field("id", ColumnKind::Int, "key")
                .field("name", ColumnKind::Text, "index(a)")
                .field("age", ColumnKind::Int, "index(a)")
                .field("int8", ColumnKind::Int, "")
                .field("int16", ColumnKind::Int, "")
                .field("int32", ColumnKind::Int, "")
                .field("flag", ColumnKind::Bool, "")
                .field("object", ColumnKind::Json, "")
                .field("slice", ColumnKind::Json, "d3")
                .field("map", ColumnKind::Json, "")
                .field("d4", ColumnKind::Text, "d4")
                .field("labels", ColumnKind::Json, "-")
        })
    }

    fn labels(&self) -> Labels {
        self.labels.clone()
    }
}

/// A second kind, for watch filtering.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OtherObject {
    pub pk: String,
    pub id: i64,
}

impl Record for OtherObject {
    fn table() -> &'static TableDef {
        static DEF: OnceLock<TableDef> = OnceLock::new();
        DEF.get_or_init(|| {
            TableDef::new("OtherObject")
                .field("pk", ColumnKind::Text, "pk(id)")
                .field("id", ColumnKind::Int, "key")
        })
    }
}

pub fn sample(id: i64) -> TestObject {
    TestObject {
        id,
        name: "Elmer".to_string(),
        age: 18,
        int8: 8,
        int16: 16,
        int32: 32,
        flag: true,
        object: TestEncoded {
            name: "json".to_string(),
        },
        slice: vec!["hello".to_string(), "world".to_string()],
        map: std::collections::BTreeMap::from([("A".to_string(), 1), ("B".to_string(), 2)]),
        d4: "d-4".to_string(),
        ..TestObject::default()
    }
}

/// A fresh database in its own scratch directory. Keep the `TempDir` alive
/// for the duration of the test.
pub fn open_db(name: &str) -> (tempfile::TempDir, Db) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path: PathBuf = dir.path().join(name);
    let db = Db::builder(path)
        .model::<TestObject>()
        .model::<OtherObject>()
        .build();
    db.open(true).expect("open database");
    (dir, db)
}

/// Polls until the condition holds or five seconds pass.
pub fn eventually(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > Duration::from_secs(5) {
            panic!("condition not met within 5s");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Sequence entry recorded by [`TestHandler`]: the action and the subject's
/// id (-1 for the parity marker).
pub type Seen = (Action, i64);

#[derive(Default)]
pub struct HandlerLog {
    pub started: bool,
    pub parity: bool,
    pub all: Vec<Seen>,
    pub created: Vec<i64>,
    pub updated: Vec<i64>,
    pub deleted: Vec<i64>,
    pub errors: Vec<String>,
    pub done: bool,
}

/// Accounting handler: records everything it sees, in order.
#[derive(Clone, Default)]
pub struct TestHandler {
    pub log: Arc<Mutex<HandlerLog>>,
}

impl TestHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, HandlerLog> {
        self.log.lock().expect("handler log")
    }
}

impl EventHandler<TestObject> for TestHandler {
    fn started(&mut self, _watch_id: u64) {
        self.log().started = true;
    }

    fn parity(&mut self) {
        let mut log = self.log();
        log.parity = true;
        log.all.push((Action::Parity, -1));
    }

    fn created(&mut self, event: Event<TestObject>) {
        let mut log = self.log();
        log.all.push((Action::Created, event.model.id));
        log.created.push(event.model.id);
    }

    fn updated(&mut self, event: Event<TestObject>) {
        let mut log = self.log();
        log.all.push((Action::Updated, event.model.id));
        log.updated.push(event.model.id);
    }

    fn deleted(&mut self, event: Event<TestObject>) {
        let mut log = self.log();
        log.all.push((Action::Deleted, event.model.id));
        log.deleted.push(event.model.id);
    }

    fn error(&mut self, err: &shelfdb::Error) {
        self.log().errors.push(err.to_string());
    }

    fn end(&mut self) {
        self.log().done = true;
    }
}

impl EventHandler<OtherObject> for TestHandler {
    fn started(&mut self, _watch_id: u64) {
        self.log().started = true;
    }

    fn parity(&mut self) {
        let mut log = self.log();
        log.parity = true;
        log.all.push((Action::Parity, -1));
    }

    fn created(&mut self, event: Event<OtherObject>) {
        let mut log = self.log();
        log.all.push((Action::Created, event.model.id));
        log.created.push(event.model.id);
    }

    fn updated(&mut self, event: Event<OtherObject>) {
        let mut log = self.log();
        log.all.push((Action::Updated, event.model.id));
        log.updated.push(event.model.id);
    }

    fn deleted(&mut self, event: Event<OtherObject>) {
        let mut log = self.log();
        log.all.push((Action::Deleted, event.model.id));
        log.deleted.push(event.model.id);
    }

    fn error(&mut self, err: &shelfdb::Error) {
        self.log().errors.push(err.to_string());
    }

    fn end(&mut self) {
        self.log().done = true;
    }
}
