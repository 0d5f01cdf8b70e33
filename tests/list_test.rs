mod common;

use common::{open_db, sample, TestObject};
use shelfdb::{and, eq, field, gt, labeled, lt, neq, or, Error, Labels, ListOptions, Page};

fn seed(db: &shelfdb::Db, n: i64) {
    for i in 0..n {
        let mut record = sample(i);
        record.labels = Labels::from([("id".to_string(), format!("v{i}"))]);
        db.insert(&mut record).expect("insert");
    }
}

#[test]
fn predicates_select_expected_rows() {
    let (_dir, db) = open_db("pred.db");
    seed(&db, 10);

    // Equality.
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            predicate: Some(eq("id", 0)),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, 0);

    // Conjunction of inequalities: evens only, in ascending id order.
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            detail: 2,
            predicate: Some(and([
                neq("id", 1),
                neq("id", 3),
                neq("id", 5),
                neq("id", 7),
                neq("id", 9),
            ])),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(
        rows.iter().map(|row| row.id).collect::<Vec<_>>(),
        [0, 2, 4, 6, 8]
    );

    // Disjunction.
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            predicate: Some(or([eq("id", 0), eq("id", 6)])),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows.iter().map(|row| row.id).collect::<Vec<_>>(), [0, 6]);

    // Ranges.
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            predicate: Some(lt("id", 2)),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows.iter().map(|row| row.id).collect::<Vec<_>>(), [0, 1]);
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            predicate: Some(gt("id", 7)),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows.iter().map(|row| row.id).collect::<Vec<_>>(), [8, 9]);

    db.close(true).expect("close");
}

#[test]
fn virtual_and_field_operands() {
    let (_dir, db) = open_db("operands.db");
    seed(&db, 10);

    // The virtual rowid participates in predicates.
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            detail: 1,
            predicate: Some(gt("rowid", 5)),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0].rowid, 6);

    // Field-to-field comparison: rowid == int8 (= 8) matches one row.
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            detail: 1,
            predicate: Some(eq("rowid", field("int8"))),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].rowid, 8);

    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            detail: 1,
            predicate: Some(neq("rowid", field("int8"))),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows.len(), 9);

    // int8 < int16 everywhere.
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            detail: 1,
            predicate: Some(lt("int8", field("int16"))),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows.len(), 10);

    db.close(true).expect("close");
}

#[test]
fn label_match() {
    let (_dir, db) = open_db("labelmatch.db");
    seed(&db, 10);

    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            predicate: Some(labeled(Labels::from([(
                "id".to_string(),
                "v4".to_string(),
            )]))),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, 4);

    // Union with a plain predicate, sorted by the id column (position 2 of
    // the selected set).
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            sort: vec![2],
            predicate: Some(or([
                labeled(Labels::from([("id".to_string(), "v4".to_string())])),
                eq("id", 8),
            ])),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows.iter().map(|row| row.id).collect::<Vec<_>>(), [4, 8]);

    // A pair nothing carries.
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            predicate: Some(labeled(Labels::from([(
                "id".to_string(),
                "v99".to_string(),
            )]))),
            ..ListOptions::default()
        })
        .expect("list");
    assert!(rows.is_empty());

    db.close(true).expect("close");
}

#[test]
fn detail_levels_gate_columns() {
    let (_dir, db) = open_db("detail.db");
    seed(&db, 10);

    // Detail 0: pk and key fields only.
    let rows: Vec<TestObject> = db.list(&ListOptions::default()).expect("list");
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[0].name, "");
    assert!(rows[0].slice.is_empty());
    assert_eq!(rows[0].d4, "");

    // Detail 1: defaults.
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            detail: 1,
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows[0].name, "Elmer");
    assert!(rows[0].slice.is_empty());
    assert_eq!(rows[0].d4, "");

    // Detail 3 adds the slice.
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            detail: 3,
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows[0].slice, ["hello", "world"]);
    assert_eq!(rows[0].d4, "");

    // Detail 4 additionally populates d4.
    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            detail: 4,
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows[0].slice, ["hello", "world"]);
    assert_eq!(rows[0].d4, "d-4");

    db.close(true).expect("close");
}

#[test]
fn pagination_and_sort() {
    let (_dir, db) = open_db("page.db");
    seed(&db, 10);

    let rows: Vec<TestObject> = db
        .list(&ListOptions {
            sort: vec![2],
            page: Some(Page {
                limit: 3,
                offset: 2,
            }),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(rows.iter().map(|row| row.id).collect::<Vec<_>>(), [2, 3, 4]);

    db.close(true).expect("close");
}

#[test]
fn count_agrees_with_list() {
    let (_dir, db) = open_db("count.db");
    seed(&db, 10);

    assert_eq!(db.count::<TestObject>(None).expect("count"), 10);

    let above = gt("id", 0);
    let counted = db.count::<TestObject>(Some(&above)).expect("count");
    let listed: Vec<TestObject> = db
        .list(&ListOptions {
            predicate: Some(above),
            ..ListOptions::default()
        })
        .expect("list");
    assert_eq!(counted, 9);
    assert_eq!(counted, listed.len() as i64);

    db.close(true).expect("close");
}

#[test]
fn find_streams_result_rows() {
    let (_dir, db) = open_db("find.db");
    seed(&db, 10);

    let mut iter = db
        .find::<TestObject>(&ListOptions {
            detail: 1,
            ..ListOptions::default()
        })
        .expect("find");
    assert_eq!(iter.len(), 10);
    let mut seen = Vec::new();
    for row in &mut iter {
        let record = row.expect("decode");
        assert_eq!(record.name, "Elmer");
        seen.push(record.id);
    }
    assert_eq!(seen, (0..10).collect::<Vec<_>>());

    db.close(true).expect("close");
}

#[test]
fn bad_predicates_fail_to_compile() {
    let (_dir, db) = open_db("badpred.db");
    seed(&db, 1);

    let outcome: Result<Vec<TestObject>, _> = db.list(&ListOptions {
        predicate: Some(eq("bogus", 1)),
        ..ListOptions::default()
    });
    assert!(matches!(outcome, Err(Error::PredicateRef(_))));

    let outcome: Result<Vec<TestObject>, _> = db.list(&ListOptions {
        predicate: Some(eq("id", "not-a-number")),
        ..ListOptions::default()
    });
    assert!(matches!(outcome, Err(Error::PredicateValue(_))));

    let outcome: Result<Vec<TestObject>, _> = db.list(&ListOptions {
        predicate: Some(eq("slice", "x")),
        ..ListOptions::default()
    });
    assert!(matches!(outcome, Err(Error::PredicateType(_))));

    db.close(true).expect("close");
}
