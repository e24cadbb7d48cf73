//! Indexer lifecycle: visibility, two-phase commit, deletions.

use std::io::Read;
use std::sync::Arc;

use kestrel::document::Document;
use kestrel::error::KestrelError;
use kestrel::index::{IndexManager, Indexer, OpenMode, PolyReader};
use kestrel::schema::{FieldSpec, Schema};
use kestrel::storage::{MemoryStorage, Storage};

fn test_schema() -> Arc<Schema> {
    Arc::new(
        Schema::builder()
            .add_field("title", FieldSpec::text().sortable(true))
            .add_field("year", FieldSpec::integer())
            .build()
            .unwrap(),
    )
}

fn setup() -> (Arc<dyn Storage>, Arc<Schema>, Arc<IndexManager>) {
    (
        Arc::new(MemoryStorage::new_default()),
        test_schema(),
        Arc::new(IndexManager::new()),
    )
}

fn doc(title: &str, year: i64) -> Document {
    Document::builder()
        .add_text("title", title)
        .add_integer("year", year)
        .build()
}

fn titles(reader: &PolyReader) -> Vec<String> {
    reader
        .live_doc_ids()
        .iter()
        .map(|&id| {
            reader
                .document(id)
                .unwrap()
                .get_field("title")
                .unwrap()
                .as_text()
                .unwrap()
                .to_string()
        })
        .collect()
}

#[test]
fn commit_makes_docs_visible_exactly_once() {
    let (storage, schema, manager) = setup();

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Create,
    )
    .unwrap();
    indexer.add_doc(doc("alpha", 2020)).unwrap();
    indexer.add_doc(doc("beta", 2021)).unwrap();

    // Nothing is visible before the first commit.
    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(reader.doc_count(), 0);

    let snapshot = indexer.commit().unwrap();
    assert_eq!(snapshot.generation, 1);

    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(reader.doc_count(), 2);
    assert_eq!(titles(&reader), vec!["alpha", "beta"]);
    assert_eq!(reader.doc_freq("title", "alpha"), 1);
    assert_eq!(reader.postings("year", "2021"), vec![(1, 1)]);
}

#[test]
fn open_mode_semantics() {
    let (storage, schema, manager) = setup();

    // Open requires a committed index.
    let err = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap_err();
    assert!(matches!(err, KestrelError::Index(_)));

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Create,
    )
    .unwrap();
    indexer.add_doc(doc("old", 1999)).unwrap();
    indexer.commit().unwrap();

    // Truncate discards existing contents.
    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Truncate,
    )
    .unwrap();
    indexer.add_doc(doc("fresh", 2024)).unwrap();
    indexer.commit().unwrap();

    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(titles(&reader), vec!["fresh"]);
}

#[test]
fn second_writer_gets_lock_error() {
    let (storage, schema, manager) = setup();

    let _first = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Create,
    )
    .unwrap();

    let err = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Create,
    )
    .unwrap_err();
    assert!(matches!(err, KestrelError::Lock(_)));
}

#[test]
fn schema_rejection_spares_the_batch() {
    let (storage, schema, manager) = setup();

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Create,
    )
    .unwrap();

    indexer.add_doc(doc("good one", 2020)).unwrap();

    // Unknown field: this document is rejected, the session survives.
    let bad = Document::builder().add_text("authr", "typo").build();
    let err = indexer.add_doc(bad).unwrap_err();
    assert!(matches!(err, KestrelError::Schema(_)));

    // Type mismatch: same.
    let bad = Document::builder().add_text("year", "not a number").build();
    assert!(indexer.add_doc(bad).is_err());

    indexer.add_doc(doc("good two", 2021)).unwrap();
    indexer.commit().unwrap();

    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(titles(&reader), vec!["good one", "good two"]);
}

#[test]
fn stored_schema_mismatch_is_rejected() {
    let (storage, schema, manager) = setup();

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Create,
    )
    .unwrap();
    indexer.add_doc(doc("x", 1)).unwrap();
    indexer.commit().unwrap();

    let other = Arc::new(
        Schema::builder()
            .add_field("completely", FieldSpec::text())
            .build()
            .unwrap(),
    );
    let err = Indexer::open(other, Arc::clone(&storage), Arc::clone(&manager), OpenMode::Open)
        .unwrap_err();
    assert!(matches!(err, KestrelError::Schema(_)));
}

#[test]
fn abandoned_prepare_leaves_snapshot_byte_identical() {
    let (storage, schema, manager) = setup();

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Create,
    )
    .unwrap();
    indexer.add_doc(doc("committed", 2020)).unwrap();
    let snapshot = indexer.commit().unwrap();

    let manifest = format!("snapshot_{:010}.json", snapshot.generation);
    let mut before = Vec::new();
    storage.open_input(&manifest).unwrap().read_to_end(&mut before).unwrap();

    // Prepare a second commit, then walk away.
    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap();
    indexer.add_doc(doc("never published", 2024)).unwrap();
    indexer.prepare_commit().unwrap();
    indexer.abort();

    let mut after = Vec::new();
    storage.open_input(&manifest).unwrap().read_to_end(&mut after).unwrap();
    assert_eq!(before, after);

    // The candidate is inert: readers still see exactly the committed state.
    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(titles(&reader), vec!["committed"]);

    // The next open sweeps the orphaned candidate and its segment files.
    let indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap();
    drop(indexer);
    let leftovers: Vec<String> = storage
        .list_files()
        .unwrap()
        .into_iter()
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(titles(&reader), vec!["committed"]);
}

#[test]
fn delete_by_doc_id_is_idempotent() {
    let (storage, schema, manager) = setup();

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Create,
    )
    .unwrap();
    for (title, year) in [("a", 1), ("b", 2), ("c", 3)] {
        indexer.add_doc(doc(title, year)).unwrap();
    }
    indexer.commit().unwrap();

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap();
    assert!(indexer.delete_by_doc_id(1).unwrap());
    // Re-deleting the same id is a no-op.
    assert!(!indexer.delete_by_doc_id(1).unwrap());
    indexer.commit().unwrap();

    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(reader.doc_count(), 2);
    assert_eq!(reader.del_count(), 1);
    assert_eq!(reader.live_doc_ids(), vec![0, 2]);
    assert_eq!(titles(&reader), vec!["a", "c"]);
}

#[test]
fn delete_by_term_resolves_at_commit() {
    let (storage, schema, manager) = setup();

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Create,
    )
    .unwrap();
    indexer.add_doc(doc("keep me", 1)).unwrap();
    indexer.add_doc(doc("drop me", 2)).unwrap();
    indexer.add_doc(doc("also drop", 3)).unwrap();
    indexer.commit().unwrap();

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap();
    // Field names resolve case-insensitively.
    indexer.delete_by_term("TITLE", "drop").unwrap();
    indexer.commit().unwrap();

    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(titles(&reader), vec!["keep me"]);

    // Deleting a term that matches nothing commits cleanly.
    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap();
    indexer.delete_by_term("title", "absent").unwrap();
    indexer.commit().unwrap();
    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(reader.doc_count(), 1);
}

#[test]
fn empty_commit_publishes_nothing() {
    let (storage, schema, manager) = setup();

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Create,
    )
    .unwrap();
    indexer.add_doc(doc("only", 1)).unwrap();
    let first = indexer.commit().unwrap();

    let indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap();
    let second = indexer.commit().unwrap();
    assert_eq!(second.generation, first.generation);
}

#[test]
fn add_index_imports_foreign_documents() {
    let (storage, schema, manager) = setup();

    // Build a second index with its own storage.
    let foreign: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let foreign_manager = Arc::new(IndexManager::new());
    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&foreign),
        Arc::clone(&foreign_manager),
        OpenMode::Create,
    )
    .unwrap();
    indexer.add_doc(doc("imported one", 1)).unwrap();
    indexer.add_doc(doc("imported two", 2)).unwrap();
    indexer.commit().unwrap();

    // Tombstone one foreign doc; the import must skip it.
    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&foreign),
        foreign_manager,
        OpenMode::Open,
    )
    .unwrap();
    indexer.delete_by_doc_id(0).unwrap();
    indexer.commit().unwrap();

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Create,
    )
    .unwrap();
    indexer.add_doc(doc("native", 0)).unwrap();
    indexer.add_index(foreign).unwrap();
    indexer.commit().unwrap();

    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(titles(&reader), vec!["native", "imported two"]);
}

#[test]
fn optimize_consolidates_to_one_segment() {
    let (storage, schema, manager) = setup();

    for batch in 0..3 {
        let mut indexer = Indexer::open(
            Arc::clone(&schema),
            Arc::clone(&storage),
            Arc::clone(&manager),
            OpenMode::Create,
        )
        .unwrap();
        indexer.add_doc(doc(&format!("batch {batch}"), batch)).unwrap();
        indexer.commit().unwrap();
    }

    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(reader.segments().len(), 3);

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap();
    indexer.optimize().unwrap();
    indexer.commit().unwrap();

    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(reader.segments().len(), 1);
    assert_eq!(reader.doc_count(), 3);
    assert_eq!(titles(&reader), vec!["batch 0", "batch 1", "batch 2"]);
}
