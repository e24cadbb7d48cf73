//! Crash recovery: dead merges, orphaned candidates, stale locks, and a
//! full lifecycle on real files.

use std::io::Write;
use std::sync::Arc;

use kestrel::document::Document;
use kestrel::index::{BackgroundMerger, IndexManager, Indexer, OpenMode, PolyReader};
use kestrel::schema::{FieldSpec, Schema};
use kestrel::storage::{FsStorage, MemoryStorage, Storage};

fn test_schema() -> Arc<Schema> {
    Arc::new(
        Schema::builder()
            .add_field("title", FieldSpec::text().sortable(true))
            .build()
            .unwrap(),
    )
}

fn doc(title: &str) -> Document {
    Document::builder().add_text("title", title).build()
}

fn commit_batch(
    storage: &Arc<dyn Storage>,
    schema: &Arc<Schema>,
    manager: &Arc<IndexManager>,
    titles: &[&str],
) {
    let mut indexer = Indexer::open(
        Arc::clone(schema),
        Arc::clone(storage),
        Arc::clone(manager),
        OpenMode::Create,
    )
    .unwrap();
    for title in titles {
        indexer.add_doc(doc(title)).unwrap();
    }
    indexer.commit().unwrap();
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
fn dead_merge_is_discarded_on_open() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let schema = test_schema();
    let manager = Arc::new(IndexManager::new());

    commit_batch(&storage, &schema, &manager, &["one"]);
    commit_batch(&storage, &schema, &manager, &["two"]);

    // Simulate a merger that died after writing its recovery record and
    // part of the merged segment, with no merge lock held.
    manager
        .write_merge_data(storage.as_ref(), 9, vec![1, 2], 2)
        .unwrap();
    let mut output = storage.create_output("seg_9/postings.bin").unwrap();
    output.write_all(b"half-built").unwrap();
    output.close().unwrap();

    // Reopening the index must not expose the half-built segment and must
    // clean up the stale record.
    let indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap();
    drop(indexer);

    assert!(!storage.file_exists("seg_9/postings.bin"));
    assert!(!storage.file_exists("merge.json"));

    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(titles(&reader), vec!["one", "two"]);

    // With the record gone, a fresh merge can run to completion.
    let merger = BackgroundMerger::open_with_options(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        Arc::new(kestrel::analysis::SimpleAnalyzer),
        true,
    )
    .unwrap()
    .expect("merge work exists");
    merger.commit().unwrap();
    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(reader.segments().len(), 1);
    assert_eq!(titles(&reader), vec!["one", "two"]);
}

#[test]
fn interrupted_merge_before_commit_restores_pre_merge_state() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let schema = test_schema();
    let manager = Arc::new(IndexManager::new());

    commit_batch(&storage, &schema, &manager, &["one"]);
    commit_batch(&storage, &schema, &manager, &["two"]);

    // The merge prepares its candidate (segment files and a tmp manifest on
    // disk) and is then abandoned before the atomic publish.
    let mut merger = BackgroundMerger::open_with_options(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        Arc::new(kestrel::analysis::SimpleAnalyzer),
        true,
    )
    .unwrap()
    .expect("merge work exists");
    let merged_dir = format!("seg_{}", merger.merged_id());
    merger.prepare_commit().unwrap();
    merger.abort();

    // Nothing published: readers see the pre-merge state exactly.
    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(reader.segments().len(), 2);
    assert_eq!(titles(&reader), vec!["one", "two"]);

    // The next open sweeps the dead merge.
    let indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap();
    drop(indexer);
    assert!(!storage.file_exists(&merged_dir));
    assert!(!storage.file_exists("merge.json"));
}

#[test]
fn full_lifecycle_on_filesystem() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FsStorage::new_default(temp_dir.path()).unwrap());
    let schema = test_schema();
    let manager = Arc::new(IndexManager::new());

    commit_batch(&storage, &schema, &manager, &["alpha", "beta"]);
    commit_batch(&storage, &schema, &manager, &["gamma"]);

    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap();
    indexer.delete_by_term("title", "beta").unwrap();
    indexer.commit().unwrap();

    let merger = BackgroundMerger::open_with_options(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        Arc::new(kestrel::analysis::SimpleAnalyzer),
        true,
    )
    .unwrap()
    .expect("merge work exists");
    merger.commit().unwrap();

    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(reader.segments().len(), 1);
    assert_eq!(titles(&reader), vec!["alpha", "gamma"]);

    // Reopen from the same directory, the way a new process would.
    let storage2: Arc<dyn Storage> = Arc::new(FsStorage::new_default(temp_dir.path()).unwrap());
    let reader = PolyReader::open(storage2.as_ref()).unwrap();
    assert_eq!(titles(&reader), vec!["alpha", "gamma"]);

    let sort_segments = reader.sort().segments();
    let cache = sort_segments.0[0].cache("title").unwrap();
    assert_eq!(cache.value(0), Some("alpha"));
    assert_eq!(cache.value(1), Some("gamma"));
}

#[cfg(target_os = "linux")]
#[test]
fn stale_write_lock_from_dead_process_is_cleared() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FsStorage::new_default(temp_dir.path()).unwrap());
    let schema = test_schema();
    let manager = Arc::new(IndexManager::new());

    commit_batch(&storage, &schema, &manager, &["survivor"]);

    // A write lock left behind by a crashed process on this host: same
    // host name, a pid that cannot be alive.
    let info = serde_json::json!({
        "host": manager.host(),
        "pid": u32::MAX - 2,
        "token": "00000000-0000-4000-8000-000000000000",
        "created_at": "2026-01-01T00:00:00Z",
    });
    let mut output = storage.create_output("locks/write.lock").unwrap();
    output.write_all(info.to_string().as_bytes()).unwrap();
    output.close().unwrap();

    // Open clears the stale lock and proceeds.
    let mut indexer = Indexer::open(
        Arc::clone(&schema),
        Arc::clone(&storage),
        Arc::clone(&manager),
        OpenMode::Open,
    )
    .unwrap();
    indexer.add_doc(doc("after recovery")).unwrap();
    indexer.commit().unwrap();

    let reader = PolyReader::open(storage.as_ref()).unwrap();
    assert_eq!(titles(&reader), vec!["survivor", "after recovery"]);
}
