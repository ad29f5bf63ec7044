use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use kfs_meta::engine::Disabled;
use kfs_meta::operations::Operations;
use kfs_meta::protocol::OperationRequest;
use kfs_meta::storage::Sidecar;
use kfs_meta::{Config, GlobalState, SharedState};

fn write(root: &Path, rel: &str, bytes: usize) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, vec![1u8; bytes]).unwrap();
}

fn state_for(root: &Path, db: &Path) -> SharedState {
    state_with(root, db, |_| {})
}

fn state_with(root: &Path, db: &Path, adjust: impl FnOnce(&mut Config)) -> SharedState {
    let mut config = Config { db_dir: Some(db.to_path_buf()), watch: false, ..Config::for_root(root) };
    adjust(&mut config);
    GlobalState::build(config, Arc::new(Disabled), Arc::new(Disabled)).unwrap()
}

fn request(dir: &str, name: &str, action: &str) -> OperationRequest {
    let mut files = BTreeMap::new();
    files.insert(name.to_string(), true);
    OperationRequest { dir: dir.to_string(), files, action: action.to_string() }
}

#[tokio::test]
async fn test_trash_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    write(root.path(), "movies/ABC-123.mp4", 100);
    let state = state_for(root.path(), db.path());
    state.indexer.index(&["".to_string()]).unwrap();

    let report = Operations::apply(&state, &request("movies", "ABC-123.mp4", "delete")).await.unwrap();
    assert_eq!(report.applied, vec!["ABC-123.mp4"]);
    assert!(!root.path().join("movies/ABC-123.mp4").exists());
    assert!(root.path().join(".Trash/ABC-123.mp4").exists());

    let trashed = state.store.fetch(".Trash/ABC-123.mp4").unwrap();
    assert_eq!(trashed.old_loc, "movies/ABC-123.mp4");
    assert!(state.store.get("movies/ABC-123.mp4").unwrap().is_none());

    let legacy = Sidecar::load(&root.path().join(".Trash")).get("ABC-123.mp4").unwrap();
    assert_eq!(legacy.old_loc, "movies/ABC-123.mp4");

    let report = Operations::apply(&state, &request(".Trash", "ABC-123.mp4", "restore")).await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert!(root.path().join("movies/ABC-123.mp4").exists());

    let restored = state.store.fetch("movies/ABC-123.mp4").unwrap();
    assert_eq!(restored.old_loc, "");
    assert!(state.store.get(".Trash/ABC-123.mp4").unwrap().is_none());
}

#[tokio::test]
async fn test_delete_directory_moves_every_record() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    write(root.path(), "show/s1/e1.mkv", 10);
    write(root.path(), "show/s1/e2.mkv", 20);
    let state = state_for(root.path(), db.path());
    state.indexer.index(&["".to_string()]).unwrap();
    state.caches.sizes.insert("show".to_string(), 30);

    Operations::apply(&state, &request("show", "s1", "delete")).await.unwrap();

    assert!(state.store.list("show/s1").unwrap().is_empty());
    let moved = state.store.list(".Trash/s1").unwrap();
    assert_eq!(moved.len(), 3);
    assert!(moved.iter().all(|r| r.old_loc.starts_with("show/s1")));
    assert!(!state.caches.sizes.contains("show"));
    assert_eq!(state.store.sum_file_sizes(".Trash").unwrap(), 30);
}

#[tokio::test]
async fn test_delete_inside_trash_is_permanent_and_empty_clears() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    write(root.path(), "a/x", 5);
    write(root.path(), "a/y", 5);
    let state = state_for(root.path(), db.path());
    state.indexer.index(&["".to_string()]).unwrap();

    Operations::apply(&state, &request("a", "x", "delete")).await.unwrap();
    Operations::apply(&state, &request("a", "y", "delete")).await.unwrap();

    Operations::apply(&state, &request(".Trash", "x", "delete")).await.unwrap();
    assert!(!root.path().join(".Trash/x").exists());
    assert!(state.store.get(".Trash/x").unwrap().is_none());

    Operations::apply(&state, &request("", ".Trash", "delete")).await.unwrap();
    assert!(!root.path().join(".Trash/y").exists());
    assert!(state.store.get(".Trash/y").unwrap().is_none());
    assert!(root.path().join(".Trash").exists());
}

#[tokio::test]
async fn test_metadata_actions_persist_and_mirror() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    write(root.path(), "pics/cat.jpg", 3);
    let state = state_for(root.path(), db.path());

    Operations::apply(&state, &request("pics", "cat.jpg", "mark=5")).await.unwrap();
    let record = state.store.fetch("pics/cat.jpg").unwrap();
    assert_eq!(record.label, "danger");
    assert!(record.star);

    Operations::apply(&state, &request("pics", "cat.jpg", "star")).await.unwrap();
    assert!(!state.store.fetch("pics/cat.jpg").unwrap().star);

    let legacy = Sidecar::load(&root.path().join("pics")).get("cat.jpg").unwrap();
    assert_eq!(legacy.label, "danger");
    assert!(!legacy.star);
}

#[tokio::test]
async fn test_missing_item_is_reported_not_fatal() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    write(root.path(), "d/real", 1);
    let state = state_for(root.path(), db.path());

    let mut files = BTreeMap::new();
    files.insert("ghost".to_string(), true);
    files.insert("real".to_string(), true);
    let req = OperationRequest { dir: "d".into(), files, action: "label=info".into() };

    let report = Operations::apply(&state, &req).await.unwrap();
    assert_eq!(report.applied, vec!["real"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "ghost");
}

#[tokio::test]
async fn test_unknown_action_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let state = state_for(root.path(), db.path());
    let err = Operations::apply(&state, &request("", "x", "explode")).await.unwrap_err();
    assert_eq!(err.code(), 400);
}

#[tokio::test]
async fn test_trash_at_root_never_deletes() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    write(root.path(), "movies/keep.mp4", 10);
    let state = state_with(root.path(), db.path(), |c| c.trash_dir = "/".into());

    let result = Operations::apply(&state, &request("movies", "keep.mp4", "delete")).await;
    assert!(result.is_err());
    assert!(root.path().join("movies/keep.mp4").exists());
}

#[tokio::test]
async fn test_abort_still_flushes_earlier_items() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    write(root.path(), "m/a.mp4", 1);
    write(root.path(), "n/b.mp4", 1);
    let state = state_for(root.path(), db.path());
    state.indexer.index(&["".to_string()]).unwrap();
    Operations::apply(&state, &request("m", "a.mp4", "delete")).await.unwrap();
    Operations::apply(&state, &request("n", "b.mp4", "delete")).await.unwrap();
    assert!(Sidecar::load(&root.path().join(".Trash")).get("a.mp4").is_some());

    // b's destination sidecar cannot be written, which aborts the request
    std::fs::create_dir(root.path().join("n/.KFS_META")).unwrap();
    let mut files = BTreeMap::new();
    files.insert("a.mp4".to_string(), true);
    files.insert("b.mp4".to_string(), true);
    let req = OperationRequest { dir: ".Trash".into(), files, action: "restore".into() };
    assert!(Operations::apply(&state, &req).await.is_err());

    assert!(root.path().join("m/a.mp4").exists());
    assert_eq!(state.store.fetch("m/a.mp4").unwrap().old_loc, "");
    let trash_sidecar = Sidecar::load(&root.path().join(".Trash"));
    assert!(trash_sidecar.get("a.mp4").is_none());
    assert!(trash_sidecar.get("b.mp4").is_none());
}

#[tokio::test]
async fn test_unzip_failures_are_per_item() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    write(root.path(), "d/notes.txt", 3);
    write(root.path(), "d/broken.zip", 3);
    write(root.path(), "d/README", 3);
    let state = state_for(root.path(), db.path());

    let mut files = BTreeMap::new();
    for name in ["notes.txt", "broken.zip", "README"] {
        files.insert(name.to_string(), true);
    }
    let req = OperationRequest { dir: "d".into(), files, action: "unzip".into() };
    let report = Operations::apply(&state, &req).await.unwrap();

    assert!(report.applied.is_empty());
    let failed: Vec<&str> = report.failed.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(failed, vec!["README", "broken.zip", "notes.txt"]);
    assert!(!root.path().join("d/notes").exists());
}
