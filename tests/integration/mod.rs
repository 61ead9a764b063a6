//! End-to-end scenarios for rewind
//!
//! Exercises checkpointing, restore, branching history, diffing and
//! maintenance through the public [`Rewind`] API.

use ::rewind::*;
use tempfile::TempDir;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use tracing::info;

/// Test harness for checkpoint scenarios
pub struct RewindTestHarness {
    pub dir: TempDir,
    pub work: PathBuf,
    pub engine: Rewind,
    pub session: String,
    pub rng: StdRng,
}

impl RewindTestHarness {
    /// Create a harness with one registered session
    pub fn new() -> Self {
        Self::with_seed(42)
    }

    pub fn with_seed(seed: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();

        let engine = Rewind::builder()
            .compression_strategy(CompressionStrategy::Fast)
            .parallel_workers(4)
            .build(dir.path().join("storage"))
            .unwrap();
        engine.register_session("main", &work).unwrap();

        Self {
            dir,
            work,
            engine,
            session: "main".to_string(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn write(&self, rel: &str, content: impl AsRef<[u8]>) {
        let path = self.work.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.work.join(rel)).unwrap()
    }

    pub fn checkpoint(&self, message: &str) -> Checkpoint {
        self.engine.checkpoint(&self.session, message).unwrap()
    }

    pub fn restore(&self, id: &str) -> Checkpoint {
        self.engine.restore(&self.session, id).unwrap()
    }

    /// Write `count` random text files under a few directories
    pub fn generate_files(&mut self, count: usize) {
        for i in 0..count {
            let dir = ["", "src/", "src/nested/", "docs/"][self.rng.random_range(0..4)];
            let lines = self.rng.random_range(1..40);
            let mut content = String::new();
            for line in 0..lines {
                content.push_str(&format!("line {} value {}\n", line, self.rng.random::<u32>()));
            }
            self.write(&format!("{}file{}.txt", dir, i), content);
        }
    }

    /// Every file under the working directory keyed by relative path
    pub fn snapshot_contents(&self) -> BTreeMap<String, Vec<u8>> {
        collect_files(&self.work)
    }
}

pub fn collect_files(root: &Path) -> BTreeMap<String, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

#[test]
fn test_restore_then_branch_scenario() {
    let h = RewindTestHarness::new();

    h.write("a.txt", "1");
    let a = h.checkpoint("A");

    h.write("a.txt", "2");
    h.write("b.txt", "x");
    let b = h.checkpoint("B");

    h.restore(&a.id);
    assert!(!h.work.join("b.txt").exists());
    assert_eq!(h.read("a.txt"), "1");
    assert_eq!(h.engine.current(&h.session).unwrap().unwrap().id, a.id);

    let c = h.checkpoint("C");
    assert_eq!(c.parent_id.as_deref(), Some(a.id.as_str()));

    let listed = h.engine.list(&h.session).unwrap();
    let messages: Vec<_> = listed.iter().map(|c| c.message.as_str()).collect();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0], "A");
    assert_eq!(messages[1], "B");
    assert!(listed[2].is_pre_restore());
    assert_eq!(messages[3], "C");
    assert_eq!(listed[1].id, b.id);
}

#[test]
fn test_capture_is_deterministic() {
    let mut h = RewindTestHarness::new();
    h.generate_files(30);

    let first = h.checkpoint("first");
    let second = h.checkpoint("second");
    assert_ne!(first.id, second.id);
    assert_eq!(first.tree_hash, second.tree_hash);

    // A second store with a different codec agrees on every hash
    let other_dir = TempDir::new().unwrap();
    let other = Rewind::builder()
        .compression_strategy(CompressionStrategy::None)
        .build(other_dir.path())
        .unwrap();
    other.register_session("copy", &h.work).unwrap();
    let copy = other.checkpoint("copy", "copy").unwrap();
    assert_eq!(copy.tree_hash, first.tree_hash);
}

#[test]
fn test_round_trip_restore() {
    let mut h = RewindTestHarness::new();
    h.generate_files(50);
    let original = h.snapshot_contents();
    let checkpoint = h.checkpoint("original");

    // Scramble the working directory
    fs::remove_dir_all(h.work.join("src")).unwrap();
    h.write("docs/new.md", "# new");
    h.write("file0.txt", "overwritten");
    h.generate_files(10);

    let report = h
        .engine
        .restore_with_report(&h.session, &checkpoint.id, RestoreOptions::default(), &CancelToken::new())
        .unwrap();
    info!("restore changed {} files", report.files_changed());
    assert!(report.files_changed() > 0);
    assert_eq!(
        report.phases,
        vec![
            RestorePhase::Requested,
            RestorePhase::PreRestoreCheckpointed,
            RestorePhase::Applying,
            RestorePhase::Committed,
        ]
    );
    assert_eq!(h.snapshot_contents(), original);
}

#[test]
fn test_unchanged_content_is_deduplicated() {
    let mut h = RewindTestHarness::new();
    h.generate_files(20);
    let first = h.checkpoint("first");
    let blobs = h.engine.store().list_blobs().unwrap().len();
    let written = h.engine.store_stats().blobs_written;

    let second = h.checkpoint("second");
    assert_eq!(first.tree_hash, second.tree_hash);
    assert_eq!(h.engine.store().list_blobs().unwrap().len(), blobs);
    assert_eq!(h.engine.store_stats().blobs_written, written);

    // Identical content under another name costs nothing either
    h.write("copy.txt", h.read("file0.txt"));
    h.checkpoint("copy");
    assert_eq!(h.engine.store().list_blobs().unwrap().len(), blobs);
}

#[test]
fn test_large_unchanged_binary_writes_no_blobs() {
    let mut h = RewindTestHarness::new();
    let mut data = vec![0u8; 10 * 1024 * 1024];
    h.rng.fill(&mut data[..]);
    h.write("assets/model.bin", &data);
    h.write("notes.txt", "v1");

    let first = h.engine.checkpoint_with(&h.session, "v1", &CancelToken::new()).unwrap();
    assert_eq!(first.stats.blobs_written, 2);

    h.write("notes.txt", "v2");
    let second = h.engine.checkpoint_with(&h.session, "v2", &CancelToken::new()).unwrap();
    // Only the edited text file is new
    assert_eq!(second.stats.blobs_written, 1);
    assert_eq!(second.stats.dedup_hits, 1);

    let third = h.engine.checkpoint_with(&h.session, "v2 again", &CancelToken::new()).unwrap();
    assert_eq!(third.stats.blobs_written, 0);

    let deltas = h.engine.diff(&first.checkpoint.id, &second.checkpoint.id).unwrap();
    assert_eq!(deltas.len(), 1);
    assert!(deltas.get("assets/model.bin").is_none());
}

#[test]
fn test_fork_preserves_abandoned_branch() {
    let h = RewindTestHarness::new();

    h.write("a.txt", "base");
    let a = h.checkpoint("A");
    h.write("a.txt", "branch one");
    h.write("one.txt", "1");
    let b = h.checkpoint("B");

    h.restore(&a.id);
    h.write("a.txt", "branch two");
    let c = h.checkpoint("C");

    // Both branches hang off A
    let timeline = h.engine.timeline(&h.session).unwrap();
    assert_eq!(timeline.len(), 1);
    let children: Vec<_> = h
        .engine
        .index()
        .timeline(&h.session)
        .unwrap()
        .read()
        .children(&a.id)
        .iter()
        .map(|c| c.id.clone())
        .collect();
    assert!(children.contains(&b.id));
    assert!(children.contains(&c.id));

    // The abandoned branch is intact and restorable
    assert!(h.engine.verify_checkpoint(&b.id).unwrap().is_valid());
    h.restore(&b.id);
    assert_eq!(h.read("a.txt"), "branch one");
    assert_eq!(h.read("one.txt"), "1");

    let ancestor = h.engine.common_ancestor(&b.id, &c.id).unwrap().unwrap();
    assert_eq!(ancestor.id, a.id);
}

#[test]
fn test_restore_always_records_pre_restore_state() {
    let h = RewindTestHarness::new();

    h.write("a.txt", "saved");
    let a = h.checkpoint("A");
    h.write("a.txt", "unsaved edit");

    let report = h
        .engine
        .restore_with_report(&h.session, &a.id, RestoreOptions::default(), &CancelToken::new())
        .unwrap();
    let pre = report.pre_restore.unwrap();
    assert!(pre.is_pre_restore());
    assert_eq!(pre.parent_id.as_deref(), Some(a.id.as_str()));

    // The unsaved edit can be recovered
    h.restore(&pre.id);
    assert_eq!(h.read("a.txt"), "unsaved edit");
}

#[test]
fn test_dry_run_restore_changes_nothing() {
    let h = RewindTestHarness::new();

    h.write("a.txt", "1");
    let a = h.checkpoint("A");
    h.write("a.txt", "2");
    h.write("b.txt", "new");
    let b = h.checkpoint("B");

    let options = RestoreOptions {
        dry_run: true,
        ..Default::default()
    };
    let report = h
        .engine
        .restore_with_report(&h.session, &a.id, options, &CancelToken::new())
        .unwrap();
    assert!(report.dry_run);
    assert!(report.pre_restore.is_none());
    assert_eq!(report.planned.files_modified, 1);
    assert_eq!(report.planned.files_removed, 1);

    assert_eq!(h.read("a.txt"), "2");
    assert_eq!(h.engine.list(&h.session).unwrap().len(), 2);
    assert_eq!(h.engine.current(&h.session).unwrap().unwrap().id, b.id);
}

#[test]
fn test_ancestors_and_common_ancestor() {
    let h = RewindTestHarness::new();

    h.write("f.txt", "0");
    let root = h.checkpoint("root");
    h.write("f.txt", "1");
    let one = h.checkpoint("one");
    h.write("f.txt", "2");
    let two = h.checkpoint("two");

    let ancestors: Vec<_> = h.engine.ancestors(&two.id).unwrap().into_iter().map(|c| c.id).collect();
    assert_eq!(ancestors, vec![one.id.clone(), root.id.clone()]);
    assert!(h.engine.ancestors(&root.id).unwrap().is_empty());

    // An ancestor of the other checkpoint is their common ancestor
    let lca = h.engine.common_ancestor(&one.id, &two.id).unwrap().unwrap();
    assert_eq!(lca.id, one.id);
}

#[test]
fn test_diff_classifies_changes() {
    let h = RewindTestHarness::new();

    h.write("keep.txt", "same");
    h.write("edit.txt", "alpha\nbeta\ngamma\n");
    h.write("gone.txt", "bye");
    let a = h.checkpoint("A");

    h.write("edit.txt", "alpha\nBETA\ngamma\n");
    fs::remove_file(h.work.join("gone.txt")).unwrap();
    h.write("new/added.txt", "hello");
    let b = h.checkpoint("B");

    let deltas = h.engine.diff(&a.id, &b.id).unwrap();
    let summary: Vec<_> = deltas.iter().map(|d| (d.path.as_str(), d.change.label())).collect();
    assert_eq!(
        summary,
        vec![("edit.txt", "modified"), ("gone.txt", "removed"), ("new/added.txt", "added")]
    );

    let stats = deltas.stats();
    assert_eq!(stats.files_added, 1);
    assert_eq!(stats.files_removed, 1);
    assert_eq!(stats.files_modified, 1);

    // Same inputs, same output
    let again = h.engine.diff(&a.id, &b.id).unwrap();
    let again: Vec<_> = again.iter().map(|d| (d.path.as_str(), d.change.label())).collect();
    assert_eq!(summary, again);

    let edit = deltas.get("edit.txt").unwrap();
    match h.engine.line_detail(edit, &DiffOptions::default()).unwrap() {
        LineDetail::Text(file) => {
            assert_eq!(file.lines_added, 1);
            assert_eq!(file.lines_deleted, 1);
            assert_eq!(file.hunks.len(), 1);
        }
        other => panic!("expected text detail, got {:?}", other),
    }
}

#[test]
fn test_binary_files_have_no_line_detail() {
    let h = RewindTestHarness::new();

    h.write("image.bin", [0u8, 159, 146, 150, 0, 1, 2]);
    let a = h.checkpoint("A");
    h.write("image.bin", [0u8, 1, 2, 3, 0, 5]);
    let b = h.checkpoint("B");

    let details = h.engine.diff_detailed(&a.id, &b.id, &DiffOptions::default()).unwrap();
    assert_eq!(details.len(), 1);
    assert!(matches!(details[0].1, LineDetail::Binary));
}

#[test]
fn test_history_survives_reopen() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "1");
    let a = h.checkpoint("A");
    h.write("a.txt", "2");
    let b = h.checkpoint("B");
    let storage = h.engine.storage_path().to_path_buf();

    let reopened = Rewind::open(&storage).unwrap();
    let listed: Vec<_> = reopened.list("main").unwrap().into_iter().map(|c| c.id).collect();
    assert_eq!(listed, vec![a.id.clone(), b.id.clone()]);
    assert_eq!(reopened.current("main").unwrap().unwrap().id, b.id);

    reopened.restore("main", &a.id).unwrap();
    assert_eq!(h.read("a.txt"), "1");
}

#[test]
fn test_gc_only_reclaims_unreferenced_content() {
    let h = RewindTestHarness::new();

    h.write("shared.txt", "shared");
    h.checkpoint("main");

    let scratch = h.dir.path().join("scratch");
    fs::create_dir(&scratch).unwrap();
    fs::write(scratch.join("shared.txt"), "shared").unwrap();
    fs::write(scratch.join("only.txt"), "scratch only").unwrap();
    h.engine.register_session("scratch", &scratch).unwrap();
    h.engine.checkpoint("scratch", "scratch").unwrap();

    // Nothing is unreferenced yet
    let stats = h.engine.gc().unwrap();
    assert_eq!(stats.blobs_deleted, 0);
    assert_eq!(stats.trees_deleted, 0);

    h.engine.remove_session("scratch", false).unwrap();
    let analysis = h.engine.gc_analyze().unwrap();
    assert!(analysis.dry_run);
    assert_eq!(analysis.blobs_deleted, 1);
    assert_eq!(h.engine.store().list_blobs().unwrap().len(), 2);

    let stats = h.engine.gc().unwrap();
    assert_eq!(stats.blobs_deleted, 1);
    assert_eq!(stats.trees_deleted, 1);
    assert_eq!(stats.records_deleted, 1);

    let current = h.engine.current(&h.session).unwrap().unwrap();
    assert!(h.engine.verify_checkpoint(&current.id).unwrap().is_valid());
}

#[test]
fn test_verify_session_after_mixed_history() {
    let mut h = RewindTestHarness::new();
    h.generate_files(10);
    let a = h.checkpoint("A");
    h.generate_files(15);
    h.checkpoint("B");
    h.restore(&a.id);
    h.write("extra.txt", "x");
    h.checkpoint("C");

    let report = h.engine.verify_session(&h.session).unwrap();
    assert!(report.is_valid(), "{}", report.summary());
    assert_eq!(report.total_checkpoints, 4);
    assert_eq!(report.valid_checkpoints, 4);
}

#[test]
fn test_session_metrics_cover_every_checkpoint() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "1");
    h.checkpoint("A");
    h.write("b.txt", "2");
    h.checkpoint("B");
    h.write("a.txt", "11");
    h.checkpoint("C");

    let metrics = h.engine.session_metrics(&h.session).unwrap();
    assert_eq!(metrics.len(), 3);
    assert_eq!(metrics[0].changes.files_added, 1);
    assert_eq!(metrics[1].changes.files_added, 1);
    assert_eq!(metrics[2].changes.files_modified, 1);
    assert_eq!(metrics[2].file_count, 2);
}

#[tokio::test]
async fn test_events_follow_operations() {
    let h = RewindTestHarness::new();
    let mut events = h.engine.subscribe();

    h.write("a.txt", "1");
    let a = h.checkpoint("A");
    h.write("a.txt", "2");
    h.checkpoint("B");
    h.restore(&a.id);

    let mut created = 0;
    let mut restored = None;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::CheckpointCreated { .. } => created += 1,
            EngineEvent::RestoreCompleted {
                target_checkpoint_id,
                pre_restore_checkpoint_id,
                ..
            } => restored = Some((target_checkpoint_id, pre_restore_checkpoint_id)),
        }
    }
    // A, B and the pre-restore checkpoint
    assert_eq!(created, 3);
    let (target, pre) = restored.unwrap();
    assert_eq!(target, a.id);
    assert!(!pre.is_empty());
}

#[tokio::test]
async fn test_background_operations_can_be_awaited() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "1");

    let first = h.engine.spawn_checkpoint(&h.session, "bg").join().await.unwrap();
    h.write("a.txt", "2");
    h.checkpoint("fg");

    let report = h.engine.spawn_restore(&h.session, &first.id).join().await.unwrap();
    assert_eq!(report.target.id, first.id);
    assert_eq!(h.read("a.txt"), "1");
}

#[tracing_test::traced_test]
#[test]
fn test_operations_are_logged() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "1");
    let a = h.checkpoint("A");
    h.write("a.txt", "2");
    h.checkpoint("B");
    h.restore(&a.id);

    assert!(logs_contain("Created manual checkpoint"));
    assert!(logs_contain("Created pre-restore checkpoint"));
    assert!(logs_contain(&format!("to {}", a.short_id())));
}
