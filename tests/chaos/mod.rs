//! Chaos testing for rewind
//!
//! Random edit sequences, corrupted storage, cancellation and contention
//! between operations.

use ::rewind::*;
use tempfile::TempDir;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use tracing::{debug, info};

use crate::integration::collect_files;

/// Operations applied to the working directory
#[derive(Debug, Clone, Copy)]
enum ChaosOperation {
    CreateFile,
    ModifyFile,
    DeleteFile,
    Checkpoint,
    Restore,
}

struct ChaosRunner {
    _dir: TempDir,
    work: PathBuf,
    engine: Rewind,
    rng: StdRng,
    expected: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    next_file: usize,
}

impl ChaosRunner {
    fn new(seed: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        let engine = Rewind::builder()
            .parallel_workers(3)
            .build(dir.path().join("storage"))
            .unwrap();
        engine.register_session("chaos", &work).unwrap();
        Self {
            _dir: dir,
            work,
            engine,
            rng: StdRng::seed_from_u64(seed),
            expected: BTreeMap::new(),
            next_file: 0,
        }
    }

    fn existing_files(&self) -> Vec<String> {
        collect_files(&self.work).into_keys().collect()
    }

    fn random_content(&mut self) -> Vec<u8> {
        let len = self.rng.random_range(0..2048);
        if self.rng.random_bool(0.2) {
            (0..len).map(|_| self.rng.random::<u8>()).collect()
        } else {
            (0..len).map(|_| b'a' + self.rng.random_range(0..26u8)).collect()
        }
    }

    fn step(&mut self) {
        let op = *[
            ChaosOperation::CreateFile,
            ChaosOperation::CreateFile,
            ChaosOperation::ModifyFile,
            ChaosOperation::ModifyFile,
            ChaosOperation::DeleteFile,
            ChaosOperation::Checkpoint,
            ChaosOperation::Restore,
        ]
        .choose(&mut self.rng)
        .unwrap();
        debug!("chaos step {:?}", op);

        match op {
            ChaosOperation::CreateFile => {
                let dir = ["", "a/", "a/b/", "c/"][self.rng.random_range(0..4)];
                let rel = format!("{}f{}.dat", dir, self.next_file);
                self.next_file += 1;
                let content = self.random_content();
                let path = self.work.join(&rel);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, content).unwrap();
            }
            ChaosOperation::ModifyFile => {
                let files = self.existing_files();
                if let Some(rel) = files.choose(&mut self.rng).cloned() {
                    let content = self.random_content();
                    fs::write(self.work.join(rel), content).unwrap();
                }
            }
            ChaosOperation::DeleteFile => {
                let files = self.existing_files();
                if let Some(rel) = files.choose(&mut self.rng).cloned() {
                    fs::remove_file(self.work.join(rel)).unwrap();
                }
            }
            ChaosOperation::Checkpoint => {
                let checkpoint = self.engine.checkpoint("chaos", "chaos").unwrap();
                self.expected.insert(checkpoint.id, collect_files(&self.work));
            }
            ChaosOperation::Restore => {
                let ids: Vec<String> = self.expected.keys().cloned().collect();
                if let Some(id) = ids.choose(&mut self.rng) {
                    self.engine.restore("chaos", id).unwrap();
                    assert_eq!(&collect_files(&self.work), &self.expected[id], "restore to {}", id);
                }
            }
        }
    }
}

#[test]
fn test_random_operations_restore_exactly() {
    for seed in [1u64, 7, 1234] {
        let mut runner = ChaosRunner::new(seed);
        for _ in 0..60 {
            runner.step();
        }

        // Every recorded state is still reachable afterwards
        let ids: Vec<String> = runner.expected.keys().cloned().collect();
        for id in &ids {
            runner.engine.restore("chaos", id).unwrap();
            assert_eq!(collect_files(&runner.work), runner.expected[id]);
        }

        let report = runner.engine.verify_session("chaos").unwrap();
        assert!(report.is_valid(), "seed {}: {}", seed, report.summary());
        info!("seed {} produced {} checkpoints", seed, report.total_checkpoints);
    }
}

/// Flip the last byte of a stored object
fn corrupt_object(storage: &Path, hash: &BlobHash) {
    let hex = hash.as_str();
    let path = storage.join("objects").join(&hex[..2]).join(&hex[2..]);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&path, bytes).unwrap();
}

#[test]
fn test_corrupted_blob_fails_restore_without_touching_files() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    fs::create_dir(&work).unwrap();
    let storage = dir.path().join("storage");
    let engine = Rewind::builder()
        .compression_strategy(CompressionStrategy::None)
        .build(&storage)
        .unwrap();
    engine.register_session("s", &work).unwrap();

    fs::write(work.join("a.txt"), "original a").unwrap();
    fs::write(work.join("b.txt"), "original b").unwrap();
    let a = engine.checkpoint("s", "A").unwrap();

    fs::write(work.join("a.txt"), "edited a").unwrap();
    fs::remove_file(work.join("b.txt")).unwrap();
    engine.checkpoint("s", "B").unwrap();

    let tree = engine.store().get_tree(&a.tree_hash).unwrap();
    corrupt_object(&storage, &tree.get("b.txt").unwrap().hash);

    let err = engine.restore("s", &a.id).unwrap_err();
    match &err {
        RewindError::RestoreFailed {
            checkpoint_id,
            unapplied,
            ..
        } => {
            assert_eq!(checkpoint_id, &a.id);
            assert!(unapplied.contains(&PathBuf::from("b.txt")));
        }
        other => panic!("expected RestoreFailed, got {:?}", other),
    }

    // Staging failed, so the working directory is exactly as it was
    assert_eq!(fs::read_to_string(work.join("a.txt")).unwrap(), "edited a");
    assert!(!work.join("b.txt").exists());

    // The pre-restore checkpoint holds the live state and is now current
    let current = engine.current("s").unwrap().unwrap();
    assert!(current.is_pre_restore());

    // Verification and repair find the damage
    assert!(!engine.verify_checkpoint(&a.id).unwrap().is_valid());
    let repair = engine.repair().unwrap();
    assert_eq!(repair.quarantined.len(), 1);
    assert!(repair.damaged_checkpoints.contains(&a.id));

    // Content still present restores fine
    let b_state = engine.list("s").unwrap()[1].clone();
    engine.restore("s", &b_state.id).unwrap();
    assert_eq!(fs::read_to_string(work.join("a.txt")).unwrap(), "edited a");
}

#[test]
fn test_cancel_while_applying_keeps_partial_state() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    fs::create_dir_all(work.join("old")).unwrap();
    let storage = dir.path().join("storage");
    let engine = Rewind::builder().build(&storage).unwrap();
    engine.register_session("s", &work).unwrap();

    fs::write(work.join("main.rs"), "fn main() {}").unwrap();
    let a = engine.checkpoint("s", "A").unwrap();

    fs::write(work.join("main.rs"), "fn main() { todo() }").unwrap();
    fs::write(work.join("old/x.rs"), "x").unwrap();
    fs::write(work.join("old/y.rs"), "y").unwrap();
    engine.checkpoint("s", "B").unwrap();

    // Cancel as soon as the first removal lands
    let cancel = CancelToken::new();
    let observer: ApplyObserver = {
        let cancel = cancel.clone();
        Arc::new(move |_: &str| cancel.cancel())
    };
    let err = engine
        .restore_with_progress("s", &a.id, RestoreOptions::default(), &cancel, observer)
        .unwrap_err();
    let unapplied = match err {
        RewindError::RestoreFailed { unapplied, .. } => unapplied,
        other => panic!("expected RestoreFailed, got {:?}", other),
    };
    assert_eq!(unapplied, vec![PathBuf::from("old/x.rs"), PathBuf::from("main.rs")]);

    assert!(!work.join("old/y.rs").exists());
    assert_eq!(fs::read_to_string(work.join("old/x.rs")).unwrap(), "x");
    assert_eq!(fs::read_to_string(work.join("main.rs")).unwrap(), "fn main() { todo() }");

    let current = engine.current("s").unwrap().unwrap();
    assert!(current.is_pre_restore());
    let audit = restore::read_audit(&storage).unwrap();
    let last = audit.last().unwrap();
    assert_eq!(last.phase, RestorePhase::Failed);
    assert_eq!(last.unapplied, unapplied);
    assert_eq!(last.pre_restore_checkpoint_id.as_deref(), Some(current.id.as_str()));

    // The pre-restore checkpoint still brings back everything
    engine.restore("s", &current.id).unwrap();
    assert_eq!(fs::read_to_string(work.join("old/y.rs")).unwrap(), "y");
}

#[test]
fn test_get_detects_integrity_mismatch() {
    let dir = TempDir::new().unwrap();
    let storage = dir.path().join("storage");
    let store = ContentStore::init(&storage, RewindConfig::default()).unwrap();

    let hash = store.put(b"precious bytes").unwrap();
    assert_eq!(store.get(&hash).unwrap(), b"precious bytes");

    corrupt_object(&storage, &hash);
    let err = store.get(&hash).unwrap_err();
    assert!(err.is_corruption(), "{:?}", err);

    let missing = BlobHash::of(b"never stored");
    assert!(matches!(store.get(&missing), Err(RewindError::NotFound { .. })));
}

#[test]
fn test_cancelled_capture_records_nothing() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    fs::create_dir(&work).unwrap();
    for i in 0..50 {
        fs::write(work.join(format!("{}.txt", i)), i.to_string()).unwrap();
    }
    let engine = Rewind::builder().build(dir.path().join("storage")).unwrap();
    engine.register_session("s", &work).unwrap();
    let base = engine.checkpoint("s", "base").unwrap();

    fs::write(work.join("new.txt"), "new").unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = engine.checkpoint_with("s", "cancelled", &cancel).unwrap_err();
    assert!(matches!(err, RewindError::Cancelled(_)), "{:?}", err);

    assert_eq!(engine.list("s").unwrap().len(), 1);
    assert_eq!(engine.current("s").unwrap().unwrap().id, base.id);
    // The lock was released
    assert!(engine.busy_with("s").is_none());
    engine.checkpoint("s", "after").unwrap();
}

/// Ignore predicate that parks the first capture until released
fn blocking_predicate(entered: Arc<Barrier>, release: Arc<Barrier>) -> IgnorePredicate {
    let armed = Arc::new(AtomicBool::new(true));
    Arc::new(move |_path: &Path| {
        if armed.swap(false, Ordering::SeqCst) {
            entered.wait();
            release.wait();
        }
        false
    })
}

#[test]
fn test_busy_session_rejects_other_operations() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    let other = dir.path().join("other");
    fs::create_dir(&work).unwrap();
    fs::create_dir(&other).unwrap();
    fs::write(work.join("a.txt"), "a").unwrap();
    fs::write(other.join("b.txt"), "b").unwrap();

    // The parked capture occupies one worker; the others keep serving
    let engine = Rewind::builder()
        .parallel_workers(4)
        .build(dir.path().join("storage"))
        .unwrap();
    engine.register_session("other", &other).unwrap();
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    engine
        .register_session_with_ignore(
            "busy",
            &work,
            blocking_predicate(Arc::clone(&entered), Arc::clone(&release)),
        )
        .unwrap();

    let handle = engine.spawn_checkpoint("busy", "slow");
    entered.wait();

    assert_eq!(engine.busy_with("busy"), Some(session::OperationKind::Capture));
    let err = engine.checkpoint("busy", "second").unwrap_err();
    match err {
        RewindError::ConcurrencyConflict { session_id, .. } => assert_eq!(session_id, "busy"),
        other => panic!("expected ConcurrencyConflict, got {:?}", other),
    }
    assert!(matches!(engine.gc(), Err(RewindError::ConcurrencyConflict { .. })));

    // Reads and other sessions are unaffected
    assert!(engine.list("busy").unwrap().is_empty());
    engine.checkpoint("other", "independent").unwrap();

    release.wait();
    let checkpoint = handle.wait().unwrap();
    assert_eq!(checkpoint.message, "slow");
    assert!(engine.busy_with("busy").is_none());
    engine.checkpoint("busy", "second").unwrap();
}

#[test]
fn test_parallel_sessions() {
    let dir = TempDir::new().unwrap();
    let engine = Rewind::builder()
        .parallel_workers(4)
        .build(dir.path().join("storage"))
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|n| {
            let engine = engine.clone();
            let root = dir.path().join(format!("ws{}", n));
            thread::spawn(move || {
                fs::create_dir(&root).unwrap();
                let sid = format!("session-{}", n);
                engine.register_session(&sid, &root).unwrap();
                let mut ids = Vec::new();
                for round in 0..5 {
                    fs::write(root.join("shared.txt"), "same everywhere").unwrap();
                    fs::write(root.join("mine.txt"), format!("{} {}", n, round)).unwrap();
                    ids.push(engine.checkpoint(&sid, &format!("round {}", round)).unwrap().id);
                }
                engine.restore(&sid, &ids[1]).unwrap();
                assert_eq!(fs::read_to_string(root.join("mine.txt")).unwrap(), format!("{} 1", n));
                sid
            })
        })
        .collect();

    let sessions: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for sid in &sessions {
        // 5 rounds plus one pre-restore checkpoint
        assert_eq!(engine.list(sid).unwrap().len(), 6);
        assert!(engine.verify_session(sid).unwrap().is_valid());
    }
    assert_eq!(engine.sessions().unwrap().len(), 6);
}

#[test]
fn test_leftover_temp_files_are_cleaned() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    fs::create_dir(&work).unwrap();
    let storage = dir.path().join("storage");
    let engine = Rewind::builder().build(&storage).unwrap();
    engine.register_session("s", &work).unwrap();
    fs::write(work.join("a.txt"), "a").unwrap();
    engine.checkpoint("s", "A").unwrap();

    // Simulate a crash between temp write and rename
    let tmp = storage.join("tmp");
    fs::create_dir_all(&tmp).unwrap();
    fs::write(tmp.join("crashed-write"), "partial").unwrap();

    let repair = engine.repair().unwrap();
    assert!(repair.tmp_files_removed >= 1);
    assert!(repair.quarantined.is_empty());
    assert!(!tmp.join("crashed-write").exists());
}
