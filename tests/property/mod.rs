//! Property-based testing for rewind
//!
//! Uses proptest to check invariants across randomly generated directory
//! states and edits.

use ::rewind::*;
use ::rewind::diff::compute_line_diff;
use tempfile::TempDir;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Edits applied between checkpoints
#[derive(Debug, Clone)]
pub enum FileOperation {
    Write { path: String, content: Vec<u8> },
    Delete { index: usize },
}

/// Relative paths up to three directories deep
fn path_strategy() -> impl Strategy<Value = String> {
    let dirs = prop::collection::vec("[a-d]{1,3}", 0..=3);
    let name = prop_oneof!["file[0-9]{1,2}\\.txt", "[a-z]{3,8}\\.(rs|md)", "data[0-9]\\.bin"];
    (dirs, name).prop_map(|(dirs, name)| {
        let mut path = dirs.join("/");
        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(&name);
        path
    })
}

fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..512),
        "[a-z \n]{0,256}".prop_map(String::into_bytes),
    ]
}

/// A directory state with no file/directory name clashes
fn state_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(path_strategy(), content_strategy(), 0..25).prop_map(|files| {
        let mut clean: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (path, content) in files {
            let clashes = clean.keys().any(|existing| {
                existing.starts_with(&format!("{}/", path)) || path.starts_with(&format!("{}/", existing))
            });
            if !clashes {
                clean.insert(path, content);
            }
        }
        clean
    })
}

fn operation_strategy() -> impl Strategy<Value = FileOperation> {
    prop_oneof![
        (path_strategy(), content_strategy()).prop_map(|(path, content)| FileOperation::Write { path, content }),
        any::<usize>().prop_map(|index| FileOperation::Delete { index }),
    ]
}

fn write_state(root: &Path, files: &BTreeMap<String, Vec<u8>>) {
    for (rel, content) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

fn read_state(root: &Path) -> BTreeMap<String, Vec<u8>> {
    crate::integration::collect_files(root)
}

/// Apply edits, skipping any that would turn a file into a directory or back
fn apply_operations(root: &Path, operations: &[FileOperation]) {
    for op in operations {
        match op {
            FileOperation::Write { path, content } => {
                let target = root.join(path);
                let blocked = target.is_dir()
                    || target
                        .ancestors()
                        .skip(1)
                        .take_while(|p| *p != root)
                        .any(|p| p.is_file());
                if !blocked {
                    fs::create_dir_all(target.parent().unwrap()).unwrap();
                    fs::write(target, content).unwrap();
                }
            }
            FileOperation::Delete { index } => {
                let files: Vec<String> = read_state(root).into_keys().collect();
                if !files.is_empty() {
                    fs::remove_file(root.join(&files[index % files.len()])).unwrap();
                }
            }
        }
    }
}

struct Env {
    _dir: TempDir,
    work: std::path::PathBuf,
    engine: Rewind,
}

fn env() -> Env {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    fs::create_dir(&work).unwrap();
    let engine = Rewind::builder()
        .parallel_workers(2)
        .build(dir.path().join("storage"))
        .unwrap();
    engine.register_session("prop", &work).unwrap();
    Env {
        _dir: dir,
        work,
        engine,
    }
}

/// Length of the longest common subsequence of two line lists
fn lcs_len(a: &[&str], b: &[&str]) -> usize {
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    table[0][0]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The same directory content always produces the same tree hash
    #[test]
    fn capture_is_deterministic(state in state_strategy()) {
        let first = env();
        let second = env();
        write_state(&first.work, &state);
        write_state(&second.work, &state);

        let a = first.engine.checkpoint("prop", "a").unwrap();
        let b = second.engine.checkpoint("prop", "b").unwrap();
        let again = first.engine.checkpoint("prop", "again").unwrap();
        prop_assert_eq!(&a.tree_hash, &b.tree_hash);
        prop_assert_eq!(&a.tree_hash, &again.tree_hash);
        prop_assert_eq!(a.metadata.file_count, state.len());
    }

    /// Restoring a checkpoint reproduces its files exactly
    #[test]
    fn restore_round_trips(
        state in state_strategy(),
        operations in prop::collection::vec(operation_strategy(), 1..30),
    ) {
        let env = env();
        write_state(&env.work, &state);
        let checkpoint = env.engine.checkpoint("prop", "base").unwrap();

        apply_operations(&env.work, &operations);
        env.engine.restore("prop", &checkpoint.id).unwrap();
        prop_assert_eq!(read_state(&env.work), state);
    }

    /// Re-capturing unchanged content writes no blobs
    #[test]
    fn unchanged_content_is_never_stored_twice(
        state in state_strategy(),
        operations in prop::collection::vec(operation_strategy(), 0..10),
    ) {
        let env = env();
        write_state(&env.work, &state);
        env.engine.checkpoint("prop", "first").unwrap();
        apply_operations(&env.work, &operations);
        env.engine.checkpoint("prop", "second").unwrap();

        let blobs = env.engine.store().list_blobs().unwrap().len();
        let snapshot = env.engine.checkpoint_with("prop", "third", &CancelToken::new()).unwrap();
        prop_assert_eq!(snapshot.stats.blobs_written, 0);
        prop_assert_eq!(env.engine.store().list_blobs().unwrap().len(), blobs);

        let distinct: std::collections::HashSet<_> = read_state(&env.work).into_values().collect();
        prop_assert!(blobs >= distinct.len());
    }

    /// Deltas match a direct comparison of the two states
    #[test]
    fn diff_matches_state_comparison(
        state in state_strategy(),
        operations in prop::collection::vec(operation_strategy(), 1..20),
    ) {
        let env = env();
        write_state(&env.work, &state);
        let before = read_state(&env.work);
        let a = env.engine.checkpoint("prop", "a").unwrap();
        apply_operations(&env.work, &operations);
        let after = read_state(&env.work);
        let b = env.engine.checkpoint("prop", "b").unwrap();

        let deltas = env.engine.diff(&a.id, &b.id).unwrap();
        let mut expected = Vec::new();
        for path in before.keys().chain(after.keys()).collect::<std::collections::BTreeSet<_>>() {
            match (before.get(path), after.get(path)) {
                (Some(_), None) => expected.push((path.clone(), "removed")),
                (None, Some(_)) => expected.push((path.clone(), "added")),
                (Some(x), Some(y)) if x != y => expected.push((path.clone(), "modified")),
                _ => {}
            }
        }
        let actual: Vec<_> = deltas.iter().map(|d| (d.path.clone(), d.change.label())).collect();
        prop_assert_eq!(actual, expected);
        prop_assert!(env.engine.diff(&b.id, &b.id).unwrap().is_empty());
    }

    /// Line diffs are minimal edit scripts
    #[test]
    fn line_diff_is_minimal(
        old in prop::collection::vec("[abc]{0,2}", 0..30),
        new in prop::collection::vec("[abc]{0,2}", 0..30),
    ) {
        let old_text = old.join("\n");
        let new_text = new.join("\n");
        let hunks = compute_line_diff(old_text.as_bytes(), new_text.as_bytes(), &DiffOptions::default());

        let mut added = 0;
        let mut deleted = 0;
        for hunk in &hunks {
            for change in &hunk.changes {
                match change {
                    LineChange::Added(..) => added += 1,
                    LineChange::Deleted(..) => deleted += 1,
                    LineChange::Context(..) => {}
                }
            }
        }

        let old_lines: Vec<&str> = old_text.lines().collect();
        let new_lines: Vec<&str> = new_text.lines().collect();
        let common = lcs_len(&old_lines, &new_lines);
        prop_assert_eq!(deleted, old_lines.len() - common);
        prop_assert_eq!(added, new_lines.len() - common);
        prop_assert_eq!(hunks.is_empty(), old_lines == new_lines);
    }
}
