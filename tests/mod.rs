//! Main test module for rewind
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end scenarios
//! - Chaos tests for failure handling and concurrency
//! - Property-based tests for invariants

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::rewind::*;
    use tempfile::TempDir;
    use std::fs;
    use std::path::PathBuf;

    fn setup() -> (TempDir, PathBuf, Rewind) {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        let engine = Rewind::builder()
            .parallel_workers(2)
            .build(dir.path().join("storage"))
            .unwrap();
        engine.register_session("edge", &work).unwrap();
        (dir, work, engine)
    }

    #[test]
    fn test_empty_directory() {
        let (_dir, work, engine) = setup();

        let checkpoint = engine.checkpoint("edge", "Empty").unwrap();
        assert_eq!(checkpoint.metadata.file_count, 0);
        assert!(checkpoint.parent_id.is_none());

        fs::write(work.join("file.txt"), "content").unwrap();

        // Restore should remove the file
        engine.restore("edge", &checkpoint.id).unwrap();
        assert!(!work.join("file.txt").exists());
    }

    #[test]
    fn test_special_filenames() {
        let (_dir, work, engine) = setup();

        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file_with_underscores.txt",
            "file.multiple.dots.txt",
            "UPPERCASE.TXT",
            "ümlaut-ñame.txt",
            "日本語.txt",
            ".hidden",
        ];
        for name in &special_names {
            fs::write(work.join(name), format!("content of {}", name)).unwrap();
        }

        let checkpoint = engine.checkpoint("edge", "Special names").unwrap();
        assert_eq!(checkpoint.metadata.file_count, special_names.len());

        for name in &special_names {
            fs::remove_file(work.join(name)).unwrap();
        }
        engine.restore("edge", &checkpoint.id).unwrap();

        for name in &special_names {
            let content = fs::read_to_string(work.join(name)).unwrap();
            assert_eq!(content, format!("content of {}", name));
        }
    }

    #[test]
    fn test_deeply_nested_paths() {
        let (_dir, work, engine) = setup();

        let mut deep = work.clone();
        for i in 0..20 {
            deep = deep.join(format!("level{}", i));
        }
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("leaf.txt"), "bottom").unwrap();

        let checkpoint = engine.checkpoint("edge", "Deep").unwrap();
        fs::remove_dir_all(work.join("level0")).unwrap();

        engine.restore("edge", &checkpoint.id).unwrap();
        assert_eq!(fs::read_to_string(deep.join("leaf.txt")).unwrap(), "bottom");
    }

    #[test]
    fn test_empty_files_share_one_blob() {
        let (_dir, work, engine) = setup();

        for i in 0..5 {
            fs::write(work.join(format!("empty{}.txt", i)), "").unwrap();
        }
        let checkpoint = engine.checkpoint("edge", "Empties").unwrap();
        assert_eq!(checkpoint.metadata.file_count, 5);
        assert_eq!(checkpoint.metadata.total_size, 0);
        assert_eq!(engine.store().list_blobs().unwrap().len(), 1);
    }

    #[test]
    fn test_timestamps_do_not_affect_identity() {
        use filetime::{set_file_mtime, FileTime};

        let (_dir, work, engine) = setup();

        fs::write(work.join("a.txt"), "stable").unwrap();
        let first = engine.checkpoint("edge", "Before touch").unwrap();

        set_file_mtime(work.join("a.txt"), FileTime::from_unix_time(1_000_000, 0)).unwrap();
        assert!(engine.status("edge").unwrap().is_empty());

        let second = engine.checkpoint("edge", "After touch").unwrap();
        assert_eq!(first.tree_hash, second.tree_hash);
        assert!(engine.diff(&first.id, &second.id).unwrap().is_empty());
    }

    #[test]
    fn test_restore_prunes_directories_emptied_by_restore() {
        let (_dir, work, engine) = setup();

        fs::write(work.join("keep.txt"), "k").unwrap();
        let base = engine.checkpoint("edge", "Base").unwrap();

        fs::create_dir_all(work.join("new/inner")).unwrap();
        fs::write(work.join("new/inner/file.txt"), "x").unwrap();
        engine.checkpoint("edge", "With dir").unwrap();

        engine.restore("edge", &base.id).unwrap();
        assert!(!work.join("new").exists());
        assert!(work.join("keep.txt").exists());
    }

    #[test]
    fn test_restore_to_current_state_is_a_no_op() {
        let (_dir, work, engine) = setup();

        fs::write(work.join("a.txt"), "same").unwrap();
        let checkpoint = engine.checkpoint("edge", "Only").unwrap();

        let report = engine
            .restore_with_report("edge", &checkpoint.id, RestoreOptions::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.files_changed(), 0);
        assert!(report.pre_restore.is_some());
        assert_eq!(fs::read_to_string(work.join("a.txt")).unwrap(), "same");
    }

    #[test]
    fn test_unknown_checkpoint_is_not_found() {
        let (_dir, _work, engine) = setup();

        let err = engine.restore("edge", "does-not-exist").unwrap_err();
        assert!(matches!(err, RewindError::NotFound { .. }), "{:?}", err);

        let err = engine.list("no-such-session").unwrap_err();
        assert!(matches!(err, RewindError::NotFound { .. }), "{:?}", err);
    }

    #[test]
    fn test_restore_across_sessions_is_rejected() {
        let (dir, work, engine) = setup();

        fs::write(work.join("a.txt"), "a").unwrap();
        let foreign = engine.checkpoint("edge", "Edge session").unwrap();

        let other = dir.path().join("other");
        fs::create_dir(&other).unwrap();
        engine.register_session("other", &other).unwrap();

        let err = engine.restore("other", &foreign.id).unwrap_err();
        assert!(matches!(err, RewindError::NotFound { .. }), "{:?}", err);
        assert!(!other.join("a.txt").exists());
    }

    #[test]
    fn test_ambiguous_prefix() {
        let (_dir, work, engine) = setup();

        let mut ids = Vec::new();
        for i in 0..40 {
            fs::write(work.join("f.txt"), i.to_string()).unwrap();
            ids.push(engine.checkpoint("edge", &format!("cp{}", i)).unwrap().id);
        }

        // 40 ids over 16 leading hex digits guarantee a shared first character
        let shared = ids
            .iter()
            .map(|id| &id[..1])
            .find(|p| ids.iter().filter(|id| id.starts_with(*p)).count() > 1)
            .unwrap();
        let err = engine.resolve("edge", shared).unwrap_err();
        assert!(matches!(err, RewindError::AmbiguousId { .. }), "{:?}", err);

        let resolved = engine.resolve("edge", &ids[7]).unwrap();
        assert_eq!(resolved.message, "cp7");
    }

    #[test]
    fn test_ignore_patterns_are_honoured() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(work.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(work.join("build")).unwrap();
        fs::write(work.join("node_modules/pkg/index.js"), "x").unwrap();
        fs::write(work.join("build/out.o"), "o").unwrap();
        fs::write(work.join("notes.log"), "log").unwrap();
        fs::write(work.join("main.rs"), "fn main() {}").unwrap();

        let engine = Rewind::builder()
            .add_ignore_pattern("build/**")
            .add_ignore_pattern("*.log")
            .build(dir.path().join("storage"))
            .unwrap();
        engine.register_session("edge", &work).unwrap();

        let checkpoint = engine.checkpoint("edge", "Filtered").unwrap();
        assert_eq!(checkpoint.metadata.file_count, 1);

        // Restoring never touches ignored files
        fs::write(work.join("main.rs"), "changed").unwrap();
        engine.restore("edge", &checkpoint.id).unwrap();
        assert!(work.join("build/out.o").exists());
        assert!(work.join("notes.log").exists());
        assert!(work.join("node_modules/pkg/index.js").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_and_mode_round_trip() {
        use std::os::unix::fs::{symlink, PermissionsExt};

        let (_dir, work, engine) = setup();

        fs::write(work.join("script.sh"), "#!/bin/sh\necho hi\n").unwrap();
        fs::set_permissions(work.join("script.sh"), fs::Permissions::from_mode(0o755)).unwrap();
        symlink("script.sh", work.join("link")).unwrap();

        let checkpoint = engine.checkpoint("edge", "Links").unwrap();

        fs::remove_file(work.join("link")).unwrap();
        fs::set_permissions(work.join("script.sh"), fs::Permissions::from_mode(0o644)).unwrap();
        engine.restore("edge", &checkpoint.id).unwrap();

        let target = fs::read_link(work.join("link")).unwrap();
        assert_eq!(target, PathBuf::from("script.sh"));
        let mode = fs::metadata(work.join("script.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_restore_saves_file_grown_past_size_limit() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        let engine = Rewind::builder()
            .max_file_size(1024)
            .build(dir.path().join("storage"))
            .unwrap();
        engine.register_session("edge", &work).unwrap();

        fs::write(work.join("data.bin"), [7u8; 16]).unwrap();
        let a = engine.checkpoint("edge", "Small").unwrap();
        fs::write(work.join("data.bin"), [9u8; 4096]).unwrap();

        let report = engine
            .restore_with_report("edge", &a.id, RestoreOptions::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(fs::read(work.join("data.bin")).unwrap(), vec![7u8; 16]);

        // The edit lives on in the pre-restore checkpoint
        let pre = report.pre_restore.unwrap();
        engine.restore("edge", &pre.id).unwrap();
        assert_eq!(fs::read(work.join("data.bin")).unwrap(), vec![9u8; 4096]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_filename_round_trip() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (_dir, work, engine) = setup();
        let name = OsStr::from_bytes(b"caf\xe9.txt");

        fs::write(work.join("ok.txt"), "fine").unwrap();
        fs::write(work.join(name), "latin-1 name").unwrap();
        let checkpoint = engine.checkpoint("edge", "Raw names").unwrap();
        assert_eq!(checkpoint.metadata.file_count, 2);

        fs::remove_file(work.join(name)).unwrap();
        let deltas = engine.status("edge").unwrap();
        assert!(deltas.get("caf%E9.txt").is_some());

        engine.restore("edge", &checkpoint.id).unwrap();
        assert_eq!(fs::read(work.join(name)).unwrap(), b"latin-1 name");
        assert_eq!(fs::read_to_string(work.join("ok.txt")).unwrap(), "fine");
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_only_change_is_modified() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, work, engine) = setup();

        fs::write(work.join("tool"), "bin").unwrap();
        fs::set_permissions(work.join("tool"), fs::Permissions::from_mode(0o644)).unwrap();
        let a = engine.checkpoint("edge", "644").unwrap();
        fs::set_permissions(work.join("tool"), fs::Permissions::from_mode(0o755)).unwrap();
        let b = engine.checkpoint("edge", "755").unwrap();

        let deltas = engine.diff(&a.id, &b.id).unwrap();
        assert_eq!(deltas.len(), 1);
        let delta = deltas.get("tool").unwrap();
        assert!(matches!(delta.change, Change::Modified { .. }));
        assert!(!delta.content_changed());
        assert!(matches!(
            engine.line_detail(delta, &DiffOptions::default()).unwrap(),
            LineDetail::NotApplicable
        ));
    }
}
