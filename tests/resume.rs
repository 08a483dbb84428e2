//! Tests for the resume scan and progress reconciliation.

mod resume_tests {
    use ironshard::checkpoint::ProgressRecord;
    use ironshard::naming::ShardNaming;
    use ironshard::processor::KeyBatch;
    use ironshard::resume::{ResumeState, ShardCheck, check_shard, reconcile, scan_existing};
    use ironshard::testing::{SAMPLE_HEADER, gzip_bytes, truncate_half};
    use ironshard::writer::{ShardWriter, WriterOptions};
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Write complete shards for `keys`, `lines` data lines each.
    fn write_shards(dir: &Path, keys: &[&str], lines: usize) {
        let mut w = ShardWriter::new(
            dir,
            ShardNaming::default(),
            SAMPLE_HEADER.as_bytes(),
            WriterOptions::default(),
            Arc::new(HashSet::new()),
        )
        .unwrap();
        for key in keys {
            let mut bytes = Vec::new();
            for i in 0..lines {
                bytes.extend_from_slice(format!("{key}.P{i} {key}.Q{i} {}\n", i * 7919 % 1000).as_bytes());
            }
            w.write(key, &KeyBatch { bytes, lines: lines as u64 }).unwrap();
        }
        w.close_all().unwrap();
    }

    #[test]
    fn test_complete_shard_is_kept() {
        let tmp = TempDir::new().unwrap();
        write_shards(tmp.path(), &["9606", "10090"], 3);

        let state = scan_existing(tmp.path(), &ShardNaming::default()).unwrap();
        assert_eq!(state.complete, HashSet::from(["9606".to_string(), "10090".to_string()]));
        assert_eq!(state.complete_lines, 6);
        assert!(state.removed.is_empty());
    }

    #[test]
    fn test_truncated_shard_is_removed() {
        let tmp = TempDir::new().unwrap();
        let naming = ShardNaming::default();
        write_shards(tmp.path(), &["9606", "10090"], 2000);
        let damaged = naming.final_path(tmp.path(), "9606");
        truncate_half(&damaged).unwrap();
        assert_eq!(check_shard(&damaged), ShardCheck::Corrupt);

        let state = scan_existing(tmp.path(), &naming).unwrap();
        assert!(!state.complete.contains("9606"));
        assert!(state.complete.contains("10090"));
        assert_eq!(state.removed, vec![damaged.clone()]);
        assert!(!damaged.exists());
    }

    #[test]
    fn test_header_only_and_empty_shards_are_removed() {
        let tmp = TempDir::new().unwrap();
        let naming = ShardNaming::default();
        let header_only = naming.final_path(tmp.path(), "7227");
        let empty = naming.final_path(tmp.path(), "4932");
        fs::write(&header_only, gzip_bytes(&format!("{SAMPLE_HEADER}\n")).unwrap()).unwrap();
        fs::write(&empty, gzip_bytes("").unwrap()).unwrap();

        assert_eq!(check_shard(&header_only), ShardCheck::NoDataLines);
        assert_eq!(check_shard(&empty), ShardCheck::MissingHeader);

        let state = scan_existing(tmp.path(), &naming).unwrap();
        assert!(state.complete.is_empty());
        assert_eq!(state.removed.len(), 2);
        assert!(!header_only.exists());
        assert!(!empty.exists());
    }

    #[test]
    fn test_not_gzip_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let naming = ShardNaming::default();
        let bogus = naming.final_path(tmp.path(), "562");
        fs::write(&bogus, b"this is not gzip at all\n").unwrap();
        assert!(!check_shard(&bogus).is_complete());
    }

    #[test]
    fn test_foreign_and_temp_files_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let naming = ShardNaming::default();
        write_shards(tmp.path(), &["9606"], 1);
        let foreign = tmp.path().join("notes-about-runs.txt.gz");
        let wrong_hash = tmp.path().join(format!("{}-9606.txt.gz", "0".repeat(32)));
        let temp = naming.temp_path(tmp.path(), "10090", 999_999_999);
        for p in [&foreign, &wrong_hash, &temp] {
            fs::write(p, b"junk").unwrap();
        }

        let state = scan_existing(tmp.path(), &naming).unwrap();
        assert_eq!(state.complete.len(), 1);
        assert!(state.removed.is_empty());
        assert!(foreign.exists());
        assert!(wrong_hash.exists());
        assert!(temp.exists());
    }

    #[test]
    fn test_missing_directory_yields_empty_state() {
        let tmp = TempDir::new().unwrap();
        let state = scan_existing(&tmp.path().join("nope"), &ShardNaming::default()).unwrap();
        assert!(state.complete.is_empty());
    }

    #[test]
    fn test_reconcile_lets_filesystem_win() {
        let mut progress = ProgressRecord::default();
        progress.merge(["9606".to_string(), "10090".to_string(), "7227".to_string()]);
        let state = ResumeState {
            complete: HashSet::from(["9606".to_string(), "4932".to_string()]),
            ..Default::default()
        };

        let dropped = reconcile(&mut progress, &state);
        assert_eq!(dropped, vec!["10090".to_string(), "7227".to_string()]);
        assert_eq!(progress.completed_keys.len(), 1);
        assert!(progress.completed_keys.contains("9606"));
    }
}
