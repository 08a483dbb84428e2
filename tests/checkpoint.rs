//! Tests for the progress sidecar.

mod checkpoint_tests {
    use ironshard::checkpoint::{ProgressPolicy, ProgressRecord, ProgressRecorder, current_timestamp_ms};
    use serde_json::Value;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_empty_record() {
        let tmp = TempDir::new().unwrap();
        let record = ProgressRecord::load(&tmp.path().join("split_progress.json")).unwrap();
        assert_eq!(record, ProgressRecord::default());
    }

    #[test]
    fn test_save_and_load_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("split_progress.json");

        let mut record = ProgressRecord {
            total_records: 1_500,
            records_consumed: 2_000,
            timestamp: current_timestamp_ms(),
            is_final: true,
            ..Default::default()
        };
        record.merge(["9606".to_string(), "10090".to_string()]);
        record.save(&path).unwrap();

        let loaded = ProgressRecord::load(&path).unwrap();
        assert_eq!(loaded, record);
        assert!(!tmp.path().join("split_progress.json.tmp").exists());
    }

    #[test]
    fn test_file_layout_uses_camel_case() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("p.json");
        let mut record = ProgressRecord::default();
        record.merge(["562".to_string()]);
        record.save(&path).unwrap();

        let v: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(v["completedKeys"], serde_json::json!(["562"]));
        assert!(v.get("totalRecords").is_some());
        assert!(v.get("recordsConsumed").is_some());
        assert_eq!(v["final"], Value::Bool(false));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("p.json");
        fs::write(&path, r#"{"completedKeys": ["1", "2"], "totalRecords": 10}"#).unwrap();

        let record = ProgressRecord::load(&path).unwrap();
        assert_eq!(record.completed_keys.len(), 2);
        assert_eq!(record.total_records, 10);
        assert_eq!(record.records_consumed, 0);
        assert!(!record.is_final);
    }

    #[test]
    fn test_corrupt_file_is_an_error_but_recorder_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("p.json");
        fs::write(&path, b"{ not json").unwrap();

        assert!(ProgressRecord::load(&path).is_err());
        let recorder = ProgressRecorder::open(&path, ProgressPolicy::AtEnd);
        assert_eq!(recorder.record(), &ProgressRecord::default());
    }

    #[test]
    fn test_recorder_accumulates_across_runs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("p.json");

        let mut first = ProgressRecorder::open(&path, ProgressPolicy::AtEnd);
        first.update(["a".to_string()], 100, 100);
        assert!(first.save(true).unwrap());

        let mut second = ProgressRecorder::open(&path, ProgressPolicy::AtEnd);
        second.update(["b".to_string()], 40, 140);
        // a later update within the same run replaces, not adds, the run count
        second.update(["c".to_string()], 50, 150);
        second.save(true).unwrap();

        let record = ProgressRecord::load(&path).unwrap();
        assert_eq!(record.total_records, 150);
        assert_eq!(record.records_consumed, 150);
        assert_eq!(
            record.completed_keys.iter().cloned().collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert!(record.is_final);
        assert!(record.timestamp > 0);
    }

    #[test]
    fn test_never_policy_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("p.json");
        let mut recorder = ProgressRecorder::open(&path, ProgressPolicy::Never);
        recorder.update(["a".to_string()], 1, 1);
        assert!(!recorder.save(true).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_interval_policy() {
        let tmp = TempDir::new().unwrap();
        let at_end = ProgressRecorder::open(tmp.path().join("a.json"), ProgressPolicy::AtEnd);
        assert!(!at_end.interval_due());

        let mut every = ProgressRecorder::open(tmp.path().join("b.json"), ProgressPolicy::TimeInterval(0));
        assert!(every.interval_due());
        every.save(false).unwrap();
        assert!(every.interval_due());

        let hourly = ProgressRecorder::open(tmp.path().join("c.json"), ProgressPolicy::TimeInterval(3600));
        assert!(!hourly.interval_due());
    }
}
