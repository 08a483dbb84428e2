//! Tests for chunked input reading and decompression strategies.

mod source_tests {
    use ironshard::error::SplitError;
    use ironshard::io::source::{ChunkSource, Decompressor, ExternalDecompressor, SourceStrategy};
    use ironshard::testing::{SAMPLE_HEADER, keyed_lines, truncate_half, write_gzip_input, write_plain_input};
    use std::fs;
    use std::path::Path;
    use std::process::{Command, Stdio};
    use tempfile::TempDir;

    fn gzip_available() -> bool {
        Command::new("gzip")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    fn drain(source: &mut ChunkSource) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(chunk) = source.next_chunk().unwrap() {
            out.extend(chunk.records().map(|r| String::from_utf8_lossy(r).into_owned()));
        }
        out
    }

    fn sample(dir: &Path, n: usize) -> (std::path::PathBuf, Vec<String>) {
        let path = dir.join("links.txt.gz");
        let lines: Vec<String> = keyed_lines(&["9606", "10090", "7227"], n.div_ceil(3))
            .into_iter()
            .take(n)
            .collect();
        write_gzip_input(&path, SAMPLE_HEADER, &lines).unwrap();
        (path, lines)
    }

    #[test]
    fn test_in_process_chunks_and_header() {
        let tmp = TempDir::new().unwrap();
        let (path, lines) = sample(tmp.path(), 10);

        let mut source = ChunkSource::open(&path, &Decompressor::InProcess, 4).unwrap();
        assert_eq!(source.header(), SAMPLE_HEADER.as_bytes());
        assert_eq!(source.strategy(), &SourceStrategy::InProcess("gzip"));

        let sizes: Vec<(u64, usize)> = std::iter::from_fn(|| source.next_chunk().unwrap())
            .map(|c| (c.index, c.lines))
            .collect();
        assert_eq!(sizes, vec![(0, 4), (1, 4), (2, 2)]);
        assert_eq!(source.records_consumed(), lines.len() as u64);
        assert!(source.next_chunk().unwrap().is_none());
        source.finish().unwrap();
    }

    #[test]
    fn test_iterator_yields_all_records_in_order() {
        let tmp = TempDir::new().unwrap();
        let (path, lines) = sample(tmp.path(), 25);
        let source = ChunkSource::open(&path, &Decompressor::InProcess, 7).unwrap();
        let read: Vec<String> = source
            .map(|c| c.unwrap())
            .flat_map(|c| c.records().map(|r| String::from_utf8_lossy(r).into_owned()).collect::<Vec<_>>())
            .collect();
        assert_eq!(read, lines);
    }

    #[test]
    fn test_external_and_in_process_agree() {
        if !gzip_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let (path, lines) = sample(tmp.path(), 500);

        let mut external = ChunkSource::open(&path, &Decompressor::External(ExternalDecompressor::gzip()), 64).unwrap();
        assert_eq!(external.strategy(), &SourceStrategy::External("gzip".into()));
        let mut in_process = ChunkSource::open(&path, &Decompressor::InProcess, 64).unwrap();

        assert_eq!(external.header(), in_process.header());
        let a = drain(&mut external);
        let b = drain(&mut in_process);
        assert_eq!(a, b);
        assert_eq!(a, lines);
        external.finish().unwrap();
        in_process.finish().unwrap();
    }

    #[test]
    fn test_auto_falls_back_when_program_missing() {
        let tmp = TempDir::new().unwrap();
        let (path, lines) = sample(tmp.path(), 6);
        let missing = ExternalDecompressor {
            program: "ironshard-no-such-decompressor".into(),
            args: vec!["-dc".into()],
        };

        let mut source = ChunkSource::open(&path, &Decompressor::Auto(missing.clone()), 100).unwrap();
        assert_eq!(source.strategy(), &SourceStrategy::InProcess("gzip"));
        assert_eq!(drain(&mut source), lines);

        assert!(ChunkSource::open(&path, &Decompressor::External(missing), 100).is_err());
    }

    #[test]
    fn test_external_failure_after_data_is_fatal() {
        if !gzip_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let (path, _) = sample(tmp.path(), 20_000);
        truncate_half(&path).unwrap();

        let mut source = ChunkSource::open(&path, &Decompressor::External(ExternalDecompressor::gzip()), 1000).unwrap();
        while let Ok(Some(_)) = source.next_chunk() {}
        let err = source.finish().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SplitError>(),
            Some(SplitError::Decompression { .. })
        ));
    }

    #[test]
    fn test_plain_text_and_unterminated_last_line() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("links.txt");
        fs::write(&path, "h1 h2\r\n9606.a 9606.b 1\n10090.c 10090.d 2").unwrap();

        let mut source = ChunkSource::open(&path, &Decompressor::default(), 10).unwrap();
        assert_eq!(source.header(), b"h1 h2");
        assert_eq!(source.strategy(), &SourceStrategy::InProcess("plain"));
        assert_eq!(drain(&mut source), vec!["9606.a 9606.b 1", "10090.c 10090.d 2"]);
        assert_eq!(source.records_consumed(), 2);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.txt");
        fs::write(&path, b"").unwrap();

        let err = ChunkSource::open(&path, &Decompressor::InProcess, 10).err().unwrap();
        assert!(matches!(err.downcast_ref::<SplitError>(), Some(SplitError::EmptyInput(_))));
    }

    #[test]
    fn test_header_only_input_has_no_chunks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("header.txt");
        write_plain_input::<&str>(&path, SAMPLE_HEADER, &[]).unwrap();

        let mut source = ChunkSource::open(&path, &Decompressor::InProcess, 10).unwrap();
        assert!(source.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_fast_forward_then_read() {
        let tmp = TempDir::new().unwrap();
        let (path, lines) = sample(tmp.path(), 30);

        let mut source = ChunkSource::open(&path, &Decompressor::InProcess, 8).unwrap();
        let ff = source.fast_forward(13).unwrap();
        assert_eq!(ff.skipped, 13);
        assert_eq!(ff.shortfall(), 0);

        let first = source.next_chunk().unwrap().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.records().next().unwrap(), lines[13].as_bytes());
        assert_eq!(drain(&mut source).len() + first.lines, 17);
        assert_eq!(source.records_consumed(), 30);
    }

    #[test]
    fn test_fast_forward_past_end_reports_shortfall() {
        let tmp = TempDir::new().unwrap();
        let (path, _) = sample(tmp.path(), 5);

        let mut source = ChunkSource::open(&path, &Decompressor::InProcess, 8).unwrap();
        let ff = source.fast_forward(8).unwrap();
        assert_eq!(ff.skipped, 5);
        assert_eq!(ff.shortfall(), 3);
        assert!(source.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_fast_forward_stops_when_asked() {
        let tmp = TempDir::new().unwrap();
        let (path, lines) = sample(tmp.path(), 30);

        let mut source = ChunkSource::open(&path, &Decompressor::InProcess, 8).unwrap();
        let err = source.fast_forward_until(20, || true).unwrap_err();
        assert!(matches!(err.downcast_ref::<SplitError>(), Some(SplitError::Interrupted)));
        assert_eq!(source.records_consumed(), 0);

        // nothing was discarded before the first check
        let first = source.next_chunk().unwrap().unwrap();
        assert_eq!(first.records().next().unwrap(), lines[0].as_bytes());
        source.abort();
    }

    #[test]
    fn test_fast_forward_counts_unterminated_last_line() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("links.txt");
        fs::write(&path, "h\na 1\nb 2").unwrap();

        let mut source = ChunkSource::open(&path, &Decompressor::InProcess, 8).unwrap();
        let ff = source.fast_forward(5).unwrap();
        assert_eq!(ff.skipped, 2);
        assert_eq!(ff.shortfall(), 3);
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (path, _) = sample(tmp.path(), 3);
        assert!(ChunkSource::open(&path, &Decompressor::InProcess, 0).is_err());
    }
}
