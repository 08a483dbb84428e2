//! Forward-only chunked reading of the (decompressed) input.
//!
//! A [`ChunkSource`] yields the input header once, then a finite sequence of
//! [`Chunk`]s of at most `chunk_size` lines each. The stream is single pass:
//! a chunk handed out cannot be read again, and there is no seeking.
//!
//! Two decompression strategies produce the same byte stream:
//! - an external process (`pigz -dc` by default) whose stdout is streamed,
//! - in-process decoding through [`crate::io::compression`].
//!
//! With [`Decompressor::Auto`], gzip input goes through the external tool when
//! it can be spawned and produces the header, and through the in-process
//! decoder otherwise.

use crate::error::SplitError;
use crate::io::compression::{auto_detect_reader, detect_codec};
use anyhow::{Context, Result, bail};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const READ_BUFFER_BYTES: usize = 1 << 20;
const FAST_FORWARD_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// External decompressor invocation. The input path is appended as the last
/// argument; the tool must write the decompressed stream to stdout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalDecompressor {
    pub program: String,
    pub args: Vec<String>,
}

impl ExternalDecompressor {
    /// `pigz -dc -p <threads>`
    #[must_use]
    pub fn pigz(threads: usize) -> Self {
        Self {
            program: "pigz".to_string(),
            args: vec!["-dc".into(), "-p".into(), threads.max(1).to_string()],
        }
    }

    /// `gzip -dc`
    #[must_use]
    pub fn gzip() -> Self {
        Self {
            program: "gzip".to_string(),
            args: vec!["-dc".into()],
        }
    }
}

/// Decompression strategy requested at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decompressor {
    /// External tool for gzip input, in-process fallback when it is missing
    /// or fails before delivering the header.
    Auto(ExternalDecompressor),
    /// External tool only; failing to spawn it is fatal.
    External(ExternalDecompressor),
    /// Always decode in-process.
    InProcess,
}

impl Default for Decompressor {
    fn default() -> Self {
        Decompressor::Auto(ExternalDecompressor::pigz(num_cpus::get().min(16)))
    }
}

/// The strategy actually in use, reported in the run summary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceStrategy {
    External(String),
    InProcess(&'static str),
}

impl fmt::Display for SourceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStrategy::External(program) => write!(f, "external ({program})"),
            SourceStrategy::InProcess(codec) => write!(f, "in-process ({codec})"),
        }
    }
}

/// A bounded run of consecutive input records.
///
/// Records are stored back to back in `data`, each terminated by `\n`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    /// Position of this chunk in the input (0-based, after fast-forward).
    pub index: u64,
    pub data: Vec<u8>,
    pub lines: usize,
}

impl Chunk {
    /// Build a chunk from individual lines (newlines are added).
    #[must_use]
    pub fn from_lines<S: AsRef<[u8]>>(index: u64, lines: &[S]) -> Self {
        let mut data = Vec::new();
        for line in lines {
            data.extend_from_slice(line.as_ref());
            data.push(b'\n');
        }
        Self {
            index,
            data,
            lines: lines.len(),
        }
    }

    /// Records without their trailing newline, in input order.
    pub fn records(&self) -> impl Iterator<Item = &[u8]> {
        let body = self.data.strip_suffix(b"\n").unwrap_or(&self.data);
        let empty = self.data.is_empty();
        body.split(|b| *b == b'\n').filter(move |_| !empty)
    }
}

/// Outcome of [`ChunkSource::fast_forward`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FastForward {
    pub requested: u64,
    pub skipped: u64,
}

impl FastForward {
    /// Records that were requested but not present in the input.
    #[must_use]
    pub fn shortfall(&self) -> u64 {
        self.requested - self.skipped
    }
}

fn is_empty_input(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SplitError>(), Some(SplitError::EmptyInput(_)))
}

struct ExternalChild {
    program: String,
    child: Child,
}

pub struct ChunkSource {
    path: PathBuf,
    reader: Box<dyn BufRead + Send>,
    child: Option<ExternalChild>,
    header: Vec<u8>,
    strategy: SourceStrategy,
    chunk_size: usize,
    next_index: u64,
    consumed: u64,
    last_chunk_bytes: usize,
    exhausted: bool,
}

impl ChunkSource {
    /// Open `path`, pick the decompression strategy and read the header line.
    ///
    /// # Errors
    /// Fails if the file cannot be opened, the external tool is required but
    /// unusable, or the input has no header line.
    pub fn open(path: impl AsRef<Path>, decompressor: &Decompressor, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref();
        if chunk_size == 0 {
            bail!(SplitError::InvalidConfig("chunk_size must be positive".into()));
        }
        let codec = detect_codec(path)?;
        let is_gzip = codec.is_some_and(|c| c.name() == "gzip");

        match decompressor {
            Decompressor::InProcess => Self::open_in_process(path, chunk_size),
            Decompressor::External(tool) => Self::open_external(path, tool, chunk_size),
            Decompressor::Auto(tool) if is_gzip => match Self::open_external(path, tool, chunk_size) {
                Ok(source) => Ok(source),
                Err(err) if is_empty_input(&err) => Err(err),
                Err(err) => {
                    warn!(
                        program = %tool.program,
                        error = %format!("{err:#}"),
                        "external decompressor unusable, falling back to in-process decoding"
                    );
                    Self::open_in_process(path, chunk_size)
                }
            },
            Decompressor::Auto(_) => Self::open_in_process(path, chunk_size),
        }
    }

    fn open_in_process(path: &Path, chunk_size: usize) -> Result<Self> {
        let codec_name = detect_codec(path)?.map_or("plain", |c| match c.name() {
            "gzip" => "gzip",
            "zstd" => "zstd",
            _ => "other",
        });
        let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let rdr = auto_detect_reader(f, path)
            .with_context(|| format!("setup decompression for {}", path.display()))?;
        let reader = Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, rdr));
        Self::with_reader(path, reader, None, SourceStrategy::InProcess(codec_name), chunk_size)
    }

    fn open_external(path: &Path, tool: &ExternalDecompressor, chunk_size: usize) -> Result<Self> {
        let mut child = Command::new(&tool.program)
            .args(&tool.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn {}", tool.program))?;
        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("no stdout pipe from {}", tool.program))?;
        let reader = Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, stdout));
        let external = ExternalChild {
            program: tool.program.clone(),
            child,
        };
        Self::with_reader(
            path,
            reader,
            Some(external),
            SourceStrategy::External(tool.program.clone()),
            chunk_size,
        )
    }

    fn with_reader(
        path: &Path,
        mut reader: Box<dyn BufRead + Send>,
        mut child: Option<ExternalChild>,
        strategy: SourceStrategy,
        chunk_size: usize,
    ) -> Result<Self> {
        let mut header = Vec::new();
        let read = reader
            .read_until(b'\n', &mut header)
            .with_context(|| format!("read header of {}", path.display()));
        let read = match read {
            Ok(n) => n,
            Err(err) => {
                if let Some(ext) = child.as_mut() {
                    ext.child.kill().ok();
                    ext.child.wait().ok();
                }
                return Err(err);
            }
        };
        if read == 0 {
            if let Some(mut ext) = child.take() {
                drop(reader);
                let status = ext.child.wait().with_context(|| format!("wait for {}", ext.program))?;
                if !status.success() {
                    bail!(SplitError::Decompression {
                        program: ext.program,
                        status
                    });
                }
            }
            bail!(SplitError::EmptyInput(path.to_path_buf()));
        }
        while matches!(header.last(), Some(b'\n' | b'\r')) {
            header.pop();
        }

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            child,
            header,
            strategy,
            chunk_size,
            next_index: 0,
            consumed: 0,
            last_chunk_bytes: 0,
            exhausted: false,
        })
    }

    /// Header line, without its line terminator.
    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    #[must_use]
    pub fn strategy(&self) -> &SourceStrategy {
        &self.strategy
    }

    /// Data records consumed so far, fast-forwarded ones included.
    #[must_use]
    pub fn records_consumed(&self) -> u64 {
        self.consumed
    }

    /// Discard the next `n` data records without materializing them.
    ///
    /// Works burst by burst directly on the reader's buffer. If the input ends
    /// first, the shortfall is reported rather than treated as an error.
    ///
    /// # Errors
    /// Returns an error on I/O failure of the underlying stream.
    pub fn fast_forward(&mut self, n: u64) -> Result<FastForward> {
        self.fast_forward_until(n, || false)
    }

    /// [`fast_forward`](Self::fast_forward) that polls `stop` before every
    /// burst and gives up with [`SplitError::Interrupted`] once it returns
    /// `true`. The source should be aborted afterwards.
    ///
    /// # Errors
    /// Returns an error on I/O failure or when stopped.
    pub fn fast_forward_until(&mut self, n: u64, stop: impl Fn() -> bool) -> Result<FastForward> {
        let started = Instant::now();
        let mut last_log = started;
        let mut skipped = 0u64;
        let mut mid_line = false;

        while skipped < n {
            if stop() {
                warn!(skipped, requested = n, "fast-forward interrupted");
                bail!(SplitError::Interrupted);
            }
            let (used, lines) = {
                let buf = self
                    .reader
                    .fill_buf()
                    .with_context(|| format!("fast-forward in {}", self.path.display()))?;
                if buf.is_empty() {
                    if mid_line {
                        // unterminated final record
                        skipped += 1;
                    }
                    self.exhausted = true;
                    break;
                }
                let want = n - skipped;
                let mut found = 0u64;
                let mut end = buf.len();
                for (i, b) in buf.iter().enumerate() {
                    if *b == b'\n' {
                        found += 1;
                        if found == want {
                            end = i + 1;
                            break;
                        }
                    }
                }
                mid_line = buf[end - 1] != b'\n';
                (end, found)
            };
            self.reader.consume(used);
            skipped += lines;

            if last_log.elapsed() >= FAST_FORWARD_LOG_INTERVAL {
                let secs = started.elapsed().as_secs_f64();
                #[allow(clippy::cast_precision_loss)]
                let rate = if secs > 0.0 { skipped as f64 / secs } else { 0.0 };
                info!(
                    skipped,
                    requested = n,
                    rate = %format_args!("{:.1}M lines/s", rate / 1e6),
                    "fast-forwarding"
                );
                last_log = Instant::now();
            }
        }

        self.consumed += skipped;
        Ok(FastForward { requested: n, skipped })
    }

    /// Read the next chunk, or `None` at end of input.
    ///
    /// # Errors
    /// Returns an error on I/O failure of the underlying stream.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut data = Vec::with_capacity(self.last_chunk_bytes);
        let mut lines = 0usize;
        while lines < self.chunk_size {
            let n = self
                .reader
                .read_until(b'\n', &mut data)
                .with_context(|| format!("read chunk #{} of {}", self.next_index, self.path.display()))?;
            if n == 0 {
                self.exhausted = true;
                break;
            }
            if data.last() != Some(&b'\n') {
                data.push(b'\n');
            }
            lines += 1;
        }
        if lines == 0 {
            return Ok(None);
        }
        let chunk = Chunk {
            index: self.next_index,
            data,
            lines,
        };
        self.next_index += 1;
        self.consumed += lines as u64;
        self.last_chunk_bytes = self.last_chunk_bytes.max(chunk.data.len());
        Ok(Some(chunk))
    }

    /// Close the stream after it was read to the end, checking the external
    /// decompressor's exit status.
    ///
    /// # Errors
    /// Returns [`SplitError::Decompression`] if the external tool failed.
    pub fn finish(self) -> Result<()> {
        let Self { reader, child, .. } = self;
        drop(reader);
        if let Some(mut ext) = child {
            let status = ext.child.wait().with_context(|| format!("wait for {}", ext.program))?;
            if !status.success() {
                bail!(SplitError::Decompression {
                    program: ext.program,
                    status
                });
            }
        }
        Ok(())
    }

    /// Stop early: kill the external decompressor if there is one.
    pub fn abort(self) {
        let Self { reader, child, .. } = self;
        drop(reader);
        if let Some(mut ext) = child {
            ext.child.kill().ok();
            ext.child.wait().ok();
        }
    }
}

impl Iterator for ChunkSource {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
