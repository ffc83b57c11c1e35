//! Resumable chunked copy engine.
//!
//! Copies `[start, EOF)` from a source file to a destination file in fixed
//! size chunks, surviving transient read/write failures. Every failed
//! operation is retried with linear backoff after restoring the failing
//! handle's cursor to the last confirmed-good offset, so a partial or wedged
//! I/O call can never corrupt the transfer. The offset only advances once a
//! chunk has been both fully read and fully written.
//!
//! The engine is generic over seekable streams; [`copy_range`] binds it to
//! [`crate::direct::DirectFile`] handles.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::Context;

use crate::direct;
use crate::progress;

pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Error type for copy operations that preserves the transfer summary even
/// on failure; `summary.position` is the offset to resume from.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    /// Size of each read/write pair.
    pub chunk_size: usize,
    /// Consecutive failures allowed per chunk phase before giving up. The
    /// budget is shared between the failing operation and the cursor
    /// recovery seeks it triggers.
    pub max_attempts: u32,
    /// Base backoff delay; attempt N sleeps N times this long.
    pub retry_delay: std::time::Duration,
    /// Open the handles with O_DIRECT.
    pub direct_io: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            direct_io: true,
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct Summary {
    /// Bytes successfully transferred this run.
    pub bytes_copied: u64,
    /// Chunks successfully transferred this run.
    pub chunks_copied: u64,
    /// Absolute offset of the next byte to copy. Valid on failure as well;
    /// a supervisor resumes by re-invoking with this offset.
    pub position: u64,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            chunks copied: {}\n\
            resume offset: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.chunks_copied,
            self.position,
        )
    }
}

/// Shared failure budget for one chunk phase.
///
/// The operation itself and the cursor-recovery seeks that follow a failure
/// count against the same ceiling, mirroring the two collapsed retry loops:
/// `Operation -> (fail) -> RecoverCursor -> Operation`.
struct Backoff<'a> {
    attempts: u32,
    settings: &'a Settings,
}

impl<'a> Backoff<'a> {
    fn new(settings: &'a Settings) -> Self {
        Self {
            attempts: 0,
            settings,
        }
    }

    /// Record one failure. Sleeps with linear backoff if budget remains,
    /// otherwise reports the phase as unrecoverable.
    fn failed(&mut self, what: &str, error: &std::io::Error) -> anyhow::Result<()> {
        self.attempts += 1;
        if self.attempts >= self.settings.max_attempts {
            anyhow::bail!("{what} failed {} times, giving up: {error}", self.attempts);
        }
        tracing::warn!(
            "{what} failed (attempt {}/{}): {error}",
            self.attempts,
            self.settings.max_attempts
        );
        std::thread::sleep(self.settings.retry_delay * self.attempts);
        Ok(())
    }
}

/// Move a handle back to the last confirmed-good offset after a failed
/// operation. A failed I/O call leaves the OS cursor wherever it pleases;
/// trusting it is exactly the corruption this tool exists to avoid.
fn recover_cursor<S: Seek>(
    stream: &mut S,
    position: u64,
    backoff: &mut Backoff,
    what: &str,
) -> anyhow::Result<()> {
    loop {
        match stream.seek(SeekFrom::Start(position)) {
            Ok(_) => {
                tracing::debug!("{what} cursor restored to byte {position}");
                return Ok(());
            }
            Err(error) => {
                backoff.failed(&format!("moving {what} cursor back to {position}"), &error)?;
            }
        }
    }
}

/// Read one chunk at `position`, retrying through transient failures.
/// Returns the number of bytes read; zero means clean end of file.
fn read_chunk<R: Read + Seek>(
    reader: &mut R,
    buf: &mut [u8],
    position: u64,
    settings: &Settings,
) -> anyhow::Result<usize> {
    let mut backoff = Backoff::new(settings);
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(error) => {
                backoff.failed(&format!("reading source at offset {position}"), &error)?;
                recover_cursor(reader, position, &mut backoff, "source")?;
            }
        }
    }
}

/// Write one full chunk at `position`, retrying through transient failures.
/// A write that reports fewer bytes than requested gets the same treatment
/// as a hard error.
fn write_chunk<W: Write + Seek>(
    writer: &mut W,
    chunk: &[u8],
    position: u64,
    settings: &Settings,
) -> anyhow::Result<()> {
    let mut backoff = Backoff::new(settings);
    loop {
        let error = match writer.write(chunk) {
            Ok(n) if n == chunk.len() => return Ok(()),
            Ok(n) => std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write: {n} of {} bytes", chunk.len()),
            ),
            Err(error) => error,
        };
        backoff.failed(
            &format!("writing {} bytes at offset {position}", chunk.len()),
            &error,
        )?;
        recover_cursor(writer, position, &mut backoff, "destination")?;
    }
}

/// Run the transfer loop over a pair of seekable streams.
///
/// Positions both cursors at `start`, then copies chunk by chunk until the
/// source reports end of file. `buf` is the reusable chunk buffer and fixes
/// the chunk size regardless of `settings.chunk_size`.
pub fn transfer<R, W>(
    reader: &mut R,
    writer: &mut W,
    start: u64,
    buf: &mut [u8],
    settings: &Settings,
    mut printer: Option<&mut progress::ProgressPrinter>,
) -> Result<Summary, Error>
where
    R: Read + Seek,
    W: Write + Seek,
{
    let result = transfer_loop(reader, writer, start, buf, settings, printer.as_deref_mut());
    if let Some(printer) = printer {
        printer.finish();
    }
    result
}

fn transfer_loop<R, W>(
    reader: &mut R,
    writer: &mut W,
    start: u64,
    buf: &mut [u8],
    settings: &Settings,
    mut printer: Option<&mut progress::ProgressPrinter>,
) -> Result<Summary, Error>
where
    R: Read + Seek,
    W: Write + Seek,
{
    let mut summary = Summary {
        position: start,
        ..Default::default()
    };
    reader
        .seek(SeekFrom::Start(start))
        .with_context(|| format!("cannot position source at byte {start}"))
        .map_err(|err| Error::new(err, summary))?;
    writer
        .seek(SeekFrom::Start(start))
        .with_context(|| format!("cannot position destination at byte {start}"))
        .map_err(|err| Error::new(err, summary))?;
    tracing::debug!("cursors positioned at byte {start}");
    loop {
        let n = read_chunk(reader, buf, summary.position, settings)
            .map_err(|err| Error::new(err, summary))?;
        if n == 0 {
            tracing::debug!("end of source at byte {}", summary.position);
            break;
        }
        write_chunk(writer, &buf[..n], summary.position, settings)
            .map_err(|err| Error::new(err, summary))?;
        // the only place the offset moves: both phases succeeded for n bytes
        summary.position += n as u64;
        summary.bytes_copied += n as u64;
        summary.chunks_copied += 1;
        if let Some(printer) = printer.as_deref_mut() {
            printer.chunk_done(summary.bytes_copied, summary.position);
        }
    }
    Ok(summary)
}

/// Copy `[start, EOF)` from `src` to `dst`.
///
/// Opens both handles (unbuffered when `settings.direct_io` allows), runs
/// the transfer loop and closes the handles on every exit path. On failure
/// the returned error still carries the summary so the caller knows where
/// to resume.
pub fn copy_range(
    src: &std::path::Path,
    dst: &std::path::Path,
    start: u64,
    settings: &Settings,
    printer: Option<&mut progress::ProgressPrinter>,
) -> Result<Summary, Error> {
    let base = Summary {
        position: start,
        ..Default::default()
    };
    let mut direct_io = settings.direct_io;
    if direct_io && !direct::is_aligned(start) {
        tracing::warn!("start offset {start} is not block aligned, using buffered I/O");
        direct_io = false;
    }
    let mut reader = direct::DirectFile::open_read(src, direct_io)
        .with_context(|| format!("cannot open {src:?} for reading"))
        .map_err(|err| Error::new(err, base))?;
    tracing::info!("{} opened for reading", src.display());
    let mut writer = direct::DirectFile::open_write(dst, direct_io)
        .with_context(|| format!("cannot open {dst:?} for writing"))
        .map_err(|err| Error::new(err, base))?;
    tracing::info!("{} opened for writing", dst.display());
    let mut buf = direct::AlignedBuf::new(settings.chunk_size);
    transfer(
        &mut reader,
        &mut writer,
        start,
        buf.as_mut_slice(),
        settings,
        printer,
    )
}
