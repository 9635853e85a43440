use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;

/// Default rotation size, 64 MiB.
pub const DEFAULT_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Line-oriented log writer with time- and size-based rotation.
///
/// File names are produced by the caller-supplied naming function from the
/// rotation timestamp, so fallback logs get `failed.dst=<id>-<ts>.log`
/// names and archives get theirs. A new file is started lazily on the
/// first write after a rotation boundary.
pub struct RotatingWriter {
    dir: PathBuf,
    name_fn: Box<dyn Fn(chrono::DateTime<Utc>) -> String + Send>,
    rotation_period: Duration,
    max_bytes: u64,

    current: Option<File>,
    current_path: Option<PathBuf>,
    written: u64,
    opened_at: Instant,
}

impl RotatingWriter {
    pub fn new(
        dir: impl Into<PathBuf>,
        rotation_period: Duration,
        max_bytes: u64,
        name_fn: impl Fn(chrono::DateTime<Utc>) -> String + Send + 'static,
    ) -> IngestResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to create log dir", err))?;

        Ok(Self {
            dir,
            name_fn: Box::new(name_fn),
            rotation_period,
            max_bytes: if max_bytes == 0 { DEFAULT_MAX_BYTES } else { max_bytes },
            current: None,
            current_path: None,
            written: 0,
            opened_at: Instant::now(),
        })
    }

    /// Appends one line (newline added here) to the current file, rotating
    /// first when over the size or age limit.
    pub fn write_line(&mut self, line: &str) -> IngestResult<()> {
        if self.should_rotate() {
            self.rotate()?;
        }
        if self.current.is_none() {
            self.open_new()?;
        }

        let file = self.current.as_mut().expect("file was just opened");
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to write log line", err))?;

        self.written += line.len() as u64 + 1;
        Ok(())
    }

    pub fn flush(&mut self) -> IngestResult<()> {
        if let Some(file) = self.current.as_mut() {
            file.flush()
                .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to flush log file", err))?;
        }
        Ok(())
    }

    /// Path of the file currently being written, if any.
    pub fn current_path(&self) -> Option<&PathBuf> {
        self.current_path.as_ref()
    }

    fn should_rotate(&self) -> bool {
        self.current.is_some()
            && (self.written >= self.max_bytes || self.opened_at.elapsed() >= self.rotation_period)
    }

    fn rotate(&mut self) -> IngestResult<()> {
        self.flush()?;
        self.current = None;
        self.current_path = None;
        self.written = 0;
        Ok(())
    }

    fn open_new(&mut self) -> IngestResult<()> {
        let path = self.dir.join((self.name_fn)(Utc::now()));
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to open log file", err))?;

        self.current = Some(file);
        self.current_path = Some(path);
        self.written = 0;
        self.opened_at = Instant::now();
        Ok(())
    }
}

impl std::fmt::Debug for RotatingWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingWriter")
            .field("dir", &self.dir)
            .field("current_path", &self.current_path)
            .field("written", &self.written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(dir: &std::path::Path, max_bytes: u64) -> RotatingWriter {
        let counter = std::sync::atomic::AtomicU32::new(0);
        RotatingWriter::new(dir, Duration::from_secs(3600), max_bytes, move |_ts| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("log-{n}.log")
        })
        .unwrap()
    }

    #[test]
    fn lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path(), 0);
        w.write_line("{\"a\":1}").unwrap();
        w.write_line("{\"a\":2}").unwrap();
        w.flush().unwrap();

        let content = std::fs::read_to_string(w.current_path().unwrap()).unwrap();
        assert_eq!(content, "{\"a\":1}\n{\"a\":2}\n");
    }

    #[test]
    fn size_rotation_starts_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path(), 8);

        w.write_line("0123456789").unwrap();
        let first = w.current_path().unwrap().clone();
        w.write_line("next").unwrap();
        let second = w.current_path().unwrap().clone();

        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
    }
}
