use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;

/// Moves fully processed log files into the archive directory.
#[derive(Debug, Clone)]
pub struct Archiver {
    archive_dir: PathBuf,
}

impl Archiver {
    pub fn new(archive_dir: impl Into<PathBuf>) -> IngestResult<Self> {
        let archive_dir = archive_dir.into();
        std::fs::create_dir_all(&archive_dir)
            .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to create archive dir", err))?;
        Ok(Self { archive_dir })
    }

    /// Moves the file at `path` into the archive directory, keeping its
    /// name. Falls back to copy+remove when a rename crosses filesystems.
    pub fn archive(&self, path: &Path) -> IngestResult<()> {
        let Some(file_name) = path.file_name() else {
            return Err(ingest_error!(
                ErrorKind::Io,
                "Cannot archive a path without a file name",
                path.display()
            ));
        };
        let target = self.archive_dir.join(file_name);

        if std::fs::rename(path, &target).is_err() {
            std::fs::copy(path, &target)
                .and_then(|_| std::fs::remove_file(path))
                .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to archive file", err))?;
        }

        debug!(file = %target.display(), "archived log file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_moves_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("events.log");
        std::fs::write(&source, "line\n").unwrap();

        let archiver = Archiver::new(dir.path().join("archive")).unwrap();
        archiver.archive(&source).unwrap();

        assert!(!source.exists());
        let archived = dir.path().join("archive").join("events.log");
        assert_eq!(std::fs::read_to_string(archived).unwrap(), "line\n");
    }
}
