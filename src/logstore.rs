//! Storage for raw command output.
//!
//! Every operation that runs a command gets a log ref; its combined stdout/stderr is
//! streamed into a sink obtained from [`LogStore::new_writer`] and can be read back later
//! by the same ref.

use crate::error::{BackrunError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A streaming sink for command output.
pub type LogSink = Box<dyn Write + Send>;

/// Storage for command output addressable by ref.
pub trait LogStore: Send + Sync {
    /// Open a writer for `log_ref`, appending if it already exists.
    fn new_writer(&self, log_ref: &str) -> Result<LogSink>;

    /// Read back everything written under `log_ref`.
    fn read(&self, log_ref: &str) -> Result<String>;
}

/// Open writer count per log file.
type ActiveFiles = Arc<Mutex<HashMap<PathBuf, usize>>>;

/// Log store keeping one plain-text file per ref, removing the oldest files once more
/// than `max_files` exist. Files with an open writer are never removed.
pub struct RotatingLog {
    dir: PathBuf,
    max_files: usize,
    active: ActiveFiles,
}

const LOG_EXTENSION: &str = "log";

impl RotatingLog {
    /// Create a rotating log rooted at `dir`.
    pub fn new(dir: impl AsRef<Path>, max_files: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_files: max_files.max(1),
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn path_for(&self, log_ref: &str) -> Result<PathBuf> {
        if log_ref.is_empty()
            || !log_ref
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(BackrunError::Validation(format!("invalid log ref {:?}", log_ref)));
        }
        Ok(self.dir.join(format!("{}.{}", log_ref, LOG_EXTENSION)))
    }

    /// Log files sorted oldest first.
    fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(LOG_EXTENSION) {
                let modified = fs::metadata(&path)?.modified()?;
                files.push((modified, path));
            }
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    fn rotate(&self) -> Result<()> {
        let active = self.active.lock();
        let files = self.files()?;
        if files.len() <= self.max_files {
            return Ok(());
        }
        let excess = files.len() - self.max_files;
        let closed = files.iter().filter(|p| !active.contains_key(p.as_path()));
        for path in closed.take(excess) {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Rotated out log file"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove log file"),
            }
        }
        Ok(())
    }
}

/// A log file writer registered as active until dropped.
struct ActiveWriter {
    file: BufWriter<File>,
    path: PathBuf,
    active: ActiveFiles,
}

impl ActiveWriter {
    fn open(path: PathBuf, active: &ActiveFiles) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        *active.lock().entry(path.clone()).or_insert(0) += 1;
        Ok(Self {
            file: BufWriter::new(file),
            path,
            active: active.clone(),
        })
    }
}

impl Write for ActiveWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Drop for ActiveWriter {
    fn drop(&mut self) {
        if let Err(e) = self.file.flush() {
            warn!(path = %self.path.display(), error = %e, "Failed to flush log file");
        }
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.path);
            }
        }
    }
}

impl LogStore for RotatingLog {
    fn new_writer(&self, log_ref: &str) -> Result<LogSink> {
        let writer = ActiveWriter::open(self.path_for(log_ref)?, &self.active)?;
        self.rotate()?;
        Ok(Box::new(writer))
    }

    fn read(&self, log_ref: &str) -> Result<String> {
        let path = self.path_for(log_ref)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackrunError::NotFound(format!("log {}", log_ref)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Sink discarding everything, for steps that have nowhere to log.
pub fn discard() -> LogSink {
    Box::new(std::io::sink())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let logs = RotatingLog::new(dir.path(), 10).unwrap();

        let mut sink = logs.new_writer("op-1").unwrap();
        writeln!(sink, "scanning files").unwrap();
        writeln!(sink, "done").unwrap();
        drop(sink);

        assert_eq!(logs.read("op-1").unwrap(), "scanning files\ndone\n");
    }

    #[test]
    fn test_missing_ref_is_not_found() {
        let dir = tempdir().unwrap();
        let logs = RotatingLog::new(dir.path(), 10).unwrap();
        assert!(matches!(logs.read("op-9"), Err(BackrunError::NotFound(_))));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let logs = RotatingLog::new(dir.path(), 10).unwrap();
        assert!(logs.new_writer("../escape").is_err());
    }

    #[test]
    fn test_rotation_removes_oldest() {
        let dir = tempdir().unwrap();
        let logs = RotatingLog::new(dir.path(), 2).unwrap();

        for i in 0..4 {
            let mut sink = logs.new_writer(&format!("op-{}", i)).unwrap();
            writeln!(sink, "run {}", i).unwrap();
            drop(sink);
            // Keep modification times distinct
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        assert_eq!(logs.files().unwrap().len(), 2);
        assert!(logs.read("op-0").is_err());
        assert_eq!(logs.read("op-3").unwrap(), "run 3\n");
    }

    #[test]
    fn test_rotation_keeps_open_writers() {
        let dir = tempdir().unwrap();
        let logs = RotatingLog::new(dir.path(), 2).unwrap();

        let mut long_running = logs.new_writer("op-0").unwrap();
        writeln!(long_running, "still scanning").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        for i in 1..5 {
            let mut sink = logs.new_writer(&format!("op-{}", i)).unwrap();
            writeln!(sink, "run {}", i).unwrap();
            drop(sink);
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        writeln!(long_running, "done").unwrap();
        drop(long_running);
        assert_eq!(logs.read("op-0").unwrap(), "still scanning\ndone\n");
        assert!(logs.read("op-1").is_err());
        assert_eq!(logs.read("op-4").unwrap(), "run 4\n");
        assert!(logs.active.lock().is_empty());

        // Once closed, the file is an ordinary rotation candidate again.
        for i in 5..7 {
            std::thread::sleep(std::time::Duration::from_millis(20));
            drop(logs.new_writer(&format!("op-{}", i)).unwrap());
        }
        assert_eq!(logs.files().unwrap().len(), 2);
        assert!(logs.read("op-0").is_err());
    }
}
