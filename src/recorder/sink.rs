//! Append-only JSON lines file with numbered backups

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::models::AccessEvent;

/// The active log file plus its rotation policy.
///
/// Backups are named `<path>.1` (most recent) up to `<path>.<max_file_count>`.
pub struct LogSink {
    path: PathBuf,
    file: Option<File>,
    max_file_size: u64,
    max_file_count: usize,
}

impl LogSink {
    /// Open (or create) the active file, creating its directory if needed
    pub fn open(path: &Path, max_file_size: u64, max_file_count: usize) -> io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = open_append(path)?;
        log::info!("URL access log opened: {:?}", path);

        Ok(LogSink {
            path: path.to_path_buf(),
            file: Some(file),
            max_file_size,
            max_file_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one JSON line per record and sync the file.
    ///
    /// Records that fail to serialize or write are logged and skipped.
    /// Returns the number of records written.
    pub fn write_batch(&mut self, records: &[AccessEvent]) -> usize {
        let Some(file) = self.file.as_ref() else {
            log::warn!("URL access log is closed, dropping {} records", records.len());
            return 0;
        };

        let mut writer = BufWriter::new(file);
        let mut written = 0;
        for record in records {
            let line = match serde_json::to_string(record) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Failed to serialize URL record: {}", e);
                    continue;
                }
            };
            match writeln!(writer, "{}", line) {
                Ok(()) => written += 1,
                Err(e) => log::error!("Failed to write URL record: {}", e),
            }
        }

        if let Err(e) = writer.flush() {
            log::error!("Failed to flush URL access log: {}", e);
        }
        drop(writer);
        if let Err(e) = file.sync_all() {
            log::error!("Failed to sync URL access log: {}", e);
        }

        log::debug!("Wrote {} URL records to {:?}", written, self.path);
        written
    }

    /// Size of the active file in bytes
    pub fn size(&self) -> io::Result<u64> {
        match self.file.as_ref() {
            Some(file) => Ok(file.metadata()?.len()),
            None => Ok(0),
        }
    }

    pub fn needs_rotation(&self) -> bool {
        match self.size() {
            Ok(size) => size > self.max_file_size,
            Err(e) => {
                log::warn!("Failed to stat URL access log: {}", e);
                false
            }
        }
    }

    /// Shift backups up one generation and start a fresh active file.
    ///
    /// The renames are all-or-nothing: if any of them fails the ones already
    /// done are undone, no backup is discarded and writing continues on the
    /// current handle. Returns whether the file was rotated.
    pub fn rotate(&mut self) -> bool {
        if self.max_file_count == 0 {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("Failed to discard {:?}: {}", self.path, e);
                return false;
            }
            return self.reopen();
        }

        let discarded = discard_path(&self.path);
        let mut plan = Vec::new();
        let oldest = backup_path(&self.path, self.max_file_count);
        if oldest.is_file() {
            plan.push((oldest, discarded.clone()));
        }
        for generation in (1..self.max_file_count).rev() {
            let from = backup_path(&self.path, generation);
            if from.is_file() {
                plan.push((from, backup_path(&self.path, generation + 1)));
            }
        }
        plan.push((self.path.clone(), backup_path(&self.path, 1)));

        let mut done: Vec<&(PathBuf, PathBuf)> = Vec::new();
        for step in &plan {
            let (from, to) = step;
            if let Err(e) = fs::rename(from, to) {
                log::warn!("Failed to rename {:?} to {:?}: {}, keeping current log", from, to, e);
                for (from, to) in done.into_iter().rev() {
                    if let Err(e) = fs::rename(to, from) {
                        log::error!("Failed to restore {:?} from {:?}: {}", from, to, e);
                    }
                }
                return false;
            }
            done.push(step);
        }

        if discarded.exists() {
            if let Err(e) = fs::remove_file(&discarded) {
                log::warn!("Failed to remove {:?}: {}", discarded, e);
            }
        }
        self.reopen()
    }

    fn reopen(&mut self) -> bool {
        match open_append(&self.path) {
            Ok(file) => {
                self.file = Some(file);
                log::info!("Rotated URL access log {:?}", self.path);
                true
            }
            Err(e) => {
                // The old handle still points at the renamed file
                log::error!("Failed to open new URL access log {:?}: {}", self.path, e);
                false
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                log::warn!("Failed to sync URL access log on close: {}", e);
            }
        }
    }
}

/// Path of backup generation `n`, e.g. `url_access.log.2`
pub fn backup_path(path: &Path, generation: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", generation));
    PathBuf::from(name)
}

/// Where the oldest backup waits until the rest of a rotation succeeds
fn discard_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".discard");
    PathBuf::from(name)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(n: usize) -> Vec<AccessEvent> {
        (0..n)
            .map(|i| AccessEvent::new(i as i64, "a@x.io", "rotation.example.com", "tcp"))
            .collect()
    }

    fn line_count(path: &Path) -> usize {
        fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/var/log/url.log"), 3),
            PathBuf::from("/var/log/url.log.3")
        );
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/url.log");
        let sink = LogSink::open(&path, 1024, 2).unwrap();
        assert!(path.exists());
        assert_eq!(sink.size().unwrap(), 0);
    }

    #[test]
    fn test_write_batch_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("url.log");
        let mut sink = LogSink::open(&path, 1024, 2).unwrap();

        assert_eq!(sink.write_batch(&events(3)), 3);
        assert_eq!(sink.write_batch(&[]), 0);
        assert_eq!(sink.write_batch(&events(2)), 2);
        assert_eq!(line_count(&path), 5);
    }

    #[test]
    fn test_rotation_keeps_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("url.log");
        let mut sink = LogSink::open(&path, 1024, 2).unwrap();

        for _ in 0..3 {
            sink.write_batch(&events(8));
            assert!(sink.needs_rotation());
            sink.rotate();
        }

        assert!(backup_path(&path, 1).exists());
        assert!(backup_path(&path, 2).exists());
        assert!(!backup_path(&path, 3).exists());
        assert_eq!(sink.size().unwrap(), 0);
        assert!(!sink.needs_rotation());
    }

    #[test]
    fn test_zero_retention_discards_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("url.log");
        let mut sink = LogSink::open(&path, 10, 0).unwrap();

        sink.write_batch(&events(2));
        sink.rotate();

        assert!(!backup_path(&path, 1).exists());
        assert_eq!(line_count(&path), 0);
        sink.write_batch(&events(1));
        assert_eq!(line_count(&path), 1);
    }

    #[test]
    fn test_failed_rename_keeps_every_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("url.log");
        let mut sink = LogSink::open(&path, 10, 2).unwrap();

        sink.write_batch(&events(2));
        assert!(sink.rotate());
        // Generation 2 is occupied by something that is not a backup
        let blocker = backup_path(&path, 2);
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();

        for round in 0..3 {
            sink.write_batch(&events(3));
            assert!(sink.needs_rotation());
            assert!(!sink.rotate(), "round {} rotated", round);
        }

        assert_eq!(line_count(&backup_path(&path, 1)), 2);
        assert_eq!(line_count(&path), 9);
        assert!(blocker.join("keep").exists());
        assert!(!discard_path(&path).exists());
    }

    #[test]
    fn test_unmovable_first_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("url.log");
        let mut sink = LogSink::open(&path, 10, 1).unwrap();
        let blocker = backup_path(&path, 1);
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();

        sink.write_batch(&events(2));
        assert!(!sink.rotate());
        sink.write_batch(&events(1));

        assert_eq!(line_count(&path), 3);
        assert!(blocker.join("keep").exists());
    }
}
