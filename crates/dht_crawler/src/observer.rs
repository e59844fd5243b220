use crate::errors::Result;
use krpc_encoding::U160;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Narrow seam for passive info-hash collection (spec.md §1, §6). The
/// engine calls `observe` from the `announce_peer` handler and from
/// `get_peers` query observation; a SQLite-backed implementation is left
/// as an external collaborator, this crate only ships the two simplest
/// ones.
pub trait InfoHashObserver: Send + Sync {
    fn observe(&self, info_hash: U160);
}

/// The default: discards everything.
pub struct NullObserver;

impl InfoHashObserver for NullObserver {
    fn observe(&self, _info_hash: U160) {}
}

/// Appends one 40-hex-char info-hash per line to a file, matching the
/// on-disk format in spec.md §6.
pub struct FileInfoHashLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl FileInfoHashLog {
    pub fn open(path: impl AsRef<Path>) -> Result<FileInfoHashLog> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(FileInfoHashLog {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InfoHashObserver for FileInfoHashLog {
    fn observe(&self, info_hash: U160) {
        let mut file = self.file.lock().expect("info-hash log mutex poisoned");
        if let Err(e) = writeln!(file, "{}", info_hash.to_hex()) {
            log::warn!("failed to append to info-hash log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn null_observer_accepts_anything() {
        let observer = NullObserver;
        observer.observe(U160::random());
    }

    #[test]
    fn file_log_appends_hex_lines() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("dht_crawler_test_{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let log = FileInfoHashLog::open(&path).unwrap();
        let a = U160::random();
        let b = U160::random();
        log.observe(a);
        log.observe(b);
        drop(log);

        let mut contents = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec![a.to_hex(), b.to_hex()]);

        std::fs::remove_file(&path).unwrap();
    }
}
