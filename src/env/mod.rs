//! Environment abstraction: files, directories, locks, and the clock.
//!
//! The engine performs all file system access through these traits so the
//! enclosing database can substitute instrumented or fault-injecting
//! implementations. [`StdEnv`] is the production implementation over
//! `std::fs`.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::{Error, Result};

/// A file read sequentially from the beginning.
pub trait SequentialFile: Send {
    /// Read up to `buf.len()` bytes. Returns the number of bytes read;
    /// zero means end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Skip `n` bytes without reading them.
    fn skip(&mut self, n: u64) -> Result<()>;
}

/// A file supporting reads at arbitrary offsets, shareable between threads.
pub trait RandomAccessFile: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, which is short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// A file written by appending.
pub trait WritableFile: Send {
    /// Append `data` at the end of the file.
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Push buffered data to the operating system.
    fn flush(&mut self) -> Result<()>;

    /// Flush and then force the data to stable storage.
    fn sync(&mut self) -> Result<()>;
}

/// An acquired advisory lock on a file. Released on drop.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        locked_paths().lock().remove(&self.path);
    }
}

/// The platform services the engine consumes.
pub trait Env: Send + Sync {
    /// Open a file for sequential reading.
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>>;

    /// Open a file for random-access reading.
    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;

    /// Create (truncating) a file for appending.
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;

    /// Open an existing file for appending, creating it if missing.
    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;

    /// Check whether a file exists.
    fn file_exists(&self, path: &Path) -> bool;

    /// Names (not paths) of the children of a directory.
    fn children(&self, dir: &Path) -> Result<Vec<String>>;

    /// Remove a file.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Create a directory.
    fn create_dir(&self, path: &Path) -> Result<()>;

    /// Size of a file in bytes.
    fn file_size(&self, path: &Path) -> Result<u64>;

    /// Rename a file, replacing any existing target.
    fn rename_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Take an exclusive advisory lock on `path`, creating it if needed.
    ///
    /// Fails if another process (or this one) already holds the lock.
    fn lock_file(&self, path: &Path) -> Result<FileLock>;

    /// Microseconds since some fixed point in time.
    fn now_micros(&self) -> u64;

    /// Sleep the calling thread.
    fn sleep_micros(&self, micros: u64);
}

// Paths locked by this process. flock does not exclude a second open of the
// same file within one process, so re-locking is tracked here.
fn locked_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static LOCKED: std::sync::OnceLock<Mutex<HashSet<PathBuf>>> = std::sync::OnceLock::new();
    LOCKED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Production environment over `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdEnv;

struct StdSequentialFile {
    file: File,
}

impl SequentialFile for StdSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.file.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }
}

struct StdRandomAccessFile {
    file: File,
}

impl RandomAccessFile for StdRandomAccessFile {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;

        let mut read = 0;
        while read < buf.len() {
            let n = self.file.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    #[cfg(not(unix))]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::windows::fs::FileExt;

        let mut read = 0;
        while read < buf.len() {
            let n = self.file.seek_read(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }
}

struct StdWritableFile {
    writer: BufWriter<File>,
}

impl WritableFile for StdWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

fn open_error(path: &Path, err: std::io::Error) -> Error {
    Error::Io(format!("{}: {}", path.display(), err))
}

impl Env for StdEnv {
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        let file = File::open(path).map_err(|e| open_error(path, e))?;
        Ok(Box::new(StdSequentialFile { file }))
    }

    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path).map_err(|e| open_error(path, e))?;
        Ok(Box::new(StdRandomAccessFile { file }))
    }

    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| open_error(path, e))?;
        Ok(Box::new(StdWritableFile {
            writer: BufWriter::new(file),
        }))
    }

    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| open_error(path, e))?;
        Ok(Box::new(StdWritableFile {
            writer: BufWriter::new(file),
        }))
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn children(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| open_error(dir, e))? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| open_error(path, e))
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir(path).map_err(|e| open_error(path, e))
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let meta = fs::metadata(path).map_err(|e| open_error(path, e))?;
        Ok(meta.len())
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(|e| open_error(from, e))
    }

    fn lock_file(&self, path: &Path) -> Result<FileLock> {
        let path_buf = path.to_path_buf();
        if !locked_paths().lock().insert(path_buf.clone()) {
            return Err(Error::Io(format!(
                "lock {}: already held by process",
                path.display()
            )));
        }

        let file = match OpenOptions::new().create(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                locked_paths().lock().remove(&path_buf);
                return Err(open_error(path, e));
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                locked_paths().lock().remove(&path_buf);
                return Err(Error::Io(format!(
                    "lock {}: held by another process",
                    path.display()
                )));
            }
        }

        Ok(FileLock {
            file,
            path: path_buf,
        })
    }

    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    fn sleep_micros(&self, micros: u64) {
        std::thread::sleep(Duration::from_micros(micros));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read_sequential() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let env = StdEnv;

        let mut w = env.new_writable_file(&path).unwrap();
        w.append(b"hello ").unwrap();
        w.append(b"world").unwrap();
        w.sync().unwrap();
        drop(w);

        let mut r = env.new_sequential_file(&path).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(r.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b"hello ");
        r.skip(2).unwrap();
        let mut buf = [0u8; 16];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"rld");
    }

    #[test]
    fn test_random_access_read_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"0123456789").unwrap();

        let env = StdEnv;
        let f = env.new_random_access_file(&path).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(f.read_at(3, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"3456");

        // Short read at end of file.
        let mut buf = [0u8; 8];
        assert_eq!(f.read_at(7, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"789");
    }

    #[test]
    fn test_appendable_preserves_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let env = StdEnv;

        let mut w = env.new_writable_file(&path).unwrap();
        w.append(b"one").unwrap();
        w.flush().unwrap();
        drop(w);

        let mut w = env.new_appendable_file(&path).unwrap();
        w.append(b"two").unwrap();
        w.flush().unwrap();
        drop(w);

        assert_eq!(std::fs::read(&path).unwrap(), b"onetwo");
    }

    #[test]
    fn test_children_and_metadata() {
        let dir = tempdir().unwrap();
        let env = StdEnv;
        std::fs::write(dir.path().join("a"), b"xx").unwrap();
        std::fs::write(dir.path().join("b"), b"yyy").unwrap();

        let mut names = env.children(dir.path()).unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        assert_eq!(env.file_size(&dir.path().join("b")).unwrap(), 3);
        assert!(env.file_exists(&dir.path().join("a")));

        env.remove_file(&dir.path().join("a")).unwrap();
        assert!(!env.file_exists(&dir.path().join("a")));
    }

    #[test]
    fn test_lock_file_excludes_second_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LOCK");
        let env = StdEnv;

        let lock = env.lock_file(&path).unwrap();
        assert!(env.lock_file(&path).is_err());
        drop(lock);

        // Re-lockable after release.
        let lock = env.lock_file(&path).unwrap();
        drop(lock);
    }
}
