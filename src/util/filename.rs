//! Database file naming conventions.
//!
//! All files live directly inside the database directory:
//!
//! - `CURRENT` names the live manifest
//! - `LOCK` is the advisory lock held while the database is open
//! - `LOG` and `LOG.old` are informational logs
//! - `MANIFEST-NNNNNN` are descriptor files
//! - `NNNNNN.log` are write-ahead log segments
//! - `NNNNNN.ldb` / `NNNNNN.sst` are sorted tables (only `.ldb` is written)
//! - `NNNNNN.dbtmp` are temporary rename sources

use std::path::{Path, PathBuf};

use crate::env::Env;
use crate::Result;

/// File types in the database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Write-ahead log file.
    Log,
    /// Lock file preventing concurrent opens.
    Lock,
    /// Sorted table file.
    Table,
    /// Descriptor (manifest) file.
    Descriptor,
    /// CURRENT file naming the live manifest.
    Current,
    /// Temporary file.
    Temp,
    /// Informational log file.
    InfoLog,
}

fn make_file_name(dbname: &Path, number: u64, suffix: &str) -> PathBuf {
    dbname.join(format!("{:06}.{}", number, suffix))
}

/// Path of a write-ahead log segment.
pub fn log_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    make_file_name(dbname, number, "log")
}

/// Path of a sorted table as written.
pub fn table_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    make_file_name(dbname, number, "ldb")
}

/// Path of a sorted table under the legacy suffix, accepted on read.
pub fn sst_table_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    make_file_name(dbname, number, "sst")
}

/// Path of a descriptor (manifest) file.
pub fn descriptor_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    dbname.join(format!("MANIFEST-{:06}", number))
}

/// Path of the CURRENT file.
pub fn current_file_name(dbname: &Path) -> PathBuf {
    dbname.join("CURRENT")
}

/// Path of the lock file.
pub fn lock_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOCK")
}

/// Path of a temporary file.
pub fn temp_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    make_file_name(dbname, number, "dbtmp")
}

/// Path of the informational log.
pub fn info_log_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOG")
}

/// Path the informational log is rotated to.
pub fn old_info_log_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOG.old")
}

/// Parse a file name (without directory) into its type and number.
///
/// Numbers are normally zero-padded to six digits, but longer (or shorter)
/// decimal numbers are also accepted. Returns `None` for unowned files.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    if name == "CURRENT" {
        return Some((FileType::Current, 0));
    }
    if name == "LOCK" {
        return Some((FileType::Lock, 0));
    }
    if name == "LOG" || name == "LOG.old" {
        return Some((FileType::InfoLog, 0));
    }

    if let Some(suffix) = name.strip_prefix("MANIFEST-") {
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(number) = suffix.parse::<u64>() {
                return Some((FileType::Descriptor, number));
            }
        }
        return None;
    }

    let dot = name.find('.')?;
    let (num_str, ext) = name.split_at(dot);
    if num_str.is_empty() || !num_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number = num_str.parse::<u64>().ok()?;

    let file_type = match &ext[1..] {
        "log" => FileType::Log,
        "ldb" | "sst" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((file_type, number))
}

/// Point the CURRENT file at `MANIFEST-<descriptor_number>`.
///
/// Writes the name into a temporary file, syncs it, and renames it over
/// CURRENT so the switch is atomic.
pub fn set_current_file(env: &dyn Env, dbname: &Path, descriptor_number: u64) -> Result<()> {
    let manifest = descriptor_file_name(dbname, descriptor_number);
    let contents = manifest
        .file_name()
        .expect("descriptor path has a file name")
        .to_string_lossy();

    let tmp = temp_file_name(dbname, descriptor_number);
    let result = (|| {
        let mut file = env.new_writable_file(&tmp)?;
        file.append(format!("{}\n", contents).as_bytes())?;
        file.sync()?;
        drop(file);
        env.rename_file(&tmp, &current_file_name(dbname))
    })();

    if result.is_err() {
        let _ = env.remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::StdEnv;

    #[test]
    fn test_file_paths() {
        let dbname = Path::new("/data/db");

        assert_eq!(lock_file_name(dbname), Path::new("/data/db/LOCK"));
        assert_eq!(current_file_name(dbname), Path::new("/data/db/CURRENT"));
        assert_eq!(
            descriptor_file_name(dbname, 5),
            Path::new("/data/db/MANIFEST-000005")
        );
        assert_eq!(log_file_name(dbname, 123), Path::new("/data/db/000123.log"));
        assert_eq!(
            table_file_name(dbname, 456),
            Path::new("/data/db/000456.ldb")
        );
        assert_eq!(
            sst_table_file_name(dbname, 456),
            Path::new("/data/db/000456.sst")
        );
        assert_eq!(
            temp_file_name(dbname, 789),
            Path::new("/data/db/000789.dbtmp")
        );
    }

    #[test]
    fn test_parse_file_name() {
        let cases: &[(&str, FileType, u64)] = &[
            ("100.log", FileType::Log, 100),
            ("0.log", FileType::Log, 0),
            ("0.sst", FileType::Table, 0),
            ("0.ldb", FileType::Table, 0),
            ("CURRENT", FileType::Current, 0),
            ("LOCK", FileType::Lock, 0),
            ("MANIFEST-2", FileType::Descriptor, 2),
            ("MANIFEST-000007", FileType::Descriptor, 7),
            ("LOG", FileType::InfoLog, 0),
            ("LOG.old", FileType::InfoLog, 0),
            ("18446744073709551615.log", FileType::Log, u64::MAX),
            ("000123.dbtmp", FileType::Temp, 123),
        ];
        for &(name, ft, number) in cases {
            let parsed = parse_file_name(name);
            assert_eq!(parsed, Some((ft, number)), "parsing {:?}", name);
        }

        let errors = [
            "",
            "foo",
            "foo-dx-100.log",
            ".log",
            "manifest-5",
            "MANIFEST",
            "MANIFEST-",
            "XMANIFEST-3",
            "MANIFEST-3x",
            "100",
            "100.",
            "100.abc",
            "18446744073709551616.log", // overflows u64
        ];
        for name in errors {
            assert_eq!(parse_file_name(name), None, "parsing {:?}", name);
        }
    }

    #[test]
    fn test_set_current_file() {
        let dir = tempfile::tempdir().unwrap();
        let env = StdEnv;

        set_current_file(&env, dir.path(), 42).unwrap();

        let contents = std::fs::read_to_string(current_file_name(dir.path())).unwrap();
        assert_eq!(contents, "MANIFEST-000042\n");
        // The temporary file was renamed away.
        assert!(!temp_file_name(dir.path(), 42).exists());
    }
}
