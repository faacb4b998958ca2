//! Crash-safe file replacement and output directory naming.
//!
//! Writers stage the new content in a temporary file next to the target and
//! rename it into place, so a crash leaves either the old or the new version
//! on disk, never a partial one.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;

/// Directory used for records whose keyword leaves no usable path.
pub const FALLBACK_KEYWORD: &str = "weibo";

/// The per-keyword directory, relative to an output root.
///
/// Only normal path components of `keyword` are kept, so the result never
/// escapes the root it is joined onto.
pub fn keyword_dir(keyword: &str) -> PathBuf {
    let dir: PathBuf = Path::new(keyword.trim())
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    if dir.as_os_str().is_empty() {
        PathBuf::from(FALLBACK_KEYWORD)
    } else {
        dir
    }
}

/// Creates the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Atomically replaces `path` with whatever `write` produces.
///
/// When `keep_existing` is set, the current content of `path` is copied into
/// the staged file first, so `write` only has to append.
pub fn replace_file<F>(path: &Path, keep_existing: bool, write: F) -> io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    ensure_parent_dir(path)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut staged = NamedTempFile::new_in(dir)?;
    {
        let mut out = BufWriter::new(staged.as_file_mut());
        if keep_existing {
            match File::open(path) {
                Ok(mut existing) => {
                    io::copy(&mut existing, &mut out)?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        write(&mut out)?;
        out.flush()?;
    }
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Atomically replaces `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    replace_file(path, false, |out| out.write_all(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn keyword_dir_stays_below_the_root() {
        assert_eq!(keyword_dir("生日快乐"), Path::new("生日快乐"));
        assert_eq!(keyword_dir("/etc/cron.d"), Path::new("etc/cron.d"));
        assert_eq!(keyword_dir("../../tmp/x"), Path::new("tmp/x"));
        assert_eq!(keyword_dir("a/./b/../c"), Path::new("a/b/c"));
        assert_eq!(keyword_dir(""), Path::new(FALLBACK_KEYWORD));
        assert_eq!(keyword_dir("  "), Path::new(FALLBACK_KEYWORD));
        assert_eq!(keyword_dir("/.."), Path::new(FALLBACK_KEYWORD));

        let root = Path::new("/data/out");
        for keyword in ["/etc", "..", "../../x", "a/../../..", ""] {
            let joined = root.join(keyword_dir(keyword));
            assert!(joined.starts_with(root), "{:?}", joined);
            assert!(!joined.components().any(|c| c == Component::ParentDir));
        }
    }

    #[test]
    fn write_creates_parents_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("out.json");

        write_atomic(&path, b"first").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");

        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn keep_existing_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.csv");

        replace_file(&path, true, |out| out.write_all(b"one\n")).unwrap();
        replace_file(&path, true, |out| out.write_all(b"two\n")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn failed_write_leaves_previous_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"committed").unwrap();

        let result = replace_file(&path, false, |out| {
            out.write_all(b"half")?;
            Err(io::Error::new(io::ErrorKind::Other, "crash"))
        });
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "committed");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
