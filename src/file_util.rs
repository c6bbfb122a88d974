//! Utilities for hashing files and moving them into place without tearing.

use std::fs::{self, File};
use std::io;

use camino::Utf8Path;
use tracing::*;

use crate::errors::Result;
use crate::hashing::{ContentHash, HashingReader};

/// Past this, let the kernel page the file in instead of us buffering it.
const MAP_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Hash a file's current contents. Small files stream through a bounded
/// buffer; big ones are memory-mapped and digested in one go.
pub fn hash_file(path: &Utf8Path) -> Result<ContentHash> {
    let fh = File::open(path)?;
    let length = fh.metadata()?.len();

    if length >= MAP_THRESHOLD {
        trace!("mapping {path} ({length} bytes) to hash it");
        let mapping = unsafe { memmap2::Mmap::map(&fh)? };
        return Ok(ContentHash::hash(&mapping));
    }

    trace!("streaming {path} ({length} bytes) to hash it");
    let mut reader = HashingReader::new(fh);
    io::copy(&mut reader, &mut io::sink())?;
    Ok(reader.finalize().0)
}

/// Move a fully-staged file over its canonical path.
///
/// The staging directory lives under the tree root, so this is a same-
/// filesystem rename: the canonical path never holds a partial file.
pub fn place_file(staged: &Utf8Path, target: &Utf8Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    // A directory in the way of an incoming regular file loses.
    match fs::symlink_metadata(target.as_std_path()) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(target)?,
        _ => {}
    }
    fs::rename(staged, target)?;
    debug!("placed {staged} at {target}");
    Ok(())
}

/// The conflict-preserving name for `rel`:
/// `/a.txt` becomes `/a.conflict.txt`, then `/a.conflict.1.txt`, ...
/// Extensionless paths get a plain `.conflict[.n]` suffix.
pub fn conflict_rel_path(rel: &str, n: u32) -> String {
    let number = if n == 0 {
        String::new()
    } else {
        format!(".{n}")
    };
    match rel.rfind('.').filter(|&dot| dot > rel.rfind('/').unwrap_or(0) + 1) {
        Some(dot) => format!("{}.conflict{}.{}", &rel[..dot], number, &rel[dot + 1..]),
        None => format!("{rel}.conflict{number}"),
    }
}

/// Flip the hidden attribute where hidden-ness is an attribute.
/// Dot-prefixed names already cover POSIX systems.
#[cfg(windows)]
pub fn hide_best_effort(path: &Utf8Path) {
    use std::os::windows::ffi::OsStrExt;

    use winapi::um::fileapi::{GetFileAttributesW, INVALID_FILE_ATTRIBUTES, SetFileAttributesW};
    use winapi::um::winnt::FILE_ATTRIBUTE_HIDDEN;

    let wide: Vec<u16> = path
        .as_std_path()
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    unsafe {
        let attrs = GetFileAttributesW(wide.as_ptr());
        if attrs != INVALID_FILE_ATTRIBUTES {
            SetFileAttributesW(wide.as_ptr(), attrs | FILE_ATTRIBUTE_HIDDEN);
        }
    }
}

#[cfg(not(windows))]
pub fn hide_best_effort(_path: &Utf8Path) {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hashing_matches_the_oneshot_digest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let contents = b"some file contents worth checking";
        let path = root.join("f.bin");
        fs::write(&path, contents)?;
        assert_eq!(hash_file(&path)?, ContentHash::hash(contents));
        Ok(())
    }

    #[test]
    fn conflict_names() {
        assert_eq!(conflict_rel_path("/a.txt", 0), "/a.conflict.txt");
        assert_eq!(conflict_rel_path("/a.txt", 1), "/a.conflict.1.txt");
        assert_eq!(conflict_rel_path("/d/a.tar.gz", 0), "/d/a.tar.conflict.gz");
        assert_eq!(conflict_rel_path("/noext", 0), "/noext.conflict");
        assert_eq!(conflict_rel_path("/noext", 2), "/noext.conflict.2");
        // A leading dot is a hidden-file marker, not an extension.
        assert_eq!(conflict_rel_path("/.vimrc", 0), "/.vimrc.conflict");
    }

    #[test]
    fn place_overwrites_and_creates_parents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let staged = root.join("staged");
        fs::write(&staged, b"fresh")?;

        let target = root.join("sub/dir/target");
        place_file(&staged, &target)?;
        assert_eq!(fs::read(&target)?, b"fresh");

        let staged2 = root.join("staged2");
        fs::write(&staged2, b"fresher")?;
        place_file(&staged2, &target)?;
        assert_eq!(fs::read(&target)?, b"fresher");
        Ok(())
    }
}
