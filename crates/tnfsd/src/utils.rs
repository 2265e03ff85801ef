use {
    std::{ffi::OsStr, fs::Metadata, os::unix::prelude::*, path::Path},
    tnfs::fcall::*,
    tokio::fs,
};

/// Entry flags for a name/metadata pair.
///
/// DIR and SPECIAL come from the file type; HIDDEN is the Unix dot-name
/// convention.
pub fn entry_flags(name: &str, attr: &Metadata) -> EntryFlags {
    let mut flags = EntryFlags::from(&attr.file_type());
    if name.starts_with('.') {
        flags.insert(EntryFlags::HIDDEN);
    }
    flags
}

/// Build a wire directory entry from metadata.
pub fn dir_entry(name: impl Into<String>, attr: &Metadata) -> DirEntry {
    let name = name.into();
    DirEntry {
        flags: entry_flags(&name, attr),
        size: attr.len() as u32,
        mtime: attr.mtime() as u32,
        ctime: attr.ctime() as u32,
        name,
    }
}

/// Stat `name` inside `dir` and build its wire entry.
///
/// Follows symlinks, as the listing should describe the target. Returns
/// `None` when the stat fails (dangling link, concurrent unlink); such
/// entries are skipped.
pub async fn stat_entry(dir: &Path, name: &OsStr) -> Option<DirEntry> {
    let name = name.to_str()?;
    if name.len() > MAX_FILENAME_LEN {
        return None;
    }
    let attr = fs::metadata(dir.join(name)).await.ok()?;
    Some(dir_entry(name, &attr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_names_are_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".profile"), b"x").unwrap();
        let attr = std::fs::metadata(dir.path().join(".profile")).unwrap();

        let entry = dir_entry(".profile", &attr);
        assert!(entry.flags.contains(EntryFlags::HIDDEN));
        assert!(!entry.flags.contains(EntryFlags::DIR));
        assert_eq!(entry.size, 1);
    }

    #[test]
    fn directories_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let attr = std::fs::metadata(dir.path()).unwrap();
        assert!(entry_flags("sub", &attr).contains(EntryFlags::DIR));
    }
}
