//! Recursive flattened enumeration, the DIROPT TRAVERSE variant.
//!
//! Produces one flat listing across the whole subtree of the opened
//! directory. Entry names are relative paths like `sub/deep/file.sna`; the
//! glob pattern applies to the final component. Filters and sorting follow
//! the flat loader, and the caller reuses the loaded handle on a matching
//! reopen instead of walking the tree again.

use std::path::PathBuf;

use tnfs::fcall::*;
use tnfs::Result;
use tokio::fs;
use tokio_stream::{wrappers::ReadDirStream, StreamExt};

use crate::directory::{accept_entry, sort_and_merge, DirHandle};
use crate::utils;

pub async fn traverse_directory(dh: &mut DirHandle, maxresults: u16) -> Result<()> {
    dh.entries.clear();
    dh.cursor = 0;

    let diropt = dh.diropt;
    let sortopt = dh.sortopt;
    let pattern = dh.pattern.clone();

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut count: u16 = 0;
    let mut queue: Vec<(PathBuf, String)> = vec![(dh.path.clone(), String::new())];

    'walk: while let Some((abs, prefix)) = queue.pop() {
        let rd = match fs::read_dir(&abs).await {
            Ok(rd) => rd,
            // The opened directory must be readable; subdirectories that
            // vanish or deny access mid-walk are skipped.
            Err(e) if prefix.is_empty() => return Err(e.into()),
            Err(_) => continue,
        };
        let mut stream = ReadDirStream::new(rd);

        while let Some(entry) = stream.next().await {
            let Ok(entry) = entry else { continue };
            let Some(mut e) = utils::stat_entry(&abs, &entry.file_name()).await else {
                continue;
            };
            let name = e.name.clone();
            let is_dir = e.flags.contains(EntryFlags::DIR);

            let skip_hidden =
                !diropt.contains(DirOpt::NO_SKIPHIDDEN) && e.flags.contains(EntryFlags::HIDDEN);
            if is_dir && !skip_hidden {
                queue.push((abs.join(&name), format!("{}{}/", prefix, name)));
            }

            e.name = format!("{}{}", prefix, name);
            if !accept_entry(&e, &name, diropt, &pattern) {
                continue;
            }

            if is_dir && !diropt.contains(DirOpt::NO_FOLDERSFIRST) {
                dirs.push(e);
            } else {
                files.push(e);
            }
            count += 1;
            if maxresults > 0 && count >= maxresults {
                break 'walk;
            }
        }
    }

    dh.entries = sort_and_merge(dirs, files, sortopt);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.sna"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        std::fs::write(dir.path().join("sub/b.sna"), b"").unwrap();
        std::fs::write(dir.path().join("sub/deep/c.sna"), b"").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), b"").unwrap();
        dir
    }

    fn handle(dir: &tempfile::TempDir, diropt: DirOpt, pattern: &str) -> DirHandle {
        DirHandle {
            path: dir.path().to_owned(),
            pattern: pattern.to_owned(),
            diropt,
            ..DirHandle::default()
        }
    }

    #[tokio::test]
    async fn flattens_the_subtree_with_relative_names() {
        let dir = fixture();
        let mut dh = handle(&dir, DirOpt::TRAVERSE, "");
        traverse_directory(&mut dh, 0).await.unwrap();

        let names: Vec<_> = dh.entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(
            names,
            ["sub", "sub/deep", "a.sna", "notes.txt", "sub/b.sna", "sub/deep/c.sna"]
        );
    }

    #[tokio::test]
    async fn pattern_applies_to_the_final_component() {
        let dir = fixture();
        let mut dh = handle(&dir, DirOpt::TRAVERSE | DirOpt::NO_FOLDERS, "*.sna");
        traverse_directory(&mut dh, 0).await.unwrap();

        let names: Vec<_> = dh.entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, ["a.sna", "sub/b.sna", "sub/deep/c.sna"]);
    }

    #[tokio::test]
    async fn hidden_subtrees_are_not_descended() {
        let dir = fixture();
        let mut dh = handle(&dir, DirOpt::TRAVERSE, "");
        traverse_directory(&mut dh, 0).await.unwrap();
        assert!(dh.entries.iter().all(|e| !e.name.contains(".git")));

        let mut dh = handle(&dir, DirOpt::TRAVERSE | DirOpt::NO_SKIPHIDDEN, "");
        traverse_directory(&mut dh, 0).await.unwrap();
        assert!(dh.entries.iter().any(|e| e.name == ".git/config"));
    }

    #[tokio::test]
    async fn maxresults_caps_the_walk() {
        let dir = fixture();
        let mut dh = handle(&dir, DirOpt::TRAVERSE | DirOpt::NO_FOLDERS, "*.sna");
        traverse_directory(&mut dh, 2).await.unwrap();
        assert_eq!(dh.entries.len(), 2);
    }
}
