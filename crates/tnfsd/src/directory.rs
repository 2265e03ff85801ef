//! Directory engine: path containment, handle slots, enumeration.
//!
//! Every client-supplied path is resolved against the export root before it
//! reaches the filesystem; a path that names anything outside the root
//! resolves to the root itself. Extended enumeration (OPENDIRX/READDIRX)
//! materializes the listing into a sorted vector at open time and pages it
//! out of that vector, so seekdir/telldir positions are plain indices.

use std::cmp::Ordering;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use log::{debug, info};
use tnfs::fcall::*;
use tnfs::{error::status, Error, Result};
use tokio::fs;
use tokio_stream::{wrappers::ReadDirStream, StreamExt};

use crate::config::{DIR_HANDLE_TIMEOUT, MAX_DHND_PER_CONN};
use crate::server::ServerConfig;
use crate::session::Session;
use crate::traverse;
use crate::utils;

/// One directory handle slot.
///
/// States: free (`!open && !loaded`), reserved (initialized but load
/// failed), loaded (listing cached, reusable until it expires), open
/// (client currently holds it). A loaded slot keeps its entry list after
/// CLOSEDIR so a matching reopen can skip the reload.
#[derive(Debug, Default)]
pub struct DirHandle {
    pub open: bool,
    pub loaded: bool,
    /// Legacy OPENDIR snapshot: unfiltered, unsorted, `.`/`..` included
    pub raw: bool,
    pub path: PathBuf,
    pub pattern: String,
    pub diropt: DirOpt,
    pub sortopt: SortOpt,
    /// Load time; a loaded slot expires DIR_HANDLE_TIMEOUT after this
    pub open_at: Option<Instant>,
    pub entries: Vec<DirEntry>,
    pub cursor: usize,
}

impl DirHandle {
    /// Release the slot and everything it caches.
    pub fn clear(&mut self) {
        *self = DirHandle::default();
    }

    fn init(&mut self, path: &Path, diropt: DirOpt, sortopt: SortOpt, pattern: &str, now: Instant) {
        self.clear();
        self.path = path.to_owned();
        self.pattern = pattern.to_owned();
        self.diropt = diropt;
        self.sortopt = sortopt;
        self.open_at = Some(now);
    }

    fn matches(&self, path: &Path, diropt: DirOpt, sortopt: SortOpt, pattern: &str) -> bool {
        self.path == path
            && self.diropt == diropt
            && self.sortopt == sortopt
            && self.pattern == pattern
    }
}

/// Collapse duplicate separators and convert backslashes.
pub fn normalize_path(old: &str) -> String {
    let mut out = String::with_capacity(old.len());
    let mut slash = false;
    for c in old.chars() {
        if c == '/' || c == '\\' {
            if !slash {
                out.push('/');
            }
            slash = true;
        } else {
            out.push(c);
            slash = false;
        }
    }
    out
}

fn has_parent_component(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

/// Resolve a client path to an absolute path inside the export root.
///
/// The path is composed as `root / session root / client path` and
/// normalized. A `..` component, or a canonical result outside the root,
/// resolves to the root itself; containment is not an error the client
/// gets to observe. For targets that do not exist yet (create, mkdir,
/// rename destination) the parent directory is canonicalized instead.
pub async fn resolve_path(
    cfg: &ServerConfig,
    session_root: &str,
    client_path: &str,
) -> Result<PathBuf> {
    if client_path.len() > MAX_TNFSPATH {
        return Err(Error::No(status::ENAMETOOLONG));
    }

    let joined = normalize_path(&format!(
        "{}/{}/{}",
        cfg.realroot.display(),
        session_root,
        client_path
    ));
    if joined.len() > MAX_FILEPATH {
        return Err(Error::No(status::ENAMETOOLONG));
    }

    if has_parent_component(&joined) {
        debug!("path {:?} rejected, contains ..", client_path);
        return Ok(cfg.realroot.clone());
    }

    let path = PathBuf::from(joined);
    match fs::canonicalize(&path).await {
        Ok(c) if c.starts_with(&cfg.realroot) => Ok(c),
        Ok(c) => {
            debug!("path {} escapes the root, using root", c.display());
            Ok(cfg.realroot.clone())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // The target may be about to be created; contain its parent.
            match (path.parent(), path.file_name()) {
                (Some(parent), Some(name)) => match fs::canonicalize(parent).await {
                    Ok(c) if c.starts_with(&cfg.realroot) => Ok(c.join(name)),
                    Ok(_) => Ok(cfg.realroot.clone()),
                    Err(_) => Ok(path),
                },
                _ => Ok(cfg.realroot.clone()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Case-insensitive glob match: `*` matches any run, `?` matches exactly
/// one character, everything else matches literally.
pub fn pattern_match(src: &str, pattern: &str) -> bool {
    let src: Vec<char> = src.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    let (n, m) = (src.len(), pat.len());

    // Empty pattern can only match the empty string.
    if m == 0 {
        return n == 0;
    }

    let mut lookup = vec![vec![false; m + 1]; n + 1];
    lookup[0][0] = true;

    // Only '*' can match the empty string.
    for j in 1..=m {
        if pat[j - 1] == '*' {
            lookup[0][j] = lookup[0][j - 1];
        }
    }

    for i in 1..=n {
        for j in 1..=m {
            lookup[i][j] = if pat[j - 1] == '*' {
                // '*' is an empty run, or it swallows src[i-1].
                lookup[i][j - 1] || lookup[i - 1][j]
            } else if pat[j - 1] == '?'
                || src[i - 1].to_ascii_lowercase() == pat[j - 1].to_ascii_lowercase()
            {
                lookup[i - 1][j - 1]
            } else {
                false
            };
        }
    }

    lookup[n][m]
}

fn compare_entries(a: &DirEntry, b: &DirEntry, sortopt: SortOpt) -> Ordering {
    let ord = if sortopt.contains(SortOpt::SIZE) {
        a.size.cmp(&b.size)
    } else if sortopt.contains(SortOpt::MODIFIED) {
        a.mtime.cmp(&b.mtime)
    } else if sortopt.contains(SortOpt::CASE) {
        a.name.cmp(&b.name)
    } else {
        a.name
            .to_ascii_lowercase()
            .cmp(&b.name.to_ascii_lowercase())
    };

    if sortopt.contains(SortOpt::DESCENDING) {
        ord.reverse()
    } else {
        ord
    }
}

/// Sort the two groups and concatenate them, directories first.
///
/// `Vec::sort_by` is a stable mergesort, the same contract the linked-list
/// mergesort of the reference server provides.
pub(crate) fn sort_and_merge(
    mut dirs: Vec<DirEntry>,
    mut files: Vec<DirEntry>,
    sortopt: SortOpt,
) -> Vec<DirEntry> {
    if !sortopt.contains(SortOpt::NONE) {
        dirs.sort_by(|a, b| compare_entries(a, b, sortopt));
        files.sort_by(|a, b| compare_entries(a, b, sortopt));
    }
    dirs.extend(files);
    dirs
}

/// Filter one candidate entry. `match_name` is the component the glob
/// pattern applies to (the basename, for traversal results).
pub(crate) fn accept_entry(
    entry: &DirEntry,
    match_name: &str,
    diropt: DirOpt,
    pattern: &str,
) -> bool {
    let is_dir = entry.flags.contains(EntryFlags::DIR);

    // The pattern skips directories unless DIR_PATTERN says otherwise.
    if (diropt.contains(DirOpt::DIR_PATTERN) || !is_dir)
        && !pattern.is_empty()
        && !pattern_match(match_name, pattern)
    {
        return false;
    }
    if !diropt.contains(DirOpt::NO_SKIPHIDDEN) && entry.flags.contains(EntryFlags::HIDDEN) {
        return false;
    }
    if !diropt.contains(DirOpt::NO_SKIPSPECIAL) && entry.flags.contains(EntryFlags::SPECIAL) {
        return false;
    }
    if diropt.contains(DirOpt::NO_FOLDERS) && is_dir {
        return false;
    }
    true
}

/// Load, filter and sort the listing for an extended handle.
async fn load_directory(dh: &mut DirHandle, maxresults: u16) -> Result<()> {
    dh.entries.clear();
    dh.cursor = 0;

    let mut stream = ReadDirStream::new(fs::read_dir(&dh.path).await?);
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut count: u16 = 0;

    while let Some(entry) = stream.next().await {
        let entry = entry?;
        let Some(e) = utils::stat_entry(&dh.path, &entry.file_name()).await else {
            continue;
        };
        if !accept_entry(&e, &e.name, dh.diropt, &dh.pattern) {
            continue;
        }

        if e.flags.contains(EntryFlags::DIR) && !dh.diropt.contains(DirOpt::NO_FOLDERSFIRST) {
            dirs.push(e);
        } else {
            files.push(e);
        }

        count += 1;
        if maxresults > 0 && count >= maxresults {
            break;
        }
    }

    dh.entries = sort_and_merge(dirs, files, dh.sortopt);
    Ok(())
}

/// Legacy OPENDIR snapshot: raw names in filesystem order, `.`/`..`
/// included, nothing filtered or sorted.
async fn load_raw(dh: &mut DirHandle) -> Result<()> {
    dh.entries.clear();
    dh.cursor = 0;

    // The OS iterator omits the dot entries; clients of the legacy command
    // expect them.
    for name in [".", ".."] {
        dh.entries.push(DirEntry {
            flags: EntryFlags::DIR,
            name: name.to_owned(),
            ..DirEntry::default()
        });
    }

    let mut stream = ReadDirStream::new(fs::read_dir(&dh.path).await?);
    while let Some(entry) = stream.next().await {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            dh.entries.push(DirEntry {
                name: name.to_owned(),
                ..DirEntry::default()
            });
        }
    }
    Ok(())
}

fn sweep_dir_handles(dhandles: &mut [DirHandle], now: Instant) {
    for (i, dh) in dhandles.iter_mut().enumerate() {
        if dh.open || !dh.loaded {
            continue;
        }
        let expired = dh
            .open_at
            .is_none_or(|at| now.duration_since(at) > DIR_HANDLE_TIMEOUT);
        if expired {
            debug!("freeing stale dir handle {}", i);
            dh.clear();
        }
    }
}

/// Pick a slot for a new enumeration: sweep expired slots, then try to
/// reuse a matching loaded one (if asked), then an empty one, then evict
/// any slot that is not currently open. `None` means every slot is open.
pub fn find_free_dir_handle(
    dhandles: &mut [DirHandle],
    path: &Path,
    diropt: DirOpt,
    sortopt: SortOpt,
    pattern: &str,
    reuse: bool,
    now: Instant,
) -> Option<usize> {
    sweep_dir_handles(dhandles, now);

    if reuse {
        for (i, dh) in dhandles.iter_mut().enumerate() {
            if !dh.open && dh.loaded && dh.matches(path, diropt, sortopt, pattern) {
                debug!("reusing dir handle {}", i);
                dh.cursor = 0;
                return Some(i);
            }
        }
    }

    for (i, dh) in dhandles.iter_mut().enumerate() {
        if !dh.open && !dh.loaded {
            dh.init(path, diropt, sortopt, pattern, now);
            return Some(i);
        }
    }

    for (i, dh) in dhandles.iter_mut().enumerate() {
        if !dh.open {
            debug!("evicting loaded dir handle {}", i);
            dh.init(path, diropt, sortopt, pattern, now);
            return Some(i);
        }
    }

    None
}

fn dir_handle_mut(s: &mut Session, handle: u8) -> Result<&mut DirHandle> {
    let idx = handle as usize;
    if idx >= MAX_DHND_PER_CONN || !s.dhandles[idx].open {
        return Err(Error::No(status::EBADF));
    }
    Ok(&mut s.dhandles[idx])
}

pub async fn opendir(
    cfg: &ServerConfig,
    s: &mut Session,
    client_path: &str,
    now: Instant,
) -> Result<FCall> {
    let path = resolve_path(cfg, &s.root, client_path).await?;

    let Some(i) = find_free_dir_handle(
        &mut s.dhandles,
        &path,
        DirOpt::empty(),
        SortOpt::empty(),
        "",
        false,
        now,
    ) else {
        return Err(Error::No(status::EMFILE));
    };

    let dh = &mut s.dhandles[i];
    load_raw(dh).await?;
    dh.open = true;
    dh.raw = true;

    Ok(FCall::ROpenDir { handle: i as u8 })
}

pub fn readdir(s: &mut Session, handle: u8) -> Result<FCall> {
    let dh = dir_handle_mut(s, handle)?;
    match dh.entries.get(dh.cursor) {
        Some(e) => {
            let name = e.name.clone();
            dh.cursor += 1;
            Ok(FCall::RReadDir { name })
        }
        None => Err(Error::No(status::EOF)),
    }
}

pub fn closedir(s: &mut Session, handle: u8) -> Result<FCall> {
    let dh = dir_handle_mut(s, handle)?;
    dh.open = false;
    if dh.raw {
        // Raw snapshots are never reused, drop them now.
        dh.clear();
    }
    Ok(FCall::RCloseDir)
}

pub fn telldir(s: &mut Session, handle: u8) -> Result<FCall> {
    let dh = dir_handle_mut(s, handle)?;
    Ok(FCall::RTellDir {
        pos: dh.cursor as u32,
    })
}

pub fn seekdir(s: &mut Session, handle: u8, pos: u32) -> Result<FCall> {
    let dh = dir_handle_mut(s, handle)?;
    dh.cursor = (pos as usize).min(dh.entries.len());
    let path = dh.path.clone();

    if pos == 0 && s.lastpath != path {
        info!("path changed to: {}", path.display());
        s.lastpath = path;
    }

    Ok(FCall::RSeekDir)
}

#[allow(clippy::too_many_arguments)]
pub async fn opendirx(
    cfg: &ServerConfig,
    s: &mut Session,
    diropt: DirOpt,
    sortopt: SortOpt,
    maxresults: u16,
    pattern: &str,
    client_path: &str,
    now: Instant,
) -> Result<FCall> {
    let path = resolve_path(cfg, &s.root, client_path).await?;
    let recurse = diropt.contains(DirOpt::TRAVERSE);

    let Some(i) = find_free_dir_handle(
        &mut s.dhandles,
        &path,
        diropt,
        sortopt,
        pattern,
        recurse,
        now,
    ) else {
        return Err(Error::No(status::EMFILE));
    };

    let dh = &mut s.dhandles[i];
    if recurse {
        if !dh.loaded {
            traverse::traverse_directory(dh, maxresults).await?;
        }
        // A loaded handle is the reuse case; skip the reload.
    } else {
        load_directory(dh, maxresults).await?;
    }
    dh.open = true;
    dh.loaded = true;

    let count = dh.entries.len().min(u16::MAX as usize) as u16;
    debug!(
        "opendirx handle={} count={} path={}",
        i,
        count,
        dh.path.display()
    );
    Ok(FCall::ROpenDirX {
        handle: i as u8,
        count,
    })
}

pub fn readdirx(s: &mut Session, handle: u8, req_count: u8) -> Result<FCall> {
    let idx = handle as usize;
    if idx >= MAX_DHND_PER_CONN {
        return Err(Error::No(status::EBADF));
    }
    let dh = &mut s.dhandles[idx];
    if !dh.open || !dh.loaded {
        return Err(Error::No(status::EBADF));
    }

    // Already at the end on entry: one EOF reply, nothing else.
    if dh.cursor >= dh.entries.len() {
        return Err(Error::No(status::EOF));
    }

    let dirpos = dh.cursor as u16;
    let mut total = READDIRX_HEADER_SIZE;
    let mut batch = Vec::new();

    while dh.cursor < dh.entries.len() {
        if req_count != 0 && batch.len() >= req_count as usize {
            break;
        }
        let e = &dh.entries[dh.cursor];
        if total + e.wire_size() > TNFS_MAX_PAYLOAD {
            break;
        }
        total += e.wire_size();
        batch.push(e.clone());
        dh.cursor += 1;
    }

    let mut dir_status = DirStatus::empty();
    if dh.cursor >= dh.entries.len() {
        dir_status.insert(DirStatus::EOF);
    }

    Ok(FCall::RReadDirX {
        dir_status,
        dirpos,
        entries: batch,
    })
}

pub async fn mkdir(cfg: &ServerConfig, s: &mut Session, client_path: &str) -> Result<FCall> {
    let path = resolve_path(cfg, &s.root, client_path).await?;
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o755);
    builder.create(&path).await?;
    Ok(FCall::RMkDir)
}

pub async fn rmdir(cfg: &ServerConfig, s: &mut Session, client_path: &str) -> Result<FCall> {
    let path = resolve_path(cfg, &s.root, client_path).await?;
    fs::remove_dir(&path).await?;
    Ok(FCall::RRmDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_DHND_PER_CONN;
    use std::time::Duration;

    fn named(name: &str) -> DirEntry {
        DirEntry {
            name: name.to_owned(),
            ..DirEntry::default()
        }
    }

    fn dir_named(name: &str) -> DirEntry {
        DirEntry {
            flags: EntryFlags::DIR,
            name: name.to_owned(),
            ..DirEntry::default()
        }
    }

    fn test_cfg(root: &Path) -> ServerConfig {
        ServerConfig {
            root: root.to_owned(),
            realroot: std::fs::canonicalize(root).unwrap(),
            port: 0,
        }
    }

    #[test]
    fn normalize_collapses_separators() {
        assert_eq!(normalize_path("/srv//tnfs///games"), "/srv/tnfs/games");
        assert_eq!(normalize_path("a\\b\\\\c"), "a/b/c");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn glob_semantics() {
        assert!(pattern_match("foo.sna", "*.sna"));
        assert!(pattern_match("FOO.SNA", "*.sna"));
        assert!(!pattern_match("foo.txt", "*.sna"));
        assert!(pattern_match("disk1.trd", "disk?.trd"));
        assert!(!pattern_match("disk12.trd", "disk?.trd"));
        assert!(pattern_match("anything", "*"));
        assert!(pattern_match("", "*"));
        assert!(pattern_match("", ""));
        assert!(!pattern_match("x", ""));
    }

    #[test]
    fn default_sort_is_folders_first_case_insensitive() {
        let files = vec![named("B"), named("a"), named("C")];
        let dirs = vec![dir_named("sub")];
        let order: Vec<_> = sort_and_merge(dirs, files, SortOpt::empty())
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(order, ["sub", "a", "B", "C"]);
    }

    #[test]
    fn case_sensitive_descending_sort() {
        let files = vec![named("B"), named("a"), named("C")];
        let dirs = vec![dir_named("sub")];
        let order: Vec<_> = sort_and_merge(dirs, files, SortOpt::CASE | SortOpt::DESCENDING)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(order, ["sub", "a", "C", "B"]);
    }

    #[test]
    fn sort_none_keeps_load_order() {
        let files = vec![named("zz"), named("aa")];
        let order: Vec<_> = sort_and_merge(Vec::new(), files, SortOpt::NONE)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(order, ["zz", "aa"]);
    }

    #[tokio::test]
    async fn parent_components_resolve_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());

        let p = resolve_path(&cfg, "", "../../etc").await.unwrap();
        assert_eq!(p, cfg.realroot);
    }

    #[tokio::test]
    async fn symlink_escape_resolves_to_root() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("exit")).unwrap();
        let cfg = test_cfg(dir.path());

        let p = resolve_path(&cfg, "", "exit").await.unwrap();
        assert_eq!(p, cfg.realroot);
    }

    #[tokio::test]
    async fn missing_target_is_contained_by_its_parent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());

        let p = resolve_path(&cfg, "", "newfile.txt").await.unwrap();
        assert_eq!(p, cfg.realroot.join("newfile.txt"));
    }

    #[tokio::test]
    async fn overlong_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());

        let long = "x".repeat(MAX_TNFSPATH + 1);
        match resolve_path(&cfg, "", &long).await {
            Err(Error::No(s)) => assert_eq!(s, status::ENAMETOOLONG),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn opendirx_globs_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["foo.sna", "foo.txt", "bar.sna"] {
            std::fs::write(dir.path().join(f), b"").unwrap();
        }
        let cfg = test_cfg(dir.path());
        let mut s = Session::for_tests();

        let reply = opendirx(
            &cfg,
            &mut s,
            DirOpt::empty(),
            SortOpt::empty(),
            0,
            "*.sna",
            "/",
            Instant::now(),
        )
        .await
        .unwrap();
        let FCall::ROpenDirX { handle, count } = reply else {
            panic!("wrong reply");
        };
        assert_eq!(count, 2);

        let names: Vec<_> = s.dhandles[handle as usize]
            .entries
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names, ["bar.sna", "foo.sna"]);
    }

    #[tokio::test]
    async fn opendirx_filters_hidden_and_folders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".hidden"), b"").unwrap();
        std::fs::write(dir.path().join("seen"), b"").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let cfg = test_cfg(dir.path());
        let mut s = Session::for_tests();

        let reply = opendirx(
            &cfg,
            &mut s,
            DirOpt::empty(),
            SortOpt::empty(),
            0,
            "",
            "/",
            Instant::now(),
        )
        .await
        .unwrap();
        let FCall::ROpenDirX { handle, count } = reply else {
            panic!("wrong reply");
        };
        assert_eq!(count, 2);
        let names: Vec<_> = s.dhandles[handle as usize]
            .entries
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names, ["sub", "seen"]);

        let reply = opendirx(
            &cfg,
            &mut s,
            DirOpt::NO_SKIPHIDDEN | DirOpt::NO_FOLDERS,
            SortOpt::empty(),
            0,
            "",
            "/",
            Instant::now(),
        )
        .await
        .unwrap();
        let FCall::ROpenDirX { handle, .. } = reply else {
            panic!("wrong reply");
        };
        let names: Vec<_> = s.dhandles[handle as usize]
            .entries
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names, [".hidden", "seen"]);
    }

    fn loaded_session(names: usize, name_len: usize) -> Session {
        let mut s = Session::for_tests();
        let dh = &mut s.dhandles[0];
        for i in 0..names {
            dh.entries.push(named(&format!(
                "{:0width$}",
                i,
                width = name_len
            )));
        }
        dh.open = true;
        dh.loaded = true;
        dh.open_at = Some(Instant::now());
        s
    }

    #[test]
    fn readdirx_fills_the_datagram() {
        // 100 entries, 10 byte names, 24 bytes each on the wire: 21 fit in
        // the 523 bytes left after the reply header.
        let mut s = loaded_session(100, 10);

        let FCall::RReadDirX {
            dir_status,
            dirpos,
            entries,
        } = readdirx(&mut s, 0, 0).unwrap()
        else {
            panic!("wrong reply");
        };
        assert_eq!(entries.len(), 21);
        assert_eq!(dirpos, 0);
        assert_eq!(dir_status, DirStatus::empty());

        let FCall::RReadDirX { dirpos, .. } = readdirx(&mut s, 0, 0).unwrap() else {
            panic!("wrong reply");
        };
        assert_eq!(dirpos, 21);
    }

    #[test]
    fn readdirx_drains_then_reports_eof() {
        let mut s = loaded_session(100, 10);

        let mut seen = 0;
        loop {
            let FCall::RReadDirX {
                dir_status,
                entries,
                ..
            } = readdirx(&mut s, 0, 0).unwrap()
            else {
                panic!("wrong reply");
            };
            seen += entries.len();
            if dir_status.contains(DirStatus::EOF) {
                break;
            }
        }
        assert_eq!(seen, 100);

        // The cursor is exhausted; the next call is a bare EOF status.
        match readdirx(&mut s, 0, 0) {
            Err(Error::No(s)) => assert_eq!(s, status::EOF),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn readdirx_honors_requested_count() {
        let mut s = loaded_session(10, 4);
        let FCall::RReadDirX { entries, .. } = readdirx(&mut s, 0, 3).unwrap() else {
            panic!("wrong reply");
        };
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn readdirx_bad_handles() {
        let mut s = loaded_session(1, 4);
        for h in [MAX_DHND_PER_CONN as u8, 0xff, 1] {
            match readdirx(&mut s, h, 0) {
                Err(Error::No(st)) => assert_eq!(st, status::EBADF),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn telldir_seekdir_roundtrip() {
        let mut s = loaded_session(10, 4);
        for n in [0u32, 3, 9, 10] {
            seekdir(&mut s, 0, n).unwrap();
            let FCall::RTellDir { pos } = telldir(&mut s, 0).unwrap() else {
                panic!("wrong reply");
            };
            assert_eq!(pos, n);
        }

        // Past the end clamps to the end.
        seekdir(&mut s, 0, 1000).unwrap();
        let FCall::RTellDir { pos } = telldir(&mut s, 0).unwrap() else {
            panic!("wrong reply");
        };
        assert_eq!(pos, 10);
    }

    #[tokio::test]
    async fn traverse_handle_is_reused_until_it_expires() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.sna"), b"").unwrap();
        std::fs::write(dir.path().join("b.sna"), b"").unwrap();
        let cfg = test_cfg(dir.path());
        let mut s = Session::for_tests();
        let t0 = Instant::now();

        let opts = DirOpt::TRAVERSE;
        let reply = opendirx(&cfg, &mut s, opts, SortOpt::empty(), 0, "", "/", t0)
            .await
            .unwrap();
        let FCall::ROpenDirX { handle, count } = reply else {
            panic!("wrong reply");
        };
        assert_eq!(count, 2);
        closedir(&mut s, handle).unwrap();

        // The listing is served from the cached handle: a file added after
        // the load is not visible through the reused handle.
        std::fs::write(dir.path().join("c.sna"), b"").unwrap();
        let reply = opendirx(&cfg, &mut s, opts, SortOpt::empty(), 0, "", "/", t0)
            .await
            .unwrap();
        let FCall::ROpenDirX {
            handle: again,
            count,
        } = reply
        else {
            panic!("wrong reply");
        };
        assert_eq!(again, handle);
        assert_eq!(count, 2);
        closedir(&mut s, again).unwrap();

        // Past DIR_HANDLE_TIMEOUT the slot is swept and reloaded.
        let late = t0 + DIR_HANDLE_TIMEOUT + Duration::from_secs(1);
        let reply = opendirx(&cfg, &mut s, opts, SortOpt::empty(), 0, "", "/", late)
            .await
            .unwrap();
        let FCall::ROpenDirX { count, .. } = reply else {
            panic!("wrong reply");
        };
        assert_eq!(count, 3);
    }

    #[test]
    fn all_handles_open_means_no_handle() {
        let mut s = Session::for_tests();
        for dh in s.dhandles.iter_mut() {
            dh.open = true;
        }
        let got = find_free_dir_handle(
            &mut s.dhandles,
            Path::new("/x"),
            DirOpt::empty(),
            SortOpt::empty(),
            "",
            false,
            Instant::now(),
        );
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn legacy_readdir_walks_raw_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("only"), b"").unwrap();
        let cfg = test_cfg(dir.path());
        let mut s = Session::for_tests();

        let FCall::ROpenDir { handle } = opendir(&cfg, &mut s, "/", Instant::now()).await.unwrap()
        else {
            panic!("wrong reply");
        };

        let mut names = Vec::new();
        loop {
            match readdir(&mut s, handle) {
                Ok(FCall::RReadDir { name }) => names.push(name),
                Err(Error::No(st)) if st == status::EOF => break,
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(names, [".", "..", "only"]);

        closedir(&mut s, handle).unwrap();
        match readdir(&mut s, handle) {
            Err(Error::No(st)) => assert_eq!(st, status::EBADF),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
