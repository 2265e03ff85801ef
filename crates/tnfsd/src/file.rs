//! File operations: open/read/write/lseek/close plus the path-level calls
//! (stat, chmod, rename, unlink) and the filesystem totals.

use std::io::{self, SeekFrom};
use std::os::unix::fs::PermissionsExt;

use log::debug;
use tnfs::fcall::*;
use tnfs::{error::status, Error, Result};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::directory::resolve_path;
use crate::server::ServerConfig;
use crate::session::{FileHandle, Session};

pub async fn open(
    cfg: &ServerConfig,
    s: &mut Session,
    flags: OpenFlags,
    mode: u16,
    client_path: &str,
) -> Result<FCall> {
    let path = resolve_path(cfg, &s.root, client_path).await?;

    let mut opts = fs::OpenOptions::new();
    match flags.bits() & 0x3 {
        0x1 => opts.read(true),
        0x2 => opts.write(true),
        0x3 => opts.read(true).write(true),
        _ => return Err(Error::No(status::EINVAL)),
    };
    if flags.contains(OpenFlags::APPEND) {
        opts.append(true);
    }
    if flags.contains(OpenFlags::CREAT) {
        opts.create(true);
        opts.mode(mode as u32);
        if flags.contains(OpenFlags::EXCL) {
            opts.create_new(true);
        }
    }
    if flags.contains(OpenFlags::TRUNC) {
        opts.truncate(true);
    }

    let file = opts.open(&path).await?;
    let fd = s.alloc_fd(FileHandle { file, path })?;
    Ok(FCall::ROpen { fd })
}

pub async fn read(s: &mut Session, fd: u8, count: u16) -> Result<FCall> {
    let count = (count as usize).min(MAX_IOSZ).min(TNFS_MAX_PAYLOAD - 2);
    let fh = s.file_mut(fd)?;

    let mut buf = vec![0; count];
    let n = fh.file.read(&mut buf[..]).await?;
    if n == 0 {
        return Err(Error::No(status::EOF));
    }
    buf.truncate(n);
    Ok(FCall::RRead { data: Data(buf) })
}

pub async fn write(s: &mut Session, fd: u8, data: &Data) -> Result<FCall> {
    let fh = s.file_mut(fd)?;
    let n = fh.file.write(&data.0).await?;
    Ok(FCall::RWrite { count: n as u16 })
}

pub async fn lseek(s: &mut Session, fd: u8, whence: u8, offset: i32) -> Result<FCall> {
    let from = match whence {
        0 if offset < 0 => return Err(Error::No(status::EINVAL)),
        0 => SeekFrom::Start(offset as u64),
        1 => SeekFrom::Current(offset as i64),
        2 => SeekFrom::End(offset as i64),
        _ => return Err(Error::No(status::EINVAL)),
    };

    let fh = s.file_mut(fd)?;
    let pos = fh.file.seek(from).await?;
    Ok(FCall::RLSeek { pos: pos as u32 })
}

pub fn close(s: &mut Session, fd: u8) -> Result<FCall> {
    let fh = s.file_mut(fd)?;
    debug!("closing fd {} ({})", fd, fh.path.display());
    s.close_fd(fd)?;
    Ok(FCall::RClose)
}

pub async fn stat(cfg: &ServerConfig, s: &mut Session, client_path: &str) -> Result<FCall> {
    let path = resolve_path(cfg, &s.root, client_path).await?;
    let attr = fs::metadata(&path).await?;
    Ok(FCall::RStat {
        stat: FileStat::from(&attr),
    })
}

pub async fn unlink(cfg: &ServerConfig, s: &mut Session, client_path: &str) -> Result<FCall> {
    let path = resolve_path(cfg, &s.root, client_path).await?;
    fs::remove_file(&path).await?;
    Ok(FCall::RUnlink)
}

pub async fn chmod(
    cfg: &ServerConfig,
    s: &mut Session,
    mode: u16,
    client_path: &str,
) -> Result<FCall> {
    let path = resolve_path(cfg, &s.root, client_path).await?;
    fs::set_permissions(&path, PermissionsExt::from_mode(mode as u32)).await?;
    Ok(FCall::RChmod)
}

pub async fn rename(
    cfg: &ServerConfig,
    s: &mut Session,
    from: &str,
    to: &str,
) -> Result<FCall> {
    let from = resolve_path(cfg, &s.root, from).await?;
    let to = resolve_path(cfg, &s.root, to).await?;
    fs::rename(&from, &to).await?;
    Ok(FCall::RRename)
}

async fn statvfs_root(cfg: &ServerConfig) -> Result<nix::sys::statvfs::Statvfs> {
    let path = cfg.realroot.clone();
    let vfs = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&path))
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))??;
    Ok(vfs)
}

/// Total size of the filesystem holding the root, in kilobytes.
pub async fn size(cfg: &ServerConfig) -> Result<FCall> {
    let vfs = statvfs_root(cfg).await?;
    let kb = (vfs.blocks() as u64).saturating_mul(vfs.block_size() as u64) / 1024;
    Ok(FCall::RSize {
        kilobytes: kb.min(u32::MAX as u64) as u32,
    })
}

/// Kilobytes available on the filesystem holding the root.
pub async fn free(cfg: &ServerConfig) -> Result<FCall> {
    let vfs = statvfs_root(cfg).await?;
    let kb = (vfs.blocks_available() as u64).saturating_mul(vfs.block_size() as u64) / 1024;
    Ok(FCall::RFree {
        kilobytes: kb.min(u32::MAX as u64) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_cfg(root: &Path) -> ServerConfig {
        ServerConfig {
            root: root.to_owned(),
            realroot: std::fs::canonicalize(root).unwrap(),
            port: 0,
        }
    }

    #[tokio::test]
    async fn open_write_seek_read_close() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let mut s = Session::for_tests();

        let FCall::ROpen { fd } = open(
            &cfg,
            &mut s,
            OpenFlags::RDWR | OpenFlags::CREAT,
            0o644,
            "file.bin",
        )
        .await
        .unwrap() else {
            panic!("wrong reply");
        };
        assert_eq!(fd, 0);

        let FCall::RWrite { count } = write(&mut s, fd, &Data(b"hello world".to_vec()))
            .await
            .unwrap()
        else {
            panic!("wrong reply");
        };
        assert_eq!(count, 11);

        let FCall::RLSeek { pos } = lseek(&mut s, fd, 0, 6).await.unwrap() else {
            panic!("wrong reply");
        };
        assert_eq!(pos, 6);

        let FCall::RRead { data } = read(&mut s, fd, 100).await.unwrap() else {
            panic!("wrong reply");
        };
        assert_eq!(data.0, b"world");

        // Cursor now at the end; the next read is EOF, not an error reply
        // with data.
        match read(&mut s, fd, 100).await {
            Err(Error::No(st)) => assert_eq!(st, status::EOF),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }

        let FCall::RLSeek { pos } = lseek(&mut s, fd, 2, 0).await.unwrap() else {
            panic!("wrong reply");
        };
        assert_eq!(pos, 11);

        close(&mut s, fd).unwrap();
        assert!(close(&mut s, fd).is_err());
    }

    #[tokio::test]
    async fn reads_are_clamped_to_the_transfer_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big"), vec![7u8; 600]).unwrap();
        let cfg = test_cfg(dir.path());
        let mut s = Session::for_tests();

        let FCall::ROpen { fd } =
            open(&cfg, &mut s, OpenFlags::RDONLY, 0, "big").await.unwrap()
        else {
            panic!("wrong reply");
        };
        let FCall::RRead { data } = read(&mut s, fd, 600).await.unwrap() else {
            panic!("wrong reply");
        };
        assert_eq!(data.0.len(), MAX_IOSZ);
    }

    #[tokio::test]
    async fn excl_create_reports_eexist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("taken"), b"").unwrap();
        let cfg = test_cfg(dir.path());
        let mut s = Session::for_tests();

        let flags = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::EXCL;
        let err = open(&cfg, &mut s, flags, 0o644, "taken").await.unwrap_err();
        assert_eq!(err.status(), status::EEXIST);
    }

    #[tokio::test]
    async fn invalid_access_mode_is_einval() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let mut s = Session::for_tests();

        let err = open(&cfg, &mut s, OpenFlags::empty(), 0, "x").await.unwrap_err();
        assert_eq!(err.status(), status::EINVAL);

        let err = lseek(&mut s, 0, 9, 0).await.unwrap_err();
        assert_eq!(err.status(), status::EBADF); // no such fd first

        let FCall::ROpen { fd } = open(
            &cfg,
            &mut s,
            OpenFlags::RDWR | OpenFlags::CREAT,
            0o644,
            "x",
        )
        .await
        .unwrap() else {
            panic!("wrong reply");
        };
        let err = lseek(&mut s, fd, 9, 0).await.unwrap_err();
        assert_eq!(err.status(), status::EINVAL);
        let err = lseek(&mut s, fd, 0, -4).await.unwrap_err();
        assert_eq!(err.status(), status::EINVAL);
    }

    #[tokio::test]
    async fn stat_chmod_rename_unlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"12345").unwrap();
        let cfg = test_cfg(dir.path());
        let mut s = Session::for_tests();

        let FCall::RStat { stat: fstat } = stat(&cfg, &mut s, "f").await.unwrap() else {
            panic!("wrong reply");
        };
        assert_eq!(fstat.size, 5);
        assert!(fstat.mode & 0o100000 != 0); // regular file bit
        assert!(fstat.uid_name.is_empty() && fstat.gid_name.is_empty());

        chmod(&cfg, &mut s, 0o600, "f").await.unwrap();
        let attr = std::fs::metadata(dir.path().join("f")).unwrap();
        assert_eq!(attr.permissions().mode() & 0o777, 0o600);

        rename(&cfg, &mut s, "f", "g").await.unwrap();
        assert!(!dir.path().join("f").exists());
        assert!(dir.path().join("g").exists());

        unlink(&cfg, &mut s, "g").await.unwrap();
        assert!(!dir.path().join("g").exists());

        let err = stat(&cfg, &mut s, "g").await.unwrap_err();
        assert_eq!(err.status(), status::ENOENT);
    }

    #[tokio::test]
    async fn filesystem_totals_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());

        let FCall::RSize { kilobytes } = size(&cfg).await.unwrap() else {
            panic!("wrong reply");
        };
        assert!(kilobytes > 0);
        assert!(matches!(free(&cfg).await.unwrap(), FCall::RFree { .. }));
    }
}
