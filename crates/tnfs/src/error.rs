//! Error type and the TNFS status byte table.

use std::{fmt, io};

use nix::errno::Errno;

/// TNFS status bytes carried in the reply header.
///
/// The numbering is fixed by the 0x0102 protocol; the names mirror the
/// POSIX errno each value was derived from.
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const EPERM: u8 = 0x01;
    pub const ENOENT: u8 = 0x02;
    pub const EIO: u8 = 0x03;
    pub const ENXIO: u8 = 0x04;
    pub const EBADF: u8 = 0x05;
    pub const EAGAIN: u8 = 0x06;
    pub const ENOMEM: u8 = 0x07;
    pub const EACCES: u8 = 0x08;
    pub const EBUSY: u8 = 0x09;
    pub const EEXIST: u8 = 0x0a;
    pub const ENOTDIR: u8 = 0x0b;
    pub const EISDIR: u8 = 0x0c;
    pub const EINVAL: u8 = 0x0d;
    pub const ENFILE: u8 = 0x0e;
    pub const EMFILE: u8 = 0x0f;
    pub const EFBIG: u8 = 0x10;
    pub const ENOSPC: u8 = 0x11;
    pub const ESPIPE: u8 = 0x12;
    pub const EROFS: u8 = 0x13;
    pub const ENAMETOOLONG: u8 = 0x14;
    pub const ENOSYS: u8 = 0x15;
    pub const ENOTEMPTY: u8 = 0x16;
    pub const ELOOP: u8 = 0x17;
    pub const ENODATA: u8 = 0x18;
    pub const ENOSTR: u8 = 0x19;
    pub const EPROTO: u8 = 0x1a;
    pub const EBADFD: u8 = 0x1b;
    pub const EUSERS: u8 = 0x1c;
    pub const ENOBUFS: u8 = 0x1d;
    pub const EALREADY: u8 = 0x1e;
    pub const ESTALE: u8 = 0x1f;
    /// End of file or directory. Distinct from an error.
    pub const EOF: u8 = 0x21;
    /// The session id in the request does not name a live session.
    pub const EBADSESSION: u8 = 0xff;
}

/// TNFS server error.
///
/// `No` carries a status byte from [`status`] and is sent to the client
/// verbatim. `Io` wraps a host error; it is mapped onto the status table
/// when the reply is formed.
#[derive(Debug)]
pub enum Error {
    No(u8),
    Io(io::Error),
}

impl Error {
    /// The status byte this error puts in the reply header.
    pub fn status(&self) -> u8 {
        match *self {
            Error::No(s) => s,
            Error::Io(ref e) => host_status(e),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::No(s) => write!(f, "{}", string(s)),
            Error::Io(ref e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::No(_) => None,
            Error::Io(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(e as i32))
    }
}

/// Map a host error to a TNFS status byte.
///
/// Errors without an entry in the protocol table degrade to `EIO`.
pub fn host_status(err: &io::Error) -> u8 {
    if let Some(raw) = err.raw_os_error() {
        return match Errno::from_raw(raw) {
            Errno::EPERM => status::EPERM,
            Errno::ENOENT => status::ENOENT,
            Errno::EIO => status::EIO,
            Errno::ENXIO => status::ENXIO,
            Errno::EBADF => status::EBADF,
            Errno::EAGAIN => status::EAGAIN,
            Errno::ENOMEM => status::ENOMEM,
            Errno::EACCES => status::EACCES,
            Errno::EBUSY => status::EBUSY,
            Errno::EEXIST => status::EEXIST,
            Errno::ENOTDIR => status::ENOTDIR,
            Errno::EISDIR => status::EISDIR,
            Errno::EINVAL => status::EINVAL,
            Errno::ENFILE => status::ENFILE,
            Errno::EMFILE => status::EMFILE,
            Errno::EFBIG => status::EFBIG,
            Errno::ENOSPC => status::ENOSPC,
            Errno::ESPIPE => status::ESPIPE,
            Errno::EROFS => status::EROFS,
            Errno::ENAMETOOLONG => status::ENAMETOOLONG,
            Errno::ENOSYS => status::ENOSYS,
            Errno::ENOTEMPTY => status::ENOTEMPTY,
            Errno::ELOOP => status::ELOOP,
            Errno::ESTALE => status::ESTALE,
            _ => status::EIO,
        };
    }

    // Synthetic errors (decoder, in-process checks) carry no raw errno.
    match err.kind() {
        io::ErrorKind::NotFound => status::ENOENT,
        io::ErrorKind::PermissionDenied => status::EACCES,
        io::ErrorKind::AlreadyExists => status::EEXIST,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => status::EINVAL,
        io::ErrorKind::UnexpectedEof => status::EINVAL,
        _ => status::EIO,
    }
}

/// Human-readable name for a status byte, for logging.
pub fn string(s: u8) -> &'static str {
    match s {
        status::SUCCESS => "success",
        status::EPERM => "EPERM",
        status::ENOENT => "ENOENT",
        status::EIO => "EIO",
        status::ENXIO => "ENXIO",
        status::EBADF => "EBADF",
        status::EAGAIN => "EAGAIN",
        status::ENOMEM => "ENOMEM",
        status::EACCES => "EACCES",
        status::EBUSY => "EBUSY",
        status::EEXIST => "EEXIST",
        status::ENOTDIR => "ENOTDIR",
        status::EISDIR => "EISDIR",
        status::EINVAL => "EINVAL",
        status::ENFILE => "ENFILE",
        status::EMFILE => "EMFILE",
        status::EFBIG => "EFBIG",
        status::ENOSPC => "ENOSPC",
        status::ESPIPE => "ESPIPE",
        status::EROFS => "EROFS",
        status::ENAMETOOLONG => "ENAMETOOLONG",
        status::ENOSYS => "ENOSYS",
        status::ENOTEMPTY => "ENOTEMPTY",
        status::ELOOP => "ELOOP",
        status::ENODATA => "ENODATA",
        status::ENOSTR => "ENOSTR",
        status::EPROTO => "EPROTO",
        status::EBADFD => "EBADFD",
        status::EUSERS => "EUSERS",
        status::ENOBUFS => "ENOBUFS",
        status::EALREADY => "EALREADY",
        status::ESTALE => "ESTALE",
        status::EOF => "EOF",
        status::EBADSESSION => "EBADSESSION",
        _ => "unknown",
    }
}

#[test]
fn host_errno_maps_to_table() {
    let e = io::Error::from_raw_os_error(Errno::ENOENT as i32);
    assert_eq!(host_status(&e), status::ENOENT);

    let e = io::Error::from_raw_os_error(Errno::ENOTEMPTY as i32);
    assert_eq!(host_status(&e), status::ENOTEMPTY);
}

#[test]
fn unmapped_host_errno_degrades_to_eio() {
    let e = io::Error::from_raw_os_error(Errno::EDOM as i32);
    assert_eq!(host_status(&e), status::EIO);
}

#[test]
fn synthetic_errors_map_by_kind() {
    let e = io::Error::new(io::ErrorKind::UnexpectedEof, "truncated");
    assert_eq!(host_status(&e), status::EINVAL);

    let e = io::Error::other("anything");
    assert_eq!(host_status(&e), status::EIO);
}
