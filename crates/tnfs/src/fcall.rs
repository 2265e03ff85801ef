//! TNFS protocol data types and constants.
//!
//! # Protocol
//! TNFS 0x0102

use std::fs;
use std::os::unix::fs::MetadataExt;

use bitflags::bitflags;
use enum_primitive::*;

/// Protocol version reported in MOUNT replies (0x0102, little-endian on the
/// wire)
pub const PROTO_VERSION: u16 = 0x0102;

/// Default UDP/TCP port
pub const TNFSD_PORT: u16 = 16384;

/// Maximum size of a TNFS message, request or reply
pub const MAXMSGSZ: usize = 532;

/// Size of a request header: sid[2] seq[1] cmd[1]
///
/// A reply header carries one extra status byte.
pub const TNFS_HEADERSZ: usize = 4;

/// Maximum usable payload of a reply (header and status byte deducted)
pub const TNFS_MAX_PAYLOAD: usize = MAXMSGSZ - TNFS_HEADERSZ - 1;

/// Minimum retry interval handed to clients at MOUNT time, milliseconds
pub const MIN_RETRY_MS: u16 = 1000;

/// Longest path a client may send
pub const MAX_TNFSPATH: usize = 256;

/// Longest single filename supported
pub const MAX_FILENAME_LEN: usize = 256;

/// Longest server-side resolved path plus filename
pub const MAX_FILEPATH: usize = 384;

/// Longest server root directory path
pub const MAX_ROOT: usize = 128;

/// Maximum size of one READ or WRITE transfer
pub const MAX_IOSZ: usize = 512;

/// Fixed part of a READDIRX reply: count[1] dir_status[1] dirpos[2]
pub const READDIRX_HEADER_SIZE: usize = 4;

/// Per-entry overhead in a READDIRX reply:
/// flags[1] size[4] mtime[4] ctime[4] NUL[1]
pub const READDIRX_ENTRY_SIZE: usize = 14;

bitflags! {
    /// Directory enumeration options, OPENDIRX `diropt` byte
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct DirOpt: u8 {
        #[doc = "Do not group directories ahead of files"]
        const NO_FOLDERSFIRST   = 0x01;
        #[doc = "Include hidden entries"]
        const NO_SKIPHIDDEN     = 0x02;
        #[doc = "Include special (non-file, non-directory) entries"]
        const NO_SKIPSPECIAL    = 0x04;
        #[doc = "Apply the glob pattern to directories as well"]
        const DIR_PATTERN       = 0x08;
        #[doc = "Exclude directories entirely"]
        const NO_FOLDERS        = 0x10;
        #[doc = "Recursive flattened enumeration with handle reuse"]
        const TRAVERSE          = 0x20;
    }
}

bitflags! {
    /// Sort options, OPENDIRX `sortopt` byte
    ///
    /// With no bits set the listing is case-insensitive ascending by name.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SortOpt: u8 {
        #[doc = "Do not sort"]
        const NONE          = 0x01;
        #[doc = "Case-sensitive name comparison"]
        const CASE          = 0x02;
        #[doc = "Reverse the order"]
        const DESCENDING    = 0x04;
        #[doc = "Sort by modification time"]
        const MODIFIED      = 0x08;
        #[doc = "Sort by file size"]
        const SIZE          = 0x10;
    }
}

bitflags! {
    /// Per-entry flags in READDIRX results
    ///
    /// EntryFlags can be constructed from std::fs::FileType via From trait;
    /// HIDDEN is a naming convention and is set by the directory loader.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct EntryFlags: u8 {
        const DIR       = 0x01;
        const HIDDEN    = 0x02;
        const SPECIAL   = 0x04;
    }
}

bitflags! {
    /// Directory status byte in READDIRX replies
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct DirStatus: u8 {
        #[doc = "The cursor reached the end of the listing"]
        const EOF = 0x01;
    }
}

bitflags! {
    /// OPEN request flags (u16 little-endian on the wire)
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct OpenFlags: u16 {
        const RDONLY    = 0x0001;
        const WRONLY    = 0x0002;
        const RDWR      = 0x0003;
        const APPEND    = 0x0008;
        const CREAT     = 0x0100;
        const TRUNC     = 0x0200;
        const EXCL      = 0x0400;
    }
}

impl From<fs::FileType> for EntryFlags {
    fn from(typ: fs::FileType) -> Self {
        From::from(&typ)
    }
}

impl<'a> From<&'a fs::FileType> for EntryFlags {
    fn from(typ: &'a fs::FileType) -> Self {
        let mut flags = EntryFlags::empty();

        if typ.is_dir() {
            flags.insert(EntryFlags::DIR);
        } else if !typ.is_file() {
            flags.insert(EntryFlags::SPECIAL);
        }

        flags
    }
}

enum_from_primitive! {
    #[doc = "Command opcodes, legacy TNFS 0x0102 numbering"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Cmd {
        Mount       = 0x00,
        Umount      = 0x01,

        OpenDir     = 0x10,
        ReadDir     = 0x11,
        CloseDir    = 0x12,
        MkDir       = 0x13,
        RmDir       = 0x14,
        TellDir     = 0x15,
        SeekDir     = 0x16,
        OpenDirX    = 0x17,
        ReadDirX    = 0x18,

        Read        = 0x21,
        Write       = 0x22,
        Close       = 0x23,
        Stat        = 0x24,
        LSeek       = 0x25,
        Unlink      = 0x26,
        Chmod       = 0x27,
        Rename      = 0x28,
        Open        = 0x29,

        Size        = 0x30,
        Free        = 0x31,
    }
}

/// One directory entry as carried by READDIRX.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub flags: EntryFlags,
    /// Size in bytes, truncated to 32 bits
    pub size: u32,
    /// Modification time, seconds since the epoch
    pub mtime: u32,
    /// Creation time, seconds since the epoch
    pub ctime: u32,
    /// Entry name; relative path for traversal results
    pub name: String,
}

impl DirEntry {
    /// Bytes this entry occupies in a READDIRX reply
    pub fn wire_size(&self) -> usize {
        READDIRX_ENTRY_SIZE + self.name.len()
    }
}

/// File attributes as carried by a STAT reply.
///
/// FileStat can be constructed from `std::fs::Metadata` via From trait.
/// The trailing owner/group name strings are sent empty, as the reference
/// servers do.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileStat {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub uid_name: String,
    pub gid_name: String,
}

impl From<fs::Metadata> for FileStat {
    fn from(attr: fs::Metadata) -> Self {
        From::from(&attr)
    }
}

impl<'a> From<&'a fs::Metadata> for FileStat {
    fn from(attr: &'a fs::Metadata) -> Self {
        FileStat {
            mode: attr.mode() as u16,
            uid: attr.uid() as u16,
            gid: attr.gid() as u16,
            size: attr.size() as u32,
            atime: attr.atime() as u32,
            mtime: attr.mtime() as u32,
            ctime: attr.ctime() as u32,
            uid_name: String::new(),
            gid_name: String::new(),
        }
    }
}

/// Data type used in READ replies and WRITE requests
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

/// Request header; replies echo it back with a status byte appended
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Header {
    /// Session id, zero only in MOUNT requests
    pub sid: u16,
    /// Per-session sequence number; a repeat marks a retransmit
    pub seq: u8,
}

/// A data type encapsulating the various TNFS messages
///
/// `T` variants are requests, `R` variants are success replies. Error
/// replies carry no body and are formed directly by
/// [`serialize::error_frame`](crate::serialize::error_frame).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    TMount {
        version: u16,
        location: String,
        user: String,
        password: String,
    },
    RMount {
        version: u16,
        retry_ms: u16,
    },
    TUmount,
    RUmount,

    TOpenDir {
        path: String,
    },
    ROpenDir {
        handle: u8,
    },
    TReadDir {
        handle: u8,
    },
    RReadDir {
        name: String,
    },
    TCloseDir {
        handle: u8,
    },
    RCloseDir,
    TMkDir {
        path: String,
    },
    RMkDir,
    TRmDir {
        path: String,
    },
    RRmDir,
    TTellDir {
        handle: u8,
    },
    RTellDir {
        pos: u32,
    },
    TSeekDir {
        handle: u8,
        pos: u32,
    },
    RSeekDir,
    TOpenDirX {
        diropt: DirOpt,
        sortopt: SortOpt,
        maxresults: u16,
        pattern: String,
        path: String,
    },
    ROpenDirX {
        handle: u8,
        count: u16,
    },
    TReadDirX {
        handle: u8,
        count: u8,
    },
    RReadDirX {
        dir_status: DirStatus,
        dirpos: u16,
        entries: Vec<DirEntry>,
    },

    TOpen {
        flags: OpenFlags,
        mode: u16,
        path: String,
    },
    ROpen {
        fd: u8,
    },
    TRead {
        fd: u8,
        count: u16,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fd: u8,
        data: Data,
    },
    RWrite {
        count: u16,
    },
    TClose {
        fd: u8,
    },
    RClose,
    TStat {
        path: String,
    },
    RStat {
        stat: FileStat,
    },
    TLSeek {
        fd: u8,
        whence: u8,
        offset: i32,
    },
    RLSeek {
        pos: u32,
    },
    TUnlink {
        path: String,
    },
    RUnlink,
    TChmod {
        mode: u16,
        path: String,
    },
    RChmod,
    TRename {
        from: String,
        to: String,
    },
    RRename,

    TSize,
    RSize {
        kilobytes: u32,
    },
    TFree,
    RFree {
        kilobytes: u32,
    },
}

impl FCall {
    /// If the message is a reply
    pub fn is_r(&self) -> bool {
        use crate::FCall::*;

        matches!(
            *self,
            RMount { .. }
                | RUmount
                | ROpenDir { .. }
                | RReadDir { .. }
                | RCloseDir
                | RMkDir
                | RRmDir
                | RTellDir { .. }
                | RSeekDir
                | ROpenDirX { .. }
                | RReadDirX { .. }
                | ROpen { .. }
                | RRead { .. }
                | RWrite { .. }
                | RClose
                | RStat { .. }
                | RLSeek { .. }
                | RUnlink
                | RChmod
                | RRename
                | RSize { .. }
                | RFree { .. }
        )
    }
}

impl<'a> From<&'a FCall> for Cmd {
    fn from(fcall: &'a FCall) -> Cmd {
        match *fcall {
            FCall::TMount { .. } | FCall::RMount { .. } => Cmd::Mount,
            FCall::TUmount | FCall::RUmount => Cmd::Umount,
            FCall::TOpenDir { .. } | FCall::ROpenDir { .. } => Cmd::OpenDir,
            FCall::TReadDir { .. } | FCall::RReadDir { .. } => Cmd::ReadDir,
            FCall::TCloseDir { .. } | FCall::RCloseDir => Cmd::CloseDir,
            FCall::TMkDir { .. } | FCall::RMkDir => Cmd::MkDir,
            FCall::TRmDir { .. } | FCall::RRmDir => Cmd::RmDir,
            FCall::TTellDir { .. } | FCall::RTellDir { .. } => Cmd::TellDir,
            FCall::TSeekDir { .. } | FCall::RSeekDir => Cmd::SeekDir,
            FCall::TOpenDirX { .. } | FCall::ROpenDirX { .. } => Cmd::OpenDirX,
            FCall::TReadDirX { .. } | FCall::RReadDirX { .. } => Cmd::ReadDirX,
            FCall::TOpen { .. } | FCall::ROpen { .. } => Cmd::Open,
            FCall::TRead { .. } | FCall::RRead { .. } => Cmd::Read,
            FCall::TWrite { .. } | FCall::RWrite { .. } => Cmd::Write,
            FCall::TClose { .. } | FCall::RClose => Cmd::Close,
            FCall::TStat { .. } | FCall::RStat { .. } => Cmd::Stat,
            FCall::TLSeek { .. } | FCall::RLSeek { .. } => Cmd::LSeek,
            FCall::TUnlink { .. } | FCall::RUnlink => Cmd::Unlink,
            FCall::TChmod { .. } | FCall::RChmod => Cmd::Chmod,
            FCall::TRename { .. } | FCall::RRename => Cmd::Rename,
            FCall::TSize | FCall::RSize { .. } => Cmd::Size,
            FCall::TFree | FCall::RFree { .. } => Cmd::Free,
        }
    }
}

/// Envelope for TNFS messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Session id and sequence number echoed between request and reply
    pub hdr: Header,
    /// Message body encapsulating the various TNFS messages
    pub body: FCall,
}
