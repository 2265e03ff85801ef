//! Serialize/deserialize TNFS messages into/from binary.
//!
//! All integers are little-endian. Strings are NUL-terminated with no
//! length prefix; a missing terminator is a decode error. Requests are
//! decoded from a [`Cursor`] over the datagram payload because several
//! bodies (MOUNT credentials, the OPENDIRX pattern) are delimited only by
//! the end of the datagram.

use crate::{error::status, fcall::*, io_err};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Cursor, Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for i32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.as_bytes().contains(&0) {
            return Err(io_err!(InvalidInput, "string contains NUL"));
        }
        w.write_all(self.as_bytes())?;
        w.write_u8(0)?;
        Ok(self.len() + 1)
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u16).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl Encodable for DirEntry {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.flags.bits()
            << &self.size
            << &self.mtime
            << &self.ctime
            << &self.name
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for FileStat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.mode
            << &self.uid
            << &self.gid
            << &self.size
            << &self.atime
            << &self.mtime
            << &self.ctime
            << &self.uid_name
            << &self.gid_name
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let cmd = Cmd::from(&self.body);
        let buf = Encoder::new(w) << &self.hdr.sid << &self.hdr.seq << &(cmd as u8);

        // Success replies carry the status byte; error replies are formed
        // by error_frame instead.
        let buf = if self.body.is_r() {
            buf << &status::SUCCESS
        } else {
            buf
        };

        let buf = match self.body {
            TMount {
                ref version,
                ref location,
                ref user,
                ref password,
            } => buf << version << location << user << password,
            RMount {
                ref version,
                ref retry_ms,
            } => buf << version << retry_ms,
            TUmount | RUmount => buf,

            TOpenDir { ref path } => buf << path,
            ROpenDir { ref handle } => buf << handle,
            TReadDir { ref handle } => buf << handle,
            RReadDir { ref name } => buf << name,
            TCloseDir { ref handle } => buf << handle,
            RCloseDir => buf,
            TMkDir { ref path } => buf << path,
            RMkDir => buf,
            TRmDir { ref path } => buf << path,
            RRmDir => buf,
            TTellDir { ref handle } => buf << handle,
            RTellDir { ref pos } => buf << pos,
            TSeekDir {
                ref handle,
                ref pos,
            } => buf << handle << pos,
            RSeekDir => buf,
            TOpenDirX {
                ref diropt,
                ref sortopt,
                ref maxresults,
                ref pattern,
                ref path,
            } => buf << &diropt.bits() << &sortopt.bits() << maxresults << pattern << path,
            ROpenDirX {
                ref handle,
                ref count,
            } => buf << handle << count,
            TReadDirX {
                ref handle,
                ref count,
            } => buf << handle << count,
            RReadDirX {
                ref dir_status,
                ref dirpos,
                ref entries,
            } => entries.iter().fold(
                buf << &(entries.len() as u8) << &dir_status.bits() << dirpos,
                |acc, e| acc << e,
            ),

            TOpen {
                ref flags,
                ref mode,
                ref path,
            } => buf << &flags.bits() << mode << path,
            ROpen { ref fd } => buf << fd,
            TRead { ref fd, ref count } => buf << fd << count,
            RRead { ref data } => buf << data,
            TWrite { ref fd, ref data } => buf << fd << data,
            RWrite { ref count } => buf << count,
            TClose { ref fd } => buf << fd,
            RClose => buf,
            TStat { ref path } => buf << path,
            RStat { ref stat } => buf << stat,
            TLSeek {
                ref fd,
                ref whence,
                ref offset,
            } => buf << fd << whence << offset,
            RLSeek { ref pos } => buf << pos,
            TUnlink { ref path } => buf << path,
            RUnlink => buf,
            TChmod { ref mode, ref path } => buf << mode << path,
            RChmod => buf,
            TRename { ref from, ref to } => buf << from << to,
            RRename => buf,

            TSize | TFree => buf,
            RSize { ref kilobytes } => buf << kilobytes,
            RFree { ref kilobytes } => buf << kilobytes,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for i32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i32::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut bytes = Vec::new();
        loop {
            match r.read_u8() {
                Ok(0) => break,
                Ok(b) => bytes.push(b),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(io_err!(UnexpectedEof, "string missing NUL terminator"));
                }
                Err(e) => return Err(e),
            }
        }
        String::from_utf8(bytes).map_err(|_| io_err!(InvalidData, "invalid UTF-8 sequence"))
    }
}

/// Parse the 4 byte request header.
///
/// Returns the raw command byte alongside the header so the dispatcher can
/// echo unknown opcodes back in an ENOSYS reply.
pub fn read_header(buf: &[u8]) -> Result<(Header, u8)> {
    let mut cur = Cursor::new(buf);
    let sid: u16 = decode!(cur);
    let seq: u8 = decode!(cur);
    let cmd: u8 = decode!(cur);
    Ok((Header { sid, seq }, cmd))
}

fn expect_consumed(cur: &Cursor<&[u8]>) -> Result<()> {
    if cur.position() as usize != cur.get_ref().len() {
        return Err(io_err!(InvalidData, "trailing bytes after message body"));
    }
    Ok(())
}

fn remaining(cur: &Cursor<&[u8]>) -> usize {
    cur.get_ref().len() - cur.position() as usize
}

/// Decode a request body.
///
/// `payload` is the datagram with the 4 byte header stripped. Bodies must
/// consume the payload exactly; WRITE is the one exception, where the
/// length field governs and trailing bytes are ignored as the reference
/// servers do.
pub fn read_request_body(cmd: Cmd, payload: &[u8]) -> Result<FCall> {
    let mut cur = Cursor::new(payload);

    let body = match cmd {
        Cmd::Mount => {
            let version: u16 = decode!(cur);
            let location: String = decode!(cur);
            // Old clients omit the credential strings entirely.
            let user = if remaining(&cur) > 0 {
                decode!(cur)
            } else {
                String::new()
            };
            let password = if remaining(&cur) > 0 {
                decode!(cur)
            } else {
                String::new()
            };
            FCall::TMount {
                version,
                location,
                user,
                password,
            }
        }
        Cmd::Umount => FCall::TUmount,

        Cmd::OpenDir => FCall::TOpenDir { path: decode!(cur) },
        Cmd::ReadDir => FCall::TReadDir {
            handle: decode!(cur),
        },
        Cmd::CloseDir => FCall::TCloseDir {
            handle: decode!(cur),
        },
        Cmd::MkDir => FCall::TMkDir { path: decode!(cur) },
        Cmd::RmDir => FCall::TRmDir { path: decode!(cur) },
        Cmd::TellDir => FCall::TTellDir {
            handle: decode!(cur),
        },
        Cmd::SeekDir => FCall::TSeekDir {
            handle: decode!(cur),
            pos: decode!(cur),
        },
        Cmd::OpenDirX => {
            let diropt = decode!(DirOpt, cur);
            let sortopt = decode!(SortOpt, cur);
            let maxresults: u16 = decode!(cur);
            let first: String = decode!(cur);
            // A single string after the options is the directory path; the
            // pattern is only present when two strings follow.
            if remaining(&cur) == 0 {
                FCall::TOpenDirX {
                    diropt,
                    sortopt,
                    maxresults,
                    pattern: String::new(),
                    path: first,
                }
            } else {
                FCall::TOpenDirX {
                    diropt,
                    sortopt,
                    maxresults,
                    pattern: first,
                    path: decode!(cur),
                }
            }
        }
        Cmd::ReadDirX => FCall::TReadDirX {
            handle: decode!(cur),
            count: decode!(cur),
        },

        Cmd::Open => FCall::TOpen {
            flags: decode!(OpenFlags, cur),
            mode: decode!(cur),
            path: decode!(cur),
        },
        Cmd::Read => FCall::TRead {
            fd: decode!(cur),
            count: decode!(cur),
        },
        Cmd::Write => {
            let fd: u8 = decode!(cur);
            let len: u16 = decode!(cur);
            if remaining(&cur) < len as usize {
                return Err(io_err!(UnexpectedEof, "write body shorter than length"));
            }
            let mut data = vec![0; len as usize];
            cur.read_exact(&mut data)?;
            return Ok(FCall::TWrite {
                fd,
                data: Data(data),
            });
        }
        Cmd::Close => FCall::TClose { fd: decode!(cur) },
        Cmd::Stat => FCall::TStat { path: decode!(cur) },
        Cmd::LSeek => FCall::TLSeek {
            fd: decode!(cur),
            whence: decode!(cur),
            offset: decode!(cur),
        },
        Cmd::Unlink => FCall::TUnlink { path: decode!(cur) },
        Cmd::Chmod => FCall::TChmod {
            mode: decode!(cur),
            path: decode!(cur),
        },
        Cmd::Rename => FCall::TRename {
            from: decode!(cur),
            to: decode!(cur),
        },

        Cmd::Size => FCall::TSize,
        Cmd::Free => FCall::TFree,
    };

    expect_consumed(&cur)?;
    Ok(body)
}

/// Look up a command opcode.
pub fn cmd_from_u8(cmd: u8) -> Option<Cmd> {
    Cmd::from_u8(cmd)
}

/// Encode a message into a fresh buffer, enforcing the datagram bound.
pub fn frame(msg: &Msg) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    msg.encode(&mut buf)?;
    if buf.len() > MAXMSGSZ {
        return Err(io_err!(InvalidInput, "message exceeds MAXMSGSZ"));
    }
    Ok(buf)
}

/// Encode an error reply: header, command, nonzero status, no body.
///
/// A failed MOUNT additionally reports the server protocol version so the
/// client can tell what it is talking to.
pub fn error_frame(hdr: &Header, cmd: u8, status_byte: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TNFS_HEADERSZ + 3);
    // Infallible for Vec writers.
    let _ = Encoder::new(&mut buf) << &hdr.sid << &hdr.seq << &cmd << &status_byte;
    if cmd == Cmd::Mount as u8 && status_byte != status::SUCCESS {
        let _ = Encoder::new(&mut buf) << &PROTO_VERSION;
    }
    buf
}

#[test]
fn header_roundtrip() {
    let msg = Msg {
        hdr: Header { sid: 0xbeef, seq: 7 },
        body: FCall::TTellDir { handle: 3 },
    };
    let buf = frame(&msg).unwrap();
    assert_eq!(buf, vec![0xef, 0xbe, 7, 0x15, 3]);

    let (hdr, cmd) = read_header(&buf).unwrap();
    assert_eq!(hdr, msg.hdr);
    assert_eq!(cmd_from_u8(cmd), Some(Cmd::TellDir));
    assert_eq!(
        read_request_body(Cmd::TellDir, &buf[TNFS_HEADERSZ..]).unwrap(),
        msg.body
    );
}

#[test]
fn mount_reply_bytes() {
    let msg = Msg {
        hdr: Header { sid: 0x0001, seq: 0 },
        body: FCall::RMount {
            version: PROTO_VERSION,
            retry_ms: MIN_RETRY_MS,
        },
    };
    // sid seq cmd status version retry: retry 1000ms is 0xE8 0x03.
    assert_eq!(
        frame(&msg).unwrap(),
        vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01, 0xe8, 0x03]
    );
}

#[test]
fn mount_request_credentials_optional() {
    // version + mountpoint only, no user/password strings at all.
    let payload = [0x02, 0x01, b'/', 0x00];
    let body = read_request_body(Cmd::Mount, &payload).unwrap();
    assert_eq!(
        body,
        FCall::TMount {
            version: 0x0102,
            location: "/".to_owned(),
            user: String::new(),
            password: String::new(),
        }
    );
}

#[test]
fn string_missing_nul_is_rejected() {
    let payload = [0x02, 0x01, b'g', b'a', b'm', b'e', b's'];
    assert!(read_request_body(Cmd::Mount, &payload).is_err());
    assert!(read_request_body(Cmd::OpenDir, b"nodir").is_err());
}

#[test]
fn opendirx_single_string_is_the_path() {
    let mut payload = vec![0x00, 0x00, 0x10, 0x00];
    payload.extend_from_slice(b"games\0");
    let body = read_request_body(Cmd::OpenDirX, &payload).unwrap();
    assert_eq!(
        body,
        FCall::TOpenDirX {
            diropt: DirOpt::empty(),
            sortopt: SortOpt::empty(),
            maxresults: 16,
            pattern: String::new(),
            path: "games".to_owned(),
        }
    );
}

#[test]
fn opendirx_two_strings_are_pattern_then_path() {
    let mut payload = vec![0x08, 0x02, 0x00, 0x00];
    payload.extend_from_slice(b"*.sna\0games\0");
    let body = read_request_body(Cmd::OpenDirX, &payload).unwrap();
    assert_eq!(
        body,
        FCall::TOpenDirX {
            diropt: DirOpt::DIR_PATTERN,
            sortopt: SortOpt::CASE,
            maxresults: 0,
            pattern: "*.sna".to_owned(),
            path: "games".to_owned(),
        }
    );
}

#[test]
fn fixed_size_bodies_reject_trailing_bytes() {
    assert!(read_request_body(Cmd::ReadDir, &[1]).is_ok());
    assert!(read_request_body(Cmd::ReadDir, &[1, 2]).is_err());
    assert!(read_request_body(Cmd::SeekDir, &[1, 0, 0, 0, 0]).is_ok());
    assert!(read_request_body(Cmd::SeekDir, &[1, 0, 0, 0]).is_err());
}

#[test]
fn write_length_field_governs() {
    let payload = [2, 3, 0, b'a', b'b', b'c', b'x'];
    let body = read_request_body(Cmd::Write, &payload).unwrap();
    assert_eq!(
        body,
        FCall::TWrite {
            fd: 2,
            data: Data(b"abc".to_vec()),
        }
    );

    let short = [2, 4, 0, b'a', b'b'];
    assert!(read_request_body(Cmd::Write, &short).is_err());
}

#[test]
fn readdirx_reply_encoding() {
    let msg = Msg {
        hdr: Header { sid: 0x0001, seq: 2 },
        body: FCall::RReadDirX {
            dir_status: DirStatus::EOF,
            dirpos: 4,
            entries: vec![DirEntry {
                flags: EntryFlags::DIR,
                size: 0,
                mtime: 1,
                ctime: 2,
                name: "sub".to_owned(),
            }],
        },
    };
    let buf = frame(&msg).unwrap();
    assert_eq!(
        buf,
        vec![
            0x01, 0x00, 2, 0x18, 0x00, // header + status
            1, 0x01, 4, 0, // count, dir_status, dirpos
            0x01, 0, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, b's', b'u', b'b', 0,
        ]
    );
}

#[test]
fn oversized_message_is_rejected() {
    let msg = Msg {
        hdr: Header { sid: 1, seq: 0 },
        body: FCall::RRead {
            data: Data(vec![0; MAXMSGSZ]),
        },
    };
    assert!(frame(&msg).is_err());
}

#[test]
fn error_frame_echoes_mount_version() {
    let hdr = Header { sid: 0, seq: 9 };
    let buf = error_frame(&hdr, Cmd::Mount as u8, status::ENOENT);
    assert_eq!(buf, vec![0, 0, 9, 0x00, 0x02, 0x02, 0x01]);

    let buf = error_frame(&hdr, Cmd::Open as u8, status::EACCES);
    assert_eq!(buf, vec![0, 0, 9, 0x29, 0x08]);
}
