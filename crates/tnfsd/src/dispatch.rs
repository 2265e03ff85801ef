//! Protocol dispatcher.
//!
//! One raw frame in, at most one reply out. The dispatcher validates the
//! header, locates the session, answers retransmits from the per-session
//! reply cache, and routes everything else to the command handlers. Every
//! reply it produces is cached on the session before it is returned, so a
//! repeated sequence number yields the exact same bytes without
//! re-executing anything.

use std::net::SocketAddr;
use std::time::Instant;

use log::{debug, info, warn};
use tnfs::errstr;
use tnfs::fcall::*;
use tnfs::serialize::{cmd_from_u8, error_frame, frame, read_header, read_request_body};
use tnfs::{error::status, Error, Result};

use crate::directory;
use crate::file;
use crate::server::ServerConfig;
use crate::session::{self, ConnId, Session, SessionTable};

/// Where a frame came from; the reply goes back the same way.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Udp(SocketAddr),
    Tcp(ConnId, SocketAddr),
}

impl Source {
    pub fn addr(&self) -> SocketAddr {
        match *self {
            Source::Udp(a) | Source::Tcp(_, a) => a,
        }
    }

    fn conn(&self) -> Option<ConnId> {
        match *self {
            Source::Udp(_) => None,
            Source::Tcp(c, _) => Some(c),
        }
    }
}

// A malformed body on a handle-carrying command is a bad handle; anywhere
// else it is a malformed argument.
fn decode_error_status(cmd: Cmd) -> u8 {
    match cmd {
        Cmd::ReadDir | Cmd::CloseDir | Cmd::TellDir | Cmd::SeekDir | Cmd::ReadDirX => {
            status::EBADF
        }
        _ => status::EINVAL,
    }
}

/// Handle one frame and produce the reply bytes, if any.
///
/// Frames that are too short, too long, or that fail the source check are
/// dropped without a reply; the client recovers by retransmitting.
pub async fn handle_frame(
    cfg: &ServerConfig,
    sessions: &mut SessionTable,
    source: Source,
    buf: &[u8],
    now: Instant,
) -> Option<Vec<u8>> {
    if buf.len() < TNFS_HEADERSZ || buf.len() > MAXMSGSZ {
        debug!(
            "dropping frame of {} bytes from {}",
            buf.len(),
            source.addr()
        );
        return None;
    }

    let (hdr, cmd_byte) = read_header(buf).ok()?;
    let payload = &buf[TNFS_HEADERSZ..];

    let Some(cmd) = cmd_from_u8(cmd_byte) else {
        debug!("unknown command 0x{:02x} from {}", cmd_byte, source.addr());
        return Some(error_frame(&hdr, cmd_byte, status::ENOSYS));
    };

    if cmd == Cmd::Mount {
        return Some(handle_mount(cfg, sessions, source, &hdr, payload, now).await);
    }

    let Some(s) = sessions.get_mut(hdr.sid) else {
        debug!(
            "no session 0x{:04x} for {:?} from {}",
            hdr.sid,
            cmd,
            source.addr()
        );
        return Some(error_frame(&hdr, cmd_byte, status::EBADSESSION));
    };

    // The request must come from where the session lives; anything else is
    // discarded without a reply.
    match source {
        Source::Udp(addr) => {
            if s.cli_conn.is_some() || s.client.ip() != addr.ip() {
                debug!("source mismatch for session 0x{:04x}", hdr.sid);
                return None;
            }
            // The client's source port may move between datagrams; replies
            // follow the request.
            s.client = addr;
        }
        Source::Tcp(conn, _) => {
            if s.cli_conn != Some(conn) {
                debug!("connection mismatch for session 0x{:04x}", hdr.sid);
                return None;
            }
        }
    }

    if let Some(cached) = s.cached_reply(hdr.seq) {
        debug!(
            "retransmit of seq {} for session 0x{:04x}",
            hdr.seq, hdr.sid
        );
        return Some(cached.to_vec());
    }

    s.touch(now);

    let body = match read_request_body(cmd, payload) {
        Ok(body) => body,
        Err(e) => {
            debug!("bad {:?} body from {}: {}", cmd, source.addr(), e);
            let reply = error_frame(&hdr, cmd_byte, decode_error_status(cmd));
            s.cache_reply(hdr.seq, &reply);
            return Some(reply);
        }
    };

    // UMOUNT frees the session after the reply is formed; there is nothing
    // left to cache it on.
    if matches!(body, FCall::TUmount) {
        let reply = frame(&Msg {
            hdr,
            body: FCall::RUmount,
        })
        .ok()?;
        sessions.free(hdr.sid);
        info!("session 0x{:04x} unmounted", hdr.sid);
        return Some(reply);
    }

    let reply = match route(cfg, s, body, now).await {
        Ok(rbody) => match frame(&Msg { hdr, body: rbody }) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode {:?} reply: {}", cmd, e);
                error_frame(&hdr, cmd_byte, status::EIO)
            }
        },
        Err(e) => {
            debug!("{:?} from {}: {}", cmd, source.addr(), errstr(e.status()));
            error_frame(&hdr, cmd_byte, e.status())
        }
    };

    s.cache_reply(hdr.seq, &reply);
    Some(reply)
}

async fn handle_mount(
    cfg: &ServerConfig,
    sessions: &mut SessionTable,
    source: Source,
    hdr: &Header,
    payload: &[u8],
    now: Instant,
) -> Vec<u8> {
    // A retransmitted MOUNT is answered from the existing session's cache
    // instead of allocating a twin.
    if let Some(existing) = sessions.find_by_addr(source.addr()) {
        if let Some(cached) = existing.cached_reply(hdr.seq) {
            debug!("mount retransmit from {}", source.addr());
            return cached.to_vec();
        }
    }

    let Ok(FCall::TMount {
        version,
        location,
        user,
        ..
    }) = read_request_body(Cmd::Mount, payload)
    else {
        return error_frame(hdr, Cmd::Mount as u8, status::EINVAL);
    };

    match session::mount(
        cfg,
        sessions,
        source.addr(),
        source.conn(),
        hdr,
        version,
        &location,
        &user,
        now,
    )
    .await
    {
        Ok((sid, rbody)) => {
            // The reply header carries the newly assigned sid.
            let msg = Msg {
                hdr: Header { sid, seq: hdr.seq },
                body: rbody,
            };
            match frame(&msg) {
                Ok(bytes) => {
                    if let Some(s) = sessions.get_mut(sid) {
                        s.cache_reply(hdr.seq, &bytes);
                    }
                    bytes
                }
                Err(e) => {
                    warn!("failed to encode mount reply: {}", e);
                    error_frame(hdr, Cmd::Mount as u8, status::EIO)
                }
            }
        }
        Err(e) => {
            debug!("mount from {}: {}", source.addr(), errstr(e.status()));
            error_frame(hdr, Cmd::Mount as u8, e.status())
        }
    }
}

async fn route(
    cfg: &ServerConfig,
    s: &mut Session,
    body: FCall,
    now: Instant,
) -> Result<FCall> {
    use FCall::*;

    match body {
        TOpenDir { ref path } => directory::opendir(cfg, s, path, now).await,
        TReadDir { handle } => directory::readdir(s, handle),
        TCloseDir { handle } => directory::closedir(s, handle),
        TMkDir { ref path } => directory::mkdir(cfg, s, path).await,
        TRmDir { ref path } => directory::rmdir(cfg, s, path).await,
        TTellDir { handle } => directory::telldir(s, handle),
        TSeekDir { handle, pos } => directory::seekdir(s, handle, pos),
        TOpenDirX {
            diropt,
            sortopt,
            maxresults,
            ref pattern,
            ref path,
        } => {
            directory::opendirx(cfg, s, diropt, sortopt, maxresults, pattern, path, now).await
        }
        TReadDirX { handle, count } => directory::readdirx(s, handle, count),

        TOpen {
            flags,
            mode,
            ref path,
        } => file::open(cfg, s, flags, mode, path).await,
        TRead { fd, count } => file::read(s, fd, count).await,
        TWrite { fd, ref data } => file::write(s, fd, data).await,
        TClose { fd } => file::close(s, fd),
        TStat { ref path } => file::stat(cfg, s, path).await,
        TLSeek { fd, whence, offset } => file::lseek(s, fd, whence, offset).await,
        TUnlink { ref path } => file::unlink(cfg, s, path).await,
        TChmod { mode, ref path } => file::chmod(cfg, s, mode, path).await,
        TRename { ref from, ref to } => file::rename(cfg, s, from, to).await,

        TSize => file::size(cfg).await,
        TFree => file::free(cfg).await,

        // MOUNT and UMOUNT are handled before routing, and the request
        // decoder never yields reply bodies.
        _ => Err(Error::No(status::ENOSYS)),
    }
}
