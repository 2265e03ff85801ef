//! Session manager: allocation, lookup, timeout sweeping, MOUNT.
//!
//! A session is created by MOUNT and destroyed by UMOUNT, the inactivity
//! sweep, or the loss of its owning TCP connection. While live it is
//! reachable both by its 16-bit sid and by its client address, and it owns
//! every file and directory handle the client holds.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use log::{debug, info};
use tnfs::fcall::*;
use tnfs::{error::status, Error, Result};
use tokio::fs;

use crate::config::{MAX_DHND_PER_CONN, MAX_FD_PER_CONN, MAX_SESSIONS, MAX_SESSIONS_PER_IP, SESSION_TIMEOUT};
use crate::directory::{self, DirHandle};
use crate::server::ServerConfig;

/// Identifier of a TCP connection in the server's connection table.
pub type ConnId = u64;

/// An open file slot; the slot index is the fd the client sees.
pub struct FileHandle {
    pub file: fs::File,
    pub path: PathBuf,
}

pub struct Session {
    pub sid: u16,
    pub client: SocketAddr,
    /// Owning TCP connection; `None` for UDP sessions
    pub cli_conn: Option<ConnId>,
    /// Subpath under the export root selected at MOUNT, may be empty
    pub root: String,
    pub last_contact: Instant,
    /// Sequence number of the last executed request, with its encoded
    /// reply. A repeat of the sequence number is answered from here
    /// without re-executing anything.
    pub last_seq: Option<u8>,
    pub last_reply: Vec<u8>,
    pub fhandles: [Option<FileHandle>; MAX_FD_PER_CONN],
    pub dhandles: [DirHandle; MAX_DHND_PER_CONN],
    /// Last enumerated path, for the usage log
    pub lastpath: PathBuf,
}

impl Session {
    fn new(
        sid: u16,
        client: SocketAddr,
        cli_conn: Option<ConnId>,
        root: String,
        now: Instant,
    ) -> Session {
        Session {
            sid,
            client,
            cli_conn,
            root,
            last_contact: now,
            last_seq: None,
            last_reply: Vec::new(),
            fhandles: std::array::from_fn(|_| None),
            dhandles: std::array::from_fn(|_| DirHandle::default()),
            lastpath: PathBuf::new(),
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_contact = now;
    }

    /// Remember the reply bytes for `seq` so a retransmit can be answered
    /// verbatim.
    pub fn cache_reply(&mut self, seq: u8, reply: &[u8]) {
        self.last_seq = Some(seq);
        self.last_reply.clear();
        self.last_reply.extend_from_slice(reply);
    }

    pub fn cached_reply(&self, seq: u8) -> Option<&[u8]> {
        if self.last_seq == Some(seq) && !self.last_reply.is_empty() {
            Some(&self.last_reply)
        } else {
            None
        }
    }

    /// Put an open file into the first free slot.
    pub fn alloc_fd(&mut self, fh: FileHandle) -> Result<u8> {
        for (i, slot) in self.fhandles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(fh);
                return Ok(i as u8);
            }
        }
        Err(Error::No(status::EMFILE))
    }

    pub fn file_mut(&mut self, fd: u8) -> Result<&mut FileHandle> {
        self.fhandles
            .get_mut(fd as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::No(status::EBADF))
    }

    pub fn close_fd(&mut self, fd: u8) -> Result<()> {
        self.fhandles
            .get_mut(fd as usize)
            .and_then(Option::take)
            .map(drop)
            .ok_or(Error::No(status::EBADF))
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Session {
        Session::new(
            1,
            "127.0.0.1:0".parse().unwrap(),
            None,
            String::new(),
            Instant::now(),
        )
    }
}

/// All live sessions, keyed by sid.
pub struct SessionTable {
    sessions: HashMap<u16, Session>,
    next_sid: u16,
    max_sessions: usize,
    max_per_ip: usize,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::with_caps(MAX_SESSIONS, MAX_SESSIONS_PER_IP)
    }

    fn with_caps(max_sessions: usize, max_per_ip: usize) -> SessionTable {
        SessionTable {
            sessions: HashMap::new(),
            next_sid: 1,
            max_sessions,
            max_per_ip,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn get_mut(&mut self, sid: u16) -> Option<&mut Session> {
        self.sessions.get_mut(&sid)
    }

    pub fn get(&self, sid: u16) -> Option<&Session> {
        self.sessions.get(&sid)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<&Session> {
        self.sessions.values().find(|s| s.client == addr)
    }

    /// Allocate a session. Fails with EMFILE when the table is full and
    /// EACCES when the per-IP cap is reached. `with_sid` pins the sid when
    /// it is still free (remount), otherwise a fresh one is picked.
    pub fn alloc(
        &mut self,
        client: SocketAddr,
        cli_conn: Option<ConnId>,
        root: String,
        with_sid: Option<u16>,
        now: Instant,
    ) -> Result<&mut Session> {
        if self.sessions.len() >= self.max_sessions {
            return Err(Error::No(status::EMFILE));
        }
        let from_ip = self
            .sessions
            .values()
            .filter(|s| s.client.ip() == client.ip())
            .count();
        if from_ip >= self.max_per_ip {
            return Err(Error::No(status::EACCES));
        }

        let sid = match with_sid {
            Some(sid) if sid != 0 && !self.sessions.contains_key(&sid) => sid,
            _ => self.new_sid(),
        };

        debug_assert!(sid != 0);
        let session = Session::new(sid, client, cli_conn, root, now);
        Ok(self.sessions.entry(sid).or_insert(session))
    }

    /// Free a session; dropping it closes every handle it owns.
    pub fn free(&mut self, sid: u16) -> Option<Session> {
        let s = self.sessions.remove(&sid);
        if s.is_some() {
            debug!("session 0x{:04x} freed", sid);
        }
        s
    }

    /// Throw out sessions silent for longer than SESSION_TIMEOUT.
    pub fn sweep(&mut self, now: Instant) {
        if SESSION_TIMEOUT.is_zero() {
            return;
        }
        self.sessions.retain(|sid, s| {
            let live = now.duration_since(s.last_contact) <= SESSION_TIMEOUT;
            if !live {
                info!("session 0x{:04x} timed out", sid);
            }
            live
        });
    }

    /// Free every session bound to a TCP connection that went away.
    pub fn reset_cli_conn(&mut self, conn: ConnId) {
        self.sessions.retain(|sid, s| {
            let keep = s.cli_conn != Some(conn);
            if !keep {
                info!("session 0x{:04x} lost its connection", sid);
            }
            keep
        });
    }

    fn new_sid(&mut self) -> u16 {
        loop {
            let sid = self.next_sid;
            self.next_sid = self.next_sid.wrapping_add(1);
            if self.next_sid == 0 {
                self.next_sid = 1;
            }
            if sid != 0 && !self.sessions.contains_key(&sid) {
                return sid;
            }
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        SessionTable::new()
    }
}

/// MOUNT: validate the requested subtree and create the session.
///
/// Returns the new sid separately because the reply header carries it in
/// place of the (zero) sid the client sent.
pub async fn mount(
    cfg: &ServerConfig,
    sessions: &mut SessionTable,
    client: SocketAddr,
    cli_conn: Option<ConnId>,
    hdr: &Header,
    version: u16,
    location: &str,
    user: &str,
    now: Instant,
) -> Result<(u16, FCall)> {
    debug!(
        "mount {:?} from {} (client version 0x{:04x}, user {:?})",
        location, client, version, user
    );

    let path = directory::resolve_path(cfg, "", location).await?;
    let attr = fs::metadata(&path).await?;
    if !attr.is_dir() {
        return Err(Error::No(status::ENOTDIR));
    }

    let root = path
        .strip_prefix(&cfg.realroot)
        .unwrap_or_else(|_| std::path::Path::new(""))
        .to_string_lossy()
        .into_owned();

    // A client that still holds a sid is remounting; drop the old session
    // and keep its sid, so stale handles cannot survive the remount.
    let mut with_sid = None;
    if hdr.sid != 0 {
        if let Some(old) = sessions.get(hdr.sid) {
            if old.client.ip() == client.ip() {
                sessions.free(hdr.sid);
                with_sid = Some(hdr.sid);
            }
        }
    }

    let s = sessions.alloc(client, cli_conn, root, with_sid, now)?;
    info!("session 0x{:04x} mounted {:?} for {}", s.sid, location, client);

    Ok((
        s.sid,
        FCall::RMount {
            version: PROTO_VERSION,
            retry_ms: MIN_RETRY_MS,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(host: &str, port: u16) -> SocketAddr {
        format!("{}:{}", host, port).parse().unwrap()
    }

    #[test]
    fn sids_start_at_one_and_stay_unique() {
        let mut t = SessionTable::with_caps(8, 8);
        let now = Instant::now();

        let a = t.alloc(addr("10.0.0.1", 100), None, String::new(), None, now).unwrap().sid;
        let b = t.alloc(addr("10.0.0.2", 100), None, String::new(), None, now).unwrap().sid;
        let c = t.alloc(addr("10.0.0.3", 100), None, String::new(), None, now).unwrap().sid;
        assert_eq!((a, b, c), (1, 2, 3));

        t.free(2);
        let d = t.alloc(addr("10.0.0.4", 100), None, String::new(), None, now).unwrap().sid;
        assert_eq!(d, 4);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn table_full_is_emfile() {
        let mut t = SessionTable::with_caps(2, 2);
        let now = Instant::now();
        t.alloc(addr("10.0.0.1", 1), None, String::new(), None, now).unwrap();
        t.alloc(addr("10.0.0.1", 2), None, String::new(), None, now).unwrap();

        match t.alloc(addr("10.0.0.2", 3), None, String::new(), None, now) {
            Err(Error::No(s)) => assert_eq!(s, status::EMFILE),
            other => panic!("unexpected: {:?}", other.map(|s| s.sid)),
        }
    }

    #[test]
    fn per_ip_cap_is_eacces() {
        let mut t = SessionTable::with_caps(8, 1);
        let now = Instant::now();
        t.alloc(addr("10.0.0.1", 1), None, String::new(), None, now).unwrap();

        match t.alloc(addr("10.0.0.1", 2), None, String::new(), None, now) {
            Err(Error::No(s)) => assert_eq!(s, status::EACCES),
            other => panic!("unexpected: {:?}", other.map(|s| s.sid)),
        }

        // A different address is still welcome.
        assert!(t.alloc(addr("10.0.0.2", 1), None, String::new(), None, now).is_ok());
    }

    #[test]
    fn sweep_frees_idle_sessions() {
        let mut t = SessionTable::with_caps(8, 8);
        let t0 = Instant::now();
        let quiet = t.alloc(addr("10.0.0.1", 1), None, String::new(), None, t0).unwrap().sid;
        let active = t.alloc(addr("10.0.0.2", 1), None, String::new(), None, t0).unwrap().sid;

        let later = t0 + SESSION_TIMEOUT / 2;
        t.get_mut(active).unwrap().touch(later);

        t.sweep(t0 + SESSION_TIMEOUT + Duration::from_secs(1));
        assert!(t.get_mut(quiet).is_none());
        assert!(t.get_mut(active).is_some());
    }

    #[test]
    fn connection_loss_frees_bound_sessions() {
        let mut t = SessionTable::with_caps(8, 8);
        let now = Instant::now();
        let tcp = t.alloc(addr("10.0.0.1", 1), Some(7), String::new(), None, now).unwrap().sid;
        let udp = t.alloc(addr("10.0.0.2", 1), None, String::new(), None, now).unwrap().sid;

        t.reset_cli_conn(7);
        assert!(t.get_mut(tcp).is_none());
        assert!(t.get_mut(udp).is_some());
    }

    #[test]
    fn reply_cache_answers_repeats_only() {
        let mut s = Session::for_tests();
        s.cache_reply(9, &[1, 2, 3]);
        assert_eq!(s.cached_reply(9), Some(&[1u8, 2, 3][..]));
        assert_eq!(s.cached_reply(10), None);
    }

    #[tokio::test]
    async fn fd_slots_fill_and_free() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Session::for_tests();

        for i in 0..MAX_FD_PER_CONN {
            let path = dir.path().join(format!("f{}", i));
            let file = fs::File::create(&path).await.unwrap();
            let fd = s.alloc_fd(FileHandle { file, path }).unwrap();
            assert_eq!(fd, i as u8);
        }

        let path = dir.path().join("overflow");
        let file = fs::File::create(&path).await.unwrap();
        match s.alloc_fd(FileHandle { file, path }) {
            Err(Error::No(st)) => assert_eq!(st, status::EMFILE),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }

        s.close_fd(3).unwrap();
        assert!(s.file_mut(3).is_err());
        let path = dir.path().join("again");
        let file = fs::File::create(&path).await.unwrap();
        assert_eq!(s.alloc_fd(FileHandle { file, path }).unwrap(), 3);
    }
}
