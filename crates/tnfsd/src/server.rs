//! Transports and the server event loop.
//!
//! Transport tasks (the UDP reader, the TCP acceptor, one reader per
//! connection) forward raw frames over a channel into a single dispatch
//! loop that exclusively owns the session and connection tables. Each
//! message is processed to completion before the next one is taken, which
//! keeps per-session ordering and makes the retransmit cache sound without
//! any locking. A periodic tick in the same loop drives the timeout sweeps
//! and stats logging.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use log::{debug, error, info, warn};
use socket2::{SockRef, TcpKeepalive};
use tnfs::fcall::MAXMSGSZ;
use tnfs::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{
    CONN_TIMEOUT, MAX_TCP_CONN, STATS_INTERVAL, SWEEP_INTERVAL, TCP_KA_COUNT, TCP_KA_IDLE,
    TCP_KA_INTVL,
};
use crate::dispatch::{self, Source};
use crate::session::{ConnId, SessionTable};

/// Immutable server configuration shared with the command handlers.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Export root as given on the command line
    pub root: PathBuf,
    /// Canonicalized export root; every resolved path stays under this
    pub realroot: PathBuf,
    pub port: u16,
}

enum Event {
    Datagram {
        src: SocketAddr,
        frame: BytesMut,
    },
    Connected {
        conn: ConnId,
        peer: SocketAddr,
        tx: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    },
    TcpFrame {
        conn: ConnId,
        frame: BytesMut,
    },
    Disconnected {
        conn: ConnId,
    },
}

struct TcpConn {
    peer: SocketAddr,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    last_activity: Instant,
}

#[derive(Default)]
struct Stats {
    messages: u64,
    replies: u64,
    dropped: u64,
}

pub struct Server {
    cfg: Arc<ServerConfig>,
    sessions: SessionTable,
    conns: HashMap<ConnId, TcpConn>,
    stats: Stats,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Server {
        Server {
            cfg: Arc::new(cfg),
            sessions: SessionTable::new(),
            conns: HashMap::new(),
            stats: Stats::default(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let bind = (std::net::Ipv4Addr::UNSPECIFIED, self.cfg.port);
        let udp = Arc::new(UdpSocket::bind(bind).await?);
        let listener = TcpListener::bind(bind).await?;
        info!(
            "serving {} (resolved to {}) on UDP and TCP port {}",
            self.cfg.root.display(),
            self.cfg.realroot.display(),
            self.cfg.port
        );

        let (tx, mut rx) = mpsc::channel::<Event>(1024);
        tokio::spawn(udp_reader(udp.clone(), tx.clone()));
        tokio::spawn(acceptor(listener, tx.clone()));
        drop(tx);

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_stats = Instant::now();

        loop {
            tokio::select! {
                ev = rx.recv() => {
                    let Some(ev) = ev else { break };
                    self.handle_event(&udp, ev).await;
                }
                _ = sweep.tick() => {
                    self.tick(&mut last_stats);
                }
            }
        }

        Ok(())
    }

    async fn handle_event(&mut self, udp: &UdpSocket, ev: Event) {
        let now = Instant::now();
        match ev {
            Event::Datagram { src, frame } => {
                self.stats.messages += 1;
                let reply = dispatch::handle_frame(
                    &self.cfg,
                    &mut self.sessions,
                    Source::Udp(src),
                    &frame,
                    now,
                )
                .await;
                match reply {
                    Some(bytes) => {
                        self.stats.replies += 1;
                        if let Err(e) = udp.send_to(&bytes, src).await {
                            // The client recovers by retransmitting.
                            warn!("udp send to {} failed: {}", src, e);
                        }
                    }
                    None => self.stats.dropped += 1,
                }
            }
            Event::Connected {
                conn,
                peer,
                tx,
                cancel,
            } => {
                if self.conns.len() >= MAX_TCP_CONN {
                    warn!("connection table full, rejecting {}", peer);
                    cancel.cancel();
                    return;
                }
                debug!("accepted {} as connection {}", peer, conn);
                self.conns.insert(
                    conn,
                    TcpConn {
                        peer,
                        tx,
                        cancel,
                        last_activity: now,
                    },
                );
            }
            Event::TcpFrame { conn, frame } => {
                self.stats.messages += 1;
                let Some(c) = self.conns.get_mut(&conn) else {
                    return;
                };
                c.last_activity = now;
                let peer = c.peer;

                let reply = dispatch::handle_frame(
                    &self.cfg,
                    &mut self.sessions,
                    Source::Tcp(conn, peer),
                    &frame,
                    now,
                )
                .await;
                match reply {
                    Some(bytes) => {
                        self.stats.replies += 1;
                        if let Some(c) = self.conns.get(&conn) {
                            // A stalled connection must not stall the loop;
                            // an undelivered reply is re-requested by seq.
                            if c.tx.try_send(bytes).is_err() {
                                debug!("reply to connection {} dropped", conn);
                            }
                        }
                    }
                    None => self.stats.dropped += 1,
                }
            }
            Event::Disconnected { conn } => {
                if self.conns.remove(&conn).is_some() {
                    debug!("connection {} closed", conn);
                }
                self.sessions.reset_cli_conn(conn);
            }
        }
    }

    fn tick(&mut self, last_stats: &mut Instant) {
        let now = Instant::now();
        self.sessions.sweep(now);

        if !CONN_TIMEOUT.is_zero() {
            let mut dead = Vec::new();
            self.conns.retain(|&conn, c| {
                let live = now.duration_since(c.last_activity) <= CONN_TIMEOUT;
                if !live {
                    info!("connection {} from {} timed out", conn, c.peer);
                    c.cancel.cancel();
                    dead.push(conn);
                }
                live
            });
            for conn in dead {
                self.sessions.reset_cli_conn(conn);
            }
        }

        if !STATS_INTERVAL.is_zero() && now.duration_since(*last_stats) >= STATS_INTERVAL {
            *last_stats = now;
            info!(
                "stats: {} sessions, {} connections, {} messages, {} replies, {} dropped",
                self.sessions.len(),
                self.conns.len(),
                self.stats.messages,
                self.stats.replies,
                self.stats.dropped
            );
        }
    }
}

async fn udp_reader(udp: Arc<UdpSocket>, tx: mpsc::Sender<Event>) {
    // One byte of headroom so an oversized datagram is seen as such and
    // dropped, instead of arriving silently truncated to the maximum.
    let mut buf = vec![0u8; MAXMSGSZ + 1];
    loop {
        match udp.recv_from(&mut buf).await {
            Ok((n, src)) => {
                let frame = BytesMut::from(&buf[..n]);
                if tx.send(Event::Datagram { src, frame }).await.is_err() {
                    return;
                }
            }
            // Transient (ICMP unreachable from an earlier reply); keep going.
            Err(e) => debug!("udp receive failed: {}", e),
        }
    }
}

async fn acceptor(listener: TcpListener, tx: mpsc::Sender<Event>) {
    let mut next_conn: ConnId = 1;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn = next_conn;
                next_conn += 1;
                if let Err(e) = configure_keepalive(&stream) {
                    warn!("keepalive setup for {} failed: {}", peer, e);
                }
                tokio::spawn(serve_connection(conn, stream, peer, tx.clone()));
            }
            Err(e) => error!("accept failed: {}", e),
        }
    }
}

fn configure_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let ka = TcpKeepalive::new()
        .with_time(TCP_KA_IDLE)
        .with_interval(TCP_KA_INTVL)
        .with_retries(TCP_KA_COUNT);
    SockRef::from(stream).set_tcp_keepalive(&ka)
}

async fn serve_connection(
    conn: ConnId,
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<Event>,
) {
    let (mut rd, mut wr) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let cancel = CancellationToken::new();

    if events
        .send(Event::Connected {
            conn,
            peer,
            tx,
            cancel: cancel.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if wr.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    // The wire format carries no length prefix; one segment read is one
    // message, as with the reference daemon.
    let mut buf = vec![0u8; MAXMSGSZ + 1];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = rd.read(&mut buf) => match res {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = BytesMut::from(&buf[..n]);
                    if events.send(Event::TcpFrame { conn, frame }).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    let _ = events.send(Event::Disconnected { conn }).await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keepalive_applies_to_accepted_streams() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();
        configure_keepalive(&stream).unwrap();
        client.await.unwrap();
    }
}
