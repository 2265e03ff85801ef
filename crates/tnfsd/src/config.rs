//! Compile time server configuration.

use std::time::Duration;

/// Maximum open file descriptors per session
pub const MAX_FD_PER_CONN: usize = 16;

/// Maximum directory handles per session
pub const MAX_DHND_PER_CONN: usize = 8;

/// Maximum number of live sessions
pub const MAX_SESSIONS: usize = 4096;

/// Maximum number of sessions from a single IP
pub const MAX_SESSIONS_PER_IP: usize = 4096;

/// Maximum number of TCP connections
pub const MAX_TCP_CONN: usize = 4096;

/// Sessions are thrown out after no contact for this long
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// TCP connections are thrown out after no contact for this long
pub const CONN_TIMEOUT: Duration = Duration::from_secs(600);

/// How long loaded-but-closed directory handles are cached
pub const DIR_HANDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How often server stats are logged
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Sweep cadence for the session/connection timeout tick
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Idle time before TCP starts sending keepalive probes
pub const TCP_KA_IDLE: Duration = Duration::from_secs(30);

/// Interval between individual keepalive probes
pub const TCP_KA_INTVL: Duration = Duration::from_secs(1);

/// Keepalive probes sent before the connection is dropped
pub const TCP_KA_COUNT: u32 = 60;
