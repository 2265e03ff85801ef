#![forbid(unsafe_code)]
//! TNFS protocol library.
//!
//! This crate provides the data types and wire codec for TNFS (Trivial
//! Network File System), the lightweight UDP-first file service protocol
//! spoken by retro-computer clients, protocol version 0x0102.
//!
//! # Overview
//!
//! A TNFS exchange is a single request datagram answered by a single reply
//! datagram. Requests carry a 4 byte header (`sid`, `seq`, `cmd`); replies
//! repeat the header and insert a status byte before the payload. All
//! multi-byte integers are little-endian regardless of host, strings are
//! NUL-terminated, and no message may exceed [`MAXMSGSZ`] bytes.
//!
//! The pieces:
//!
//! 1. [`fcall`] — the [`Cmd`](fcall::Cmd) opcode table, option bitfields,
//!    and the [`FCall`](fcall::FCall) enum covering every request and
//!    reply body.
//! 2. [`serialize`] — encode/decode between [`Msg`](fcall::Msg) and wire
//!    bytes.
//! 3. [`error`] — the TNFS status byte table and the mapping from host
//!    errors onto it.
//!
//! # Error Handling
//!
//! Server code signals a protocol-level failure by returning
//! [`Error::No`](error::Error::No) with a status byte from
//! [`error::status`]. Host I/O errors convert through `?` and are mapped
//! onto the status table when the reply is formed; anything without a
//! defined mapping becomes `EIO`.

pub mod error;
pub mod fcall;
pub mod serialize;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::status;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
