//! Low-level, allocation-disciplined building blocks shared by the cachegate engine.
//!
//! This crate deliberately knows nothing about sockets, backends or async scheduling — it is the
//! "physics" layer: a bump-allocated per-task arena ([`workspace`]), the header message store
//! built on top of it ([`http`]), the Vary/Key variant fingerprint codecs ([`vary`], [`key`]),
//! the PROXY protocol codec ([`proxy`]), the ESI opcode program format ([`esi`]), and the gzip
//! splicing helpers used to stitch ESI sub-responses into a parent gzip member ([`gzip`]).

pub mod esi;
pub mod gzip;
pub mod http;
pub mod key;
pub mod proxy;
pub mod vary;
pub mod workspace;

pub use workspace::{Span, Workspace, WsError};
