// calibre-wire: Calibre wireless-device protocol types and framing.
//
// The desktop peer speaks a length-prefixed framing where each control
// message is `<decimal length>[<opcode>,<json object>]`, with a raw binary
// sub-stream for book bodies.  This crate holds the closed opcode set, the
// frame codec, and the typed message payloads; it does no I/O.

pub mod framing;
pub mod messages;
pub mod metadata;
pub mod opcode;

pub use framing::{Frame, FramingError, MAX_FRAME_LEN};
pub use metadata::{BookMetadata, CacheBookRecord, SyncColumns, UNKNOWN_TIME};
pub use opcode::Opcode;

/// Largest chunk of raw book-body bytes moved in one read/write.
pub const CONTENT_PACKET_LEN: usize = 4096;
