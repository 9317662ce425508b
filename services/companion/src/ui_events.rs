use serde::Serialize;

/// Events the protocol task emits for whoever is watching (status display,
/// cover generation, notifications).  The session never blocks on consumers.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompanionEvent {
    HandshakeComplete {
        device_uuid: String,
    },
    /// A book body landed on disk; `path` is the cover-generation hook.
    BookReceived {
        lpath: String,
        path: String,
    },
    MetadataSynced {
        lpath: String,
    },
    BooksDeleted {
        count: usize,
    },
    CollectionsSynced {
        collections: usize,
    },
    /// SEND_BOOKLISTS arrived after a run of SEND_BOOKs: one transfer batch
    /// is complete.
    TransferBatchComplete {
        new_books: u32,
    },
    /// DISPLAY_MESSAGE forwarded to the UI.
    PeerMessage {
        kind: i64,
        message: String,
    },
    Disconnected {
        books_received: u32,
    },
}
