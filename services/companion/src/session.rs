//! One protocol session with the desktop peer.
//!
//! # Protocol
//! 1. RX `GET_INITIALIZATION_INFO`: reply with the capability object (plus
//!    `passwordHash` when the peer sent a challenge).
//! 2. RX `GET_DEVICE_INFORMATION`: reply with the device identity; a
//!    `DISPLAY_MESSAGE` with `messageKind == 1` here means bad password.
//! 3. Ready loop: dispatch peer-initiated operations until the peer ejects,
//!    hangs up, or the worker is asked to stop.
//!
//! A `Session` value is scoped to a single connection: the session book
//! list, receive counters, and metadata cache live and die with it.  The
//! cache is flushed once the ready loop ends.

use crate::cache::MetadataCache;
use crate::shelves;
use crate::space;
use crate::store::{BookStore, StorageCard, StoreError};
use crate::transport::{FramedTransport, TransportError};
use crate::ui_events::CompanionEvent;
use calibre_wire::framing::Frame;
use calibre_wire::messages::{
    BookCountRequest, BookCountResponse, BooklistsRequest, Capabilities, DeleteBooksRequest,
    DeviceInfo, DeviceInfoResponse, DisplayMessageRequest, ErrorResponse, FileLengthResponse,
    FileSegmentRequest, FreeSpaceResponse, InitRequest, NoopRequest, SendBookMetadataRequest,
    SendBookRequest, TotalSpaceResponse,
};
use calibre_wire::metadata::canonical_lpath;
use calibre_wire::{BookMetadata, CONTENT_PACKET_LEN, Opcode, SyncColumns};
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

pub const APP_NAME: &str = "PocketBook Calibre Companion";
pub const DEVICE_KIND: &str = "PocketBook";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid password")]
    InvalidCredentials,
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("Store: {0}")]
    Store(#[from] StoreError),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity and credentials the session presents to the peer.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub device_name: String,
    pub app_version: String,
    pub password: String,
    /// Stable `device_store_uuid`, generated on first run and persisted by
    /// the config layer.
    pub device_uuid: String,
    pub columns: SyncColumns,
    /// Where the metadata cache file lives.
    pub data_dir: PathBuf,
}

/// What a completed session did.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionSummary {
    pub books_received: u32,
}

pub struct Session<S> {
    transport: FramedTransport<S>,
    store: BookStore,
    cache: MetadataCache,
    ctx: SessionContext,
    events: broadcast::Sender<CompanionEvent>,
    /// Ordered inventory declared to the peer; indexes are its `priKey`s.
    books: Vec<BookMetadata>,
    books_received: u32,
    last_booklist_count: u32,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(
        transport: FramedTransport<S>,
        store: BookStore,
        cache: MetadataCache,
        ctx: SessionContext,
        events: broadcast::Sender<CompanionEvent>,
    ) -> Self {
        Session {
            transport,
            store,
            cache,
            ctx,
            events,
            books: Vec::new(),
            books_received: 0,
            last_booklist_count: 0,
        }
    }

    /// Drive the session to completion.  Handshake failures abort before
    /// anything is cached; after that the cache is flushed however the
    /// ready loop ends.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionSummary, SessionError> {
        self.handshake().await?;
        let result = self.ready_loop(&mut shutdown).await;
        if let Err(e) = self.cache.save() {
            warn!(error = %e, "cache save failed");
        }
        let _ = self.events.send(CompanionEvent::Disconnected {
            books_received: self.books_received,
        });
        result.map(|()| SessionSummary {
            books_received: self.books_received,
        })
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    async fn handshake(&mut self) -> Result<(), SessionError> {
        let frame = self.recv_strict().await?;
        if frame.opcode != Opcode::GetInitializationInfo {
            return Err(SessionError::Handshake(format!(
                "expected GET_INITIALIZATION_INFO, got {:?}",
                frame.opcode
            )));
        }
        let init: InitRequest = serde_json::from_value(frame.args)
            .map_err(|e| SessionError::Handshake(format!("bad initialization request: {e}")))?;

        let mut caps = Capabilities::new(
            APP_NAME,
            &self.ctx.app_version,
            DEVICE_KIND,
            &self.ctx.device_name,
        );
        caps.has_card_a = self.store.has_removable_storage();
        if !self.ctx.columns.read.is_empty() {
            caps.is_read_sync_col = Some(self.ctx.columns.read.clone());
        }
        if !self.ctx.columns.read_date.is_empty() {
            caps.is_read_date_sync_col = Some(self.ctx.columns.read_date.clone());
        }
        if !init.password_challenge.is_empty() {
            caps.password_hash = Some(password_hash(
                &self.ctx.password,
                &init.password_challenge,
            ));
        }
        self.transport.send(Opcode::Ok, &caps).await?;

        let frame = self.recv_strict().await?;
        match frame.opcode {
            Opcode::GetDeviceInformation => {}
            Opcode::DisplayMessage => {
                if let Ok(msg) = serde_json::from_value::<DisplayMessageRequest>(frame.args) {
                    if msg.message_kind == Some(1) {
                        return Err(SessionError::InvalidCredentials);
                    }
                }
                return Err(SessionError::Handshake(
                    "unexpected message from desktop".to_owned(),
                ));
            }
            other => {
                return Err(SessionError::Handshake(format!(
                    "expected GET_DEVICE_INFORMATION, got {other:?}"
                )));
            }
        }

        self.cache
            .initialize(&self.ctx.data_dir, &self.ctx.device_uuid);

        let reply = DeviceInfoResponse {
            device_info: DeviceInfo {
                device_store_uuid: self.ctx.device_uuid.clone(),
                device_name: self.ctx.device_name.clone(),
                location_code: "main".to_owned(),
            },
            version: self.ctx.app_version.clone(),
            device_version: self.ctx.app_version.clone(),
        };
        self.transport.send(Opcode::Ok, &reply).await?;
        info!(device_uuid = %self.ctx.device_uuid, "handshake complete");
        let _ = self.events.send(CompanionEvent::HandshakeComplete {
            device_uuid: self.ctx.device_uuid.clone(),
        });
        Ok(())
    }

    /// Receive a frame during handshake, where any malformation fails the
    /// whole session.
    async fn recv_strict(&mut self) -> Result<Frame, SessionError> {
        self.transport
            .recv()
            .await?
            .map_err(|e| SessionError::Handshake(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Ready loop
    // -----------------------------------------------------------------------

    async fn ready_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stop requested, leaving session");
                        // Best-effort farewell so the peer sees a clean stop.
                        let _ = self.transport.send(Opcode::Ok, &json!({})).await;
                        return Ok(());
                    }
                }
                received = self.transport.recv() => {
                    let decoded = match received {
                        Ok(d) => d,
                        Err(TransportError::Closed) => {
                            info!("peer closed the connection");
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    };
                    let frame = match decoded {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "malformed frame");
                            self.send_error("Failed to parse request").await?;
                            continue;
                        }
                    };
                    debug!(opcode = ?frame.opcode, "dispatch");
                    match frame.opcode {
                        Opcode::SetCalibreDeviceInfo | Opcode::SetLibraryInfo => {
                            self.transport.send(Opcode::Ok, &json!({})).await?;
                        }
                        Opcode::TotalSpace => self.handle_total_space().await?,
                        Opcode::FreeSpace => self.handle_free_space().await?,
                        Opcode::GetBookCount => self.handle_book_count(frame.args).await?,
                        Opcode::SendBook => self.handle_send_book(frame.args).await?,
                        Opcode::SendBookMetadata => self.handle_book_metadata(frame.args)?,
                        Opcode::SendBooklists => self.handle_booklists(frame.args)?,
                        Opcode::DeleteBook => self.handle_delete(frame.args).await?,
                        Opcode::GetBookFileSegment => self.handle_file_segment(frame.args).await?,
                        Opcode::DisplayMessage => self.handle_display_message(frame.args),
                        Opcode::Noop => {
                            if self.handle_noop(frame.args).await? {
                                info!("peer ejected the device");
                                return Ok(());
                            }
                        }
                        other => {
                            warn!(opcode = ?other, "unexpected opcode");
                            self.send_error("Unexpected opcode").await?;
                        }
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Operation handlers
    // -----------------------------------------------------------------------

    async fn handle_total_space(&mut self) -> Result<(), SessionError> {
        match space::total_space(self.store.books_root()) {
            Ok(total) => {
                self.transport
                    .send(
                        Opcode::Ok,
                        &TotalSpaceResponse {
                            total_space_on_device: total,
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "total space query failed");
                self.send_error("Failed to get total space").await
            }
        }
    }

    async fn handle_free_space(&mut self) -> Result<(), SessionError> {
        match space::free_space(self.store.books_root()) {
            Ok(free) => {
                self.transport
                    .send(
                        Opcode::Ok,
                        &FreeSpaceResponse {
                            free_space_on_device: free,
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "free space query failed");
                self.send_error("Failed to get free space").await
            }
        }
    }

    /// Build the session book list for the requested card and stream it:
    /// the `count` reply first, then one frame per book in list order.
    async fn handle_book_count(&mut self, args: Value) -> Result<(), SessionError> {
        let Ok(req) = serde_json::from_value::<BookCountRequest>(args) else {
            return self.send_error("Malformed book count request").await;
        };
        let requested = StorageCard::from_wire_name(&req.on_card);
        let all = match self.store.all_books() {
            Ok(books) => books,
            Err(e) => {
                error!(error = %e, "inventory query failed");
                return self.send_error("Failed to list books").await;
            }
        };
        self.books = all
            .into_iter()
            .filter(|book| Some(book.card) == requested)
            .map(|book| book.meta)
            .collect();

        // Re-attach the identity the desktop assigned earlier so it can
        // skip books it already knows.
        let mut matched = 0usize;
        for book in &mut self.books {
            if let Some(cached) = self.cache.get(&book.lpath) {
                if !cached.uuid.is_empty() {
                    book.uuid = cached.uuid.clone();
                    matched += 1;
                }
                if !cached.last_modified.is_empty() {
                    book.last_modified = Some(cached.last_modified.clone());
                }
            }
        }
        info!(
            card = %req.on_card,
            count = self.books.len(),
            matched,
            cached = req.use_cached_metadata,
            "streaming booklist"
        );

        self.transport
            .send(
                Opcode::Ok,
                &BookCountResponse {
                    count: self.books.len(),
                    will_stream: true,
                    will_scan: true,
                },
            )
            .await?;
        for (index, book) in self.books.iter().enumerate() {
            if req.use_cached_metadata {
                self.transport
                    .send(Opcode::Ok, &book.cached_frame(index))
                    .await?;
            } else {
                self.transport
                    .send(Opcode::Ok, &book.full_frame(Some(index)))
                    .await?;
            }
        }
        Ok(())
    }

    /// Receive a book: OK-to-send reply, then exactly `length` raw bytes
    /// into `<booksDir>/<lpath>`, then the store/cache updates.
    async fn handle_send_book(&mut self, args: Value) -> Result<(), SessionError> {
        let Ok(req) = serde_json::from_value::<SendBookRequest>(args) else {
            return self.send_error("Missing required fields").await;
        };
        let card = match req.on_card.as_deref() {
            Some("carda") => StorageCard::CardA,
            _ => StorageCard::Main,
        };
        if self.store.set_target_storage(card).is_err() {
            warn!("SD card requested but not available");
            return self.send_error("SD Card not available").await;
        }

        let mut meta = BookMetadata::from_wire(&req.metadata, &self.ctx.columns);
        meta.lpath = canonical_lpath(&req.lpath);
        meta.size = req.length as i64;

        let path = self.store.book_file_path(&meta.lpath);
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(error = %e, "failed to create book directory");
                return self.send_error("Failed to create directory").await;
            }
        }
        let mut file = match tokio::fs::File::create(&path).await {
            Ok(file) => file,
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to create book file");
                return self.send_error("Failed to create book file").await;
            }
        };
        self.transport
            .send(Opcode::Ok, &json!({ "lpath": meta.lpath.clone() }))
            .await?;

        info!(lpath = %meta.lpath, length = req.length, "receiving book body");
        let mut remaining = req.length;
        let mut buf = vec![0u8; CONTENT_PACKET_LEN];
        let mut write_failed = false;
        while remaining > 0 {
            let chunk = remaining.min(CONTENT_PACKET_LEN as u64) as usize;
            // A transport failure here aborts the session; the partial file
            // stays on disk and the peer will resend.
            self.transport.recv_exact(&mut buf[..chunk]).await?;
            if !write_failed {
                if let Err(e) = file.write_all(&buf[..chunk]).await {
                    error!(error = %e, "disk write failed, draining transfer");
                    write_failed = true;
                }
            }
            remaining -= chunk as u64;
        }
        if write_failed {
            drop(file);
            return self.send_error("Failed to write book data").await;
        }
        file.flush().await?;
        drop(file);

        if let Err(e) = self.store.add_book(&meta) {
            error!(error = %e, lpath = %meta.lpath, "failed to record book");
        }
        self.cache.update(&meta);
        self.books_received += 1;
        let _ = self.events.send(CompanionEvent::BookReceived {
            lpath: meta.lpath.clone(),
            path: path.display().to_string(),
        });
        Ok(())
    }

    /// Settings-only sync; the peer expects no reply.
    fn handle_book_metadata(&mut self, args: Value) -> Result<(), SessionError> {
        let Ok(req) = serde_json::from_value::<SendBookMetadataRequest>(args) else {
            warn!("malformed SEND_BOOK_METADATA");
            return Ok(());
        };
        let meta = BookMetadata::from_wire(&req.data, &self.ctx.columns);
        info!(lpath = %meta.lpath, is_read = meta.is_read, "metadata sync");
        match self.store.update_book_sync(&meta) {
            Ok(true) => {
                if let Some(entry) = self.books.iter_mut().find(|b| b.lpath == meta.lpath) {
                    entry.is_read = meta.is_read;
                    entry.is_favorite = meta.is_favorite;
                    entry.last_read_date = meta.last_read_date.clone();
                    entry.series = meta.series.clone();
                    entry.series_index = meta.series_index;
                }
                self.cache.update(&meta);
                let _ = self.events.send(CompanionEvent::MetadataSynced {
                    lpath: meta.lpath.clone(),
                });
            }
            Ok(false) => warn!(lpath = %meta.lpath, "metadata sync for unknown book"),
            Err(e) => error!(error = %e, "metadata sync failed"),
        }
        Ok(())
    }

    /// Collection sync; the peer expects no reply.
    fn handle_booklists(&mut self, args: Value) -> Result<(), SessionError> {
        let Ok(req) = serde_json::from_value::<BooklistsRequest>(args) else {
            return Ok(());
        };
        if let Some(collections) = req.collections {
            match shelves::sync_collections(&mut self.store, &collections) {
                Ok(()) => {
                    let _ = self.events.send(CompanionEvent::CollectionsSynced {
                        collections: collections.len(),
                    });
                }
                Err(e) => error!(error = %e, "collection sync failed"),
            }
        }
        // A booklist after a run of SEND_BOOKs closes a transfer batch.
        let new_books = self.books_received - self.last_booklist_count;
        if new_books > 0 {
            info!(new_books, "book transfer batch complete");
            let _ = self
                .events
                .send(CompanionEvent::TransferBatchComplete { new_books });
            self.last_booklist_count = self.books_received;
        }
        Ok(())
    }

    /// Resolve uuids up front, ack the command, then delete and confirm
    /// each lpath in the order received.
    async fn handle_delete(&mut self, args: Value) -> Result<(), SessionError> {
        let Ok(req) = serde_json::from_value::<DeleteBooksRequest>(args) else {
            return self.send_error("Missing lpaths").await;
        };
        info!(count = req.lpaths.len(), "deleting books");
        let mut to_delete = Vec::with_capacity(req.lpaths.len());
        for lpath in &req.lpaths {
            let uuid = self
                .books
                .iter()
                .find(|book| book.lpath == *lpath)
                .map(|book| book.uuid.clone())
                .filter(|uuid| !uuid.is_empty())
                .or_else(|| self.cache.uuid_for(lpath).map(str::to_owned))
                .unwrap_or_default();
            to_delete.push((lpath.clone(), uuid));
        }

        self.transport.send(Opcode::Ok, &json!({})).await?;
        for (lpath, uuid) in to_delete {
            if let Err(e) = self.store.delete_book(&lpath) {
                error!(error = %e, lpath = %lpath, "delete failed");
            }
            self.cache.remove(&lpath);
            self.books.retain(|book| book.lpath != lpath);
            self.transport
                .send(Opcode::Ok, &json!({ "uuid": uuid }))
                .await?;
        }
        let _ = self.events.send(CompanionEvent::BooksDeleted {
            count: req.lpaths.len(),
        });
        Ok(())
    }

    /// Serve book bytes back: `OK {fileLength}`, then raw chunks to EOF.
    async fn handle_file_segment(&mut self, args: Value) -> Result<(), SessionError> {
        let Ok(req) = serde_json::from_value::<FileSegmentRequest>(args) else {
            return self.send_error("Missing lpath").await;
        };
        let path = self.store.book_file_path(&req.lpath);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, lpath = %req.lpath, "book file not readable");
                return self.send_error("Failed to open book file").await;
            }
        };
        let length = match file.metadata().await {
            Ok(stat) => stat.len(),
            Err(e) => {
                warn!(error = %e, "stat failed");
                return self.send_error("Failed to open book file").await;
            }
        };
        self.transport
            .send(
                Opcode::Ok,
                &FileLengthResponse {
                    file_length: length,
                },
            )
            .await?;
        let mut buf = vec![0u8; CONTENT_PACKET_LEN];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.transport.send_raw(&buf[..n]).await?;
        }
        Ok(())
    }

    fn handle_display_message(&mut self, args: Value) {
        if let Ok(req) = serde_json::from_value::<DisplayMessageRequest>(args) {
            info!(kind = ?req.message_kind, message = %req.message, "message from desktop");
            let _ = self.events.send(CompanionEvent::PeerMessage {
                kind: req.message_kind.unwrap_or(0),
                message: req.message,
            });
        }
    }

    /// NOOP sub-shapes. Returns `true` when the peer is ejecting.
    async fn handle_noop(&mut self, args: Value) -> Result<bool, SessionError> {
        let req: NoopRequest = serde_json::from_value(args).unwrap_or_default();
        if req.ejecting {
            self.transport.send(Opcode::Ok, &json!({})).await?;
            return Ok(true);
        }
        if let Some(index) = req.pri_key {
            match usize::try_from(index).ok().and_then(|i| self.books.get(i)) {
                Some(book) => {
                    let frame = book.full_frame(None);
                    self.transport.send(Opcode::Ok, &frame).await?;
                }
                None => {
                    warn!(index, "priKey out of range");
                    self.transport.send(Opcode::Ok, &json!({})).await?;
                }
            }
            return Ok(false);
        }
        if req.count.is_some() {
            // Batch-size advisory; acknowledged and otherwise ignored.
            self.transport.send(Opcode::Ok, &json!({})).await?;
            return Ok(false);
        }
        self.transport.send(Opcode::Ok, &json!({})).await?;
        Ok(false)
    }

    async fn send_error(&mut self, message: &str) -> Result<(), SessionError> {
        self.transport
            .send(
                Opcode::Error,
                &ErrorResponse {
                    message: message.to_owned(),
                },
            )
            .await?;
        Ok(())
    }
}

/// `lowercase_hex(sha1(password || challenge))`, as the desktop computes it.
pub fn password_hash(password: &str, challenge: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(challenge.as_bytes());
    hex::encode(hasher.finalize())
}
