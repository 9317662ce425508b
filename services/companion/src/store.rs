//! Metadata store over the device database.
//!
//! # Schema
//! The device DB (`folders`, `files`, `books_impl`, `books_settings`,
//! `profiles`, `bookshelfs`, `bookshelfs_books`) is owned by the reader
//! firmware; its existence is a precondition and nothing here creates or
//! migrates tables.
//!
//! # SQLite settings
//! Connections are opened per operation (no lock is held across network
//! waits) with `busy_timeout = 5000`, `journal_mode = WAL`,
//! `synchronous = NORMAL`.
//!
//! Folder ids and the current profile id are memoized on the store and
//! reset by `initialize`.

use crate::config::Config;
use crate::timeutil;
use calibre_wire::BookMetadata;
use calibre_wire::metadata::extension_of;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("removable storage not available")]
    RemovableStorageUnavailable,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The peer's storage-card abstraction mapped onto device storage ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageCard {
    /// Internal storage (`storageid = 1`).
    Main,
    /// Removable storage (`storageid = 2`).
    CardA,
}

impl StorageCard {
    /// Map the peer's `on_card` string. `None` for card names the device
    /// does not model (nothing will match them).
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "" | "main" => Some(StorageCard::Main),
            "carda" => Some(StorageCard::CardA),
            _ => None,
        }
    }

    pub fn storage_id(self) -> i64 {
        match self {
            StorageCard::Main => 1,
            StorageCard::CardA => 2,
        }
    }

    fn from_storage_id(id: i64) -> Self {
        if id == 2 {
            StorageCard::CardA
        } else {
            StorageCard::Main
        }
    }
}

/// One inventory row: the book record plus where it lives.
#[derive(Debug, Clone)]
pub struct DeviceBook {
    pub meta: BookMetadata,
    pub card: StorageCard,
}

pub struct BookStore {
    db_path: PathBuf,
    books_dir: PathBuf,
    sdcard_dir: Option<PathBuf>,
    profile: Option<String>,
    target_storage: StorageCard,
    folder_ids: HashMap<(i64, String), i64>,
    profile_id: Option<i64>,
}

impl BookStore {
    pub fn new(
        db_path: PathBuf,
        books_dir: PathBuf,
        sdcard_dir: Option<PathBuf>,
        profile: Option<String>,
    ) -> Self {
        BookStore {
            db_path,
            books_dir,
            sdcard_dir,
            profile,
            target_storage: StorageCard::Main,
            folder_ids: HashMap::new(),
            profile_id: None,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.db_path.clone(),
            cfg.books_dir.clone(),
            cfg.sdcard_dir.clone(),
            cfg.profile.clone(),
        )
    }

    /// Drop memoized folder/profile ids (e.g. before a new session).
    pub fn initialize(&mut self) {
        self.folder_ids.clear();
        self.profile_id = None;
    }

    pub fn has_removable_storage(&self) -> bool {
        self.sdcard_dir.is_some()
    }

    /// The internal storage root (used for capacity queries).
    pub fn books_root(&self) -> &Path {
        &self.books_dir
    }

    /// Select which storage root subsequent incoming books land under.
    pub fn set_target_storage(&mut self, card: StorageCard) -> StoreResult<()> {
        if card == StorageCard::CardA && self.sdcard_dir.is_none() {
            return Err(StoreError::RemovableStorageUnavailable);
        }
        self.target_storage = card;
        Ok(())
    }

    /// Absolute path of a book file under the current target storage root.
    pub fn book_file_path(&self, lpath: &str) -> PathBuf {
        let root = match self.target_storage {
            StorageCard::CardA => self.sdcard_dir.as_ref().unwrap_or(&self.books_dir),
            StorageCard::Main => &self.books_dir,
        };
        root.join(lpath.trim_start_matches('/'))
    }

    pub(crate) fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.db_path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(conn)
    }

    // -----------------------------------------------------------------------
    // Book operations
    // -----------------------------------------------------------------------

    /// Insert or update the `(folder, filename)` row pair for `meta`, then
    /// merge its per-profile settings. One transaction; idempotent.
    pub fn add_book(&mut self, meta: &BookMetadata) -> StoreResult<i64> {
        let full = path_str(&self.book_file_path(&meta.lpath));
        let (folder, file_name) = split_path(&full);
        let file_size = meta.size;
        // The peer's metadata already carries size and mtime; no stat() here.
        let file_mtime = meta
            .last_modified
            .as_deref()
            .and_then(timeutil::parse_iso)
            .unwrap_or_else(timeutil::now_epoch);
        let storage_id = self.storage_id_for(&full);
        let now = timeutil::now_epoch();
        let day_added = timeutil::end_of_local_day(now);

        let sort_author = if meta.author_sort.is_empty() {
            meta.authors.as_str()
        } else {
            meta.author_sort.as_str()
        };
        let first_author_letter = first_letter(sort_author);
        let first_title_letter = first_letter(&meta.title);

        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let folder_id = self.get_or_create_folder(&tx, folder, storage_id)?;

        let existing: Option<(i64, i64)> = tx
            .query_row(
                "SELECT id, book_id FROM files WHERE filename = ?1 AND folder_id = ?2",
                params![file_name, folder_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let book_id = match existing {
            Some((file_id, book_id)) => {
                tx.execute(
                    "UPDATE files SET size = ?1, modification_time = ?2 WHERE id = ?3",
                    params![file_size, file_mtime, file_id],
                )?;
                tx.execute(
                    "UPDATE books_impl
                     SET title = ?1, first_title_letter = ?2, author = ?3, firstauthor = ?4,
                         first_author_letter = ?5, series = ?6, numinseries = ?7, size = ?8,
                         isbn = ?9, sort_title = ?10, updated = ?11, ts_added = ?12
                     WHERE id = ?13",
                    params![
                        meta.title,
                        first_title_letter,
                        meta.authors,
                        sort_author,
                        first_author_letter,
                        meta.series,
                        meta.series_index,
                        meta.size,
                        meta.isbn,
                        meta.title,
                        now,
                        day_added,
                        book_id,
                    ],
                )?;
                book_id
            }
            None => {
                tx.execute(
                    "INSERT INTO books_impl
                         (title, first_title_letter, author, firstauthor, first_author_letter,
                          series, numinseries, size, isbn, sort_title, creationtime, updated,
                          ts_added, hidden)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 0, ?11, 0)",
                    params![
                        meta.title,
                        first_title_letter,
                        meta.authors,
                        sort_author,
                        first_author_letter,
                        meta.series,
                        meta.series_index,
                        meta.size,
                        meta.isbn,
                        meta.title,
                        day_added,
                    ],
                )?;
                let book_id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO files
                         (storageid, folder_id, book_id, filename, size, modification_time, ext)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        storage_id,
                        folder_id,
                        book_id,
                        file_name,
                        file_size,
                        file_mtime,
                        extension_of(file_name),
                    ],
                )?;
                book_id
            }
        };

        let profile_id = self.current_profile_id(&tx)?;
        apply_book_settings(&tx, book_id, meta, profile_id)?;
        tx.commit()?;
        Ok(book_id)
    }

    /// Merge per-profile settings only (read state, favorite, completion).
    /// Returns `false` when no book matches the lpath.
    pub fn update_book_sync(&mut self, meta: &BookMetadata) -> StoreResult<bool> {
        let mut conn = self.open()?;
        let Some(book_id) = self.find_book_id(&conn, &meta.lpath)? else {
            return Ok(false);
        };
        let tx = conn.transaction()?;
        let profile_id = self.current_profile_id(&tx)?;
        apply_book_settings(&tx, book_id, meta, profile_id)?;
        tx.commit()?;
        Ok(true)
    }

    /// Remove the file (best-effort) and the `files`/`books_settings`/
    /// `books_impl` rows. Missing rows are not errors.
    pub fn delete_book(&mut self, lpath: &str) -> StoreResult<()> {
        let full_path = self.book_file_path(lpath);
        let _ = std::fs::remove_file(&full_path);

        let full = path_str(&full_path);
        let (folder, file_name) = split_path(&full);
        let storage_id = self.storage_id_for(&full);

        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let found: Option<(i64, i64)> = tx
            .query_row(
                "SELECT f.id, f.book_id FROM files f
                 JOIN folders fo ON f.folder_id = fo.id
                 WHERE f.filename = ?1 AND fo.name = ?2 AND f.storageid = ?3",
                params![file_name, folder, storage_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((file_id, book_id)) = found {
            tx.execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
            tx.execute(
                "DELETE FROM books_settings WHERE bookid = ?1",
                params![book_id],
            )?;
            tx.execute("DELETE FROM books_impl WHERE id = ?1", params![book_id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Every book with its reconstructed lpath and per-profile read state.
    /// Books without a settings row still appear.
    pub fn all_books(&mut self) -> StoreResult<Vec<DeviceBook>> {
        let conn = self.open()?;
        let profile_id = self.current_profile_id(&conn)?;
        let mut stmt = conn.prepare(
            "SELECT b.id, b.title, b.author, b.series, b.numinseries, b.size,
                    f.modification_time, f.filename, fo.name, f.storageid,
                    bs.completed, bs.favorite, bs.completed_ts
             FROM books_impl b
             JOIN files f ON b.id = f.book_id
             JOIN folders fo ON f.folder_id = fo.id
             LEFT JOIN books_settings bs ON b.id = bs.bookid AND bs.profileid = ?1",
        )?;
        let rows = stmt.query_map(params![profile_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, Option<i64>>(10)?,
                row.get::<_, Option<i64>>(11)?,
                row.get::<_, Option<i64>>(12)?,
            ))
        })?;

        let mut books = Vec::new();
        for row in rows {
            let (
                id,
                title,
                author,
                series,
                series_index,
                size,
                mtime,
                filename,
                folder,
                storage_id,
                completed,
                favorite,
                completed_ts,
            ) = row?;
            let is_read = completed.unwrap_or(0) != 0;
            let read_ts = completed_ts.unwrap_or(0);
            let meta = BookMetadata {
                db_book_id: Some(id),
                title: title.unwrap_or_default(),
                authors: author.unwrap_or_default(),
                series: series.unwrap_or_default(),
                series_index: series_index.unwrap_or(0),
                size: size.unwrap_or(0),
                lpath: self.lpath_for(&folder, &filename),
                last_modified: (mtime != 0).then(|| timeutil::format_iso(mtime)),
                is_read,
                is_favorite: favorite.unwrap_or(0) != 0,
                last_read_date: (is_read && read_ts > 0)
                    .then(|| timeutil::format_iso(read_ts)),
                ..BookMetadata::default()
            };
            books.push(DeviceBook {
                meta,
                card: StorageCard::from_storage_id(storage_id),
            });
        }
        Ok(books)
    }

    /// Resolve an lpath to its device book id, if present.
    pub(crate) fn find_book_id(
        &self,
        conn: &Connection,
        lpath: &str,
    ) -> StoreResult<Option<i64>> {
        let full = path_str(&self.book_file_path(lpath));
        let (folder, file_name) = split_path(&full);
        Ok(conn
            .query_row(
                "SELECT f.book_id FROM files f
                 JOIN folders fo ON f.folder_id = fo.id
                 WHERE f.filename = ?1 AND fo.name = ?2",
                params![file_name, folder],
                |row| row.get(0),
            )
            .optional()?)
    }

    // -----------------------------------------------------------------------
    // Shelf helpers (driven by the collection sync)
    // -----------------------------------------------------------------------

    /// Find a shelf by name, reviving a tombstoned row, or insert a new one.
    pub(crate) fn get_or_create_bookshelf(conn: &Connection, name: &str) -> StoreResult<i64> {
        let now = timeutil::now_epoch();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM bookshelfs WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            conn.execute(
                "UPDATE bookshelfs SET is_deleted = 0, ts = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO bookshelfs (name, is_deleted, ts) VALUES (?1, 0, ?2)",
            params![name, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Attach a book to a shelf, reviving a tombstoned membership.
    pub(crate) fn link_book_to_shelf(
        conn: &Connection,
        shelf_id: i64,
        book_id: i64,
    ) -> StoreResult<()> {
        let now = timeutil::now_epoch();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM bookshelfs_books WHERE bookshelfid = ?1 AND bookid = ?2",
                params![shelf_id, book_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            conn.execute(
                "UPDATE bookshelfs_books SET is_deleted = 0, ts = ?1
                 WHERE bookshelfid = ?2 AND bookid = ?3",
                params![now, shelf_id, book_id],
            )?;
        } else {
            conn.execute(
                "INSERT INTO bookshelfs_books (bookshelfid, bookid, ts, is_deleted)
                 VALUES (?1, ?2, ?3, 0)",
                params![shelf_id, book_id, now],
            )?;
        }
        Ok(())
    }

    pub(crate) fn current_profile_id(&mut self, conn: &Connection) -> StoreResult<i64> {
        if let Some(id) = self.profile_id {
            return Ok(id);
        }
        let id = match &self.profile {
            Some(name) => conn
                .query_row(
                    "SELECT id FROM profiles WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(1),
            None => 1,
        };
        self.profile_id = Some(id);
        Ok(id)
    }

    fn get_or_create_folder(
        &mut self,
        conn: &Connection,
        folder: &str,
        storage_id: i64,
    ) -> StoreResult<i64> {
        let key = (storage_id, folder.to_owned());
        if let Some(id) = self.folder_ids.get(&key) {
            return Ok(*id);
        }
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM folders WHERE storageid = ?1 AND name = ?2",
                params![storage_id, folder],
                |row| row.get(0),
            )
            .optional()?;
        let id = match existing {
            Some(id) => id,
            None => {
                conn.execute(
                    "INSERT INTO folders (storageid, name) VALUES (?1, ?2)",
                    params![storage_id, folder],
                )?;
                conn.last_insert_rowid()
            }
        };
        self.folder_ids.insert(key, id);
        Ok(id)
    }

    fn storage_id_for(&self, full: &str) -> i64 {
        if let Some(sdcard) = &self.sdcard_dir {
            if Path::new(full).starts_with(sdcard) {
                return StorageCard::CardA.storage_id();
            }
        }
        StorageCard::Main.storage_id()
    }

    /// Reconstruct the library-relative path from a DB folder + filename.
    pub(crate) fn lpath_for(&self, folder: &str, filename: &str) -> String {
        let full = format!("{}/{}", folder, filename);
        let mut roots = vec![path_str(&self.books_dir)];
        if let Some(sdcard) = &self.sdcard_dir {
            roots.push(path_str(sdcard));
        }
        for root in roots {
            if let Some(rel) = full.strip_prefix(&root) {
                return rel.trim_start_matches('/').to_owned();
            }
        }
        filename.to_owned()
    }
}

/// Merge incoming sync state into a `books_settings` row.
///
/// A read book forces progress to 100/100; an unread book clears completion
/// but leaves `cpage`/`npage` untouched so local progress survives.
fn apply_book_settings(
    conn: &Connection,
    book_id: i64,
    meta: &BookMetadata,
    profile_id: i64,
) -> StoreResult<()> {
    let completed = i64::from(meta.is_read);
    let favorite = i64::from(meta.is_favorite);
    let completed_ts = if meta.is_read {
        meta.last_read_date
            .as_deref()
            .and_then(timeutil::parse_iso)
            .unwrap_or(0)
    } else {
        0
    };

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM books_settings WHERE bookid = ?1 AND profileid = ?2",
            params![book_id, profile_id],
            |row| row.get(0),
        )
        .optional()?;

    if exists.is_some() {
        if meta.is_read {
            conn.execute(
                "UPDATE books_settings
                 SET completed = ?1, favorite = ?2, completed_ts = ?3, cpage = 100, npage = 100
                 WHERE bookid = ?4 AND profileid = ?5",
                params![completed, favorite, completed_ts, book_id, profile_id],
            )?;
        } else {
            conn.execute(
                "UPDATE books_settings
                 SET completed = 0, favorite = ?1, completed_ts = 0
                 WHERE bookid = ?2 AND profileid = ?3",
                params![favorite, book_id, profile_id],
            )?;
        }
    } else {
        let page = if meta.is_read { 100 } else { 0 };
        conn.execute(
            "INSERT INTO books_settings
                 (bookid, profileid, completed, favorite, completed_ts, cpage, npage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![book_id, profile_id, completed, favorite, completed_ts, page, page],
        )?;
    }
    Ok(())
}

/// First grapheme for the DB's letter-index columns: ASCII uppercases in
/// place, anything else goes through char-wise uppercase.
fn first_letter(s: &str) -> String {
    let Some(first) = s.chars().next() else {
        return String::new();
    };
    if first.is_ascii_alphanumeric() || first.is_ascii_punctuation() {
        first.to_ascii_uppercase().to_string()
    } else {
        first.to_uppercase().collect()
    }
}

fn split_path(full: &str) -> (&str, &str) {
    full.rsplit_once('/').unwrap_or(("", full))
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
