//! Shared fixtures for tests that need a populated device database.
//!
//! The device schema is a precondition in production (the reader firmware
//! owns it); tests build the same tables in a temp directory.

use crate::store::BookStore;
use calibre_wire::BookMetadata;
use rusqlite::Connection;
use std::path::PathBuf;
use tempfile::TempDir;

pub(crate) const DEVICE_SCHEMA: &str = "
CREATE TABLE folders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    storageid INTEGER NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (storageid, name)
);
CREATE TABLE files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    storageid INTEGER NOT NULL,
    folder_id INTEGER NOT NULL,
    book_id INTEGER NOT NULL,
    filename TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    modification_time INTEGER NOT NULL DEFAULT 0,
    ext TEXT,
    UNIQUE (folder_id, filename)
);
CREATE TABLE books_impl (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT,
    first_title_letter TEXT,
    author TEXT,
    firstauthor TEXT,
    first_author_letter TEXT,
    series TEXT,
    numinseries INTEGER,
    size INTEGER,
    isbn TEXT,
    sort_title TEXT,
    creationtime INTEGER DEFAULT 0,
    updated INTEGER DEFAULT 0,
    ts_added INTEGER DEFAULT 0,
    hidden INTEGER DEFAULT 0
);
CREATE TABLE books_settings (
    bookid INTEGER NOT NULL,
    profileid INTEGER NOT NULL,
    completed INTEGER DEFAULT 0,
    favorite INTEGER DEFAULT 0,
    completed_ts INTEGER DEFAULT 0,
    cpage INTEGER DEFAULT 0,
    npage INTEGER DEFAULT 0,
    UNIQUE (bookid, profileid)
);
CREATE TABLE profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE bookshelfs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    is_deleted INTEGER DEFAULT 0,
    ts INTEGER DEFAULT 0
);
CREATE TABLE bookshelfs_books (
    bookshelfid INTEGER NOT NULL,
    bookid INTEGER NOT NULL,
    ts INTEGER DEFAULT 0,
    is_deleted INTEGER DEFAULT 0,
    UNIQUE (bookshelfid, bookid)
);
";

pub(crate) fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("explorer-3.db")
}

/// A store over a fresh device DB, books under `<dir>/books`.
pub(crate) fn open_store(dir: &TempDir) -> BookStore {
    let db = db_path(dir);
    let conn = Connection::open(&db).unwrap();
    conn.execute_batch(DEVICE_SCHEMA).unwrap();
    BookStore::new(db, dir.path().join("books"), None, None)
}

/// A second connection for asserting on raw rows.
pub(crate) fn raw_conn(dir: &TempDir) -> Connection {
    Connection::open(db_path(dir)).unwrap()
}

pub(crate) fn meta(lpath: &str, title: &str) -> BookMetadata {
    BookMetadata {
        lpath: lpath.to_owned(),
        title: title.to_owned(),
        authors: "A. Author".to_owned(),
        size: 11,
        ..BookMetadata::default()
    }
}
