//! Collection synchronization.
//!
//! The peer sends its collections as `name -> [lpath]`; the device mirrors
//! them onto its bookshelf tables with a three-way set diff.  Shelves and
//! memberships are soft-deleted (tombstoned) and revived by name, never
//! duplicated.

use crate::store::{BookStore, StoreResult};
use crate::timeutil;
use rusqlite::{Connection, params};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Strip the desktop's `" (N)"` count suffix from a collection name.
/// Only a suffix preceded by a space is stripped; `Foo(bar)` is untouched.
pub fn clean_collection_name(raw: &str) -> &str {
    if !raw.ends_with(')') {
        return raw;
    }
    match raw.rfind('(') {
        Some(open) if open > 0 && raw.as_bytes()[open - 1] == b' ' => &raw[..open - 1],
        _ => raw,
    }
}

/// Mirror the peer's collections onto the device shelves in one transaction.
///
/// For each peer collection: missing memberships are inserted (reviving
/// tombstones), memberships the peer dropped are soft-deleted.  Shelves the
/// peer no longer has are soft-deleted by name.  Lpaths with no matching
/// book are skipped; the shelf itself still exists.
pub fn sync_collections(
    store: &mut BookStore,
    peer: &BTreeMap<String, Vec<String>>,
) -> StoreResult<()> {
    let mut desired: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (raw_name, lpaths) in peer {
        desired
            .entry(clean_collection_name(raw_name))
            .or_default()
            .extend(lpaths.iter().map(String::as_str));
    }

    let mut conn = store.open()?;
    let mut device = device_collections(store, &conn)?;
    info!(
        peer = desired.len(),
        device = device.len(),
        "collection sync"
    );

    let now = timeutil::now_epoch();
    let tx = conn.transaction()?;
    for (name, files) in &desired {
        let shelf_id = BookStore::get_or_create_bookshelf(&tx, name)?;
        match device.remove(*name) {
            Some(device_files) => {
                let to_add: Vec<&str> = files
                    .iter()
                    .filter(|f| !device_files.contains(**f))
                    .copied()
                    .collect();
                let to_remove: Vec<&String> = device_files
                    .iter()
                    .filter(|f| !files.contains(f.as_str()))
                    .collect();
                debug!(
                    collection = name,
                    add = to_add.len(),
                    remove = to_remove.len(),
                    "diff"
                );
                for lpath in to_add {
                    match store.find_book_id(&tx, lpath)? {
                        Some(book_id) => BookStore::link_book_to_shelf(&tx, shelf_id, book_id)?,
                        None => warn!(lpath, "collection references unknown book"),
                    }
                }
                for lpath in to_remove {
                    if let Some(book_id) = store.find_book_id(&tx, lpath)? {
                        tx.execute(
                            "UPDATE bookshelfs_books SET is_deleted = 1, ts = ?1
                             WHERE bookshelfid = ?2 AND bookid = ?3",
                            params![now, shelf_id, book_id],
                        )?;
                    }
                }
            }
            None => {
                for lpath in files {
                    match store.find_book_id(&tx, lpath)? {
                        Some(book_id) => BookStore::link_book_to_shelf(&tx, shelf_id, book_id)?,
                        None => warn!(lpath, "collection references unknown book"),
                    }
                }
            }
        }
    }

    // Whatever the peer stopped sending is gone from its library.
    for name in device.keys() {
        info!(collection = %name, "collection dropped by desktop");
        tx.execute(
            "UPDATE bookshelfs SET is_deleted = 1, ts = ?1 WHERE name = ?2",
            params![now, name],
        )?;
    }
    tx.commit()?;
    conn.execute_batch("PRAGMA wal_checkpoint(FULL);")?;
    Ok(())
}

/// Current shelves as `name -> set<lpath>`, tombstones excluded.
fn device_collections(
    store: &BookStore,
    conn: &Connection,
) -> StoreResult<BTreeMap<String, BTreeSet<String>>> {
    let mut stmt = conn.prepare(
        "SELECT bs.name, f.filename, fo.name
         FROM bookshelfs bs
         JOIN bookshelfs_books bb ON bs.id = bb.bookshelfid
         JOIN books_impl b ON bb.bookid = b.id
         JOIN files f ON b.id = f.book_id
         JOIN folders fo ON f.folder_id = fo.id
         WHERE bs.is_deleted = 0 AND bb.is_deleted = 0",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for row in rows {
        let (shelf, filename, folder) = row?;
        map.entry(shelf)
            .or_default()
            .insert(store.lpath_for(&folder, &filename));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use tempfile::TempDir;

    fn collections(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(name, lpaths)| {
                (
                    (*name).to_owned(),
                    lpaths.iter().map(|l| (*l).to_owned()).collect(),
                )
            })
            .collect()
    }

    fn active_collections(
        store: &mut crate::store::BookStore,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let conn = store.open().unwrap();
        device_collections(store, &conn).unwrap()
    }

    #[test]
    fn clean_name_strips_count_suffix() {
        assert_eq!(clean_collection_name("Favorites (12)"), "Favorites");
        assert_eq!(clean_collection_name("R (2)"), "R");
    }

    #[test]
    fn clean_name_leaves_other_parens_alone() {
        assert_eq!(clean_collection_name("Foo(bar)"), "Foo(bar)");
        assert_eq!(clean_collection_name("(solo)"), "(solo)");
        assert_eq!(clean_collection_name("plain"), "plain");
        assert_eq!(clean_collection_name(""), "");
    }

    #[test]
    fn sync_creates_shelves_and_memberships() {
        let dir = TempDir::new().unwrap();
        let mut store = testutil::open_store(&dir);
        store.add_book(&testutil::meta("a.epub", "A")).unwrap();
        store.add_book(&testutil::meta("b.epub", "B")).unwrap();

        sync_collections(&mut store, &collections(&[("Reading (2)", &["a.epub", "b.epub"])]))
            .unwrap();

        let active = active_collections(&mut store);
        assert_eq!(active.len(), 1);
        let files = &active["Reading"];
        assert!(files.contains("a.epub") && files.contains("b.epub"));
    }

    #[test]
    fn sync_diffs_against_existing_shelf() {
        let dir = TempDir::new().unwrap();
        let mut store = testutil::open_store(&dir);
        store.add_book(&testutil::meta("a.epub", "A")).unwrap();
        store.add_book(&testutil::meta("b.epub", "B")).unwrap();
        store.add_book(&testutil::meta("z.epub", "Z")).unwrap();

        sync_collections(
            &mut store,
            &collections(&[("R", &["a.epub"]), ("X", &["z.epub"])]),
        )
        .unwrap();
        // Peer now has only R, grown by one book.
        sync_collections(&mut store, &collections(&[("R (2)", &["a.epub", "b.epub"])]))
            .unwrap();

        let active = active_collections(&mut store);
        assert_eq!(
            active.get("R"),
            Some(&["a.epub".to_owned(), "b.epub".to_owned()].into_iter().collect())
        );
        // X was dropped by the peer: tombstoned, not deleted.
        assert!(!active.contains_key("X"));
        let conn = testutil::raw_conn(&dir);
        let (is_deleted,): (i64,) = conn
            .query_row(
                "SELECT is_deleted FROM bookshelfs WHERE name = 'X'",
                [],
                |row| Ok((row.get(0)?,)),
            )
            .unwrap();
        assert_eq!(is_deleted, 1);
    }

    #[test]
    fn dropped_membership_is_tombstoned() {
        let dir = TempDir::new().unwrap();
        let mut store = testutil::open_store(&dir);
        let a = store.add_book(&testutil::meta("a.epub", "A")).unwrap();
        let b = store.add_book(&testutil::meta("b.epub", "B")).unwrap();

        sync_collections(&mut store, &collections(&[("R", &["a.epub", "b.epub"])])).unwrap();
        sync_collections(&mut store, &collections(&[("R", &["a.epub"])])).unwrap();

        let conn = testutil::raw_conn(&dir);
        let deleted: i64 = conn
            .query_row(
                "SELECT bb.is_deleted FROM bookshelfs_books bb WHERE bb.bookid = ?1",
                params![b],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(deleted, 1);
        let kept: i64 = conn
            .query_row(
                "SELECT bb.is_deleted FROM bookshelfs_books bb WHERE bb.bookid = ?1",
                params![a],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(kept, 0);
    }

    #[test]
    fn reappearing_shelf_is_revived_not_duplicated() {
        let dir = TempDir::new().unwrap();
        let mut store = testutil::open_store(&dir);
        store.add_book(&testutil::meta("a.epub", "A")).unwrap();

        sync_collections(&mut store, &collections(&[("R", &["a.epub"])])).unwrap();
        sync_collections(&mut store, &collections(&[])).unwrap();
        sync_collections(&mut store, &collections(&[("R", &["a.epub"])])).unwrap();

        let conn = testutil::raw_conn(&dir);
        let shelves: i64 = conn
            .query_row("SELECT COUNT(*) FROM bookshelfs WHERE name = 'R'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(shelves, 1);
        let active = active_collections(&mut store);
        assert!(active["R"].contains("a.epub"));
    }

    #[test]
    fn unknown_lpaths_are_skipped_but_shelf_exists() {
        let dir = TempDir::new().unwrap();
        let mut store = testutil::open_store(&dir);

        sync_collections(&mut store, &collections(&[("Ghost", &["missing.epub"])])).unwrap();

        let conn = testutil::raw_conn(&dir);
        let shelves: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM bookshelfs WHERE name = 'Ghost' AND is_deleted = 0",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(shelves, 1);
        let memberships: i64 = conn
            .query_row("SELECT COUNT(*) FROM bookshelfs_books", [], |r| r.get(0))
            .unwrap();
        assert_eq!(memberships, 0);
    }
}
