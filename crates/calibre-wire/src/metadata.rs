//! Book metadata as it crosses the wire and the on-disk cache.
//!
//! One record shape (`BookMetadata`) moves across every boundary; the
//! serialized forms differ.  Inventory streaming uses either the full frame
//! or, when the peer opts into cached metadata, a minimal frame carrying only
//! identity and sync fields.  The persistent cache stores a third form that
//! adds `_original_*` shadows of the sync fields so the device can tell which
//! side mutated a value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire sentinel for "modification time unknown".  Internally unknown time is
/// `None`; the sentinel exists only at the serialization boundary.
pub const UNKNOWN_TIME: &str = "1970-01-01T00:00:00+00:00";

/// Names of the desktop's user-defined columns mirrored as sync fields.
/// An empty name means the column is not configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncColumns {
    pub read: String,
    pub read_date: String,
    pub favorite: String,
}

/// The canonical book record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookMetadata {
    pub uuid: String,
    pub title: String,
    /// Display string; a wire-side author array is joined with `", "`.
    pub authors: String,
    pub author_sort: String,
    /// Library-relative path, forward slashes, no leading slash.
    pub lpath: String,
    pub series: String,
    pub series_index: i64,
    pub isbn: String,
    pub publisher: String,
    pub pubdate: String,
    pub tags: String,
    pub comments: String,
    pub thumbnail: Option<String>,
    pub size: i64,
    /// `None` = unknown (serialized as [`UNKNOWN_TIME`]).
    pub last_modified: Option<String>,
    pub is_read: bool,
    pub last_read_date: Option<String>,
    pub is_favorite: bool,
    pub original_is_read: Option<bool>,
    pub original_last_read_date: Option<String>,
    pub original_is_favorite: Option<bool>,
    /// Device-local row id, absent before insertion.
    pub db_book_id: Option<i64>,
}

impl BookMetadata {
    /// Build a record from the peer's metadata object.
    ///
    /// Accepts `authors` as either a string or an array; reads the sync
    /// fields out of `user_metadata.<column>["#value#"]` for whichever
    /// columns are configured.
    pub fn from_wire(obj: &Value, columns: &SyncColumns) -> Self {
        let mut meta = BookMetadata {
            uuid: string_field(obj, "uuid"),
            title: string_field(obj, "title"),
            authors: string_or_list(obj.get("authors")),
            author_sort: string_field(obj, "author_sort"),
            lpath: canonical_lpath(&string_field(obj, "lpath")),
            series: string_field(obj, "series"),
            series_index: int_field(obj, "series_index"),
            isbn: string_field(obj, "isbn"),
            publisher: string_field(obj, "publisher"),
            pubdate: string_field(obj, "pubdate"),
            tags: string_or_list(obj.get("tags")),
            comments: string_field(obj, "comments"),
            thumbnail: thumbnail_field(obj.get("thumbnail")),
            size: int_field(obj, "size"),
            last_modified: known_time(string_field(obj, "last_modified")),
            ..BookMetadata::default()
        };
        if let Some(user) = obj.get("user_metadata") {
            if !columns.read.is_empty() {
                meta.is_read = user_column_bool(user, &columns.read);
            }
            if !columns.read_date.is_empty() {
                let date = user_column_string(user, &columns.read_date);
                meta.last_read_date = (!date.is_empty()).then_some(date);
            }
            if !columns.favorite.is_empty() {
                meta.is_favorite = user_column_bool(user, &columns.favorite);
            }
        }
        meta
    }

    /// The full inventory frame. `pri_key` is set when streaming the session
    /// book list (index positions become the peer's `priKey` handles).
    pub fn full_frame(&self, pri_key: Option<usize>) -> FullBookFrame {
        FullBookFrame {
            pri_key,
            uuid: self.uuid.clone(),
            title: self.title.clone(),
            authors: self.authors.clone(),
            lpath: self.lpath.clone(),
            last_modified: self
                .last_modified
                .clone()
                .unwrap_or_else(|| UNKNOWN_TIME.to_owned()),
            size: self.size,
            series: (!self.series.is_empty()).then(|| self.series.clone()),
            series_index: (!self.series.is_empty()).then_some(self.series_index),
            is_read: self.is_read,
            sync_type: 1,
            last_read_date: self.last_read_date.clone(),
        }
    }

    /// The minimal frame used when the peer set `willUseCachedMetadata`.
    pub fn cached_frame(&self, pri_key: usize) -> CachedBookFrame {
        CachedBookFrame {
            pri_key,
            uuid: self.uuid.clone(),
            lpath: self.lpath.clone(),
            last_modified: self
                .last_modified
                .clone()
                .unwrap_or_else(|| UNKNOWN_TIME.to_owned()),
            extension: extension_of(&self.lpath).to_owned(),
            is_read: self.is_read,
            sync_type: 1,
            last_read_date: self.last_read_date.clone(),
        }
    }

    /// The shape persisted in the per-device cache file.
    pub fn to_cache_record(&self) -> CacheBookRecord {
        CacheBookRecord {
            uuid: self.uuid.clone(),
            title: self.title.clone(),
            authors: self.authors.clone(),
            lpath: self.lpath.clone(),
            last_modified: self.last_modified.clone().unwrap_or_default(),
            is_read: self.is_read,
            last_read_date: self.last_read_date.clone(),
            is_favorite: self.is_favorite,
            original_is_read: self.original_is_read,
            original_last_read_date: self.original_last_read_date.clone(),
            original_is_favorite: self.original_is_favorite,
        }
    }

    pub fn from_cache_record(record: &CacheBookRecord) -> Self {
        BookMetadata {
            uuid: record.uuid.clone(),
            title: record.title.clone(),
            authors: record.authors.clone(),
            lpath: record.lpath.clone(),
            last_modified: known_time(record.last_modified.clone()),
            is_read: record.is_read,
            last_read_date: record.last_read_date.clone(),
            is_favorite: record.is_favorite,
            original_is_read: record.original_is_read,
            original_last_read_date: record.original_last_read_date.clone(),
            original_is_favorite: record.original_is_favorite,
            ..BookMetadata::default()
        }
    }
}

/// Full inventory frame, one per book in the booklist stream.
#[derive(Debug, Clone, Serialize)]
pub struct FullBookFrame {
    #[serde(rename = "priKey", skip_serializing_if = "Option::is_none")]
    pub pri_key: Option<usize>,
    pub uuid: String,
    pub title: String,
    pub authors: String,
    pub lpath: String,
    pub last_modified: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_index: Option<i64>,
    #[serde(rename = "_is_read_")]
    pub is_read: bool,
    #[serde(rename = "_sync_type_")]
    pub sync_type: i64,
    #[serde(rename = "_last_read_date_", skip_serializing_if = "Option::is_none")]
    pub last_read_date: Option<String>,
}

/// Identification-and-sync-only frame for peers that cache metadata.
#[derive(Debug, Clone, Serialize)]
pub struct CachedBookFrame {
    #[serde(rename = "priKey")]
    pub pri_key: usize,
    pub uuid: String,
    pub lpath: String,
    pub last_modified: String,
    pub extension: String,
    #[serde(rename = "_is_read_")]
    pub is_read: bool,
    #[serde(rename = "_sync_type_")]
    pub sync_type: i64,
    #[serde(rename = "_last_read_date_", skip_serializing_if = "Option::is_none")]
    pub last_read_date: Option<String>,
}

/// The `book` object inside a cache-file entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheBookRecord {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub authors: String,
    pub lpath: String,
    #[serde(default)]
    pub last_modified: String,
    #[serde(rename = "_is_read_", default)]
    pub is_read: bool,
    #[serde(
        rename = "_last_read_date_",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_read_date: Option<String>,
    #[serde(rename = "_is_favorite_", default)]
    pub is_favorite: bool,
    #[serde(
        rename = "_original_is_read_",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub original_is_read: Option<bool>,
    #[serde(
        rename = "_original_last_read_date_",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub original_last_read_date: Option<String>,
    #[serde(
        rename = "_original_is_favorite_",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub original_is_favorite: Option<bool>,
}

/// Canonicalize an lpath: forward slashes, no leading slash.
pub fn canonical_lpath(raw: &str) -> String {
    let slashed = raw.replace('\\', "/");
    slashed.trim_start_matches('/').to_owned()
}

/// File extension of an lpath, without the dot. Empty when there is none.
pub fn extension_of(lpath: &str) -> &str {
    lpath.rsplit_once('.').map_or("", |(_, ext)| ext)
}

fn known_time(value: String) -> Option<String> {
    (!value.is_empty() && value != UNKNOWN_TIME).then_some(value)
}

fn string_field(obj: &Value, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

fn int_field(obj: &Value, key: &str) -> i64 {
    match obj.get(key) {
        Some(v) => v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)).unwrap_or(0),
        None => 0,
    }
}

fn string_or_list(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        _ => String::new(),
    }
}

// Calibre ships thumbnails as `[width, height, base64]`; a bare string is
// accepted too.
fn thumbnail_field(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(items)) => items.get(2).and_then(Value::as_str).map(str::to_owned),
        _ => None,
    }
}

fn user_column_bool(user: &Value, column: &str) -> bool {
    user.get(column)
        .and_then(|c| c.get("#value#"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn user_column_string(user: &Value, column: &str) -> String {
    user.get(column)
        .and_then(|c| c.get("#value#"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns() -> SyncColumns {
        SyncColumns {
            read: "#read".to_owned(),
            read_date: "#read_date".to_owned(),
            favorite: "#favorite".to_owned(),
        }
    }

    #[test]
    fn authors_string_passes_through() {
        let obj = json!({"authors": "Ada Lovelace", "lpath": "a.epub"});
        let meta = BookMetadata::from_wire(&obj, &SyncColumns::default());
        assert_eq!(meta.authors, "Ada Lovelace");
    }

    #[test]
    fn authors_array_joins_with_comma_space() {
        let obj = json!({"authors": ["Ada Lovelace", "Charles Babbage"], "lpath": "a.epub"});
        let meta = BookMetadata::from_wire(&obj, &SyncColumns::default());
        assert_eq!(meta.authors, "Ada Lovelace, Charles Babbage");
    }

    #[test]
    fn lpath_is_canonicalized() {
        let obj = json!({"lpath": "/sub\\dir/x.epub"});
        let meta = BookMetadata::from_wire(&obj, &SyncColumns::default());
        assert_eq!(meta.lpath, "sub/dir/x.epub");
    }

    #[test]
    fn user_columns_populate_sync_fields() {
        let obj = json!({
            "lpath": "a.epub",
            "user_metadata": {
                "#read": {"#value#": true},
                "#read_date": {"#value#": "2026-02-01T10:00:00+00:00"},
                "#favorite": {"#value#": true}
            }
        });
        let meta = BookMetadata::from_wire(&obj, &columns());
        assert!(meta.is_read);
        assert!(meta.is_favorite);
        assert_eq!(
            meta.last_read_date.as_deref(),
            Some("2026-02-01T10:00:00+00:00")
        );
    }

    #[test]
    fn missing_user_columns_default_to_unset() {
        let obj = json!({"lpath": "a.epub", "user_metadata": {}});
        let meta = BookMetadata::from_wire(&obj, &columns());
        assert!(!meta.is_read);
        assert!(!meta.is_favorite);
        assert_eq!(meta.last_read_date, None);
    }

    #[test]
    fn unconfigured_columns_are_not_looked_up() {
        let obj = json!({
            "lpath": "a.epub",
            "user_metadata": {"#read": {"#value#": true}}
        });
        let meta = BookMetadata::from_wire(&obj, &SyncColumns::default());
        assert!(!meta.is_read);
    }

    #[test]
    fn unknown_time_sentinel_becomes_none() {
        let obj = json!({"lpath": "a.epub", "last_modified": UNKNOWN_TIME});
        let meta = BookMetadata::from_wire(&obj, &SyncColumns::default());
        assert_eq!(meta.last_modified, None);
    }

    #[test]
    fn fractional_series_index_truncates() {
        let obj = json!({"lpath": "a.epub", "series_index": 2.5});
        let meta = BookMetadata::from_wire(&obj, &SyncColumns::default());
        assert_eq!(meta.series_index, 2);
    }

    #[test]
    fn full_frame_omits_empty_series() {
        let meta = BookMetadata {
            lpath: "a.epub".to_owned(),
            ..BookMetadata::default()
        };
        let frame = serde_json::to_value(meta.full_frame(Some(0))).unwrap();
        assert_eq!(frame["priKey"], 0);
        assert!(frame.get("series").is_none());
        assert_eq!(frame["_sync_type_"], 1);
        assert_eq!(frame["last_modified"], UNKNOWN_TIME);
    }

    #[test]
    fn cached_frame_carries_extension_and_sync_fields() {
        let meta = BookMetadata {
            uuid: "u-1".to_owned(),
            lpath: "sub/x.epub".to_owned(),
            is_read: true,
            last_read_date: Some("2026-01-01T00:00:00+00:00".to_owned()),
            ..BookMetadata::default()
        };
        let frame = serde_json::to_value(meta.cached_frame(4)).unwrap();
        assert_eq!(frame["priKey"], 4);
        assert_eq!(frame["uuid"], "u-1");
        assert_eq!(frame["extension"], "epub");
        assert_eq!(frame["_is_read_"], true);
        assert_eq!(frame["_last_read_date_"], "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn cache_record_round_trips_through_json() {
        let meta = BookMetadata {
            uuid: "u-2".to_owned(),
            title: "T".to_owned(),
            authors: "A".to_owned(),
            lpath: "b.epub".to_owned(),
            last_modified: Some("2026-03-01T00:00:00+00:00".to_owned()),
            is_read: true,
            is_favorite: true,
            original_is_read: Some(false),
            ..BookMetadata::default()
        };
        let text = serde_json::to_string(&meta.to_cache_record()).unwrap();
        let record: CacheBookRecord = serde_json::from_str(&text).unwrap();
        let back = BookMetadata::from_cache_record(&record);
        assert_eq!(back.uuid, meta.uuid);
        assert_eq!(back.last_modified, meta.last_modified);
        assert_eq!(back.original_is_read, Some(false));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["_is_read_"], true);
        assert_eq!(value["_original_is_read_"], false);
    }
}
