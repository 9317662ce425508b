//! Typed payloads for the control-frame conversations.
//!
//! Requests are deserialized into these records before dispatch so the
//! handlers never poke at raw JSON; responses serialize with the exact key
//! names the desktop driver expects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Extensions the device accepts, in the order they are advertised.
pub const ACCEPTED_EXTENSIONS: [&str; 9] = [
    "epub", "pdf", "mobi", "azw3", "fb2", "txt", "djvu", "cbz", "cbr",
];

/// Path-length hint advertised per extension.
pub const DEFAULT_PATH_LENGTH: u32 = 37;

/// Cover height hint advertised to the desktop.
pub const COVER_HEIGHT: u32 = 240;

// ---------------------------------------------------------------------------
// Requests (peer -> device)
// ---------------------------------------------------------------------------

/// `GET_INITIALIZATION_INFO` arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct InitRequest {
    #[serde(rename = "passwordChallenge", default)]
    pub password_challenge: String,
}

/// `GET_BOOK_COUNT` arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct BookCountRequest {
    /// `""` or `"main"` = internal storage, `"carda"` = removable.
    #[serde(rename = "on_card", default)]
    pub on_card: String,
    #[serde(rename = "willUseCachedMetadata", default)]
    pub use_cached_metadata: bool,
}

/// `SEND_BOOK` arguments. The raw binary body follows the device's OK reply.
#[derive(Debug, Clone, Deserialize)]
pub struct SendBookRequest {
    pub lpath: String,
    pub length: u64,
    pub metadata: serde_json::Value,
    #[serde(rename = "on_card", default)]
    pub on_card: Option<String>,
}

/// `SEND_BOOK_METADATA` arguments. No reply is expected.
#[derive(Debug, Clone, Deserialize)]
pub struct SendBookMetadataRequest {
    pub data: serde_json::Value,
}

/// `DELETE_BOOK` arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteBooksRequest {
    pub lpaths: Vec<String>,
}

/// `GET_BOOK_FILE_SEGMENT` arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct FileSegmentRequest {
    pub lpath: String,
}

/// `SEND_BOOKLISTS` arguments. Collection names may carry a trailing
/// `" (N)"` count suffix.  A missing `collections` key means "nothing to
/// sync"; an empty map means the peer has no collections left.
#[derive(Debug, Clone, Deserialize)]
pub struct BooklistsRequest {
    #[serde(default)]
    pub collections: Option<BTreeMap<String, Vec<String>>>,
}

/// `DISPLAY_MESSAGE` arguments. `message_kind == 1` during handshake means
/// the password was rejected.
#[derive(Debug, Clone, Deserialize)]
pub struct DisplayMessageRequest {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "messageKind", default)]
    pub message_kind: Option<i64>,
}

/// `NOOP` arguments: three sub-shapes distinguished by key presence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoopRequest {
    #[serde(default)]
    pub ejecting: bool,
    #[serde(rename = "priKey", default)]
    pub pri_key: Option<i64>,
    #[serde(default)]
    pub count: Option<i64>,
}

// ---------------------------------------------------------------------------
// Responses (device -> peer)
// ---------------------------------------------------------------------------

/// Capability object returned in handshake step 2.  Key names are frozen by
/// the desktop driver.
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    #[serde(rename = "appName")]
    pub app_name: String,
    #[serde(rename = "acceptedExtensions")]
    pub accepted_extensions: Vec<String>,
    #[serde(rename = "cacheUsesLpaths")]
    pub cache_uses_lpaths: bool,
    #[serde(rename = "canAcceptLibraryInfo")]
    pub can_accept_library_info: bool,
    #[serde(rename = "canDeleteMultipleBooks")]
    pub can_delete_multiple_books: bool,
    #[serde(rename = "canReceiveBookBinary")]
    pub can_receive_book_binary: bool,
    #[serde(rename = "canSendOkToSendbook")]
    pub can_send_ok_to_sendbook: bool,
    #[serde(rename = "canStreamBooks")]
    pub can_stream_books: bool,
    #[serde(rename = "canStreamMetadata")]
    pub can_stream_metadata: bool,
    #[serde(rename = "canUseCachedMetadata")]
    pub can_use_cached_metadata: bool,
    #[serde(rename = "canSupportLpathChanges")]
    pub can_support_lpath_changes: bool,
    #[serde(rename = "willAskForUpdateBooks")]
    pub will_ask_for_update_books: bool,
    #[serde(rename = "setTempMarkWhenReadInfoSynced")]
    pub set_temp_mark_when_read_info_synced: bool,
    #[serde(rename = "ccVersionNumber")]
    pub cc_version_number: String,
    #[serde(rename = "coverHeight")]
    pub cover_height: u32,
    #[serde(rename = "deviceKind")]
    pub device_kind: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "extensionPathLengths")]
    pub extension_path_lengths: BTreeMap<String, u32>,
    #[serde(rename = "maxBookContentPacketLen")]
    pub max_book_content_packet_len: u32,
    #[serde(rename = "useUuidFileNames")]
    pub use_uuid_file_names: bool,
    #[serde(rename = "versionOK")]
    pub version_ok: bool,
    pub has_card_a: bool,
    pub has_card_b: bool,
    #[serde(rename = "isReadSyncCol", skip_serializing_if = "Option::is_none")]
    pub is_read_sync_col: Option<String>,
    #[serde(rename = "isReadDateSyncCol", skip_serializing_if = "Option::is_none")]
    pub is_read_date_sync_col: Option<String>,
    #[serde(rename = "passwordHash", skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

impl Capabilities {
    /// Capability object with the frozen flag set; identity fields supplied
    /// by the caller, optional fields left unset.
    pub fn new(app_name: &str, version: &str, device_kind: &str, device_name: &str) -> Self {
        Capabilities {
            app_name: app_name.to_owned(),
            accepted_extensions: ACCEPTED_EXTENSIONS.iter().map(|e| (*e).to_owned()).collect(),
            cache_uses_lpaths: true,
            can_accept_library_info: true,
            can_delete_multiple_books: true,
            can_receive_book_binary: true,
            can_send_ok_to_sendbook: true,
            can_stream_books: true,
            can_stream_metadata: true,
            can_use_cached_metadata: true,
            can_support_lpath_changes: true,
            will_ask_for_update_books: false,
            set_temp_mark_when_read_info_synced: false,
            cc_version_number: version.to_owned(),
            cover_height: COVER_HEIGHT,
            device_kind: device_kind.to_owned(),
            device_name: device_name.to_owned(),
            extension_path_lengths: ACCEPTED_EXTENSIONS
                .iter()
                .map(|e| ((*e).to_owned(), DEFAULT_PATH_LENGTH))
                .collect(),
            max_book_content_packet_len: crate::CONTENT_PACKET_LEN as u32,
            use_uuid_file_names: false,
            version_ok: true,
            has_card_a: false,
            has_card_b: false,
            is_read_sync_col: None,
            is_read_date_sync_col: None,
            password_hash: None,
        }
    }
}

/// Handshake step 4 reply.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfoResponse {
    pub device_info: DeviceInfo,
    pub version: String,
    pub device_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub device_store_uuid: String,
    pub device_name: String,
    pub location_code: String,
}

/// `GET_BOOK_COUNT` reply preceding the booklist stream.
#[derive(Debug, Clone, Serialize)]
pub struct BookCountResponse {
    pub count: usize,
    #[serde(rename = "willStream")]
    pub will_stream: bool,
    #[serde(rename = "willScan")]
    pub will_scan: bool,
}

/// `TOTAL_SPACE` reply.
#[derive(Debug, Clone, Serialize)]
pub struct TotalSpaceResponse {
    pub total_space_on_device: u64,
}

/// `FREE_SPACE` reply.
#[derive(Debug, Clone, Serialize)]
pub struct FreeSpaceResponse {
    pub free_space_on_device: u64,
}

/// `GET_BOOK_FILE_SEGMENT` reply preceding the raw byte stream.
#[derive(Debug, Clone, Serialize)]
pub struct FileLengthResponse {
    #[serde(rename = "fileLength")]
    pub file_length: u64,
}

/// ERROR-opcode reply body.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub message: String,
}
