//! Companion configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/mnt/ext1/system/calibre-companion.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server.host`
//!
//! # Password
//! Either inline (`auth.password`) or indirected through a file
//! (`auth.password_file`, raw string on a single line, trimmed on read).
//! Inline values starting with `$` are the legacy marker for a platform
//! secret store this build does not have; they are rejected with a pointer
//! at `password_file`.
//!
//! # Device UUID
//! `device.uuid` is generated on first run and written back to the config
//! file so the desktop sees a stable `device_store_uuid` across sessions.

use calibre_wire::SyncColumns;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level companion configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub schema_version: u32,
    pub host: String,
    pub port: u16,
    /// The resolved password (inline value or the password file's contents).
    pub password: String,
    pub device_name: String,
    /// Empty until first run persists a generated UUID.
    pub device_uuid: String,
    /// Internal storage root; lpaths are resolved under it.
    pub books_dir: PathBuf,
    /// Removable storage root, when the device has one.
    pub sdcard_dir: Option<PathBuf>,
    /// The device database (schema is a precondition, never created here).
    pub db_path: PathBuf,
    /// Where the metadata cache file lives.
    pub data_dir: PathBuf,
    /// Reader profile whose settings rows are touched; `None` = first profile.
    pub profile: Option<String>,
    pub columns: SyncColumns,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServer>,
    auth: Option<RawAuth>,
    device: Option<RawDevice>,
    storage: Option<RawStorage>,
    sync: Option<RawSync>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawAuth {
    password: Option<String>,
    password_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    name: Option<String>,
    uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStorage {
    books_dir: Option<String>,
    sdcard_dir: Option<String>,
    db_path: Option<String>,
    data_dir: Option<String>,
    profile: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSync {
    read_column: Option<String>,
    read_date_column: Option<String>,
    favorite_column: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub const DEFAULT_CONFIG_PATH: &str = "/mnt/ext1/system/calibre-companion.toml";

/// Load the companion config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load the companion config from the default path.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

/// Load the companion config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let host = raw_server
        .host
        .ok_or_else(|| ConfigError::MissingField("server.host".to_owned()))?;
    let port = raw_server.port.unwrap_or(9090);

    let password = resolve_password(raw.auth)?;

    let (device_name, device_uuid) = match raw.device {
        Some(d) => (
            d.name.unwrap_or_else(|| "PocketBook Device".to_owned()),
            d.uuid.unwrap_or_default(),
        ),
        None => ("PocketBook Device".to_owned(), String::new()),
    };

    let storage = raw.storage;
    let books_dir = PathBuf::from(
        storage
            .as_ref()
            .and_then(|s| s.books_dir.clone())
            .unwrap_or_else(|| "/mnt/ext1".to_owned()),
    );
    let sdcard_dir = storage
        .as_ref()
        .and_then(|s| s.sdcard_dir.clone())
        .map(PathBuf::from);
    let db_path = storage
        .as_ref()
        .and_then(|s| s.db_path.clone())
        .map_or_else(
            || books_dir.join("system/explorer-3/explorer-3.db"),
            PathBuf::from,
        );
    let data_dir = storage
        .as_ref()
        .and_then(|s| s.data_dir.clone())
        .map_or_else(|| books_dir.join("system"), PathBuf::from);
    let profile = storage.as_ref().and_then(|s| s.profile.clone());

    let columns = match raw.sync {
        Some(s) => SyncColumns {
            read: s.read_column.unwrap_or_else(|| "#read".to_owned()),
            read_date: s.read_date_column.unwrap_or_else(|| "#read_date".to_owned()),
            favorite: s.favorite_column.unwrap_or_else(|| "#favorite".to_owned()),
        },
        None => SyncColumns {
            read: "#read".to_owned(),
            read_date: "#read_date".to_owned(),
            favorite: "#favorite".to_owned(),
        },
    };

    Ok(Config {
        schema_version,
        host,
        port,
        password,
        device_name,
        device_uuid,
        books_dir,
        sdcard_dir,
        db_path,
        data_dir,
        profile,
        columns,
    })
}

/// Write a generated device UUID back into the config file, preserving the
/// rest of the document.
pub fn persist_device_uuid(path: &Path, uuid: &str) -> Result<(), ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    let mut doc: toml::Table =
        toml::from_str(&toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let device = doc
        .entry("device".to_owned())
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    match device.as_table_mut() {
        Some(table) => {
            table.insert("uuid".to_owned(), toml::Value::String(uuid.to_owned()));
        }
        None => {
            return Err(ConfigError::InvalidValue(
                "device is not a table".to_owned(),
            ));
        }
    }
    let rendered =
        toml::to_string_pretty(&doc).map_err(|e| ConfigError::Parse(e.to_string()))?;
    std::fs::write(path, rendered)
        .map_err(|e| ConfigError::Io(format!("writing config file '{}': {}", path.display(), e)))
}

fn resolve_password(auth: Option<RawAuth>) -> Result<String, ConfigError> {
    let Some(auth) = auth else {
        return Ok(String::new());
    };
    if let Some(file) = auth.password_file {
        let content = std::fs::read_to_string(&file)
            .map_err(|e| ConfigError::Io(format!("reading password file '{}': {}", file, e)))?;
        return Ok(content.trim().to_owned());
    }
    let password = auth.password.unwrap_or_default();
    if password.starts_with('$') {
        return Err(ConfigError::InvalidValue(
            "auth.password looks like a platform-encrypted value; use auth.password_file"
                .to_owned(),
        ));
    }
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
schema_version = 1

[server]
host = "192.168.1.50"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(cfg.host, "192.168.1.50");
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.password, "");
        assert_eq!(cfg.device_name, "PocketBook Device");
        assert_eq!(cfg.device_uuid, "");
        assert_eq!(cfg.books_dir, PathBuf::from("/mnt/ext1"));
        assert_eq!(
            cfg.db_path,
            PathBuf::from("/mnt/ext1/system/explorer-3/explorer-3.db")
        );
        assert_eq!(cfg.data_dir, PathBuf::from("/mnt/ext1/system"));
        assert_eq!(cfg.sdcard_dir, None);
        assert_eq!(cfg.columns.read, "#read");
        assert_eq!(cfg.columns.read_date, "#read_date");
        assert_eq!(cfg.columns.favorite, "#favorite");
    }

    #[test]
    fn missing_host_is_an_error() {
        let err = load_config_from_str("schema_version = 1\n[server]\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "server.host"));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let err =
            load_config_from_str("schema_version = 2\n[server]\nhost = \"h\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg = load_config_from_str(
            r##"
schema_version = 1

[server]
host = "10.0.0.2"
port = 9091

[device]
name = "PocketBook Era"
uuid = "abc-123"

[storage]
books_dir = "/books"
sdcard_dir = "/sdcard"
profile = "reader"

[sync]
read_column = "#done"
"##,
        )
        .unwrap();
        assert_eq!(cfg.port, 9091);
        assert_eq!(cfg.device_name, "PocketBook Era");
        assert_eq!(cfg.device_uuid, "abc-123");
        assert_eq!(cfg.sdcard_dir, Some(PathBuf::from("/sdcard")));
        assert_eq!(cfg.db_path, PathBuf::from("/books/system/explorer-3/explorer-3.db"));
        assert_eq!(cfg.profile.as_deref(), Some("reader"));
        assert_eq!(cfg.columns.read, "#done");
        // Unspecified sync columns keep their defaults.
        assert_eq!(cfg.columns.read_date, "#read_date");
    }

    #[test]
    fn password_file_wins_and_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  sekrit  ").unwrap();
        let toml = format!(
            "schema_version = 1\n[server]\nhost = \"h\"\n[auth]\npassword_file = \"{}\"\n",
            file.path().display()
        );
        let cfg = load_config_from_str(&toml).unwrap();
        assert_eq!(cfg.password, "sekrit");
    }

    #[test]
    fn dollar_prefixed_inline_password_is_rejected() {
        let err = load_config_from_str(
            "schema_version = 1\n[server]\nhost = \"h\"\n[auth]\npassword = \"$enc\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn persist_device_uuid_survives_reload() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        persist_device_uuid(file.path(), "u-42").unwrap();
        let cfg = load_config_from_path(file.path()).unwrap();
        assert_eq!(cfg.device_uuid, "u-42");
        // The rest of the document is preserved.
        assert_eq!(cfg.host, "192.168.1.50");
    }
}
