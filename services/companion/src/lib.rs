// companion: device-side endpoint for the Calibre wireless-device protocol.
// Exposes modules for integration testing.

pub mod cache;
pub mod config;
pub mod session;
pub mod shelves;
pub mod space;
pub mod store;
pub mod timeutil;
pub mod transport;
pub mod ui_events;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{CacheError, MetadataCache};
pub use config::{Config, ConfigError};
pub use session::{Session, SessionContext, SessionError, SessionSummary};
pub use store::{BookStore, StorageCard, StoreError};
pub use transport::{FramedTransport, TransportError};
pub use ui_events::CompanionEvent;
