#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

//! yroom is a WebSocket synchronization broker for Yjs (`yrs`) documents.
//!
//! # Features
//!
//! - Wire-compatible with the Yjs sync and awareness protocols, so
//!   off-the-shelf JavaScript clients interoperate
//! - Rooms keyed by connection path, each owning one shared document
//!   replica with a serialized update pipeline (ingest, apply, persist,
//!   broadcast)
//! - Ephemeral per-client awareness (presence) with clock-based
//!   last-write-wins and timed expiry
//! - Pluggable append-only update stores (file, temp-file, SQLite
//!   adapters) with versioned headers and history squashing
//! - Client-side provider binding a local document to one connection,
//!   with an observable `synced` signal
//!
//! The document itself is an opaque `yrs` replica: the broker only uses
//! state vectors, diffs, update application and update observation.

pub mod awareness;
pub mod codec;
pub mod error;
pub mod prelude;
pub mod protocol;
pub mod provider;
pub mod room;
pub mod server;
pub mod websocket;
pub mod ystore;

pub use awareness::Awareness;
pub use error::{Error, YrResult};
pub use provider::WebsocketProvider;
pub use room::YRoom;
pub use server::{ServerConfig, WebsocketServer};
pub use websocket::Websocket;
pub use ystore::{StoreRecord, YStore, STORE_VERSION};

// vim: ts=4
