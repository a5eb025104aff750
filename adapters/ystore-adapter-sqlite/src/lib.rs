//! SQLite-backed update store.
//!
//! Unlike the file stores, the updates of all documents live in one
//! database, keyed by document path and ordered by rowid:
//!
//! ```sql
//! CREATE TABLE yupdates (
//!     path      TEXT NOT NULL,
//!     yupdate   BLOB,
//!     metadata  BLOB,
//!     timestamp REAL NOT NULL
//! )
//! ```
//!
//! The store version is kept in `PRAGMA user_version`; a mismatch on
//! open fails with `StoreVersionMismatch`. Squashing replaces all rows
//! for the path in a single transaction.
//!
//! An optional `document_ttl` bounds history growth: when the newest
//! persisted update is older than the TTL at write time, the history
//! is merged into one squashed record before the new update is
//! appended.

use std::path::Path;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::stream;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::Update;

use yroom::prelude::*;
use yroom::ystore::{RecordStream, StoreRecord, YStore, STORE_VERSION};

mod error;
pub use error::Error as SqliteStoreError;
use error::Error as DbError;

#[derive(Debug)]
struct Inner {
	closed: bool,
	last_timestamp: f64,
}

/// A YStore which uses an SQLite database shared by all documents.
pub struct SqliteYStore {
	pool: SqlitePool,
	doc_path: String,
	document_ttl: Option<Duration>,
	inner: Mutex<Inner>,
}

impl SqliteYStore {
	/// Open the database at `db_path` (creating it if missing) for the
	/// document stored under `doc_path`.
	pub async fn open(db_path: impl AsRef<Path>, doc_path: impl Into<String>) -> YrResult<Self> {
		Self::open_with_version(db_path, doc_path, STORE_VERSION).await
	}

	pub async fn open_with_version(
		db_path: impl AsRef<Path>,
		doc_path: impl Into<String>,
		version: u32,
	) -> YrResult<Self> {
		let options = SqliteConnectOptions::new().filename(db_path.as_ref()).create_if_missing(true);
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.connect_with(options)
			.await
			.map_err(|e| Error::from(DbError::DbError(format!("Failed to open database: {}", e))))?;

		let table_count: i64 = sqlx::query_scalar(
			"SELECT count(name) FROM sqlite_master WHERE type = 'table' AND name = 'yupdates'",
		)
		.fetch_one(&pool)
		.await
		.map_err(|e| Error::from(DbError::from(e)))?;

		if table_count == 0 {
			sqlx::query(
				"CREATE TABLE yupdates (path TEXT NOT NULL, yupdate BLOB, metadata BLOB, timestamp REAL NOT NULL)",
			)
			.execute(&pool)
			.await
			.map_err(|e| Error::from(DbError::from(e)))?;
			sqlx::query("CREATE INDEX idx_yupdates_path_timestamp ON yupdates (path, timestamp)")
				.execute(&pool)
				.await
				.map_err(|e| Error::from(DbError::from(e)))?;
			sqlx::query(&format!("PRAGMA user_version = {}", version))
				.execute(&pool)
				.await
				.map_err(|e| Error::from(DbError::from(e)))?;
		} else {
			let found: i64 = sqlx::query_scalar("PRAGMA user_version")
				.fetch_one(&pool)
				.await
				.map_err(|e| Error::from(DbError::from(e)))?;
			if found as u32 != version {
				return Err(Error::StoreVersionMismatch { found: found as u32, expected: version });
			}
		}

		debug!(db = %db_path.as_ref().display(), version, "opened sqlite store");
		Ok(Self {
			pool,
			doc_path: doc_path.into(),
			document_ttl: None,
			inner: Mutex::new(Inner { closed: false, last_timestamp: 0.0 }),
		})
	}

	/// Squash document history on write once the newest persisted
	/// update is older than `ttl`.
	pub fn with_document_ttl(mut self, ttl: Duration) -> Self {
		self.document_ttl = Some(ttl);
		self
	}

	pub fn doc_path(&self) -> &str {
		&self.doc_path
	}

	/// Merge all persisted updates for the path into one record within
	/// the given transaction.
	async fn squash_history(
		&self,
		tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
		timestamp: f64,
	) -> YrResult<()> {
		let rows: Vec<(Vec<u8>,)> =
			sqlx::query_as("SELECT yupdate FROM yupdates WHERE path = ? ORDER BY rowid")
				.bind(&self.doc_path)
				.fetch_all(&mut **tx)
				.await
				.map_err(|e| Error::from(DbError::from(e)))?;
		if rows.len() <= 1 {
			return Ok(());
		}

		let mut decoded = Vec::with_capacity(rows.len());
		for (index, (update,)) in rows.iter().enumerate() {
			match Update::decode_v1(update) {
				Ok(update) => decoded.push(update),
				Err(err) => {
					warn!(path = %self.doc_path, index, "skipping corrupted update: {}", err);
				}
			}
		}
		if decoded.is_empty() {
			return Ok(());
		}
		let squashed = Update::merge_updates(decoded).encode_v1();

		sqlx::query("DELETE FROM yupdates WHERE path = ?")
			.bind(&self.doc_path)
			.execute(&mut **tx)
			.await
			.map_err(|e| Error::from(DbError::from(e)))?;
		sqlx::query("INSERT INTO yupdates VALUES (?, ?, ?, ?)")
			.bind(&self.doc_path)
			.bind(squashed.as_slice())
			.bind(&b""[..])
			.bind(timestamp)
			.execute(&mut **tx)
			.await
			.map_err(|e| Error::from(DbError::from(e)))?;
		debug!(path = %self.doc_path, rows = rows.len(), "squashed document history");
		Ok(())
	}
}

#[async_trait]
impl YStore for SqliteYStore {
	async fn write(&self, update: &[u8], metadata: &[u8]) -> YrResult<()> {
		let mut inner = self.inner.lock().await;
		if inner.closed {
			return Err(Error::StoreClosed);
		}
		let timestamp = now_timestamp().max(inner.last_timestamp);

		let mut tx =
			self.pool.begin().await.map_err(|e| Error::from(DbError::from(e)))?;

		if let Some(ttl) = self.document_ttl {
			let newest: Option<f64> = sqlx::query_scalar(
				"SELECT timestamp FROM yupdates WHERE path = ? ORDER BY rowid DESC LIMIT 1",
			)
			.bind(&self.doc_path)
			.fetch_optional(&mut *tx)
			.await
			.map_err(|e| Error::from(DbError::from(e)))?;
			if let Some(newest) = newest {
				if timestamp - newest > ttl.as_secs_f64() {
					self.squash_history(&mut tx, timestamp).await?;
				}
			}
		}

		sqlx::query("INSERT INTO yupdates VALUES (?, ?, ?, ?)")
			.bind(&self.doc_path)
			.bind(update)
			.bind(metadata)
			.bind(timestamp)
			.execute(&mut *tx)
			.await
			.map_err(|e| Error::from(DbError::from(e)))?;
		tx.commit().await.map_err(|e| Error::from(DbError::from(e)))?;

		inner.last_timestamp = timestamp;
		Ok(())
	}

	async fn read(&self) -> YrResult<RecordStream> {
		{
			let inner = self.inner.lock().await;
			if inner.closed {
				return Err(Error::StoreClosed);
			}
		}
		let rows: Vec<(Vec<u8>, Vec<u8>, f64)> = sqlx::query_as(
			"SELECT yupdate, metadata, timestamp FROM yupdates WHERE path = ? ORDER BY rowid",
		)
		.bind(&self.doc_path)
		.fetch_all(&self.pool)
		.await
		.map_err(|e| Error::from(DbError::from(e)))?;
		if rows.is_empty() {
			return Err(Error::DocNotFound);
		}
		let records = rows
			.into_iter()
			.map(|(update, metadata, timestamp)| Ok(StoreRecord { update, metadata, timestamp }));
		Ok(Box::pin(stream::iter(records)))
	}

	async fn squash(&self, update: &[u8]) -> YrResult<()> {
		let mut inner = self.inner.lock().await;
		if inner.closed {
			return Err(Error::StoreClosed);
		}
		let timestamp = now_timestamp().max(inner.last_timestamp);

		let mut tx =
			self.pool.begin().await.map_err(|e| Error::from(DbError::from(e)))?;
		sqlx::query("DELETE FROM yupdates WHERE path = ?")
			.bind(&self.doc_path)
			.execute(&mut *tx)
			.await
			.map_err(|e| Error::from(DbError::from(e)))?;
		sqlx::query("INSERT INTO yupdates VALUES (?, ?, ?, ?)")
			.bind(&self.doc_path)
			.bind(update)
			.bind(&b""[..])
			.bind(timestamp)
			.execute(&mut *tx)
			.await
			.map_err(|e| Error::from(DbError::from(e)))?;
		tx.commit().await.map_err(|e| Error::from(DbError::from(e)))?;

		inner.last_timestamp = timestamp;
		Ok(())
	}

	async fn close(&self) -> YrResult<()> {
		self.inner.lock().await.closed = true;
		self.pool.close().await;
		Ok(())
	}
}

fn now_timestamp() -> f64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or_default()
}

// vim: ts=4
