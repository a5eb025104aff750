//! Update store contract: pluggable append-only persistence for
//! document histories.
//!
//! A store holds one document's updates in append order, each record
//! carrying opaque update bytes, caller-attached metadata bytes and a
//! wall-clock timestamp. Backends are provided by adapter crates
//! (file, temp-file, SQLite); the broker only consumes this trait.

use std::pin::Pin;

use async_trait::async_trait;
use futures::StreamExt;
use futures_core::Stream;
use yrs::{Doc, ReadTxn, StateVector, Transact};

use crate::prelude::*;
use crate::protocol;

/// Version written into every store header. Opening a store persisted
/// with a different version fails with [`Error::StoreVersionMismatch`].
pub const STORE_VERSION: u32 = 0;

/// One persisted update.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
	/// Opaque CRDT update payload.
	pub update: Vec<u8>,
	/// Caller-attached metadata (e.g. an author id); may be empty.
	pub metadata: Vec<u8>,
	/// Seconds since epoch at append time; non-decreasing within a store.
	pub timestamp: f64,
}

pub type RecordStream = Pin<Box<dyn Stream<Item = YrResult<StoreRecord>> + Send>>;

/// Append-only log of updates for one document.
///
/// `write` calls are serialized by the implementation; their completion
/// order is the persisted order. `read` produces records in append
/// order and, concurrently with writers, sees a prefix consistent with
/// some write-linearization point.
#[async_trait]
pub trait YStore: Send + Sync {
	/// Append one record, stamped with the current time.
	async fn write(&self, update: &[u8], metadata: &[u8]) -> YrResult<()>;

	/// Restartable read-back of the full history in append order.
	async fn read(&self) -> YrResult<RecordStream>;

	/// Atomically replace the whole history with a single record
	/// holding `update`, which must be semantically equivalent to the
	/// concatenation of all prior updates.
	async fn squash(&self, update: &[u8]) -> YrResult<()>;

	/// End the store lifecycle. Later operations fail with
	/// [`Error::StoreClosed`].
	async fn close(&self) -> YrResult<()>;

	/// Persist a document's full current state as one record.
	async fn encode_state_as_update(&self, doc: &Doc) -> YrResult<()> {
		let update = doc.transact().encode_diff_v1(&StateVector::default());
		self.write(&update, b"").await
	}

	/// Replay the whole history into a document. Corrupted records are
	/// skipped with a warning rather than aborting the replay. Returns
	/// the number of applied updates.
	async fn apply_updates(&self, doc: &Doc) -> YrResult<usize> {
		let mut records = self.read().await?;
		let mut applied = 0;
		while let Some(record) = records.next().await {
			let record = record?;
			match protocol::apply_update(doc, &record.update) {
				Ok(()) => applied += 1,
				Err(err) => {
					warn!("skipping corrupted stored update ({} bytes): {}", record.update.len(), err);
				}
			}
		}
		Ok(applied)
	}
}

// vim: ts=4
