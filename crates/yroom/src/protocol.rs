//! The symmetric sync handshake over an opaque document replica.
//!
//! Both endpoints speak the same three-message protocol: on open each
//! side sends `SyncStep1` with its state vector, answers a received
//! `SyncStep1` with a `SyncStep2` diff, and applies `SyncStep2`/`Update`
//! payloads as they arrive. A peer considers itself synced after its
//! first `SyncStep2`.
//!
//! The document is used strictly through four capabilities: state
//! vector encoding, diff encoding, update application, and update
//! observation. Nothing here assumes anything about its internals.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::codec::{YMessage, YSyncMessage};
use crate::prelude::*;

/// Canonical encoding of an update that carries no structs and no
/// deletions. Applying it never advances a replica.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// True for updates whose application is a semantic no-op. These are
/// filtered at the sender: never transmitted and never persisted.
pub fn is_empty_update(update: &[u8]) -> bool {
	update.is_empty() || update == EMPTY_UPDATE
}

/// Encode the document's state vector.
pub fn state_vector(doc: &Doc) -> Vec<u8> {
	doc.transact().state_vector().encode_v1()
}

/// Encode a minimal update bringing a peer at `remote_state_vector` up
/// to this document's state.
pub fn encode_diff(doc: &Doc, remote_state_vector: &[u8]) -> YrResult<Vec<u8>> {
	let sv = StateVector::decode_v1(remote_state_vector)?;
	Ok(doc.transact().encode_diff_v1(&sv))
}

/// Merge an update into the document. Idempotent and commutative, so
/// replays and reorderings across reconnects are safe.
pub fn apply_update(doc: &Doc, update: &[u8]) -> YrResult<()> {
	let update = Update::decode_v1(update)?;
	doc.transact_mut().apply_update(update)?;
	Ok(())
}

/// The frame each endpoint sends on connection open.
pub fn sync_step1(doc: &Doc) -> Vec<u8> {
	YMessage::Sync(YSyncMessage::SyncStep1(state_vector(doc))).encode()
}

/// Reply to a received `SyncStep1`.
pub fn sync_step2(doc: &Doc, remote_state_vector: &[u8]) -> YrResult<Vec<u8>> {
	let diff = encode_diff(doc, remote_state_vector)?;
	Ok(YMessage::Sync(YSyncMessage::SyncStep2(diff)).encode())
}

/// Wrap update bytes into a broadcastable frame.
pub fn update_message(update: Vec<u8>) -> Vec<u8> {
	YMessage::Sync(YSyncMessage::Update(update)).encode()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
	use super::*;
	use yrs::{GetString, Text};

	#[test]
	fn empty_update_detection() {
		assert!(is_empty_update(&[]));
		assert!(is_empty_update(&[0, 0]));
		assert!(!is_empty_update(&[0, 0, 0]));

		// a doc with no changes diffs to the canonical empty update
		let doc = Doc::new();
		let diff = encode_diff(&doc, &state_vector(&Doc::new())).unwrap();
		assert!(is_empty_update(&diff));
	}

	#[test]
	fn handshake_converges_both_ways() {
		let a = Doc::new();
		let b = Doc::new();
		{
			let text = a.get_or_insert_text("t");
			text.insert(&mut a.transact_mut(), 0, "from a");
		}
		{
			let text = b.get_or_insert_text("u");
			text.insert(&mut b.transact_mut(), 0, "from b");
		}

		// a -> b: step1; b -> a: step2 + its own step1; a -> b: step2
		let diff_for_b = encode_diff(&a, &state_vector(&b)).unwrap();
		let diff_for_a = encode_diff(&b, &state_vector(&a)).unwrap();
		apply_update(&b, &diff_for_b).unwrap();
		apply_update(&a, &diff_for_a).unwrap();

		let text_a = a.get_or_insert_text("u");
		let text_b = b.get_or_insert_text("t");
		assert_eq!(text_a.get_string(&a.transact()), "from b");
		assert_eq!(text_b.get_string(&b.transact()), "from a");
	}

	#[test]
	fn apply_is_idempotent() {
		let a = Doc::new();
		{
			let text = a.get_or_insert_text("t");
			text.insert(&mut a.transact_mut(), 0, "abc");
		}
		let update = encode_diff(&a, &state_vector(&Doc::new())).unwrap();

		let b = Doc::new();
		apply_update(&b, &update).unwrap();
		apply_update(&b, &update).unwrap();
		let text = b.get_or_insert_text("t");
		assert_eq!(text.get_string(&b.transact()), "abc");
	}

	#[test]
	fn corrupted_update_is_rejected() {
		let doc = Doc::new();
		assert!(apply_update(&doc, &[0xFF, 0x01, 0x02]).is_err());
	}
}

// vim: ts=4
