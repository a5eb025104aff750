//! Ephemeral per-client presence state (cursors, names, selections),
//! carried out-of-band from the document itself.
//!
//! Each client owns one JSON state guarded by a monotonically
//! increasing clock: entries with a lower-or-equal clock are stale and
//! discarded, a `null` state announces departure. Entries that stop
//! being refreshed expire after a TTL and are re-announced as `null`
//! so peers converge on the departure.
//!
//! Wire payload (inside an awareness frame's byte string):
//! `varint(n)` then `n` entries of
//! `varint(client_id) | varint(clock) | varint(len(json)) | json`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::codec::{write_var_buf, write_var_uint, Decoder, YMessage};
use crate::prelude::*;

const NULL_STATE: &[u8] = b"null";

/// One client's entry in an awareness payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
	pub client_id: u64,
	pub clock: u32,
	/// `None` announces departure.
	pub state: Option<Value>,
}

/// A decoded awareness payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
	pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
	pub fn decode(payload: &[u8]) -> YrResult<Self> {
		let mut decoder = Decoder::new(payload);
		let count = decoder.read_var_uint()?;
		let mut entries = Vec::with_capacity(count.min(1024) as usize);
		for _ in 0..count {
			let client_id = decoder.read_var_uint()?;
			let clock = u32::try_from(decoder.read_var_uint()?).map_err(|_| Error::Decode)?;
			let json = decoder.read_var_buf()?;
			let value: Value = serde_json::from_slice(json)?;
			let state = if value.is_null() { None } else { Some(value) };
			entries.push(AwarenessEntry { client_id, clock, state });
		}
		Ok(Self { entries })
	}

	/// Encode as a complete awareness frame, ready to send.
	pub fn encode_frame(&self) -> Vec<u8> {
		let mut payload = Vec::with_capacity(16 * self.entries.len() + 4);
		write_var_uint(&mut payload, self.entries.len() as u64);
		for entry in &self.entries {
			write_var_uint(&mut payload, entry.client_id);
			write_var_uint(&mut payload, u64::from(entry.clock));
			match &entry.state {
				Some(value) => {
					// serializing a serde_json::Value cannot fail
					let json = serde_json::to_vec(value).unwrap_or_else(|_| NULL_STATE.to_vec());
					write_var_buf(&mut payload, &json);
				}
				None => write_var_buf(&mut payload, NULL_STATE),
			}
		}
		YMessage::Awareness(payload).encode()
	}
}

#[derive(Debug, Clone)]
struct PeerState {
	clock: u32,
	state: Option<Value>,
	last_updated: Instant,
}

/// Which clients an applied awareness payload touched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
	pub added: Vec<u64>,
	pub updated: Vec<u64>,
	pub removed: Vec<u64>,
}

impl AwarenessChange {
	pub fn is_empty(&self) -> bool {
		self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
	}
}

/// In-memory registry of per-client ephemeral state.
///
/// The local client is always present in its own map under its stable
/// id; remote entries live until overwritten, announced departed, or
/// expired.
#[derive(Debug)]
pub struct Awareness {
	client_id: u64,
	states: HashMap<u64, PeerState>,
}

impl Awareness {
	pub fn new(client_id: u64) -> Self {
		let mut states = HashMap::new();
		states.insert(client_id, PeerState { clock: 0, state: None, last_updated: Instant::now() });
		Self { client_id, states }
	}

	pub fn client_id(&self) -> u64 {
		self.client_id
	}

	pub fn local_state(&self) -> Option<&Value> {
		self.states.get(&self.client_id).and_then(|peer| peer.state.as_ref())
	}

	/// All currently known non-departed states.
	pub fn states(&self) -> impl Iterator<Item = (u64, &Value)> {
		self.states
			.iter()
			.filter_map(|(id, peer)| peer.state.as_ref().map(|state| (*id, state)))
	}

	/// Atomically bump the local clock and store the new state
	/// (`None` announces departure). Returns the frame to broadcast.
	pub fn set_local_state(&mut self, state: Option<Value>) -> Vec<u8> {
		let clock = self.states.get(&self.client_id).map(|peer| peer.clock).unwrap_or(0) + 1;
		self.states.insert(
			self.client_id,
			PeerState { clock, state: state.clone(), last_updated: Instant::now() },
		);
		AwarenessUpdate { entries: vec![AwarenessEntry { client_id: self.client_id, clock, state }] }
			.encode_frame()
	}

	/// Merge a received awareness payload. Strictly greater clocks win;
	/// a winning `null` state removes the entry; stale entries are
	/// ignored.
	pub fn apply_update(&mut self, payload: &[u8]) -> YrResult<AwarenessChange> {
		let update = AwarenessUpdate::decode(payload)?;
		let mut change = AwarenessChange::default();
		let now = Instant::now();
		for entry in update.entries {
			match self.states.get(&entry.client_id) {
				Some(current) if entry.clock <= current.clock => continue,
				Some(_) => match entry.state {
					Some(state) => {
						self.states.insert(
							entry.client_id,
							PeerState { clock: entry.clock, state: Some(state), last_updated: now },
						);
						change.updated.push(entry.client_id);
					}
					None => {
						self.states.remove(&entry.client_id);
						change.removed.push(entry.client_id);
					}
				},
				None => {
					if let Some(state) = entry.state {
						self.states.insert(
							entry.client_id,
							PeerState { clock: entry.clock, state: Some(state), last_updated: now },
						);
						change.added.push(entry.client_id);
					}
				}
			}
		}
		Ok(change)
	}

	/// Encode the whole registry as one awareness frame.
	pub fn encode_full(&self) -> Vec<u8> {
		let entries = self
			.states
			.iter()
			.map(|(id, peer)| AwarenessEntry {
				client_id: *id,
				clock: peer.clock,
				state: peer.state.clone(),
			})
			.collect();
		AwarenessUpdate { entries }.encode_frame()
	}

	/// Drop remote entries not refreshed within `ttl`. Returns a
	/// departure frame (`state = null`, bumped clock) to re-broadcast
	/// so peers converge, or `None` when nothing expired.
	pub fn expire(&mut self, ttl: Duration) -> Option<Vec<u8>> {
		let local_id = self.client_id;
		let expired: Vec<(u64, u32)> = self
			.states
			.iter()
			.filter(|(id, peer)| **id != local_id && peer.last_updated.elapsed() > ttl)
			.map(|(id, peer)| (*id, peer.clock))
			.collect();
		if expired.is_empty() {
			return None;
		}
		let mut entries = Vec::with_capacity(expired.len());
		for (id, clock) in expired {
			self.states.remove(&id);
			entries.push(AwarenessEntry { client_id: id, clock: clock + 1, state: None });
		}
		Some(AwarenessUpdate { entries }.encode_frame())
	}
}


// vim: ts=4
