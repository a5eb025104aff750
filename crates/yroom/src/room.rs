//! Server-side room: one shared document replica, its awareness
//! registry, the set of connected clients, and the serialized update
//! pipeline (ingest, apply, persist, broadcast).
//!
//! Concurrency model: every client frame goes through one bounded
//! ingest channel drained by a single task, so document applies observe
//! a total order, and that order is the broadcast order. Fan-out goes
//! through per-client bounded queues; a queue overflow disconnects that
//! client instead of slowing the room. No lock is held across a
//! network await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use yrs::Doc;

use crate::awareness::Awareness;
use crate::codec::{YMessage, YSyncMessage};
use crate::prelude::*;
use crate::protocol;
use crate::ystore::YStore;

/// Ingest channel capacity; clients pushing faster than the room can
/// apply are backpressured at their socket.
const INGEST_QUEUE: usize = 65536;

/// Sentinel in the origin slot while no client apply is in progress.
const NO_ORIGIN: u64 = u64::MAX;

pub(crate) struct IngestFrame {
	pub origin: u64,
	pub data: Vec<u8>,
}

struct ClientHandle {
	queue: mpsc::Sender<Vec<u8>>,
	gone: Arc<Notify>,
}

/// A named room owning the authoritative document replica.
///
/// Rooms are created lazily by the server on first connection for a
/// path and live until the server shuts down (unless room auto-clean
/// is configured).
pub struct YRoom {
	name: String,
	doc: Doc,
	awareness: Mutex<Awareness>,
	clients: RwLock<HashMap<u64, ClientHandle>>,
	store: Mutex<Option<Arc<dyn YStore>>>,
	ingest_tx: mpsc::Sender<IngestFrame>,
	ready: watch::Sender<bool>,
	closed: watch::Sender<bool>,
	/// Client id whose update is being applied on the ingest task;
	/// read by the document observer to attribute emissions.
	origin_slot: Arc<AtomicU64>,
}

impl YRoom {
	/// Create the room and start its ingest task. If a store is
	/// attached, the persisted history is replayed into the document
	/// before any client frame is consumed (the ready gate).
	pub fn new(name: impl Into<String>, store: Option<Arc<dyn YStore>>) -> Arc<Self> {
		let name = name.into();
		let doc = Doc::new();
		let awareness = Mutex::new(Awareness::new(doc.client_id()));
		let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_QUEUE);
		let (ready, _) = watch::channel(false);
		let (closed, _) = watch::channel(false);
		let room = Arc::new(Self {
			name,
			doc,
			awareness,
			clients: RwLock::new(HashMap::new()),
			store: Mutex::new(store),
			ingest_tx,
			ready,
			closed,
			origin_slot: Arc::new(AtomicU64::new(NO_ORIGIN)),
		});
		tokio::spawn(Self::run(room.clone(), ingest_rx));
		room
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// The room's shared document replica. Mutate it only through the
	/// sync pipeline; direct reads are fine.
	pub fn doc(&self) -> &Doc {
		&self.doc
	}

	pub fn awareness(&self) -> &Mutex<Awareness> {
		&self.awareness
	}

	/// Resolves once stored history has been replayed and the room
	/// accepts traffic.
	pub async fn started(&self) {
		let mut ready = self.ready.subscribe();
		while !*ready.borrow_and_update() {
			if ready.changed().await.is_err() {
				return;
			}
		}
	}

	pub async fn client_count(&self) -> usize {
		self.clients.read().await.len()
	}

	/// Register a client. Returns the receive side of its outbound
	/// queue and a notifier fired if the room evicts the client.
	pub(crate) async fn add_client(
		&self,
		client_id: u64,
		queue_capacity: usize,
	) -> (mpsc::Receiver<Vec<u8>>, Arc<Notify>) {
		let (tx, rx) = mpsc::channel(queue_capacity);
		let gone = Arc::new(Notify::new());
		let handle = ClientHandle { queue: tx, gone: gone.clone() };
		self.clients.write().await.insert(client_id, handle);
		(rx, gone)
	}

	pub(crate) async fn remove_client(&self, client_id: u64) {
		if let Some(client) = self.clients.write().await.remove(&client_id) {
			client.gone.notify_one();
		}
	}

	/// Feed one raw frame from a client into the serialized pipeline.
	pub(crate) async fn ingest(&self, origin: u64, data: Vec<u8>) {
		if *self.closed.borrow() {
			return;
		}
		let _ = self.ingest_tx.send(IngestFrame { origin, data }).await;
	}

	/// Drop awareness entries older than `ttl` and announce the
	/// departures to every client.
	pub(crate) async fn expire_awareness(&self, ttl: Duration) {
		let frame = self.awareness.lock().await.expire(ttl);
		if let Some(frame) = frame {
			debug!(room = %self.name, "broadcasting awareness expiry");
			self.broadcast(frame, None).await;
		}
	}

	/// Stop the ingest task and close the attached store.
	pub async fn close(&self) {
		let _ = self.closed.send(true);
		if let Some(store) = self.store.lock().await.take() {
			if let Err(err) = store.close().await {
				warn!(room = %self.name, "store close failed: {}", err);
			}
		}
	}

	async fn run(room: Arc<YRoom>, mut ingest_rx: mpsc::Receiver<IngestFrame>) {
		room.replay_store().await;

		// post-commit updates surface here, tagged with the client id
		// read from the origin slot at emission time
		let (update_tx, mut update_rx) = mpsc::unbounded_channel::<(Option<u64>, Vec<u8>)>();
		let origin_slot = room.origin_slot.clone();
		let _doc_sub = match room.doc.observe_update_v1(move |_txn, event| {
			let origin = match origin_slot.load(Ordering::Relaxed) {
				NO_ORIGIN => None,
				id => Some(id),
			};
			let _ = update_tx.send((origin, event.update.clone()));
		}) {
			Ok(sub) => Some(sub),
			Err(err) => {
				warn!(room = %room.name, "failed to observe document updates: {}", err);
				None
			}
		};

		let _ = room.ready.send(true);
		info!(room = %room.name, "room ready");

		let mut closed = room.closed.subscribe();
		loop {
			tokio::select! {
				_ = closed.changed() => break,
				frame = ingest_rx.recv() => match frame {
					Some(frame) => room.handle_frame(frame, &mut update_rx).await,
					None => break,
				},
				emitted = update_rx.recv() => match emitted {
					// out-of-band emission (e.g. backend edit): no originator
					Some((origin, update)) => room.commit_update(origin, update).await,
					None => break,
				},
			}
		}
		debug!(room = %room.name, "room stopped");
	}

	async fn replay_store(&self) {
		let store = self.store.lock().await.clone();
		let Some(store) = store else { return };
		match store.apply_updates(&self.doc).await {
			Ok(count) => info!(room = %self.name, updates = count, "replayed stored history"),
			Err(Error::DocNotFound) => debug!(room = %self.name, "no stored history"),
			Err(err) => {
				warn!(room = %self.name, "history replay failed, detaching store: {}", err);
				*self.store.lock().await = None;
			}
		}
	}

	async fn handle_frame(
		&self,
		frame: IngestFrame,
		update_rx: &mut mpsc::UnboundedReceiver<(Option<u64>, Vec<u8>)>,
	) {
		match YMessage::decode(&frame.data) {
			Ok(YMessage::Sync(msg)) => self.handle_sync(frame.origin, msg, update_rx).await,
			Ok(YMessage::Awareness(payload)) => {
				let applied = self.awareness.lock().await.apply_update(&payload);
				match applied {
					Ok(_change) => {
						// relay verbatim; the room never rewrites awareness payloads
						self.broadcast(frame.data, Some(frame.origin)).await;
					}
					Err(err) => {
						warn!(room = %self.name, client = frame.origin, "dropping awareness frame: {}", err);
					}
				}
			}
			Ok(YMessage::Unknown(tag)) => {
				debug!(room = %self.name, client = frame.origin, tag, "ignoring unknown message tag");
			}
			Err(err) => {
				warn!(room = %self.name, client = frame.origin, "dropping malformed frame: {}", err);
			}
		}
	}

	async fn handle_sync(
		&self,
		origin: u64,
		msg: YSyncMessage,
		update_rx: &mut mpsc::UnboundedReceiver<(Option<u64>, Vec<u8>)>,
	) {
		match msg {
			YSyncMessage::SyncStep1(state_vector) => {
				debug!(room = %self.name, client = origin, "sync step 1");
				match protocol::sync_step2(&self.doc, &state_vector) {
					Ok(reply) => {
						self.send_to(origin, reply).await;
						// also request the client's missing updates, so the
						// first round-trip converges in both directions
						self.send_to(origin, protocol::sync_step1(&self.doc)).await;
					}
					Err(err) => {
						warn!(room = %self.name, client = origin, "dropping sync step 1: {}", err);
					}
				}
			}
			YSyncMessage::SyncStep2(update) | YSyncMessage::Update(update) => {
				if protocol::is_empty_update(&update) {
					debug!(room = %self.name, client = origin, "filtered empty update");
					return;
				}
				self.origin_slot.store(origin, Ordering::Relaxed);
				let applied = protocol::apply_update(&self.doc, &update);
				self.origin_slot.store(NO_ORIGIN, Ordering::Relaxed);
				match applied {
					Ok(()) => {
						// emissions from this apply are already queued
						while let Ok((origin, update)) = update_rx.try_recv() {
							self.commit_update(origin, update).await;
						}
					}
					Err(err) => {
						warn!(room = %self.name, client = origin, "document rejected update: {}", err);
					}
				}
			}
		}
	}

	/// Persist one committed update, then fan it out to every client
	/// except the originator.
	async fn commit_update(&self, origin: Option<u64>, update: Vec<u8>) {
		if protocol::is_empty_update(&update) {
			return;
		}
		let store = self.store.lock().await.clone();
		if let Some(store) = store {
			if let Err(err) = store.write(&update, b"").await {
				warn!(room = %self.name, "store write failed, detaching store: {}", err);
				*self.store.lock().await = None;
			}
		}
		self.broadcast(protocol::update_message(update), origin).await;
	}

	pub(crate) async fn send_to(&self, client_id: u64, frame: Vec<u8>) {
		let overflow = {
			let clients = self.clients.read().await;
			let Some(client) = clients.get(&client_id) else { return };
			matches!(client.queue.try_send(frame), Err(mpsc::error::TrySendError::Full(_)))
		};
		if overflow {
			self.evict(client_id).await;
		}
	}

	async fn broadcast(&self, frame: Vec<u8>, except: Option<u64>) {
		let mut slow = Vec::new();
		{
			let clients = self.clients.read().await;
			for (client_id, client) in clients.iter() {
				if Some(*client_id) == except {
					continue;
				}
				match client.queue.try_send(frame.clone()) {
					Ok(()) => {}
					Err(mpsc::error::TrySendError::Full(_)) => slow.push(*client_id),
					// client is already on its way out
					Err(mpsc::error::TrySendError::Closed(_)) => {}
				}
			}
		}
		for client_id in slow {
			self.evict(client_id).await;
		}
	}

	async fn evict(&self, client_id: u64) {
		warn!(room = %self.name, client = client_id, "{}", Error::SlowConsumer);
		self.remove_client(client_id).await;
	}
}

// vim: ts=4
