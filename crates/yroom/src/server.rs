//! The broker server: connection admission, path-to-room routing, the
//! per-client receive loop, awareness expiry, and shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};

use crate::prelude::*;
use crate::protocol;
use crate::room::YRoom;
use crate::websocket::Websocket;
use crate::ystore::YStore;

/// Per-path store creator consulted when a room is first opened.
/// Returning `None` leaves the room unpersisted.
pub type StoreFactory =
	Arc<dyn Fn(&str) -> Pin<Box<dyn Future<Output = Option<Arc<dyn YStore>>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
	/// Awareness entries not refreshed within this window are expired
	/// and re-announced as departed.
	pub awareness_ttl: Duration,
	/// Bound on each client's outbound queue; overflow disconnects the
	/// client as a slow consumer.
	pub client_queue_capacity: usize,
	/// Delete rooms once their last client leaves. Off by default:
	/// a room kept alive serves full history to late re-joiners.
	pub auto_clean_rooms: bool,
	/// Per-client drain bound during disconnect and shutdown.
	pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			awareness_ttl: Duration::from_secs(30),
			client_queue_capacity: 1024,
			auto_clean_rooms: false,
			shutdown_grace: Duration::from_secs(1),
		}
	}
}

/// WebSocket broker server.
///
/// One instance serves any number of rooms; `serve` is the single
/// entrypoint for accepted connections, whatever transport adapter
/// produced them.
pub struct WebsocketServer {
	config: ServerConfig,
	store_factory: Option<StoreFactory>,
	rooms: RwLock<HashMap<String, Arc<YRoom>>>,
	next_client_id: AtomicU64,
	shutdown: watch::Sender<bool>,
}

impl WebsocketServer {
	pub fn new(config: ServerConfig) -> Self {
		let (shutdown, _) = watch::channel(false);
		Self {
			config,
			store_factory: None,
			rooms: RwLock::new(HashMap::new()),
			next_client_id: AtomicU64::new(1),
			shutdown,
		}
	}

	/// Attach a store factory; rooms created afterwards persist their
	/// history through the store it returns for their path.
	pub fn with_store_factory(mut self, factory: StoreFactory) -> Self {
		self.store_factory = Some(factory);
		self
	}

	pub fn config(&self) -> &ServerConfig {
		&self.config
	}

	/// Get or create the room for `name`.
	pub async fn room(&self, name: &str) -> Arc<YRoom> {
		if let Some(room) = self.rooms.read().await.get(name) {
			return room.clone();
		}
		let mut rooms = self.rooms.write().await;
		// a racing creator may have won the write lock first
		if let Some(room) = rooms.get(name) {
			return room.clone();
		}
		let store = match &self.store_factory {
			Some(factory) => factory(name).await,
			None => None,
		};
		let persisted = store.is_some();
		let room = YRoom::new(name, store);
		rooms.insert(name.to_string(), room.clone());
		drop(rooms);
		self.spawn_awareness_ticker(&room);
		info!(room = name, persisted, "room created");
		room
	}

	/// Stop a room and forget it.
	pub async fn delete_room(&self, name: &str) {
		if let Some(room) = self.rooms.write().await.remove(name) {
			debug!(room = name, "room deleted");
			room.close().await;
		}
	}

	/// Serve one client connection until it disconnects, the server
	/// shuts down, or the room evicts the client.
	pub async fn serve(&self, websocket: Websocket) -> YrResult<()> {
		if *self.shutdown.borrow() {
			return Err(Error::TransportClosed);
		}
		let path = websocket.path().to_string();
		let room = self.room(&path).await;
		room.started().await;

		let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
		info!(room = %path, client = client_id, "client connected");

		let (mut writer, mut reader) = websocket.into_split();
		let (mut queue_rx, gone) =
			room.add_client(client_id, self.config.client_queue_capacity).await;

		// outbound pump: the room enqueues, this task writes in FIFO order
		let mut send_task = tokio::spawn(async move {
			while let Some(frame) = queue_rx.recv().await {
				if writer.send(frame).await.is_err() {
					break;
				}
			}
		});

		// open the handshake from the server side
		room.send_to(client_id, protocol::sync_step1(room.doc())).await;

		let mut shutdown = self.shutdown.subscribe();
		let mut evicted = false;
		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				_ = gone.notified() => {
					evicted = true;
					break;
				}
				frame = reader.recv() => match frame {
					Some(data) => room.ingest(client_id, data).await,
					None => break,
				},
			}
		}

		room.remove_client(client_id).await;
		if tokio::time::timeout(self.config.shutdown_grace, &mut send_task).await.is_err() {
			send_task.abort();
		}
		info!(room = %path, client = client_id, "client disconnected");

		if self.config.auto_clean_rooms && room.client_count().await == 0 {
			self.delete_room(&path).await;
		}

		if evicted {
			return Err(Error::SlowConsumer);
		}
		Ok(())
	}

	/// Stop serving: release all clients under the configured grace
	/// period, then stop every room and close its store.
	pub async fn shutdown(&self) {
		info!("server shutting down");
		let _ = self.shutdown.send(true);
		tokio::time::sleep(self.config.shutdown_grace).await;
		let rooms: Vec<(String, Arc<YRoom>)> = self.rooms.write().await.drain().collect();
		for (name, room) in rooms {
			debug!(room = %name, "stopping room");
			room.close().await;
		}
	}

	fn spawn_awareness_ticker(&self, room: &Arc<YRoom>) {
		let ttl = self.config.awareness_ttl;
		let period = (ttl / 2).max(Duration::from_millis(10));
		let mut shutdown = self.shutdown.subscribe();
		let weak = Arc::downgrade(room);
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(period);
			interval.tick().await;
			loop {
				tokio::select! {
					_ = interval.tick() => {
						let Some(room) = weak.upgrade() else { break };
						room.expire_awareness(ttl).await;
					}
					_ = shutdown.changed() => break,
				}
			}
		});
	}
}

// vim: ts=4
