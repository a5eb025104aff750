//! Client-side provider: binds one local document to one connection,
//! performs the initial synchronization, and mirrors local edits to
//! the wire.
//!
//! The provider does not reconnect; when the transport drops it clears
//! its `synced` signal and stops. Reconnection policy belongs to the
//! caller, which can bind a fresh provider to the same document:
//! update replay across reconnects is safe because applies are
//! idempotent.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use yrs::Doc;

use crate::codec::{YMessage, YSyncMessage};
use crate::prelude::*;
use crate::protocol;
use crate::websocket::{Websocket, WebsocketWriter};

/// Binding of one `(document, websocket)` pair.
pub struct WebsocketProvider {
	synced: watch::Receiver<bool>,
	task: JoinHandle<()>,
	_doc_sub: yrs::Subscription,
}

impl WebsocketProvider {
	/// Start providing: subscribes to the document's post-commit
	/// updates, sends the initial `SyncStep1` and runs the receive
	/// loop until the connection closes.
	pub fn new(doc: Doc, websocket: Websocket) -> YrResult<Self> {
		let (synced_tx, synced) = watch::channel(false);
		let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

		let doc_sub = doc
			.observe_update_v1(move |_txn, event| {
				// local no-op commits are filtered at the sender
				if !protocol::is_empty_update(&event.update) {
					let _ = out_tx.send(protocol::update_message(event.update.clone()));
				}
			})
			.map_err(|err| {
				warn!("failed to observe document updates: {}", err);
				Error::CrdtRejected
			})?;

		let task = tokio::spawn(Self::run(doc.clone(), websocket, out_rx, synced_tx));
		Ok(Self { synced, task, _doc_sub: doc_sub })
	}

	/// Edge-triggered synchronization signal: latched on the first
	/// received `SyncStep2`, cleared when the connection closes.
	pub fn synced(&self) -> watch::Receiver<bool> {
		self.synced.clone()
	}

	/// Resolve once the initial synchronization completed.
	pub async fn wait_synced(&self) {
		let mut synced = self.synced.clone();
		while !*synced.borrow_and_update() {
			if synced.changed().await.is_err() {
				return;
			}
		}
	}

	async fn run(
		doc: Doc,
		websocket: Websocket,
		mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
		synced_tx: watch::Sender<bool>,
	) {
		let path = websocket.path().to_string();
		let (mut writer, mut reader) = websocket.into_split();

		debug!(endpoint = %path, "sending sync step 1");
		if writer.send(protocol::sync_step1(&doc)).await.is_err() {
			return;
		}

		loop {
			tokio::select! {
				frame = out_rx.recv() => match frame {
					Some(frame) => {
						if writer.send(frame).await.is_err() {
							break;
						}
					}
					None => break,
				},
				frame = reader.recv() => match frame {
					Some(data) => {
						Self::process(&doc, &path, &data, &mut writer, &synced_tx).await;
					}
					None => break,
				},
			}
		}

		debug!(endpoint = %path, "connection closed");
		let _ = synced_tx.send(false);
	}

	async fn process(
		doc: &Doc,
		path: &str,
		data: &[u8],
		writer: &mut Box<dyn WebsocketWriter>,
		synced_tx: &watch::Sender<bool>,
	) {
		match YMessage::decode(data) {
			Ok(YMessage::Sync(YSyncMessage::SyncStep1(state_vector))) => {
				debug!(endpoint = %path, "sync step 1 received");
				match protocol::sync_step2(doc, &state_vector) {
					Ok(reply) => {
						let _ = writer.send(reply).await;
					}
					Err(err) => warn!(endpoint = %path, "dropping sync step 1: {}", err),
				}
			}
			Ok(YMessage::Sync(YSyncMessage::SyncStep2(update))) => {
				debug!(endpoint = %path, "sync step 2 received");
				if !protocol::is_empty_update(&update) {
					if let Err(err) = protocol::apply_update(doc, &update) {
						warn!(endpoint = %path, "document rejected update: {}", err);
						return;
					}
				}
				let _ = synced_tx.send(true);
			}
			Ok(YMessage::Sync(YSyncMessage::Update(update))) => {
				if protocol::is_empty_update(&update) {
					return;
				}
				if let Err(err) = protocol::apply_update(doc, &update) {
					warn!(endpoint = %path, "document rejected update: {}", err);
				}
			}
			// presence is tracked by the application, not the provider
			Ok(YMessage::Awareness(_)) => {}
			Ok(YMessage::Unknown(tag)) => {
				debug!(endpoint = %path, tag, "ignoring unknown message tag");
			}
			Err(err) => warn!(endpoint = %path, "dropping malformed frame: {}", err),
		}
	}
}

impl Drop for WebsocketProvider {
	fn drop(&mut self) {
		self.task.abort();
	}
}

// vim: ts=4
