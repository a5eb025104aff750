//! Integration tests for the broker server: admission, the sync
//! handshake, fan-out, awareness relay, and fault confinement.

mod common;

use std::time::Duration;

use serde_json::json;
use yrs::{Doc, GetString, Map, Text, Transact};

use yroom::awareness::{AwarenessEntry, AwarenessUpdate};
use yroom::codec::{YMessage, YSyncMessage};
use yroom::error::Error;
use yroom::{protocol, ServerConfig, WebsocketProvider};

use common::{connect, eventually, recv_timeout, test_server};

/// Full state of a document as one update.
fn full_state(doc: &Doc) -> Vec<u8> {
	protocol::encode_diff(doc, &protocol::state_vector(&Doc::new())).unwrap()
}

#[tokio::test]
async fn two_clients_converge_on_map() {
	let server = test_server(ServerConfig::default());

	let doc_a = Doc::new();
	let (ws_a, _serve_a) = connect(&server, "room-1");
	let _provider_a = WebsocketProvider::new(doc_a.clone(), ws_a).unwrap();
	{
		let map = doc_a.get_or_insert_map("map");
		map.insert(&mut doc_a.transact_mut(), "key", "value");
	}

	// the room has applied A's edit once its replica holds the key
	let room = server.room("room-1").await;
	let room_map = room.doc().get_or_insert_map("map");
	let applied = eventually(|| room_map.get(&room.doc().transact(), "key").is_some(), 2000).await;
	assert!(applied, "room never applied client A's update");

	let doc_b = Doc::new();
	let (ws_b, _serve_b) = connect(&server, "room-1");
	let provider_b = WebsocketProvider::new(doc_b.clone(), ws_b).unwrap();
	tokio::time::timeout(Duration::from_secs(2), provider_b.wait_synced())
		.await
		.expect("client B never synced");

	let map = doc_b.get_or_insert_map("map");
	let value = map.get(&doc_b.transact(), "key").map(|v| v.to_string(&doc_b.transact()));
	assert_eq!(value, Some("value".to_string()));
}

#[tokio::test]
async fn clients_never_receive_their_own_updates() {
	let server = test_server(ServerConfig::default());

	let (mut ws_a, _serve_a) = connect(&server, "room-echo");
	// initial server-side sync step 1
	let first = recv_timeout(&mut ws_a, 1000).await.expect("no initial frame");
	assert!(matches!(
		YMessage::decode(&first).unwrap(),
		YMessage::Sync(YSyncMessage::SyncStep1(_))
	));

	let source = Doc::new();
	{
		let text = source.get_or_insert_text("t");
		text.insert(&mut source.transact_mut(), 0, "hello");
	}
	let update = full_state(&source);
	ws_a.send(protocol::update_message(update)).await.unwrap();

	// the update must reach the room but never echo back to A
	let room = server.room("room-echo").await;
	let text = room.doc().get_or_insert_text("t");
	assert!(eventually(|| text.get_string(&room.doc().transact()) == "hello", 2000).await);
	while let Some(frame) = recv_timeout(&mut ws_a, 200).await {
		let msg = YMessage::decode(&frame).unwrap();
		assert!(
			!matches!(msg, YMessage::Sync(YSyncMessage::Update(_))),
			"client A saw its own update echoed back"
		);
	}
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_connection() {
	let server = test_server(ServerConfig::default());
	let (mut ws, serve) = connect(&server, "room-tolerant");
	let _ = recv_timeout(&mut ws, 1000).await;

	// reserved top-level tag, then a truncated sync frame
	ws.send(vec![0xFE, 1, 2, 3]).await.unwrap();
	ws.send(vec![0]).await.unwrap();

	let source = Doc::new();
	{
		let text = source.get_or_insert_text("t");
		text.insert(&mut source.transact_mut(), 0, "still alive");
	}
	ws.send(protocol::update_message(full_state(&source))).await.unwrap();

	let room = server.room("room-tolerant").await;
	let text = room.doc().get_or_insert_text("t");
	assert!(
		eventually(|| text.get_string(&room.doc().transact()) == "still alive", 2000).await,
		"well-formed update after garbage was not applied"
	);
	assert!(!serve.is_finished(), "server dropped the connection on a malformed frame");
}

#[tokio::test]
async fn empty_updates_are_filtered() {
	let server = test_server(ServerConfig::default());
	let (mut ws_a, _serve_a) = connect(&server, "room-empty");
	let (mut ws_b, _serve_b) = connect(&server, "room-empty");
	let _ = recv_timeout(&mut ws_a, 1000).await;
	let _ = recv_timeout(&mut ws_b, 1000).await;

	ws_a.send(protocol::update_message(vec![])).await.unwrap();
	ws_a.send(protocol::update_message(vec![0, 0])).await.unwrap();

	while let Some(frame) = recv_timeout(&mut ws_b, 300).await {
		let msg = YMessage::decode(&frame).unwrap();
		assert!(
			!matches!(msg, YMessage::Sync(YSyncMessage::Update(_))),
			"empty update was broadcast"
		);
	}
}

#[tokio::test]
async fn slow_consumer_is_disconnected_but_room_survives() {
	let config = ServerConfig {
		client_queue_capacity: 16,
		..ServerConfig::default()
	};
	let server = test_server(config);

	// B connects and then never reads a single frame
	let (ws_b, serve_b) = connect(&server, "room-slow");
	let _stalled = ws_b;

	let doc_a = Doc::new();
	let (ws_a, _serve_a) = connect(&server, "room-slow");
	let provider_a = WebsocketProvider::new(doc_a.clone(), ws_a).unwrap();
	tokio::time::timeout(Duration::from_secs(2), provider_a.wait_synced())
		.await
		.expect("client A never synced");

	for i in 0..400 {
		let text = doc_a.get_or_insert_text("t");
		text.insert(&mut doc_a.transact_mut(), 0, if i % 2 == 0 { "x" } else { "y" });
	}

	let result = tokio::time::timeout(Duration::from_secs(5), serve_b)
		.await
		.expect("stalled client was never evicted")
		.unwrap();
	assert!(matches!(result, Err(Error::SlowConsumer)));

	// the room kept applying A's updates and serves them to a newcomer
	let doc_c = Doc::new();
	let (ws_c, _serve_c) = connect(&server, "room-slow");
	let provider_c = WebsocketProvider::new(doc_c.clone(), ws_c).unwrap();
	tokio::time::timeout(Duration::from_secs(2), provider_c.wait_synced())
		.await
		.expect("client C never synced");
	let text = doc_c.get_or_insert_text("t");
	assert!(eventually(|| text.get_string(&doc_c.transact()).len() == 400, 2000).await);
}

#[tokio::test]
async fn awareness_is_relayed_and_expires_after_ttl() {
	let config = ServerConfig {
		awareness_ttl: Duration::from_millis(300),
		..ServerConfig::default()
	};
	let server = test_server(config);

	let (mut ws_a, _serve_a) = connect(&server, "room-presence");
	let (mut ws_b, _serve_b) = connect(&server, "room-presence");
	let _ = recv_timeout(&mut ws_a, 1000).await;
	let _ = recv_timeout(&mut ws_b, 1000).await;

	let hello = AwarenessUpdate {
		entries: vec![AwarenessEntry {
			client_id: 42,
			clock: 1,
			state: Some(json!({"user": "alice"})),
		}],
	}
	.encode_frame();
	ws_a.send(hello).await.unwrap();

	// B observes alice's presence, relayed verbatim
	let mut seen = false;
	while let Some(frame) = recv_timeout(&mut ws_b, 1000).await {
		if let YMessage::Awareness(payload) = YMessage::decode(&frame).unwrap() {
			let update = AwarenessUpdate::decode(&payload).unwrap();
			if update.entries.iter().any(|e| e.client_id == 42 && e.state.is_some()) {
				seen = true;
				break;
			}
		}
	}
	assert!(seen, "client B never observed alice's presence");

	// A goes away without announcing departure; the TTL sweep tells B
	drop(ws_a);
	let mut departed = false;
	let deadline = tokio::time::Instant::now() + Duration::from_millis(1300);
	while tokio::time::Instant::now() < deadline {
		let Some(frame) = recv_timeout(&mut ws_b, 200).await else { continue };
		if let YMessage::Awareness(payload) = YMessage::decode(&frame).unwrap() {
			let update = AwarenessUpdate::decode(&payload).unwrap();
			if update.entries.iter().any(|e| e.client_id == 42 && e.state.is_none()) {
				departed = true;
				break;
			}
		}
	}
	assert!(departed, "client B never observed alice's departure");
}

#[tokio::test]
async fn server_replies_with_step2_and_its_own_step1() {
	let server = test_server(ServerConfig::default());
	let (mut ws, _serve) = connect(&server, "room-handshake");

	let first = recv_timeout(&mut ws, 1000).await.expect("no initial frame");
	assert!(matches!(
		YMessage::decode(&first).unwrap(),
		YMessage::Sync(YSyncMessage::SyncStep1(_))
	));

	let doc = Doc::new();
	ws.send(protocol::sync_step1(&doc)).await.unwrap();

	let mut got_step2 = false;
	let mut got_step1 = false;
	while let Some(frame) = recv_timeout(&mut ws, 500).await {
		match YMessage::decode(&frame).unwrap() {
			YMessage::Sync(YSyncMessage::SyncStep2(_)) => got_step2 = true,
			YMessage::Sync(YSyncMessage::SyncStep1(_)) => got_step1 = true,
			_ => {}
		}
		if got_step2 && got_step1 {
			break;
		}
	}
	assert!(got_step2, "no sync step 2 reply");
	assert!(got_step1, "no reciprocal sync step 1");
}

#[tokio::test]
async fn auto_clean_rooms_drops_empty_rooms() {
	let config = ServerConfig { auto_clean_rooms: true, ..ServerConfig::default() };
	let server = test_server(config);

	let (ws, serve) = connect(&server, "room-transient");
	let room = server.room("room-transient").await;
	drop(ws);
	// serve finishes its cleanup (including room deletion) before returning
	tokio::time::timeout(Duration::from_secs(2), serve)
		.await
		.expect("serve loop never returned")
		.unwrap()
		.unwrap();

	let room2 = server.room("room-transient").await;
	assert!(
		!std::sync::Arc::ptr_eq(&room, &room2),
		"room was not cleaned after its last client left"
	);
}
