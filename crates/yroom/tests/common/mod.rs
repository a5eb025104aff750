//! Shared helpers for broker integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use yroom::error::YrResult;
use yroom::{ServerConfig, Websocket, WebsocketServer};

pub fn test_server(config: ServerConfig) -> Arc<WebsocketServer> {
	Arc::new(WebsocketServer::new(config))
}

/// Connect an in-memory client to the server; the serve loop runs in a
/// background task whose handle is returned for result assertions.
pub fn connect(
	server: &Arc<WebsocketServer>,
	path: &str,
) -> (Websocket, JoinHandle<YrResult<()>>) {
	let (client, server_end) = Websocket::memory_pair(path);
	let server = server.clone();
	let handle = tokio::spawn(async move { server.serve(server_end).await });
	(client, handle)
}

pub async fn recv_timeout(ws: &mut Websocket, millis: u64) -> Option<Vec<u8>> {
	tokio::time::timeout(Duration::from_millis(millis), ws.recv()).await.ok().flatten()
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn eventually<F: Fn() -> bool>(condition: F, millis: u64) -> bool {
	let deadline = tokio::time::Instant::now() + Duration::from_millis(millis);
	loop {
		if condition() {
			return true;
		}
		if tokio::time::Instant::now() >= deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

// vim: ts=4
