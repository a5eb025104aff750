//! The framed byte-message duplex the broker consumes, plus adapters
//! for the transports it ships with.
//!
//! The contract is deliberately small: a connection has a `path` (the
//! room key), a send half and a receive half whose stream ends when the
//! connection closes for any reason. Adapters contribute no protocol
//! logic:
//! - [`Websocket::from_axum`] wraps an accepted `axum` socket (server)
//! - [`Websocket::connect`] dials out via `tokio-tungstenite` (client)
//! - [`Websocket::memory_pair`] builds an in-process loopback pair

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::prelude::*;
use crate::server::WebsocketServer;

/// Send half of a connection.
#[async_trait]
pub trait WebsocketWriter: Send + 'static {
	/// Enqueue one binary frame; may suspend.
	async fn send(&mut self, frame: Vec<u8>) -> YrResult<()>;
}

/// Receive half of a connection.
#[async_trait]
pub trait WebsocketReader: Send + 'static {
	/// Next binary frame, or `None` once the connection is closed.
	/// Transport errors translate into end-of-stream.
	async fn recv(&mut self) -> Option<Vec<u8>>;
}

/// A connected, path-addressed byte-message duplex.
pub struct Websocket {
	path: String,
	writer: Box<dyn WebsocketWriter>,
	reader: Box<dyn WebsocketReader>,
}

impl Websocket {
	pub fn new(
		path: impl Into<String>,
		writer: Box<dyn WebsocketWriter>,
		reader: Box<dyn WebsocketReader>,
	) -> Self {
		Self { path: path.into(), writer, reader }
	}

	/// The connection path, used as the room key.
	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn into_split(self) -> (Box<dyn WebsocketWriter>, Box<dyn WebsocketReader>) {
		(self.writer, self.reader)
	}

	pub async fn send(&mut self, frame: Vec<u8>) -> YrResult<()> {
		self.writer.send(frame).await
	}

	pub async fn recv(&mut self) -> Option<Vec<u8>> {
		self.reader.recv().await
	}

	/// Wrap an accepted axum WebSocket.
	pub fn from_axum(path: impl Into<String>, socket: WebSocket) -> Self {
		let (sink, stream) = socket.split();
		Self::new(path, Box::new(AxumWriter { sink }), Box::new(AxumReader { stream }))
	}

	/// Dial a `ws://`/`wss://` URL; the URL path becomes the room key.
	pub async fn connect(url: &str) -> YrResult<Self> {
		let request = url.into_client_request().map_err(|err| {
			warn!("invalid websocket url {}: {}", url, err);
			Error::TransportClosed
		})?;
		let path = request.uri().path().trim_start_matches('/').to_string();
		let (socket, _response) = connect_async(request).await.map_err(|err| {
			warn!("websocket connect to {} failed: {}", url, err);
			Error::TransportClosed
		})?;
		let (sink, stream) = socket.split();
		Ok(Self::new(
			path,
			Box::new(TungsteniteWriter { sink }),
			Box::new(TungsteniteReader { stream }),
		))
	}

	/// An in-process pair of connected endpoints sharing `path`.
	/// The broker sees no difference from a network socket.
	pub fn memory_pair(path: &str) -> (Websocket, Websocket) {
		let (tx_a, rx_b) = mpsc::channel(256);
		let (tx_b, rx_a) = mpsc::channel(256);
		let a = Websocket::new(
			path,
			Box::new(ChannelWriter { tx: tx_a }),
			Box::new(ChannelReader { rx: rx_a }),
		);
		let b = Websocket::new(
			path,
			Box::new(ChannelWriter { tx: tx_b }),
			Box::new(ChannelReader { rx: rx_b }),
		);
		(a, b)
	}
}

struct AxumWriter {
	sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl WebsocketWriter for AxumWriter {
	async fn send(&mut self, frame: Vec<u8>) -> YrResult<()> {
		self.sink
			.send(Message::Binary(frame.into()))
			.await
			.map_err(|_| Error::TransportClosed)
	}
}

struct AxumReader {
	stream: SplitStream<WebSocket>,
}

#[async_trait]
impl WebsocketReader for AxumReader {
	async fn recv(&mut self) -> Option<Vec<u8>> {
		while let Some(msg) = self.stream.next().await {
			match msg {
				Ok(Message::Binary(data)) => return Some(data.to_vec()),
				Ok(Message::Close(_)) => return None,
				// control frames and stray text are not protocol traffic
				Ok(_) => continue,
				Err(_) => return None,
			}
		}
		None
	}
}

type TungsteniteSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TungsteniteWriter {
	sink: SplitSink<TungsteniteSocket, TungsteniteMessage>,
}

#[async_trait]
impl WebsocketWriter for TungsteniteWriter {
	async fn send(&mut self, frame: Vec<u8>) -> YrResult<()> {
		self.sink
			.send(TungsteniteMessage::Binary(frame))
			.await
			.map_err(|_| Error::TransportClosed)
	}
}

struct TungsteniteReader {
	stream: SplitStream<TungsteniteSocket>,
}

#[async_trait]
impl WebsocketReader for TungsteniteReader {
	async fn recv(&mut self) -> Option<Vec<u8>> {
		while let Some(msg) = self.stream.next().await {
			match msg {
				Ok(TungsteniteMessage::Binary(data)) => return Some(data),
				Ok(TungsteniteMessage::Close(_)) => return None,
				Ok(_) => continue,
				Err(_) => return None,
			}
		}
		None
	}
}

struct ChannelWriter {
	tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl WebsocketWriter for ChannelWriter {
	async fn send(&mut self, frame: Vec<u8>) -> YrResult<()> {
		self.tx.send(frame).await.map_err(|_| Error::TransportClosed)
	}
}

struct ChannelReader {
	rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl WebsocketReader for ChannelReader {
	async fn recv(&mut self) -> Option<Vec<u8>> {
		self.rx.recv().await
	}
}

/// WebSocket upgrade handler routing every path to the broker.
pub async fn get_ws(
	ws: WebSocketUpgrade,
	Path(room): Path<String>,
	State(server): State<Arc<WebsocketServer>>,
) -> Response {
	debug!(room = %room, "websocket upgrade request");
	ws.on_upgrade(move |socket| async move {
		let websocket = Websocket::from_axum(room, socket);
		if let Err(err) = server.serve(websocket).await {
			warn!("connection ended: {}", err);
		}
	})
}

/// An axum router exposing the broker under `/{room}` for any room path.
pub fn router(server: Arc<WebsocketServer>) -> Router {
	Router::new().route("/{*room}", get(get_ws)).with_state(server)
}

// vim: ts=4
