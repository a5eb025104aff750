use std::sync::Arc;
use std::{env, path};

use tracing::{info, warn};

use yroom::websocket;
use yroom::ystore::YStore;
use yroom::{ServerConfig, WebsocketServer};
use yroom_ystore_fs::FileYStore;

pub struct Config {
	pub data_dir: path::PathBuf,
	pub listen: String,
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt::init();

	let config = Config {
		data_dir: path::PathBuf::from(env::var("DATA_DIR").unwrap_or("./data".to_string())),
		listen: env::var("LISTEN").unwrap_or("127.0.0.1:8800".to_string()),
	};

	let data_dir = config.data_dir.clone();
	let server = WebsocketServer::new(ServerConfig::default()).with_store_factory(Arc::new(
		move |room: &str| {
			let file = data_dir.join(format!("{}.y", room.replace('/', "_")));
			Box::pin(async move {
				match FileYStore::open(&file).await {
					Ok(store) => Some(Arc::new(store) as Arc<dyn YStore>),
					Err(err) => {
						warn!(file = %file.display(), "store unavailable: {}", err);
						None
					}
				}
			})
		},
	));

	let app = websocket::router(Arc::new(server));
	let listener = tokio::net::TcpListener::bind(&config.listen).await.unwrap();
	info!("listening on {}", config.listen);
	axum::serve(listener, app).await.unwrap();
}

// vim: ts=4
