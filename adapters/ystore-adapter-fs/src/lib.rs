//! File-backed update stores.
//!
//! One file per document, append-only:
//! - header: magic byte `0xFF` followed by a varint store version
//! - records: `varint(len(update)) | update | varint(len(metadata)) |
//!   metadata | 8-byte little-endian IEEE-754 timestamp`
//!
//! Initial creation and history squashing both go through a temporary
//! file and an atomic rename. A file found empty or truncated
//! mid-record opens in degraded read-only mode: the valid prefix stays
//! readable, writes fail, and the fault is logged. Records are never
//! silently dropped.
//!
//! [`TempFileYStore`] is the same store rooted under a deterministic
//! per-path location in the system temporary directory, so tests and
//! ephemeral rooms share a canonical path-to-file mapping.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::stream;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use yroom::codec::{write_var_buf, write_var_uint, Decoder};
use yroom::prelude::*;
use yroom::ystore::{RecordStream, StoreRecord, YStore, STORE_VERSION};

const MAGIC: u8 = 0xFF;

#[derive(Debug)]
struct Inner {
	closed: bool,
	degraded: bool,
	last_timestamp: f64,
}

/// A YStore which uses one file per document.
pub struct FileYStore {
	path: PathBuf,
	version: u32,
	inner: Mutex<Inner>,
}

impl FileYStore {
	/// Open (or atomically create) the store at `path`.
	pub async fn open(path: impl Into<PathBuf>) -> YrResult<Self> {
		Self::open_with_version(path, STORE_VERSION).await
	}

	/// Open with an explicit supported version. A persisted header
	/// carrying any other version fails with
	/// [`Error::StoreVersionMismatch`].
	pub async fn open_with_version(path: impl Into<PathBuf>, version: u32) -> YrResult<Self> {
		let path = path.into();
		let mut degraded = false;
		match fs::read(&path).await {
			Ok(data) if data.is_empty() => {
				warn!(path = %path.display(), "store file is empty, opening degraded read-only");
				degraded = true;
			}
			Ok(data) => {
				let body = check_header(&data, version)?;
				let (_, truncated) = parse_records(body);
				if truncated {
					warn!(
						path = %path.display(),
						"store file truncated mid-record, opening degraded read-only"
					);
					degraded = true;
				}
			}
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				if let Some(parent) = path.parent() {
					fs::create_dir_all(parent).await?;
				}
				replace_file(&path, version, None).await?;
			}
			Err(err) => return Err(err.into()),
		}
		debug!(path = %path.display(), version, degraded, "opened file store");
		Ok(Self {
			path,
			version,
			inner: Mutex::new(Inner { closed: false, degraded, last_timestamp: 0.0 }),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

#[async_trait]
impl YStore for FileYStore {
	async fn write(&self, update: &[u8], metadata: &[u8]) -> YrResult<()> {
		let mut inner = self.inner.lock().await;
		if inner.closed {
			return Err(Error::StoreClosed);
		}
		if inner.degraded {
			return Err(Error::Store("store is degraded read-only".into()));
		}
		let timestamp = now_timestamp().max(inner.last_timestamp);
		let mut buf = Vec::with_capacity(update.len() + metadata.len() + 24);
		write_var_buf(&mut buf, update);
		write_var_buf(&mut buf, metadata);
		buf.extend_from_slice(&timestamp.to_le_bytes());

		let mut file = fs::OpenOptions::new().append(true).open(&self.path).await?;
		file.write_all(&buf).await?;
		file.flush().await?;
		inner.last_timestamp = timestamp;
		Ok(())
	}

	async fn read(&self) -> YrResult<RecordStream> {
		let records = {
			let mut inner = self.inner.lock().await;
			if inner.closed {
				return Err(Error::StoreClosed);
			}
			let data = fs::read(&self.path).await?;
			if data.is_empty() {
				Vec::new()
			} else {
				let body = check_header(&data, self.version)?;
				let (records, truncated) = parse_records(body);
				if truncated && !inner.degraded {
					warn!(
						path = %self.path.display(),
						"store file truncated mid-record, switching to degraded read-only"
					);
					inner.degraded = true;
				}
				records
			}
		};
		Ok(Box::pin(stream::iter(records.into_iter().map(Ok))))
	}

	async fn squash(&self, update: &[u8]) -> YrResult<()> {
		let mut inner = self.inner.lock().await;
		if inner.closed {
			return Err(Error::StoreClosed);
		}
		let timestamp = now_timestamp().max(inner.last_timestamp);
		replace_file(&self.path, self.version, Some((update, timestamp))).await?;
		debug!(path = %self.path.display(), "squashed store history");
		inner.degraded = false;
		inner.last_timestamp = timestamp;
		Ok(())
	}

	async fn close(&self) -> YrResult<()> {
		self.inner.lock().await.closed = true;
		Ok(())
	}
}

/// A YStore which uses the system's temporary directory.
///
/// Files are written under one common directory; a given path always
/// maps to the same file within a machine.
pub struct TempFileYStore {
	store: FileYStore,
}

impl TempFileYStore {
	pub async fn open(path: impl AsRef<Path>) -> YrResult<Self> {
		let store = FileYStore::open(Self::base_dir().join(path.as_ref())).await?;
		Ok(Self { store })
	}

	pub fn base_dir() -> PathBuf {
		std::env::temp_dir().join("yroom-ystore")
	}

	pub fn path(&self) -> &Path {
		self.store.path()
	}
}

#[async_trait]
impl YStore for TempFileYStore {
	async fn write(&self, update: &[u8], metadata: &[u8]) -> YrResult<()> {
		self.store.write(update, metadata).await
	}

	async fn read(&self) -> YrResult<RecordStream> {
		self.store.read().await
	}

	async fn squash(&self, update: &[u8]) -> YrResult<()> {
		self.store.squash(update).await
	}

	async fn close(&self) -> YrResult<()> {
		self.store.close().await
	}
}

/// Validate the header and return the record body that follows it.
fn check_header(data: &[u8], expected: u32) -> YrResult<&[u8]> {
	let mut decoder = Decoder::new(data);
	let magic = decoder.read_u8().map_err(|_| Error::Decode)?;
	if magic != MAGIC {
		return Err(Error::StoreVersionMismatch { found: u32::from(magic), expected });
	}
	let found = decoder.read_var_uint().map_err(|_| Error::Decode)?;
	let found = u32::try_from(found).map_err(|_| Error::Decode)?;
	if found != expected {
		return Err(Error::StoreVersionMismatch { found, expected });
	}
	Ok(&data[decoder.position()..])
}

/// Parse records up to the valid prefix; the flag reports a truncated
/// trailing record.
fn parse_records(body: &[u8]) -> (Vec<StoreRecord>, bool) {
	let mut records = Vec::new();
	let mut decoder = Decoder::new(body);
	while !decoder.is_empty() {
		let update = match decoder.read_var_buf() {
			Ok(update) => update.to_vec(),
			Err(_) => return (records, true),
		};
		let metadata = match decoder.read_var_buf() {
			Ok(metadata) => metadata.to_vec(),
			Err(_) => return (records, true),
		};
		let timestamp = match decoder.read_bytes(8) {
			Ok(bytes) => {
				let mut raw = [0u8; 8];
				raw.copy_from_slice(bytes);
				f64::from_le_bytes(raw)
			}
			Err(_) => return (records, true),
		};
		records.push(StoreRecord { update, metadata, timestamp });
	}
	(records, false)
}

/// Write header plus an optional single record to a temporary sibling
/// and atomically rename it over `path`.
async fn replace_file(path: &Path, version: u32, record: Option<(&[u8], f64)>) -> YrResult<()> {
	let mut buf = vec![MAGIC];
	write_var_uint(&mut buf, u64::from(version));
	if let Some((update, timestamp)) = record {
		write_var_buf(&mut buf, update);
		write_var_buf(&mut buf, b"");
		buf.extend_from_slice(&timestamp.to_le_bytes());
	}
	let mut tmp = path.as_os_str().to_owned();
	tmp.push(".tmp");
	let tmp = PathBuf::from(tmp);
	fs::write(&tmp, &buf).await?;
	fs::rename(&tmp, path).await?;
	Ok(())
}

fn now_timestamp() -> f64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or_default()
}

// vim: ts=4
