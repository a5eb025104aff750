use crate::prelude::*;

pub type YrResult<T> = std::result::Result<T, Error>;

/// Broker error kinds.
///
/// Propagation policy: per-client faults stay confined to that client,
/// store faults detach the store from its room, and nothing short of
/// server shutdown takes a room down.
#[derive(Debug)]
pub enum Error {
	/// Malformed wire frame. The frame is dropped, the connection stays open.
	Decode,
	/// A client's outbound queue overflowed; that client is disconnected.
	SlowConsumer,
	/// The persisted store version differs from the supported one.
	StoreVersionMismatch { found: u32, expected: u32 },
	/// Operation on a store whose lifecycle has ended.
	StoreClosed,
	/// The transport failed or was closed by the peer.
	TransportClosed,
	/// The document rejected an update payload.
	CrdtRejected,
	/// No stored document under the requested path.
	DocNotFound,
	/// Backend-specific store fault.
	Store(String),

	// externals
	Io(std::io::Error),
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::Decode => write!(f, "malformed frame"),
			Error::SlowConsumer => write!(f, "client send queue overflow"),
			Error::StoreVersionMismatch { found, expected } => {
				write!(f, "store version mismatch: found {}, expected {}", found, expected)
			}
			Error::StoreClosed => write!(f, "store is closed"),
			Error::TransportClosed => write!(f, "transport closed"),
			Error::CrdtRejected => write!(f, "document rejected update"),
			Error::DocNotFound => write!(f, "document not found"),
			Error::Store(msg) => write!(f, "store error: {}", msg),
			Error::Io(err) => write!(f, "io error: {}", err),
		}
	}
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		warn!("io error: {}", err);
		Self::Io(err)
	}
}

impl From<yrs::encoding::read::Error> for Error {
	fn from(_err: yrs::encoding::read::Error) -> Self {
		warn!("update decode error: {}", _err);
		Error::CrdtRejected
	}
}

impl From<yrs::error::UpdateError> for Error {
	fn from(_err: yrs::error::UpdateError) -> Self {
		warn!("update apply error: {}", _err);
		Error::CrdtRejected
	}
}

impl From<serde_json::Error> for Error {
	fn from(_err: serde_json::Error) -> Self {
		warn!("json error: {}", _err);
		Error::Decode
	}
}

// vim: ts=4
