//! Error types for the SQLite store adapter

use std::fmt;

/// Adapter-specific errors
#[derive(Debug)]
pub enum Error {
	/// Database operation error
	DbError(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::DbError(msg) => write!(f, "Database error: {}", msg),
		}
	}
}

impl std::error::Error for Error {}

impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Error::DbError(err.to_string())
	}
}

impl From<Error> for yroom::error::Error {
	fn from(err: Error) -> Self {
		match err {
			Error::DbError(msg) => yroom::error::Error::Store(msg),
		}
	}
}

// vim: ts=4
