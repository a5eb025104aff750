pub use crate::error::{Error, YrResult};

pub use tracing::{debug, error, info, warn};

// vim: ts=4
