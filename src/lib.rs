pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod net;
pub mod stats;

pub use context::Context;
pub use error::{DaemonError, NetError, StatusCode, TlsError};
