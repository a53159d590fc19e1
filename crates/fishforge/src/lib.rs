pub mod assets;
pub mod bypass;
pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod fsutil;
pub mod log_sanitize;
pub mod model;
pub mod net;
pub mod orchestrator;
pub mod process;
pub mod source;
pub mod toolchain;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
