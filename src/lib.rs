pub mod client;
pub mod config;
pub mod error;
pub mod meta;
pub mod net;
pub mod protocol;
pub mod server;
pub mod services;
pub mod shutdown;
pub mod trust;

pub use config::ServerConfig;
pub use error::{CoordError, Result};
pub use server::{ServerHandle, WorkerServer};
