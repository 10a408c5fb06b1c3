#[macro_use]
extern crate log;

#[macro_use]
extern crate quick_error;

#[macro_use]
extern crate bitflags;

extern crate serde;

#[macro_use]
extern crate serde_derive;

extern crate toml;

extern crate mio;

extern crate socket2;

extern crate libc;

extern crate slab;

extern crate chrono;

#[cfg(test)]
extern crate tempfile;

#[macro_use]
mod result;
#[macro_use]
mod error;
pub use error::{Error, Result};

mod config;
pub use config::{Config, KeepAliveConfig};

pub mod socket;
pub use socket::{Endpoint, Mode, SocketHandle, SocketStatus};

mod connection;
pub use connection::Connection;

pub mod multiplexer;
pub use multiplexer::Multiplexer;

pub mod pool;
pub use pool::WorkerPool;

mod server;
pub use server::{Callback, ServerStatus, Stopper, TcpServer};

pub mod file_client;
pub use file_client::FileClient;
