#![recursion_limit = "256"]

//! A GSM 07.10 (`AT+CMUX`) link-layer multiplexer: fans a single serial
//! connection to a GSM modem out into several independent byte-stream
//! channels.
//!
//! # Example
//! ```no_run
//! # use gsmux::{Config, Error};
//! # use std::sync::{atomic::AtomicBool, Arc};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Error> {
//! let config = Config {
//!     channel_count: 2,
//!     fault_tolerant: true,
//!     ..Config::default()
//! };
//!
//! // `serial_factory`/`endpoint_factory` open the real serial port and
//! // pseudo-terminals; see `src/bin/gsmuxd` for a complete wiring.
//! # async fn serial_factory() -> Result<tokio::io::DuplexStream, Error> { unreachable!() }
//! # async fn endpoint_factory(_: usize) -> Result<tokio::io::DuplexStream, Error> { unreachable!() }
//! gsmux::supervisor::run(
//!     serial_factory,
//!     endpoint_factory,
//!     config.channel_count,
//!     config,
//!     Arc::new(AtomicBool::new(false)),
//!     || println!("link is up"),
//!     || println!("link is down"),
//! ).await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod bringup;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod constants;
mod error;
pub mod fcs;
pub mod frame;
pub mod link;
pub mod supervisor;

pub use config::Config;
pub use error::Error;
