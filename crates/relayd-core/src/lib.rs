//! Core of the relayd host agent: the signal bus and the components it
//! connects.

pub mod bus;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod facts;
pub mod model;
pub mod payload;
pub mod process;
pub mod recent;
pub mod router;
pub mod shutdown;
pub mod token;

pub use daemon::{Daemon, DaemonConfig, DaemonHandle, ShutdownReport};
pub use error::DaemonError;
