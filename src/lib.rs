#![cfg_attr(not(test), no_std)]

pub mod beacon;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod link;
pub mod link_session;
pub mod logging;
pub mod protocol;
pub mod radio;
pub mod router;
pub mod session;
pub mod settings;
pub mod storage;
pub mod time;
pub mod tx_worker;

// These modules depend on embassy/esp features only available with embedded feature
#[cfg(feature = "embedded")]
pub mod tasks;

#[cfg(test)]
mod scenarios;

// Provides the std critical-section implementation for host tests
#[cfg(test)]
use critical_section as _;

pub use config::{LinkConfig, Role};
pub use link_session::LinkSession;
