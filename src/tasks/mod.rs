//! Embassy tasks module
//!
//! Generic task bodies. `main.rs` wraps them in concrete
//! `#[embassy_executor::task]` functions for the device types.

pub mod admin;
pub mod link;
pub mod telemetry;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

use crate::link_session::LinkSession;

/// Link session shared between the tasks
pub type SharedLink<R, S, G> = Mutex<CriticalSectionRawMutex, LinkSession<R, S, G>>;

pub use admin::{admin_task, AdminCommand, AdminReceiver, ADMIN_CHANNEL};
pub use link::{beacon_task, router_task, session_task, tx_worker_task, BEACON_WAKE};
pub use telemetry::telemetry_task;
