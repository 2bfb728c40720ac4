//! Link session configuration
//!
//! Compile-time constants are grouped by subsystem. The runtime structs at the
//! bottom are built from them and are what the components actually consume,
//! so tests can shorten timings without touching the constants.

/// Radio link limits
pub mod link {
    /// Largest frame the radio accepts
    pub const MTU: usize = 250;

    /// Largest opaque payload a producer may hand to the cache
    pub const MAX_PAYLOAD: usize = 240;

    /// Largest logical message (a fragmented config section plus its sum)
    pub const MAX_MESSAGE: usize = 512;

    /// Hardware address length
    pub const ADDR_LEN: usize = 6;
}

/// Channel plan
pub mod channels {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 13;

    /// Sweep order used by discovery
    pub const SWEEP: [u8; 13] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];

    /// Channel the Receiver starts on before anything is persisted
    pub const RECEIVER_DEFAULT: u8 = 1;
}

/// Active channel-hopping discovery
pub mod discovery {
    pub const ATTEMPTS_PER_CHANNEL: u8 = 3;
    pub const ACK_WAIT_MS: u64 = 1000;

    /// Settle time after switching channel
    pub const STABILIZE_MS: u64 = 150;

    pub const BACKOFF_BASE_MS: u64 = 500;
    pub const BACKOFF_MAX_MS: u64 = 4000;

    /// Consecutive failed sweeps before recovery is considered exhausted
    pub const MAX_RESTART_FAILURES: u32 = 3;
}

/// Keep-alive thresholds
pub mod session {
    pub const HEARTBEAT_INTERVAL_MS: u64 = 10_000;
    pub const DEGRADED_MS: u64 = 30_000;
    pub const FAILURE_MS: u64 = 60_000;
    pub const DISCONNECT_MS: u64 = 90_000;
    pub const MAX_UNACKED_HEARTBEATS: u32 = 3;

    /// Interval between radio channel read-backs while connected
    pub const CHANNEL_VALIDATION_MS: u64 = 10_000;

    /// Delay between entering PersistentFailure and asking for a restart
    pub const RESTART_DELAY_MS: u64 = 60_000;

    /// Depth of the transition history ring
    pub const HISTORY_DEPTH: usize = 16;
}

/// Outbound cache
pub mod cache {
    pub const TRANSIENT_CAPACITY: usize = 250;
    pub const MUTEX_TIMEOUT_MS: u64 = 10;

    /// Layout version of persisted state blobs
    pub const STRUCT_VERSION: u16 = 1;

    /// NVS namespace for persisted state slots
    pub const NAMESPACE: &str = "cache_state";
}

/// Background transmit pump
pub mod tx_worker {
    pub const TICK_MS: u64 = 50;
    pub const CLEANUP_INTERVAL_MS: u64 = 1000;
}

/// Version beacons
pub mod beacon {
    pub const PERIOD_MS: u64 = 15_000;
    pub const MIN_INTERVAL_MS: u64 = 1000;

    /// A Receiver does not repeat an identical section request sooner than this
    pub const REQUEST_RETRY_MS: u64 = 2000;
}

/// Fragment reassembly
pub mod framing {
    /// In-flight messages tracked at once
    pub const MAX_PARTIAL: usize = 4;

    /// Partial messages older than this are discarded
    pub const PARTIAL_TIMEOUT_MS: u64 = 2000;
}

/// Settings sections
pub mod settings {
    pub const N_SECTIONS: usize = 3;
    pub const MAX_SECTION_BYTES: usize = 320;

    /// NVS namespace for settings blobs
    pub const NAMESPACE: &str = "settings";
}

/// Persistent store limits
pub mod storage {
    /// Largest blob a key may hold (header plus section bytes)
    pub const MAX_BLOB: usize = 336;
    pub const MAX_KEYS: usize = 16;
    pub const MAX_KEY_LEN: usize = 15;
    /// Start of the two flash sectors holding the store (the `nvs` partition
    /// of the default partition table)
    pub const FLASH_OFFSET: u32 = 0x9000;
}

/// Router housekeeping
pub mod router {
    /// Minimum gap between two log lines about the same decode problem
    pub const LOG_INTERVAL_MS: u64 = 5000;
    pub const MAX_HOOKS: usize = 8;
}

/// Firmware identity published in beacons
pub mod firmware {
    pub const VERSION_MAJOR: u8 = 0;
    pub const VERSION_MINOR: u8 = 1;
    pub const VERSION_PATCH: u8 = 0;

    #[cfg(not(feature = "receiver"))]
    pub const ENV_NAME: &str = "tx-s3";
    #[cfg(feature = "receiver")]
    pub const ENV_NAME: &str = "rx-s3";

    pub const MAX_ENV_NAME: usize = 16;
}

/// Which end of the link this node is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sweeps channels, owns configuration versions, sends beacons
    Transmitter,
    /// Answers probes, pulls configuration sections
    Receiver,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub attempts_per_channel: u8,
    pub ack_wait_ms: u64,
    pub stabilize_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_restart_failures: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            attempts_per_channel: discovery::ATTEMPTS_PER_CHANNEL,
            ack_wait_ms: discovery::ACK_WAIT_MS,
            stabilize_ms: discovery::STABILIZE_MS,
            backoff_base_ms: discovery::BACKOFF_BASE_MS,
            backoff_max_ms: discovery::BACKOFF_MAX_MS,
            max_restart_failures: discovery::MAX_RESTART_FAILURES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval_ms: u64,
    pub degraded_ms: u64,
    pub failure_ms: u64,
    pub disconnect_ms: u64,
    pub max_unacked_heartbeats: u32,
    pub channel_validation_ms: u64,
    /// Ask for a process restart once recovery has been exhausted for a while
    pub restart_on_persistent_failure: bool,
    pub restart_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: session::HEARTBEAT_INTERVAL_MS,
            degraded_ms: session::DEGRADED_MS,
            failure_ms: session::FAILURE_MS,
            disconnect_ms: session::DISCONNECT_MS,
            max_unacked_heartbeats: session::MAX_UNACKED_HEARTBEATS,
            channel_validation_ms: session::CHANNEL_VALIDATION_MS,
            restart_on_persistent_failure: false,
            restart_delay_ms: session::RESTART_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TxConfig {
    pub cleanup_interval_ms: u64,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: tx_worker::CLEANUP_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BeaconConfig {
    pub period_ms: u64,
    pub min_interval_ms: u64,
    pub request_retry_ms: u64,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            period_ms: beacon::PERIOD_MS,
            min_interval_ms: beacon::MIN_INTERVAL_MS,
            request_retry_ms: beacon::REQUEST_RETRY_MS,
        }
    }
}

/// Everything a [`LinkSession`](crate::link_session::LinkSession) needs to start
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub role: Role,
    /// Channel a Receiver listens on; the Transmitter ignores it
    pub home_channel: u8,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub tx: TxConfig,
    pub beacon: BeaconConfig,
}

impl LinkConfig {
    pub fn transmitter() -> Self {
        Self {
            role: Role::Transmitter,
            home_channel: channels::MIN,
            discovery: DiscoveryConfig::default(),
            session: SessionConfig::default(),
            tx: TxConfig::default(),
            beacon: BeaconConfig::default(),
        }
    }

    pub fn receiver(home_channel: u8) -> Self {
        Self {
            role: Role::Receiver,
            home_channel,
            ..Self::transmitter()
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        #[cfg(feature = "receiver")]
        {
            Self::receiver(channels::RECEIVER_DEFAULT)
        }
        #[cfg(not(feature = "receiver"))]
        {
            Self::transmitter()
        }
    }
}
