//! Connection state machine and keep-alive
//!
//! `Session` is the single writer of [`SessionState`]. It performs no I/O:
//! [`Session::poll`] returns the actions the owner must carry out (send a
//! heartbeat, tear the link down, start discovery, check the channel).
//!
//! All loss thresholds count from the last frame received from the peer.

use core::fmt;

use heapless::{Deque, Vec};

use crate::config::session::HISTORY_DEPTH;
use crate::config::SessionConfig;
use crate::protocol::version::is_newer;
use crate::protocol::{Heartbeat, HeartbeatAck, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// Radio is not on the channel the session is locked to
    ChannelMismatch { expected: u8, actual: u8 },
    /// Discovery keeps failing whole sweeps
    RecoveryExhausted { sweeps: u32 },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ChannelMismatch { expected, actual } => {
                write!(f, "channel mismatch: radio on {}, locked to {}", actual, expected)
            }
            SessionError::RecoveryExhausted { sweeps } => {
                write!(f, "recovery exhausted after {} failed sweeps", sweeps)
            }
        }
    }
}

/// Why the link was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// Nothing from the peer for the disconnect threshold
    Timeout,
    /// Peer still talks but stopped acknowledging heartbeats
    UnackedHeartbeats,
    /// Router watchdog fired
    Watchdog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Normal,
    /// Too many consecutive failed sweeps; discovery keeps trying
    PersistentFailure,
}

/// Work the owner must do on behalf of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Run a discovery sweep (Transmitter) or wait for a probe (Receiver)
    StartDiscovery,
    SendHeartbeat { seq: u32 },
    /// Remove the peer, release the channel, drop in-flight state
    Teardown(LossReason),
    /// Compare the radio's channel with the locked one
    ValidateChannel,
    /// Ask the platform to restart the process
    RequestRestart,
}

pub type Actions = Vec<SessionAction, 4>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connections: u32,
    pub reconnects: u32,
    pub longest_downtime_ms: u64,
    pub channel_mismatches: u32,
    pub heartbeats_sent: u32,
    pub heartbeats_acked: u32,
    pub heartbeats_received: u32,
    pub losses: u32,
    pub last_rssi: i8,
    pub peer_uptime_ms: u32,
    pub peer_state: SessionState,
}

pub struct Session {
    config: SessionConfig,
    state: SessionState,
    last_rx_ms: u64,
    next_hb_seq: u32,
    last_hb_sent_ms: Option<u64>,
    unacked: u32,
    first_unacked_ms: u64,
    last_validation_ms: u64,
    outage_started_ms: Option<u64>,
    recovery: RecoveryStatus,
    persistent_since_ms: u64,
    restart_requested: bool,
    history: Deque<Transition, HISTORY_DEPTH>,
    stats: SessionStats,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            last_rx_ms: 0,
            next_hb_seq: 0,
            last_hb_sent_ms: None,
            unacked: 0,
            first_unacked_ms: 0,
            last_validation_ms: 0,
            outage_started_ms: None,
            recovery: RecoveryStatus::Normal,
            persistent_since_ms: 0,
            restart_requested: false,
            history: Deque::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn recovery(&self) -> RecoveryStatus {
        self.recovery
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    pub fn last_rx_ms(&self) -> u64 {
        self.last_rx_ms
    }

    /// Sequence the next heartbeat will carry
    pub fn next_heartbeat_seq(&self) -> u32 {
        self.next_hb_seq
    }

    #[cfg(test)]
    fn set_next_heartbeat_seq(&mut self, seq: u32) {
        self.next_hb_seq = seq;
    }

    /// Oldest first
    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Leave `Idle` and begin looking for the peer
    pub fn start(&mut self, now_ms: u64) -> Actions {
        let mut actions = Actions::new();
        if self.state == SessionState::Idle {
            self.enter_connecting(now_ms);
            let _ = actions.push(SessionAction::StartDiscovery);
        }
        actions
    }

    /// Discovery (or a probe on the Receiver) established the link
    pub fn on_locked(&mut self, now_ms: u64) {
        if self.state == SessionState::Connected {
            self.last_rx_ms = now_ms;
            return;
        }
        if self.stats.connections > 0 {
            self.stats.reconnects += 1;
        }
        self.stats.connections += 1;
        self.recovery = RecoveryStatus::Normal;
        self.last_rx_ms = now_ms;
        self.unacked = 0;
        self.last_hb_sent_ms = None;
        self.last_validation_ms = now_ms;
        self.close_outage(now_ms);
        self.transition(SessionState::Connected, now_ms);
    }

    /// Any valid frame from the current peer
    pub fn on_frame_from_peer(&mut self, now_ms: u64) {
        if self.state == SessionState::Idle {
            return;
        }
        self.last_rx_ms = now_ms;
        if matches!(self.state, SessionState::Degraded | SessionState::Failure) {
            self.close_outage(now_ms);
            log::info!("session: peer heard again, link recovered");
            self.transition(SessionState::Connected, now_ms);
        }
    }

    pub fn on_heartbeat(&mut self, hb: &Heartbeat, rssi: i8) {
        self.stats.heartbeats_received += 1;
        self.stats.last_rssi = rssi;
        self.stats.peer_uptime_ms = hb.uptime_ms;
        self.stats.peer_state = hb.state;
    }

    pub fn on_heartbeat_ack(&mut self, ack: &HeartbeatAck) {
        // Only acks for heartbeats of this connection count
        if !is_newer(self.next_hb_seq, ack.ack_seq) {
            log::debug!("session: ack for unknown heartbeat {}", ack.ack_seq);
            return;
        }
        self.unacked = 0;
        self.stats.heartbeats_acked += 1;
        self.stats.peer_uptime_ms = ack.uptime_ms;
        self.stats.peer_state = ack.state;
    }

    pub fn record_channel_mismatch(&mut self, expected: u8, actual: u8) -> SessionError {
        self.stats.channel_mismatches += 1;
        log::warn!("session: radio on channel {}, locked to {}", actual, expected);
        SessionError::ChannelMismatch { expected, actual }
    }

    /// A whole discovery sweep failed
    pub fn on_sweep_failed(
        &mut self,
        consecutive: u32,
        max_failures: u32,
        now_ms: u64,
    ) -> Result<(), SessionError> {
        if consecutive < max_failures || self.recovery == RecoveryStatus::PersistentFailure {
            return Ok(());
        }
        self.recovery = RecoveryStatus::PersistentFailure;
        self.persistent_since_ms = now_ms;
        log::error!("session: {} sweeps failed in a row, persistent failure", consecutive);
        Err(SessionError::RecoveryExhausted {
            sweeps: consecutive,
        })
    }

    /// Router saw nothing from the peer for the disconnect threshold
    pub fn on_watchdog(&mut self, now_ms: u64) -> Actions {
        let mut actions = Actions::new();
        if self.state.is_linked() {
            self.recover(now_ms, LossReason::Watchdog, &mut actions);
        }
        actions
    }

    /// Periodic evaluation; cheap enough to call every tick
    pub fn poll(&mut self, now_ms: u64) -> Actions {
        let mut actions = Actions::new();
        match self.state {
            SessionState::Idle | SessionState::Disconnected => {}
            SessionState::Connecting => self.poll_restart(now_ms, &mut actions),
            SessionState::Connected | SessionState::Degraded | SessionState::Failure => {
                self.poll_linked(now_ms, &mut actions)
            }
        }
        actions
    }

    fn poll_linked(&mut self, now_ms: u64, actions: &mut Actions) {
        let silent = now_ms.saturating_sub(self.last_rx_ms);

        if silent >= self.config.disconnect_ms {
            self.recover(now_ms, LossReason::Timeout, actions);
            return;
        }
        // Acks missing while other frames still arrive
        if self.unacked >= self.config.max_unacked_heartbeats
            && self.last_rx_ms > self.first_unacked_ms
        {
            self.recover(now_ms, LossReason::UnackedHeartbeats, actions);
            return;
        }

        let target = if silent >= self.config.failure_ms {
            SessionState::Failure
        } else if silent >= self.config.degraded_ms {
            SessionState::Degraded
        } else {
            SessionState::Connected
        };
        if target != self.state {
            if self.state == SessionState::Connected {
                self.outage_started_ms = Some(self.last_rx_ms);
            }
            if target == SessionState::Connected {
                self.close_outage(now_ms);
            }
            self.transition(target, now_ms);
        }
        self.track_outage(now_ms);

        let hb_due = match self.last_hb_sent_ms {
            Some(sent) => now_ms.saturating_sub(sent) >= self.config.heartbeat_interval_ms,
            None => true,
        };
        if hb_due {
            let seq = self.next_hb_seq;
            self.next_hb_seq = self.next_hb_seq.wrapping_add(1);
            self.last_hb_sent_ms = Some(now_ms);
            if self.unacked == 0 {
                self.first_unacked_ms = now_ms;
            }
            self.unacked += 1;
            self.stats.heartbeats_sent += 1;
            let _ = actions.push(SessionAction::SendHeartbeat { seq });
        }

        if now_ms.saturating_sub(self.last_validation_ms) >= self.config.channel_validation_ms {
            self.last_validation_ms = now_ms;
            let _ = actions.push(SessionAction::ValidateChannel);
        }
    }

    fn poll_restart(&mut self, now_ms: u64, actions: &mut Actions) {
        self.track_outage(now_ms);
        if self.recovery == RecoveryStatus::PersistentFailure
            && self.config.restart_on_persistent_failure
            && !self.restart_requested
            && now_ms.saturating_sub(self.persistent_since_ms) >= self.config.restart_delay_ms
        {
            self.restart_requested = true;
            log::error!("session: requesting restart after persistent failure");
            let _ = actions.push(SessionAction::RequestRestart);
        }
    }

    /// Disconnected, torn down, and straight back to Connecting
    fn recover(&mut self, now_ms: u64, reason: LossReason, actions: &mut Actions) {
        if self.outage_started_ms.is_none() {
            self.outage_started_ms = Some(self.last_rx_ms);
        }
        self.track_outage(now_ms);
        self.stats.losses += 1;
        log::warn!(
            "session: link lost ({:?}), silent for {} ms",
            reason,
            now_ms.saturating_sub(self.last_rx_ms)
        );
        self.transition(SessionState::Disconnected, now_ms);
        let _ = actions.push(SessionAction::Teardown(reason));
        self.enter_connecting(now_ms);
        let _ = actions.push(SessionAction::StartDiscovery);
    }

    fn enter_connecting(&mut self, now_ms: u64) {
        self.next_hb_seq = 0;
        self.unacked = 0;
        self.last_hb_sent_ms = None;
        self.transition(SessionState::Connecting, now_ms);
    }

    fn track_outage(&mut self, now_ms: u64) {
        if let Some(start) = self.outage_started_ms {
            let down = now_ms.saturating_sub(start);
            if down > self.stats.longest_downtime_ms {
                self.stats.longest_downtime_ms = down;
            }
        }
    }

    fn close_outage(&mut self, now_ms: u64) {
        self.track_outage(now_ms);
        self.outage_started_ms = None;
    }

    fn transition(&mut self, to: SessionState, now_ms: u64) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if self.history.is_full() {
            self.history.pop_front();
        }
        let _ = self.history.push_back(Transition {
            from,
            to,
            at_ms: now_ms,
        });
        log::info!("session: {:?} -> {:?} at {} ms", from, to, now_ms);
    }
}
