//! Radio channel ownership
//!
//! Single writer for the radio channel. While locked, only the lock owner may
//! change it; `force_set` bypasses the lock and is reserved for session
//! recovery and discovery hops.

use core::fmt;

use crate::config::channels;
use crate::radio::{LinkRadio, RadioError};

/// Lock owner names
pub mod owner {
    pub const DISCOVERY: &str = "discovery";
    pub const SESSION: &str = "session";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Outside the channel plan
    Invalid(u8),
    /// Held by someone else
    LockedBy(&'static str),
    /// `unlock` called by a non-holder
    NotOwner,
    /// Radio reports a different channel than expected
    Mismatch { expected: u8, actual: u8 },
    Radio(RadioError),
}

impl From<RadioError> for ChannelError {
    fn from(e: RadioError) -> Self {
        ChannelError::Radio(e)
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Invalid(ch) => write!(f, "invalid channel {}", ch),
            ChannelError::LockedBy(owner) => write!(f, "channel locked by {}", owner),
            ChannelError::NotOwner => write!(f, "not the lock owner"),
            ChannelError::Mismatch { expected, actual } => {
                write!(f, "radio on channel {}, expected {}", actual, expected)
            }
            ChannelError::Radio(e) => write!(f, "radio: {}", e),
        }
    }
}

pub fn is_valid(channel: u8) -> bool {
    (channels::MIN..=channels::MAX).contains(&channel)
}

#[derive(Debug)]
pub struct ChannelManager {
    current: u8,
    owner: Option<&'static str>,
}

impl ChannelManager {
    pub fn new(initial: u8) -> Self {
        Self {
            current: initial,
            owner: None,
        }
    }

    /// Channel this manager believes the radio is on
    pub fn current(&self) -> u8 {
        self.current
    }

    pub fn owner(&self) -> Option<&'static str> {
        self.owner
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    /// The pinned channel while locked
    pub fn locked_channel(&self) -> Option<u8> {
        self.owner.map(|_| self.current)
    }

    /// Pin the radio to `channel` on behalf of `owner`
    pub fn lock<R: LinkRadio>(
        &mut self,
        radio: &mut R,
        channel: u8,
        owner: &'static str,
    ) -> Result<(), ChannelError> {
        if !is_valid(channel) {
            return Err(ChannelError::Invalid(channel));
        }
        match self.owner {
            Some(holder) if holder != owner => return Err(ChannelError::LockedBy(holder)),
            _ => {}
        }
        if radio.channel() != channel {
            radio.set_channel(channel)?;
        }
        self.current = channel;
        self.owner = Some(owner);
        log::info!("channel: locked to {} by {}", channel, owner);
        Ok(())
    }

    pub fn unlock(&mut self, owner: &'static str) -> Result<(), ChannelError> {
        match self.owner {
            Some(holder) if holder == owner => {
                self.owner = None;
                log::debug!("channel: unlocked by {}", owner);
                Ok(())
            }
            Some(_) => Err(ChannelError::NotOwner),
            None => Ok(()),
        }
    }

    /// Change channel respecting the lock
    pub fn set<R: LinkRadio>(
        &mut self,
        radio: &mut R,
        channel: u8,
        owner: &'static str,
    ) -> Result<(), ChannelError> {
        if !is_valid(channel) {
            return Err(ChannelError::Invalid(channel));
        }
        match self.owner {
            Some(holder) if holder != owner => Err(ChannelError::LockedBy(holder)),
            _ => self.force_set(radio, channel),
        }
    }

    /// Change channel ignoring the lock, then read it back
    pub fn force_set<R: LinkRadio>(&mut self, radio: &mut R, channel: u8) -> Result<(), ChannelError> {
        if !is_valid(channel) {
            return Err(ChannelError::Invalid(channel));
        }
        radio.set_channel(channel)?;
        self.current = channel;
        let actual = radio.channel();
        if actual != channel {
            log::warn!("channel: set {} but radio reports {}", channel, actual);
            return Err(ChannelError::Mismatch {
                expected: channel,
                actual,
            });
        }
        Ok(())
    }

    /// Compare the radio's channel with ours
    pub fn verify<R: LinkRadio>(&self, radio: &R) -> Result<(), ChannelError> {
        let actual = radio.channel();
        if actual == self.current {
            Ok(())
        } else {
            Err(ChannelError::Mismatch {
                expected: self.current,
                actual,
            })
        }
    }
}
