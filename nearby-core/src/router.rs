//! Inbound dispatch: decode a received frame, split system kinds from
//! application kinds, keep the rolling message history.

use std::collections::VecDeque;
use std::time::Instant;

use crate::identity::DeviceId;
use crate::protocol::{DecodedMessage, MessageRegistry, ProvisionedInfo, SystemKind, SystemMessage};
use crate::wire::{self, DecodeError, FramedMessage, LegacyEnvelope};

/// What the coordinator should do with a received frame.
#[derive(Debug)]
pub enum Dispatch {
    /// Ping: nothing beyond the heartbeat reset every frame gets.
    Heartbeat,
    Disconnect,
    MergeInfo(ProvisionedInfo),
    ReplyDeviceInfo,
    ReplyAvatar,
    Deliver(DecodedMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub at: Instant,
    pub direction: Direction,
    pub peer: DeviceId,
    pub kind: String,
    pub len: usize,
}

/// Bounded FIFO of recent frames. A limit of 0 keeps nothing.
#[derive(Debug, Default)]
pub struct MessageHistory {
    limit: usize,
    entries: VecDeque<HistoryEntry>,
}

impl MessageHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: VecDeque::with_capacity(limit.min(1024)),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.limit == 0 {
            return;
        }
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Router {
    messages: MessageRegistry,
    history: MessageHistory,
}

enum Routed {
    System(SystemMessage),
    App(FramedMessage),
}

impl Router {
    pub fn new(history_limit: usize) -> Self {
        Self {
            messages: MessageRegistry::new(),
            history: MessageHistory::new(history_limit),
        }
    }

    pub fn messages_mut(&mut self) -> &mut MessageRegistry {
        &mut self.messages
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn record(&mut self, at: Instant, direction: Direction, peer: DeviceId, kind: &str, len: usize) {
        self.history.push(HistoryEntry {
            at,
            direction,
            peer,
            kind: kind.to_owned(),
            len,
        });
    }

    fn is_known(&self, kind: &str) -> bool {
        SystemKind::from_tag(kind).is_some() || self.messages.is_registered(kind)
    }

    /// Find the envelope: single-tag first, then legacy when the tag is not known.
    fn route(&self, bytes: &[u8]) -> Result<Routed, DecodeError> {
        let simple = wire::decode_frame(bytes);
        let frame = match simple {
            Ok(frame) if self.is_known(&frame.kind) => frame,
            other => match LegacyEnvelope::decode(bytes) {
                Ok(env) if self.is_known(&env.command) => {
                    FramedMessage::new(env.command, env.payload)
                }
                _ => {
                    return Err(match other {
                        Ok(frame) => DecodeError::UnknownKind(frame.kind),
                        Err(e) => e,
                    })
                }
            },
        };
        match SystemKind::from_tag(&frame.kind) {
            Some(kind) => Ok(Routed::System(SystemMessage::decode(kind, &frame.payload)?)),
            None => Ok(Routed::App(frame)),
        }
    }

    /// Decode `bytes` from `from` and decide what to do with them. Failures
    /// carry no side effects beyond the history entry.
    pub fn dispatch(
        &mut self,
        bytes: &[u8],
        from: DeviceId,
        now: Instant,
    ) -> Result<Dispatch, DecodeError> {
        let routed = self.route(bytes);
        let kind = match &routed {
            Ok(Routed::System(m)) => m.kind().tag().to_owned(),
            Ok(Routed::App(f)) => f.kind.clone(),
            Err(_) => String::from("?"),
        };
        self.record(now, Direction::Inbound, from, &kind, bytes.len());
        Ok(match routed? {
            Routed::System(message) => match message {
                SystemMessage::Ping => Dispatch::Heartbeat,
                SystemMessage::Disconnect => Dispatch::Disconnect,
                SystemMessage::RequestDeviceInfo => Dispatch::ReplyDeviceInfo,
                SystemMessage::RequestAvatar => Dispatch::ReplyAvatar,
                SystemMessage::DeviceInfo(info) => Dispatch::MergeInfo(
                    info.into_iter()
                        .map(|(k, v)| (k, serde_json::Value::String(v)))
                        .collect(),
                ),
                SystemMessage::Provision(info) | SystemMessage::Pair(info) => {
                    Dispatch::MergeInfo(info)
                }
                SystemMessage::Dictionary(info) => {
                    Dispatch::Deliver(DecodedMessage::Dictionary(info))
                }
                SystemMessage::Avatar(avatar) => Dispatch::Deliver(DecodedMessage::Avatar(avatar)),
            },
            Routed::App(frame) => Dispatch::Deliver(DecodedMessage::App(self.messages.decode(&frame)?)),
        })
    }
}
