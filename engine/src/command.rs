//! Command bus.
//!
//! Commands are one-shot imperative messages that travel beside replication.
//! Each sender numbers its commands with a monotonically increasing
//! sequence; receivers drop anything at or below the last sequence seen from
//! that sender. Accepted commands are dispatched to the handler registered
//! for their store.

use crate::protocol::{from_bytes, to_bytes};
use crate::store::StoreProvider;
use crate::{error::Result, ConnectionId, Error, Sequence, StoreId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// A command addressed to a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub store_id: StoreId,
    /// Sender's tick when the command was sent
    pub tick: u64,
    /// Per-sender sequence, assigned at send time
    pub seq: Sequence,
    /// Sending connection; overwritten by the receiving server
    pub sender: ConnectionId,
    pub payload: Vec<u8>,
}

impl Command {
    /// Create an unsent command with raw payload bytes.
    pub fn new(store_id: impl Into<StoreId>, payload: Vec<u8>) -> Self {
        Self {
            store_id: store_id.into(),
            tick: 0,
            seq: 0,
            sender: 0,
            payload,
        }
    }

    /// Create an unsent command carrying a serialized value.
    pub fn with_payload<T: Serialize>(store_id: impl Into<StoreId>, payload: &T) -> Result<Self> {
        Ok(Self::new(store_id, to_bytes(payload)?))
    }

    /// Deserialize the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        from_bytes(&self.payload)
    }
}

/// Per-sender duplicate and replay filter.
#[derive(Debug, Clone, Default)]
pub struct SequenceGuard {
    last: HashMap<ConnectionId, Sequence>,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `seq` if it is newer than anything seen from `sender`.
    pub fn accept(&mut self, sender: ConnectionId, seq: Sequence) -> bool {
        match self.last.get(&sender) {
            Some(last) if seq <= *last => false,
            _ => {
                self.last.insert(sender, seq);
                true
            }
        }
    }

    pub fn last(&self, sender: ConnectionId) -> Option<Sequence> {
        self.last.get(&sender).copied()
    }

    /// Forget a sender, e.g. when its connection closes.
    pub fn forget(&mut self, sender: ConnectionId) {
        self.last.remove(&sender);
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }
}

/// What a handler may touch while executing a command.
pub struct CommandContext<'a> {
    pub stores: &'a mut dyn StoreProvider,
    follow_ups: &'a mut Vec<Command>,
}

impl CommandContext<'_> {
    /// Queue another command. Commands queued during a flush run in one
    /// extra pass of the same flush.
    pub fn enqueue(&mut self, command: Command) {
        self.follow_ups.push(command);
    }
}

/// Executes commands for one store.
pub trait CommandHandler: Send {
    fn execute(&mut self, command: &Command, ctx: &mut CommandContext<'_>) -> Result<()>;
}

/// Hooks around command execution.
pub trait CommandObserver: Send {
    fn before(&mut self, _command: &Command) {}
    fn after(&mut self, _command: &Command) {}
    fn failed(&mut self, _command: &Command, _error: &Error) {}
}

/// Queue of commands plus the handlers that run them.
#[derive(Default)]
pub struct CommandBus {
    queue: VecDeque<Command>,
    handlers: HashMap<StoreId, Box<dyn CommandHandler>>,
    observers: Vec<Box<dyn CommandObserver>>,
}

impl std::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBus")
            .field("queued", &self.queue.len())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a store, replacing any previous one.
    pub fn register(&mut self, store_id: impl Into<StoreId>, handler: impl CommandHandler + 'static) {
        self.handlers.insert(store_id.into(), Box::new(handler));
    }

    pub fn observe(&mut self, observer: impl CommandObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn enqueue(&mut self, command: Command) {
        tracing::debug!(
            target: "arbor::cmd",
            store = %command.store_id,
            sender = command.sender,
            seq = command.seq,
            "queue command"
        );
        self.queue.push_back(command);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Execute one command now. Follow-up commands it queues wait for the
    /// next flush.
    pub fn execute_now(&mut self, command: Command, stores: &mut dyn StoreProvider) -> bool {
        let mut follow_ups = Vec::new();
        let ok = self.execute(&command, stores, &mut follow_ups);
        self.queue.extend(follow_ups);
        ok
    }

    /// Execute everything queued, then one extra pass for commands queued
    /// while executing. Returns how many commands ran.
    pub fn flush(&mut self, stores: &mut dyn StoreProvider) -> usize {
        let mut executed = 0;

        for _ in 0..2 {
            if self.queue.is_empty() {
                break;
            }

            let batch: Vec<_> = self.queue.drain(..).collect();
            let mut follow_ups = Vec::new();
            for command in &batch {
                self.execute(command, stores, &mut follow_ups);
                executed += 1;
            }
            self.queue.extend(follow_ups);
        }

        executed
    }

    fn execute(
        &mut self,
        command: &Command,
        stores: &mut dyn StoreProvider,
        follow_ups: &mut Vec<Command>,
    ) -> bool {
        let Some(handler) = self.handlers.get_mut(&command.store_id) else {
            tracing::warn!(
                target: "arbor::cmd",
                store = %command.store_id,
                sender = command.sender,
                seq = command.seq,
                "dropping command for unknown store"
            );
            return false;
        };

        for observer in &mut self.observers {
            observer.before(command);
        }

        let mut ctx = CommandContext { stores, follow_ups };
        match handler.execute(command, &mut ctx) {
            Ok(()) => {
                for observer in &mut self.observers {
                    observer.after(command);
                }
                true
            }
            Err(e) => {
                tracing::warn!(
                    target: "arbor::cmd",
                    store = %command.store_id,
                    sender = command.sender,
                    seq = command.seq,
                    "command failed: {}",
                    e
                );
                for observer in &mut self.observers {
                    observer.failed(command, &e);
                }
                false
            }
        }
    }
}
