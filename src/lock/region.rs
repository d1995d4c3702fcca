// Lock region state machine.
//
// A region arbitrates the locks it manages under the current topology:
// granting, parking waiters FIFO, releasing, and answering owner queries.
// During a migration new acquire/release requests queue and are released
// with Retry once Apply completes. The type is generic over the reply
// handle so the protocol logic tests without sockets; all methods are
// synchronous and return the replies for the caller to send.

use crate::cluster::node::NodeId;
use crate::cluster::topology::TopologyHash;
use crate::lock::protocol::{LockEntry, LockMessage, LockMigrationKey, LockWireStatus};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

struct Waiter<S> {
    lock_id: u64,
    thread_id: u64,
    requester: NodeId,
    reply: S,
}

struct LockHolder<S> {
    owner: NodeId,
    lock_id: u64,
    thread_id: u64,
    waiters: VecDeque<Waiter<S>>,
}

struct QueuedOp<S> {
    reply: S,
    response: LockMessage,
}

struct RegionState<S> {
    locks: HashMap<String, LockHolder<S>>,
    migrating: Option<LockMigrationKey>,
    queued: Vec<QueuedOp<S>>,
}

/// Manager-side state for one region.
pub(crate) struct RegionCore<S> {
    name: String,
    state: Mutex<RegionState<S>>,
}

/// A parked lock request that needs a timeout timer.
pub(crate) struct TimerSpec {
    pub name: String,
    pub lock_id: u64,
    pub after: Duration,
}

impl<S: Clone> RegionCore<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RegionState {
                locks: HashMap::new(),
                migrating: None,
                queued: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handles a lock request. Returns the immediate reply (if any) and a
    /// timer to arm when the request was parked with a deadline.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_lock(
        &self,
        lock_id: u64,
        name: &str,
        timeout_ms: i64,
        thread_id: u64,
        requester: NodeId,
        request_hash: TopologyHash,
        local_hash: TopologyHash,
        is_manager: bool,
        reply: S,
    ) -> (Option<LockMessage>, Option<TimerSpec>) {
        let mut state = self.state.lock();

        if state.migrating.is_some() {
            state.queued.push(QueuedOp {
                reply,
                response: LockMessage::LockResponse {
                    lock_id,
                    status: LockWireStatus::Retry,
                    owner_thread: 0,
                    owner: None,
                },
            });
            return (None, None);
        }

        if request_hash != local_hash || !is_manager {
            return (
                Some(LockMessage::LockResponse {
                    lock_id,
                    status: LockWireStatus::Retry,
                    owner_thread: 0,
                    owner: None,
                }),
                None,
            );
        }

        match state.locks.get_mut(name) {
            None => {
                state.locks.insert(
                    name.to_string(),
                    LockHolder {
                        owner: requester,
                        lock_id,
                        thread_id,
                        waiters: VecDeque::new(),
                    },
                );
                (
                    Some(LockMessage::LockResponse {
                        lock_id,
                        status: LockWireStatus::Ok,
                        owner_thread: 0,
                        owner: None,
                    }),
                    None,
                )
            }
            Some(holder) if holder.owner == requester && holder.thread_id == thread_id => {
                // Re-entrant acquire by the current owner.
                (
                    Some(LockMessage::LockResponse {
                        lock_id,
                        status: LockWireStatus::Ok,
                        owner_thread: holder.thread_id,
                        owner: Some(holder.owner),
                    }),
                    None,
                )
            }
            Some(holder) => {
                if timeout_ms == 0 {
                    return (
                        Some(LockMessage::LockResponse {
                            lock_id,
                            status: LockWireStatus::Busy,
                            owner_thread: holder.thread_id,
                            owner: Some(holder.owner),
                        }),
                        None,
                    );
                }
                holder.waiters.push_back(Waiter {
                    lock_id,
                    thread_id,
                    requester,
                    reply,
                });
                let timer = (timeout_ms > 0).then(|| TimerSpec {
                    name: name.to_string(),
                    lock_id,
                    after: Duration::from_millis(timeout_ms as u64),
                });
                (None, timer)
            }
        }
    }

    /// Expires a parked waiter; returns the Timeout reply if it was still
    /// parked.
    pub fn expire_waiter(&self, name: &str, lock_id: u64) -> Option<(S, LockMessage)> {
        let mut state = self.state.lock();
        let holder = state.locks.get_mut(name)?;
        let position = holder.waiters.iter().position(|w| w.lock_id == lock_id)?;
        let waiter = holder.waiters.remove(position)?;
        Some((
            waiter.reply,
            LockMessage::LockResponse {
                lock_id,
                status: LockWireStatus::Timeout,
                owner_thread: holder.thread_id,
                owner: Some(holder.owner),
            },
        ))
    }

    /// Handles an unlock. Returns the immediate reply and any grant handed
    /// to the next waiter.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_unlock(
        &self,
        lock_id: u64,
        name: &str,
        request_hash: TopologyHash,
        local_hash: TopologyHash,
        is_manager: bool,
        reply: S,
    ) -> (Option<LockMessage>, Vec<(S, LockMessage)>) {
        let mut state = self.state.lock();

        if state.migrating.is_some() {
            state.queued.push(QueuedOp {
                reply,
                response: LockMessage::UnlockResponse {
                    lock_id,
                    status: LockWireStatus::Retry,
                },
            });
            return (None, Vec::new());
        }

        if request_hash != local_hash || !is_manager {
            return (
                Some(LockMessage::UnlockResponse {
                    lock_id,
                    status: LockWireStatus::Retry,
                }),
                Vec::new(),
            );
        }

        let held = matches!(state.locks.get(name), Some(h) if h.lock_id == lock_id);
        if !held {
            // Stale unlock: the lock moved on (or never existed here).
            return (
                Some(LockMessage::UnlockResponse {
                    lock_id,
                    status: LockWireStatus::NotOwner,
                }),
                Vec::new(),
            );
        }

        let mut holder = state.locks.remove(name).expect("held lock");
        let mut grants = Vec::new();
        if let Some(next) = holder.waiters.pop_front() {
            let granted = LockHolder {
                owner: next.requester,
                lock_id: next.lock_id,
                thread_id: next.thread_id,
                waiters: holder.waiters,
            };
            grants.push((
                next.reply,
                LockMessage::LockResponse {
                    lock_id: next.lock_id,
                    status: LockWireStatus::Ok,
                    owner_thread: 0,
                    owner: None,
                },
            ));
            state.locks.insert(name.to_string(), granted);
        }

        (
            Some(LockMessage::UnlockResponse {
                lock_id,
                status: LockWireStatus::Ok,
            }),
            grants,
        )
    }

    pub fn handle_owner(
        &self,
        query_id: u64,
        name: &str,
        request_hash: TopologyHash,
        local_hash: TopologyHash,
        is_manager: bool,
    ) -> LockMessage {
        let state = self.state.lock();

        if state.migrating.is_some() || request_hash != local_hash || !is_manager {
            return LockMessage::OwnerResponse {
                query_id,
                status: LockWireStatus::Retry,
                thread_id: 0,
                owner: None,
            };
        }

        match state.locks.get(name) {
            Some(holder) => LockMessage::OwnerResponse {
                query_id,
                status: LockWireStatus::Ok,
                thread_id: holder.thread_id,
                owner: Some(holder.owner),
            },
            None => LockMessage::OwnerResponse {
                query_id,
                status: LockWireStatus::Ok,
                thread_id: 0,
                owner: None,
            },
        }
    }

    /// The ownerships this node currently stores.
    pub fn local_entries(&self) -> Vec<LockEntry> {
        self.state
            .lock()
            .locks
            .iter()
            .map(|(name, holder)| LockEntry {
                name: name.clone(),
                lock_id: holder.lock_id,
                thread_id: holder.thread_id,
                owner: holder.owner,
            })
            .collect()
    }

    /// Marks a migration round in progress; newer keys supersede older ones.
    pub fn begin_migration(&self, key: LockMigrationKey) -> bool {
        let mut state = self.state.lock();
        match state.migrating {
            Some(current) if current.initiator == key.initiator && current.id >= key.id => false,
            _ => {
                state.migrating = Some(key);
                true
            }
        }
    }

    pub fn migrating_key(&self) -> Option<LockMigrationKey> {
        self.state.lock().migrating
    }

    /// Applies the merged ownership set: adopts entries this node manages
    /// under the current topology, drops everything else, and releases the
    /// queued requests and parked waiters with Retry.
    pub fn apply_migration(
        &self,
        key: LockMigrationKey,
        entries: Vec<LockEntry>,
        is_manager: impl Fn(&str) -> bool,
    ) -> Vec<(S, LockMessage)> {
        let mut state = self.state.lock();

        match state.migrating {
            Some(current)
                if current.initiator == key.initiator
                    && current.id > key.id =>
            {
                // Stale apply from a superseded round.
                return Vec::new();
            }
            _ => {}
        }

        let mut replies = Vec::new();

        // Parked waiters are re-driven by their clients.
        for (_, holder) in state.locks.drain() {
            for waiter in holder.waiters {
                replies.push((
                    waiter.reply,
                    LockMessage::LockResponse {
                        lock_id: waiter.lock_id,
                        status: LockWireStatus::Retry,
                        owner_thread: 0,
                        owner: None,
                    },
                ));
            }
        }

        for entry in entries {
            if is_manager(&entry.name) {
                state.locks.insert(
                    entry.name.clone(),
                    LockHolder {
                        owner: entry.owner,
                        lock_id: entry.lock_id,
                        thread_id: entry.thread_id,
                        waiters: VecDeque::new(),
                    },
                );
            }
        }

        state.migrating = None;
        for queued in state.queued.drain(..) {
            replies.push((queued.reply, queued.response));
        }

        replies
    }

    /// Drops an in-flight round (topology changed again); queued requests
    /// stay queued for the next round's apply.
    pub fn cancel_migration(&self, key: &LockMigrationKey) {
        let mut state = self.state.lock();
        if state.migrating.as_ref() == Some(key) {
            state.migrating = None;
        }
    }

    #[cfg(test)]
    fn held(&self, name: &str) -> Option<NodeId> {
        self.state.lock().locks.get(name).map(|h| h.owner)
    }
}
