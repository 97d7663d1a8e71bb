//! Consensus-backed leader lock.
//!
//! Acquisition proposes `ha.try_lock` and waits for the matching FSM event;
//! on conflict it waits for a release before trying again. The holder keeps
//! the record fresh with `ha.refresh_lock` and watches for it being freed
//! by a stale sweep or taken by someone else.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::Command;
use super::node::RaftNode;
use super::observer::{FsmEvent, HaEventType, Subscription};
use crate::error::{ErrorKind, PhysicalError, Result};
use crate::lock::{LeaderLost, Lock};

/// How often a holder refreshes its lock and a waiter retries.
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(500);
/// Upper bound on waiting for the event of one proposal.
const OUTCOME_WAIT: Duration = Duration::from_secs(5);

pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// A raft leader lock handle.
pub struct RaftLock {
    node: Arc<RaftNode>,
    key: String,
    holder: String,
    ttl: Duration,
    held: Mutex<Option<CancellationToken>>,
}

impl RaftLock {
    pub(crate) fn new(node: Arc<RaftNode>, key: String, holder: String, ttl: Duration) -> Self {
        Self {
            node,
            key,
            holder,
            ttl,
            held: Mutex::new(None),
        }
    }

    fn holds(&self) -> bool {
        self.node.fsm().lock_holder(&self.key).as_deref() == Some(self.holder.as_str())
    }

    /// Wait for the Set or TryFailed event answering our try_lock.
    async fn outcome(&self, events: &mut Subscription) -> bool {
        let deadline = tokio::time::sleep(OUTCOME_WAIT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return self.holds(),
                event = events.next() => match event {
                    Some(FsmEvent::Ha { event_type, key, holder })
                        if key == self.key && holder == self.holder =>
                    {
                        match event_type {
                            HaEventType::Set => return true,
                            HaEventType::TryFailed => return false,
                            _ => {}
                        }
                    }
                    Some(_) => {}
                    None => return self.holds(),
                },
            }
        }
    }

    /// Wait until the key is released, the retry interval passes, or `stop`
    /// fires. Returns false on stop.
    async fn wait_for_release(&self, events: &mut Subscription, stop: &CancellationToken) -> bool {
        let retry = tokio::time::sleep(REFRESH_INTERVAL);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = &mut retry => return true,
                event = events.next() => match event {
                    Some(FsmEvent::Ha { event_type: HaEventType::Released, key, .. }) if key == self.key => {
                        return true;
                    }
                    Some(_) => {}
                    None => return true,
                },
            }
        }
    }

    fn spawn_refresh(&self, lost: CancellationToken) {
        let node = self.node.clone();
        let key = self.key.clone();
        let holder = self.holder.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = lost.cancelled() => return,
                    _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
                }
                let refresh = Command::RefreshLock {
                    key: key.clone(),
                    holder: holder.clone(),
                    time_ns: now_nanos(),
                };
                match node.propose(refresh).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::Closed => {
                        info!(key = %key, "raft node closed, giving up lock");
                        lost.cancel();
                        return;
                    }
                    Err(e) => warn!(key = %key, error = %e, "failed to refresh raft lock"),
                }
                if node.fsm().lock_holder(&key).as_deref() != Some(holder.as_str()) {
                    info!(key = %key, "raft lock no longer held");
                    lost.cancel();
                    return;
                }
            }
        });
    }

    fn spawn_watch(&self, mut events: Subscription, lost: CancellationToken) {
        let key = self.key.clone();
        let holder = self.holder.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = lost.cancelled() => return,
                    event = events.next() => event,
                };
                let gone = match event {
                    Some(FsmEvent::Ha {
                        event_type: HaEventType::Released,
                        key: k,
                        ..
                    }) => k == key,
                    Some(FsmEvent::Ha {
                        event_type: HaEventType::Set,
                        key: k,
                        holder: h,
                    }) => k == key && h != holder,
                    Some(_) => false,
                    None => true,
                };
                if gone {
                    info!(key = %key, "raft lock released");
                    lost.cancel();
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl Lock for RaftLock {
    async fn lock(&self, stop: CancellationToken) -> Result<Option<LeaderLost>> {
        if stop.is_cancelled() {
            return Ok(None);
        }
        if self.held.lock().is_some() {
            return Err(PhysicalError::LockConflict {
                key: self.key.clone(),
                holder: self.holder.clone(),
            });
        }

        // Subscribe first so the answering event cannot be missed.
        let mut events = self.node.fsm().subscribe();
        loop {
            if stop.is_cancelled() {
                return Ok(None);
            }
            self.node
                .propose(Command::TryLock {
                    key: self.key.clone(),
                    holder: self.holder.clone(),
                    ttl_ns: self.ttl.as_nanos() as i64,
                    time_ns: now_nanos(),
                })
                .await?;
            if self.outcome(&mut events).await {
                break;
            }
            if !self.wait_for_release(&mut events, &stop).await {
                return Ok(None);
            }
        }

        debug!(key = %self.key, holder = %self.holder, "raft lock acquired");
        let lost = CancellationToken::new();
        self.spawn_refresh(lost.clone());
        self.spawn_watch(events, lost.clone());
        *self.held.lock() = Some(lost.clone());
        Ok(Some(LeaderLost::new(lost)))
    }

    async fn unlock(&self) -> Result<()> {
        let Some(lost) = self.held.lock().take() else {
            return Ok(());
        };
        lost.cancel();
        self.node
            .propose(Command::ReleaseLock {
                key: self.key.clone(),
                holder: self.holder.clone(),
            })
            .await?;
        Ok(())
    }

    async fn value(&self) -> Result<(bool, String)> {
        self.node.sync().await?;
        Ok(match self.node.fsm().lock_holder(&self.key) {
            Some(holder) => (true, holder),
            None => (false, String::new()),
        })
    }
}
