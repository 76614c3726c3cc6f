//! In-memory execution slots.
//!
//! A slot exists for every task this process is executing. Acquiring checks
//! the provider's slot limit and inserts under one lock, so two callers can
//! never both take the last slot. Release is keyed by task, which makes it
//! idempotent: whichever of cancel, timeout, or completion gets there first
//! frees the slot and the others find nothing to remove.
//!
//! A task holds at most one slot. A caller that failed to start a task
//! gives back only the slot its own token names, never one taken by a
//! concurrent caller for the same task.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;
use virtfleet_core::{ProviderId, TaskId};
use virtfleet_store::TaskStatus;

use crate::error::{Result, TaskError};

struct Slot {
    cancel: watch::Sender<bool>,
    ticket: u64,
}

#[derive(Default)]
struct Table {
    held: HashMap<ProviderId, HashMap<TaskId, Slot>>,
    next_ticket: u64,
}

/// Execution slots keyed by provider, then task.
#[derive(Default)]
pub struct RunningSlots {
    inner: Mutex<Table>,
}

impl RunningSlots {
    /// Create an empty slot table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot for `task_id` if fewer than `limit` are held on the
    /// provider.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidTransition` if `task_id` already holds a
    /// slot, and `TaskError::ConcurrencyLimit` if the provider is full.
    pub fn acquire(&self, provider_id: ProviderId, task_id: TaskId, limit: usize) -> Result<CancelToken> {
        let mut table = self.inner.lock();
        let ticket = table.next_ticket;
        let held = table.held.entry(provider_id).or_default();
        if held.contains_key(&task_id) {
            return Err(TaskError::InvalidTransition {
                task_id,
                status: TaskStatus::Running,
                action: "start",
            });
        }
        if held.len() >= limit {
            return Err(TaskError::ConcurrencyLimit { provider_id, limit });
        }
        let (cancel, receiver) = watch::channel(false);
        held.insert(task_id, Slot { cancel, ticket });
        table.next_ticket += 1;
        Ok(CancelToken {
            provider_id,
            task_id,
            ticket,
            receiver,
        })
    }

    /// Free the slot of `task_id`. Returns false if it was already free.
    pub fn release(&self, provider_id: ProviderId, task_id: &TaskId) -> bool {
        self.remove_if(provider_id, task_id, |_| true)
    }

    /// Free the slot `token` was issued for, if it is still held.
    ///
    /// Returns false if the slot was already freed or now belongs to a
    /// later acquire of the same task.
    pub fn release_token(&self, token: &CancelToken) -> bool {
        self.remove_if(token.provider_id, &token.task_id, |slot| slot.ticket == token.ticket)
    }

    fn remove_if(&self, provider_id: ProviderId, task_id: &TaskId, is_owner: impl FnOnce(&Slot) -> bool) -> bool {
        let mut table = self.inner.lock();
        let Some(held) = table.held.get_mut(&provider_id) else {
            return false;
        };
        let removed = held.get(task_id).is_some_and(is_owner) && held.remove(task_id).is_some();
        if held.is_empty() {
            table.held.remove(&provider_id);
        }
        removed
    }

    /// Signal cancellation to the execution holding `task_id`.
    ///
    /// Returns false if no such execution exists.
    pub fn cancel(&self, provider_id: ProviderId, task_id: &TaskId) -> bool {
        self.inner
            .lock()
            .held
            .get(&provider_id)
            .and_then(|held| held.get(task_id))
            .is_some_and(|slot| {
                slot.cancel.send_replace(true);
                true
            })
    }

    /// Slots currently held on a provider.
    #[must_use]
    pub fn held(&self, provider_id: ProviderId) -> usize {
        self.inner.lock().held.get(&provider_id).map_or(0, HashMap::len)
    }

    /// Returns true if `task_id` holds a slot.
    #[must_use]
    pub fn is_running(&self, provider_id: ProviderId, task_id: &TaskId) -> bool {
        self.inner
            .lock()
            .held
            .get(&provider_id)
            .is_some_and(|held| held.contains_key(task_id))
    }
}

/// Cancellation signal handed to an execution.
#[derive(Clone)]
pub struct CancelToken {
    provider_id: ProviderId,
    task_id: TaskId,
    ticket: u64,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Stop here if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::Cancelled` after a cancel request.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait until cancellation is requested. Never completes if the slot
    /// is released without one.
    pub async fn cancelled(&mut self) {
        if self.receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Run `work` unless cancellation arrives first, in which case `work`
    /// is dropped mid-flight.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::Cancelled` on cancellation, otherwise whatever
    /// `work` returns.
    pub async fn interruptible<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        let mut signal = self.clone();
        tokio::select! {
            outcome = work => outcome,
            () = signal.cancelled() => Err(TaskError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn limit_is_enforced_per_provider() {
        let slots = RunningSlots::new();
        let (a, b) = (TaskId::generate(), TaskId::generate());
        let p1 = ProviderId::new(1);

        slots.acquire(p1, a, 1).unwrap();
        let err = slots.acquire(p1, b, 1).err().unwrap();
        assert!(matches!(err, TaskError::ConcurrencyLimit { limit: 1, .. }));

        slots.acquire(ProviderId::new(2), b, 1).unwrap();
        assert_eq!(slots.held(p1), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let slots = RunningSlots::new();
        let task = TaskId::generate();
        let p1 = ProviderId::new(1);

        slots.acquire(p1, task, 1).unwrap();
        assert!(slots.release(p1, &task));
        assert!(!slots.release(p1, &task));
        assert_eq!(slots.held(p1), 0);
    }

    #[test]
    fn release_leaves_other_tasks_alone() {
        let slots = RunningSlots::new();
        let (old, new) = (TaskId::generate(), TaskId::generate());
        let p1 = ProviderId::new(1);

        slots.acquire(p1, old, 1).unwrap();
        slots.release(p1, &old);
        slots.acquire(p1, new, 1).unwrap();

        assert!(!slots.release(p1, &old));
        assert!(slots.is_running(p1, &new));
    }

    #[tokio::test]
    async fn cancel_reaches_token() {
        let slots = RunningSlots::new();
        let task = TaskId::generate();
        let p1 = ProviderId::new(1);

        let mut token = slots.acquire(p1, task, 2).unwrap();
        assert!(token.checkpoint().is_ok());
        assert!(slots.cancel(p1, &task));
        token.cancelled().await;
        assert!(matches!(token.checkpoint(), Err(TaskError::Cancelled)));

        assert!(!slots.cancel(p1, &TaskId::generate()));
    }

    #[tokio::test]
    async fn cancel_interrupts_blocked_work() {
        let slots = Arc::new(RunningSlots::new());
        let task = TaskId::generate();
        let p1 = ProviderId::new(1);
        let token = slots.acquire(p1, task, 1).unwrap();

        let canceller = Arc::clone(&slots);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel(p1, &task);
        });
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            token.interruptible(async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(())
            }),
        )
        .await
        .expect("cancel did not interrupt the work");
        assert!(matches!(outcome, Err(TaskError::Cancelled)));

        let done = slots.acquire(p1, TaskId::generate(), 2).unwrap();
        assert_eq!(done.interruptible(async { Ok(7) }).await.unwrap(), 7);
    }

    #[test]
    fn second_acquire_of_same_task_is_refused() {
        let slots = RunningSlots::new();
        let task = TaskId::generate();
        let p1 = ProviderId::new(1);

        let winner = slots.acquire(p1, task, 1).unwrap();
        let err = slots.acquire(p1, task, 4).err().unwrap();
        assert!(matches!(err, TaskError::InvalidTransition { action: "start", .. }));
        assert_eq!(slots.held(p1), 1);

        assert!(slots.cancel(p1, &task));
        assert!(winner.is_cancelled());
    }

    #[test]
    fn stale_token_cannot_free_a_newer_slot() {
        let slots = RunningSlots::new();
        let (task, other) = (TaskId::generate(), TaskId::generate());
        let p1 = ProviderId::new(1);

        let stale = slots.acquire(p1, task, 1).unwrap();
        assert!(slots.release(p1, &task));
        let current = slots.acquire(p1, task, 1).unwrap();

        assert!(!slots.release_token(&stale));
        assert!(slots.is_running(p1, &task));
        let err = slots.acquire(p1, other, 1).err().unwrap();
        assert!(matches!(err, TaskError::ConcurrencyLimit { limit: 1, .. }));

        assert!(slots.release_token(&current));
        assert!(!slots.release_token(&current));
        assert_eq!(slots.held(p1), 0);
    }
}
