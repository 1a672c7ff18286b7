//! Per-user turn ordering.
//!
//! Tickets are issued synchronously in acceptance order. Each ticket waits
//! for the previous ticket of the same user to be dropped, so turns for one
//! user run strictly one after another while different users proceed in
//! parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

type Tails = Arc<Mutex<HashMap<String, Tail>>>;

/// Latest issued ticket for a user.
struct Tail {
    id: u64,
    done: oneshot::Receiver<()>,
}

fn lock(tails: &Tails) -> MutexGuard<'_, HashMap<String, Tail>> {
    tails.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Issues [`TurnTicket`]s chained per user.
#[derive(Default)]
pub struct UserSequencer {
    tails: Tails,
    next_id: AtomicU64,
}

impl UserSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next place in `user_id`'s queue.
    pub fn ticket(&self, user_id: &str) -> TurnTicket {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let previous = lock(&self.tails).insert(user_id.to_string(), Tail { id, done: rx });

        TurnTicket {
            user_id: user_id.to_string(),
            id,
            wait_for: previous.map(|tail| tail.done),
            done: Some(tx),
            tails: self.tails.clone(),
        }
    }

    /// Number of users with at least one live ticket.
    pub fn active_users(&self) -> usize {
        lock(&self.tails).len()
    }
}

/// A job's place in its user's queue. Dropping it lets the next job run.
pub struct TurnTicket {
    user_id: String,
    id: u64,
    wait_for: Option<oneshot::Receiver<()>>,
    /// Dropping this sender wakes the successor.
    done: Option<oneshot::Sender<()>>,
    tails: Tails,
}

impl TurnTicket {
    /// Wait until every earlier ticket for this user has been dropped.
    pub async fn wait_turn(&mut self) {
        if let Some(previous) = self.wait_for.as_mut() {
            // The sender never sends; a closed channel means the predecessor is done.
            let _ = previous.await;
            self.wait_for = None;
        }
    }
}

impl std::fmt::Debug for TurnTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnTicket")
            .field("user_id", &self.user_id)
            .field("id", &self.id)
            .field("waiting", &self.wait_for.is_some())
            .finish()
    }
}

impl Drop for TurnTicket {
    fn drop(&mut self) {
        let mut tails = lock(&self.tails);
        if tails.get(&self.user_id).map(|tail| tail.id) == Some(self.id) {
            tails.remove(&self.user_id);
        }
        drop(tails);

        // A ticket dropped before its turn must not let successors overtake
        // its predecessor, so hand the release over to a task. Outside a
        // runtime a plain thread blocks on the predecessor instead.
        if let (Some(previous), Some(done)) = (self.wait_for.take(), self.done.take()) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = previous.await;
                        drop(done);
                    });
                }
                Err(_) => {
                    std::thread::spawn(move || {
                        let _ = previous.blocking_recv();
                        drop(done);
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn first_ticket_runs_immediately() {
        let sequencer = UserSequencer::new();
        let mut ticket = sequencer.ticket("u1");
        timeout(Duration::from_millis(100), ticket.wait_turn())
            .await
            .expect("first ticket should not wait");
    }

    #[tokio::test]
    async fn second_ticket_waits_for_first() {
        let sequencer = UserSequencer::new();
        let first = sequencer.ticket("u1");
        let mut second = sequencer.ticket("u1");

        assert!(
            timeout(Duration::from_millis(50), second.wait_turn())
                .await
                .is_err()
        );
        drop(first);
        timeout(Duration::from_millis(100), second.wait_turn())
            .await
            .expect("second ticket should run once first is dropped");
    }

    #[tokio::test]
    async fn other_users_are_independent() {
        let sequencer = UserSequencer::new();
        let _u1 = sequencer.ticket("u1");
        let mut u2 = sequencer.ticket("u2");
        timeout(Duration::from_millis(100), u2.wait_turn())
            .await
            .expect("different user should not wait");
    }

    #[tokio::test]
    async fn cancelled_wait_keeps_its_place() {
        let sequencer = UserSequencer::new();
        let first = sequencer.ticket("u1");
        let second = sequencer.ticket("u1");
        let mut third = sequencer.ticket("u1");

        // Second gives up before its turn; third must still wait for first.
        drop(second);
        assert!(
            timeout(Duration::from_millis(50), third.wait_turn())
                .await
                .is_err()
        );
        drop(first);
        timeout(Duration::from_millis(100), third.wait_turn())
            .await
            .expect("third ticket should run once first is dropped");
    }

    #[test]
    fn ticket_dropped_outside_a_runtime_keeps_its_place() {
        let sequencer = UserSequencer::new();
        let first = sequencer.ticket("u1");
        let second = sequencer.ticket("u1");
        let mut third = sequencer.ticket("u1");
        drop(second);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            assert!(
                timeout(Duration::from_millis(50), third.wait_turn())
                    .await
                    .is_err()
            );
        });
        drop(first);
        runtime.block_on(async {
            timeout(Duration::from_secs(1), third.wait_turn())
                .await
                .expect("third ticket should run once first is dropped");
        });
    }

    #[tokio::test]
    async fn entries_are_removed_when_last_ticket_drops() {
        let sequencer = UserSequencer::new();
        let a = sequencer.ticket("u1");
        let b = sequencer.ticket("u1");
        assert_eq!(sequencer.active_users(), 1);

        drop(a);
        assert_eq!(sequencer.active_users(), 1);
        drop(b);
        assert_eq!(sequencer.active_users(), 0);
    }

    #[tokio::test]
    async fn tickets_complete_in_issue_order() {
        let sequencer = Arc::new(UserSequencer::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for i in 0..10u64 {
            let mut ticket = sequencer.ticket("u1");
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                ticket.wait_turn().await;
                // Later tickets sleep less, so any reordering would show up.
                tokio::time::sleep(Duration::from_millis(10 - i)).await;
                order.lock().unwrap().push(i);
            }));
        }
        for handle in handles.into_iter().rev() {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }
}
