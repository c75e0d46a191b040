//! Per-row ordering.
//!
//! Handlers run concurrently, but two operations on the same `(table, row)`
//! must reach the mirror in delivery order. The receive loop reserves a
//! turn synchronously for each delivery; a handler waits for the previous
//! turn on its row to finish before touching the store.
//!
//! Each turn is a link in a chain of oneshot channels: the reservation
//! takes the receiver left by the previous turn and leaves its own behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

/// `(table, row key)`
pub type RowKey = (String, String);

#[derive(Debug)]
struct Tail {
    generation: u64,
    released: oneshot::Receiver<()>,
}

#[derive(Debug, Default)]
struct Chains {
    tails: HashMap<RowKey, Tail>,
    next_generation: u64,
}

/// Keyed FIFO locks over mirror rows
#[derive(Debug, Clone, Default)]
pub struct RowLocks {
    chains: Arc<Mutex<Chains>>,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next turn on a row. Turns are granted in reservation order.
    pub fn reserve(&self, table: &str, row: &str) -> RowTurn {
        let key = (table.to_string(), row.to_string());
        let (release, released) = oneshot::channel();

        let mut chains = self.lock();
        let generation = chains.next_generation;
        chains.next_generation += 1;
        let previous = chains.tails.insert(
            key.clone(),
            Tail {
                generation,
                released,
            },
        );

        RowTurn {
            previous: previous.map(|tail| tail.released),
            guard: RowGuard {
                locks: self.clone(),
                key,
                generation,
                release: Some(release),
            },
        }
    }

    /// Rows with a turn held or pending
    pub fn active_rows(&self) -> usize {
        self.lock().tails.len()
    }

    fn lock(&self) -> MutexGuard<'_, Chains> {
        self.chains
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A reserved, not yet granted turn
#[derive(Debug)]
pub struct RowTurn {
    previous: Option<oneshot::Receiver<()>>,
    guard: RowGuard,
}

impl RowTurn {
    /// Wait until every earlier turn on the row has been released
    pub async fn acquire(self) -> RowGuard {
        if let Some(previous) = self.previous {
            // The sender is only ever dropped, never used; both outcomes mean "released".
            let _ = previous.await;
        }
        self.guard
    }
}

/// Held while a handler works on a row; dropping it releases the row
#[derive(Debug)]
pub struct RowGuard {
    locks: RowLocks,
    key: RowKey,
    generation: u64,
    release: Option<oneshot::Sender<()>>,
}

impl Drop for RowGuard {
    fn drop(&mut self) {
        let mut chains = self.locks.lock();
        // Last in the chain: nobody is waiting, forget the row.
        if chains
            .tails
            .get(&self.key)
            .is_some_and(|tail| tail.generation == self.generation)
        {
            chains.tails.remove(&self.key);
        }
        drop(chains);

        self.release.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_turns_granted_in_reservation_order() {
        let locks = RowLocks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.reserve("departments", "42");
        let second = locks.reserve("departments", "42");
        let third = locks.reserve("departments", "42");

        // Spawn in reverse so scheduling order cannot explain the result.
        let mut handles = Vec::new();
        for (label, turn) in [(3, third), (2, second), (1, first)] {
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = turn.acquire().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                order.lock().unwrap().push(label);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(locks.active_rows(), 0);
    }

    #[tokio::test]
    async fn test_different_rows_do_not_wait() {
        let locks = RowLocks::new();

        let _held = locks.reserve("departments", "1").acquire().await;
        let other = locks.reserve("departments", "2");

        tokio::time::timeout(Duration::from_millis(100), other.acquire())
            .await
            .expect("independent row must not block");
    }

    #[tokio::test]
    async fn test_released_row_is_forgotten() {
        let locks = RowLocks::new();
        {
            let _guard = locks.reserve("companies", "abc").acquire().await;
            assert_eq!(locks.active_rows(), 1);
        }
        assert_eq!(locks.active_rows(), 0);
    }
}
