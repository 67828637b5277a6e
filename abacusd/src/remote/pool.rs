// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error as ThisError;
use tokio::sync::Semaphore;

use super::{RemoteSession, SessionConnector};

pub const DEFAULT_POOL_SIZE: usize = 8;

#[derive(Debug, ThisError)]
pub enum PoolError {
    /// The slot stays borrowed; the caller still owes a `release(slot)`.
    #[error("failed to open a session for pool slot {slot}: {source:#}")]
    Connect {
        slot: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("connection pool is closed")]
    Closed,
}

struct Slot {
    available: bool,
    session: Option<Arc<dyn RemoteSession>>,
}

/// Fixed number of sessions to one login node.
///
/// A semaphore sized to the capacity gates `borrow`; waiting has no timeout.
pub struct ConnectionPool {
    connector: Arc<dyn SessionConnector>,
    permits: Semaphore,
    slots: Mutex<Vec<Slot>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn SessionConnector>, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                available: true,
                session: None,
            })
            .collect();
        Self {
            connector,
            permits: Semaphore::new(capacity),
            slots: Mutex::new(slots),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn outstanding(&self) -> usize {
        self.lock_slots().iter().filter(|s| !s.available).count()
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits for a free slot and returns it with a live session.
    ///
    /// The slot is reserved under the pool lock; connecting happens after the
    /// lock is dropped so a slow handshake does not stall other borrowers.
    /// Dropping the future mid-connect gives the slot and its permit back.
    pub async fn borrow(&self) -> Result<(usize, Arc<dyn RemoteSession>), PoolError> {
        let permit = self.permits.acquire().await.map_err(|_| PoolError::Closed)?;
        permit.forget();

        let (reservation, cached) = {
            let mut slots = self.lock_slots();
            let Some(index) = slots.iter().position(|s| s.available) else {
                drop(slots);
                self.permits.add_permits(1);
                return Err(PoolError::Closed);
            };
            slots[index].available = false;
            let cached = slots[index].session.clone();
            (Reservation::new(self, index), cached)
        };
        let slot = reservation.slot;

        if let Some(session) = cached {
            if session.is_alive() {
                tracing::trace!(slot, "reusing pooled session");
                return Ok((reservation.keep(), session));
            }
            tracing::info!(slot, "pooled session is closed, reconnecting");
        }

        match self.connector.connect().await {
            Ok(session) => {
                self.lock_slots()[slot].session = Some(session.clone());
                tracing::debug!(slot, "opened pooled session");
                Ok((reservation.keep(), session))
            }
            Err(source) => {
                self.lock_slots()[slot].session = None;
                Err(PoolError::Connect {
                    slot: reservation.keep(),
                    source,
                })
            }
        }
    }

    /// Gives the slot back. The slot is marked available before the permit is
    /// released so no other borrower can pick it while it still looks taken.
    pub fn release(&self, slot: usize) {
        {
            let mut slots = self.lock_slots();
            match slots.get_mut(slot) {
                Some(entry) if !entry.available => entry.available = true,
                _ => {
                    tracing::warn!(slot, "release of a pool slot that is not borrowed");
                    return;
                }
            }
        }
        self.permits.add_permits(1);
    }

    /// Borrow paired with an automatic release when the guard is dropped.
    pub async fn lease(self: &Arc<Self>) -> Result<PooledSession, PoolError> {
        match self.borrow().await {
            Ok((slot, session)) => Ok(PooledSession {
                pool: Arc::clone(self),
                slot,
                session,
            }),
            Err(PoolError::Connect { slot, source }) => {
                self.release(slot);
                Err(PoolError::Connect { slot, source })
            }
            Err(err) => Err(err),
        }
    }

    pub fn close(&self) {
        self.permits.close();
    }
}

/// A slot taken by an in-flight `borrow`. Released on drop unless kept.
struct Reservation<'a> {
    pool: &'a ConnectionPool,
    slot: usize,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a ConnectionPool, slot: usize) -> Self {
        Self {
            pool,
            slot,
            armed: true,
        }
    }

    /// Hands the slot over to the caller.
    fn keep(mut self) -> usize {
        self.armed = false;
        self.slot
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(slot = self.slot, "borrow abandoned, releasing reserved slot");
            self.pool.release(self.slot);
        }
    }
}

/// Exclusively borrowed session; returns itself to the pool on drop.
pub struct PooledSession {
    pool: Arc<ConnectionPool>,
    slot: usize,
    session: Arc<dyn RemoteSession>,
}

impl PooledSession {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn session(&self) -> &dyn RemoteSession {
        self.session.as_ref()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{FakeConnector, FakeRemote};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pool_with(capacity: usize) -> (Arc<ConnectionPool>, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::new(FakeRemote::new()));
        let pool = Arc::new(ConnectionPool::new(connector.clone(), capacity));
        (pool, connector)
    }

    #[tokio::test]
    async fn borrow_blocks_when_every_slot_is_taken() {
        let (pool, _) = pool_with(2);
        let first = pool.lease().await.unwrap();
        let _second = pool.lease().await.unwrap();
        assert_eq!(pool.outstanding(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.lease()).await;
        assert!(blocked.is_err());

        let released = first.slot();
        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(200), pool.lease())
            .await
            .expect("slot should be free again")
            .unwrap();
        assert_eq!(third.slot(), released);
        assert_eq!(pool.outstanding(), 2);
    }

    #[tokio::test]
    async fn returned_session_is_reused() {
        let (pool, connector) = pool_with(1);
        let (slot, _) = pool.borrow().await.unwrap();
        pool.release(slot);
        let (again, _) = pool.borrow().await.unwrap();
        assert_eq!(slot, again);
        assert_eq!(connector.connects(), 1);
        pool.release(again);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn dead_session_is_replaced_on_borrow() {
        let (pool, connector) = pool_with(1);
        drop(pool.lease().await.unwrap());
        connector.issued()[0].kill();

        let lease = pool.lease().await.unwrap();
        assert!(lease.session().is_alive());
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn failed_connect_keeps_permit_until_release() {
        let (pool, connector) = pool_with(1);
        connector.set_failing(true);
        let err = match pool.borrow().await {
            Err(err) => err,
            Ok(_) => panic!("expected connect failure"),
        };
        let PoolError::Connect { slot, .. } = err else {
            panic!("unexpected error: {err}");
        };
        connector.set_failing(false);

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.borrow()).await;
        assert!(blocked.is_err());

        pool.release(slot);
        let (slot, session) = pool.borrow().await.unwrap();
        assert!(session.is_alive());
        pool.release(slot);
    }

    #[tokio::test]
    async fn lease_releases_slot_on_connect_failure() {
        let (pool, connector) = pool_with(1);
        connector.set_failing(true);
        assert!(matches!(pool.lease().await, Err(PoolError::Connect { slot: 0, .. })));
        assert_eq!(pool.outstanding(), 0);

        connector.set_failing(false);
        let lease = pool.lease().await.unwrap();
        assert_eq!(lease.slot(), 0);
    }

    #[tokio::test]
    async fn abandoned_connect_returns_slot_and_permit() {
        let (pool, connector) = pool_with(1);
        connector.set_stalling(true);
        let abandoned = tokio::time::timeout(Duration::from_millis(50), pool.borrow()).await;
        assert!(abandoned.is_err());
        assert_eq!(pool.outstanding(), 0);

        connector.set_stalling(false);
        let lease = tokio::time::timeout(Duration::from_millis(200), pool.lease())
            .await
            .expect("slot should be borrowable again")
            .unwrap();
        assert_eq!(lease.slot(), 0);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn double_release_does_not_add_capacity() {
        let (pool, _) = pool_with(1);
        let (slot, _) = pool.borrow().await.unwrap();
        pool.release(slot);
        pool.release(slot);
        let _held = pool.lease().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.lease()).await;
        assert!(blocked.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_borrowers_never_exceed_capacity() {
        let (pool, _) = pool_with(3);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..24 {
            let pool = pool.clone();
            let in_use = in_use.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let lease = pool.lease().await.unwrap();
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);
                drop(lease);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.outstanding(), 0);
    }
}
