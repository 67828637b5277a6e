// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::app::errors::AppResult;
use crate::app::ports::EventPublisherPort;
use crate::app::types::JobEvent;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// In-process fan-out: every published event goes to every live subscriber.
///
/// Each subscriber gets a bounded channel, so a slow consumer applies
/// backpressure to publishers. Subscribers that dropped their receiver are
/// pruned on the next publish.
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<JobEvent>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }

    fn senders(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<JobEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

#[async_trait]
impl EventPublisherPort for EventBus {
    async fn publish(&self, event: JobEvent) -> AppResult<()> {
        let targets = self.senders().clone();
        if targets.is_empty() {
            tracing::debug!("no subscribers for job event");
            return Ok(());
        }
        let mut dropped = false;
        for tx in &targets {
            if tx.send(event.clone()).await.is_err() {
                dropped = true;
            }
        }
        if dropped {
            self.senders().retain(|tx| !tx.is_closed());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::SchedulerEvent;

    fn event(id: u64) -> JobEvent {
        JobEvent::Scheduler(SchedulerEvent::Running(id))
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        for id in 1..=3 {
            bus.publish(event(id)).await.unwrap();
        }
        for rx in [&mut a, &mut b] {
            for id in 1..=3 {
                assert_eq!(rx.recv().await, Some(event(id)));
            }
        }
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = EventBus::new(8);
        let mut alive = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(event(1)).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(alive.recv().await, Some(event(1)));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(event(1)).await.unwrap();
    }
}
