// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-capacity FIFO that evicts its oldest element instead of rejecting.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};

use tokio::sync::Mutex;
use tracing::warn;

type EvictionCallback<T> = Box<dyn Fn(T) + Send + Sync>;

/// Bounded FIFO of retired items.
///
/// [`push`] never blocks and never rejects: at capacity the oldest element
/// is removed first and handed to the eviction callback, then the new
/// element is inserted. The callback runs synchronously inside `push`, and
/// eviction is best effort: a panicking callback is contained and logged,
/// and the insert still happens.
///
/// [`push`]: BoundedHistoryQueue::push
pub struct BoundedHistoryQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: NonZeroUsize,
    on_evict: Option<EvictionCallback<T>>,
}

impl<T> BoundedHistoryQueue<T> {
    /// Creates a queue that silently drops evicted elements.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.get())),
            capacity,
            on_evict: None,
        }
    }

    /// Creates a queue that hands every evicted element to `on_evict`.
    pub fn with_eviction_callback(
        capacity: NonZeroUsize,
        on_evict: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.get())),
            capacity,
            on_evict: Some(Box::new(on_evict)),
        }
    }

    /// Appends an element, evicting the oldest one first when full.
    pub async fn push(&self, item: T) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity.get() {
            if let Some(oldest) = items.pop_front() {
                if let Some(on_evict) = &self.on_evict {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| on_evict(oldest)));
                    if outcome.is_err() {
                        warn!("Eviction callback panicked, element dropped");
                    }
                }
            }
        }
        items.push_back(item);
    }

    /// Removes and returns the first element matching `pred`.
    pub async fn remove_where(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let mut items = self.items.lock().await;
        let pos = items.iter().position(pred)?;
        items.remove(pos)
    }

    /// Removes and returns every element, oldest first.
    pub async fn drain(&self) -> Vec<T> {
        self.items.lock().await.drain(..).collect()
    }

    /// Number of retained elements.
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    /// Whether nothing is retained.
    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Maximum number of retained elements.
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}

impl<T: Clone> BoundedHistoryQueue<T> {
    /// Clones out the retained elements, oldest first.
    pub async fn iter_snapshot(&self) -> Vec<T> {
        self.items.lock().await.iter().cloned().collect()
    }
}
