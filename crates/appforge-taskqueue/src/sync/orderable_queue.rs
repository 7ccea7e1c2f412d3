// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unbounded FIFO queue whose pending elements can be repositioned.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

/// FIFO queue with explicit reordering of queued elements.
///
/// Every structural change takes the single internal lock, so a reorder is
/// serialised against concurrent pops and can never observe a half-moved
/// queue. Consumers blocked in [`pop`] are woken by [`push`]; the move
/// operations change order, never length, and wake nobody.
///
/// [`pop`]: OrderableQueue::pop
/// [`push`]: OrderableQueue::push
#[derive(Debug)]
pub struct OrderableQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
}

impl<T> OrderableQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    /// Appends an element at the tail and wakes one waiting consumer.
    pub async fn push(&self, item: T) {
        self.items.lock().await.push_back(item);
        self.available.notify_one();
    }

    /// Removes and returns the head element, waiting until one is queued.
    pub async fn pop(&self) -> T {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(item) = items.pop_front() {
                    // pass the wakeup on, in case several pushes landed
                    // while every consumer was still unregistered
                    if !items.is_empty() {
                        self.available.notify_one();
                    }
                    return item;
                }
            }
            self.available.notified().await;
        }
    }

    /// Removes and returns the head element if one is queued.
    pub async fn try_pop(&self) -> Option<T> {
        self.items.lock().await.pop_front()
    }

    /// Number of queued elements.
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Clones out a projection of the queued elements, head first.
    pub async fn project<U>(&self, f: impl FnMut(&T) -> U) -> Vec<U> {
        self.items.lock().await.iter().map(f).collect()
    }
}

impl<T: PartialEq> OrderableQueue<T> {
    /// Moves `item` to the head of the queue.
    ///
    /// Returns `false` when the element is not queued.
    pub async fn move_to_head(&self, item: &T) -> bool {
        let mut items = self.items.lock().await;
        match items.iter().position(|x| x == item) {
            Some(pos) => {
                if let Some(moved) = items.remove(pos) {
                    items.push_front(moved);
                }
                true
            }
            None => false,
        }
    }

    /// Moves `item` to the tail of the queue.
    ///
    /// Returns `false` when the element is not queued.
    pub async fn move_to_tail(&self, item: &T) -> bool {
        let mut items = self.items.lock().await;
        match items.iter().position(|x| x == item) {
            Some(pos) => {
                if let Some(moved) = items.remove(pos) {
                    items.push_back(moved);
                }
                true
            }
            None => false,
        }
    }

    /// Moves `item` to the position directly after `anchor`.
    ///
    /// Returns `false` and leaves the queue untouched when the two are the
    /// same element or when either is not queued.
    pub async fn move_after(&self, item: &T, anchor: &T) -> bool {
        if item == anchor {
            return false;
        }
        let mut items = self.items.lock().await;
        let pos = items.iter().position(|x| x == item);
        let anchor_pos = items.iter().position(|x| x == anchor);
        let (Some(pos), Some(anchor_pos)) = (pos, anchor_pos) else {
            return false;
        };
        if let Some(moved) = items.remove(pos) {
            // the anchor shifts left when it sat behind the removed element
            let target = if pos < anchor_pos {
                anchor_pos - 1
            } else {
                anchor_pos
            };
            items.insert(target + 1, moved);
        }
        true
    }
}

impl<T: Clone> OrderableQueue<T> {
    /// Clones out the queued elements, head first.
    pub async fn snapshot(&self) -> Vec<T> {
        self.items.lock().await.iter().cloned().collect()
    }
}

impl<T> Default for OrderableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_push_pop_is_fifo() {
        let queue = OrderableQueue::new();
        queue.push(1).await;
        queue.push(2).await;
        queue.push(3).await;

        assert_eq!(queue.len().await, 3);
        assert_eq!(queue.pop().await, 1);
        assert_eq!(queue.pop().await, 2);
        assert_eq!(queue.pop().await, 3);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_try_pop_on_empty_returns_none() {
        let queue: OrderableQueue<u32> = OrderableQueue::new();
        assert_eq!(queue.try_pop().await, None);
        queue.push(7).await;
        assert_eq!(queue.try_pop().await, Some(7));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(OrderableQueue::new());
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(42).await;
        });

        let popped = tokio::time::timeout(Duration::from_secs(5), queue.pop())
            .await
            .expect("pop should complete once an element arrives");
        assert_eq!(popped, 42);
    }

    #[tokio::test]
    async fn test_concurrent_poppers_all_served() {
        let queue = Arc::new(OrderableQueue::new());
        let poppers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();

        // let every popper reach its wait before any push lands
        tokio::time::sleep(Duration::from_millis(20)).await;
        for n in 0..4u32 {
            queue.push(n).await;
        }

        let mut served: Vec<u32> =
            futures::future::join_all(poppers)
                .await
                .into_iter()
                .map(|r| r.expect("popper task should not panic"))
                .collect();
        served.sort_unstable();
        assert_eq!(served, vec![0, 1, 2, 3]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_reorder_scenario() {
        let queue = OrderableQueue::new();
        for n in 0..12 {
            queue.push(n).await;
        }

        assert_eq!(queue.pop().await, 0);
        assert!(queue.move_to_head(&5).await);
        assert_eq!(queue.pop().await, 5);
        assert!(queue.move_after(&3, &1).await);
        assert!(queue.move_after(&2, &4).await);
        assert!(!queue.move_after(&6, &6).await);
        assert!(!queue.move_to_head(&42).await);
        assert!(!queue.move_after(&42, &1).await);
        assert!(!queue.move_after(&1, &42).await);
        assert!(queue.move_to_tail(&10).await);

        let mut drained = Vec::new();
        while let Some(n) = queue.try_pop().await {
            drained.push(n);
        }
        assert_eq!(drained, vec![1, 3, 4, 2, 6, 7, 8, 9, 11, 10]);
    }

    #[tokio::test]
    async fn test_failed_move_leaves_queue_unchanged() {
        let queue = OrderableQueue::new();
        for n in 0..5 {
            queue.push(n).await;
        }
        let before = queue.snapshot().await;

        assert!(!queue.move_to_head(&99).await);
        assert!(!queue.move_to_tail(&99).await);
        assert!(!queue.move_after(&99, &2).await);
        assert!(!queue.move_after(&2, &99).await);
        assert!(!queue.move_after(&2, &2).await);

        assert_eq!(queue.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_move_after_adjacent_positions() {
        let queue = OrderableQueue::new();
        for n in 0..4 {
            queue.push(n).await;
        }

        // moving forward past the anchor
        assert!(queue.move_after(&0, &1).await);
        assert_eq!(queue.snapshot().await, vec![1, 0, 2, 3]);
        // moving backward behind the anchor
        assert!(queue.move_after(&3, &1).await);
        assert_eq!(queue.snapshot().await, vec![1, 3, 0, 2]);
    }
}
