//! Many producer, single consumer message pipe
//!
//! Producers append to a queue behind a lock. The single consumer swaps that whole queue into its
//! own private queue in one go and then drains the private queue without any locking, so a
//! consumer never holds producers up for longer than a swap.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

#[derive(thiserror::Error)]
#[error("Mailbox is closed")]
pub struct MailboxClosed<T>(pub T);

impl<T> std::fmt::Debug for MailboxClosed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MailboxClosed(..)")
    }
}

impl<T> MailboxClosed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

#[derive(Debug)]
struct ProducerQueue<T> {
    items: VecDeque<T>,
    closed: bool,
}

#[derive(Debug)]
struct MailboxShared<T> {
    producer: Mutex<ProducerQueue<T>>,
    has_messages: AtomicBool,
}

impl<T> MailboxShared<T> {
    fn lock(&self) -> MutexGuard<'_, ProducerQueue<T>> {
        self.producer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Create a connected mailbox
pub fn mailbox<T>() -> (MailboxSender<T>, MailboxReceiver<T>) {
    let shared = Arc::new(MailboxShared {
        producer: Mutex::new(ProducerQueue {
            items: VecDeque::new(),
            closed: false,
        }),
        has_messages: AtomicBool::new(false),
    });
    (
        MailboxSender {
            shared: shared.clone(),
        },
        MailboxReceiver {
            shared,
            consumer: VecDeque::new(),
            scratch: VecDeque::new(),
        },
    )
}

/// Producer half, cheap to clone and usable from any thread
#[derive(Debug)]
pub struct MailboxSender<T> {
    shared: Arc<MailboxShared<T>>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> MailboxSender<T> {
    pub fn enqueue(&self, item: T) -> Result<(), MailboxClosed<T>> {
        let mut queue = self.shared.lock();
        if queue.closed {
            return Err(MailboxClosed(item));
        }
        queue.items.push_back(item);
        self.shared.has_messages.store(true, Ordering::Release);
        Ok(())
    }

    /// Append a batch under a single lock acquisition, the batch stays contiguous
    pub fn enqueue_batch<I: IntoIterator<Item = T>>(
        &self,
        items: I,
    ) -> Result<(), MailboxClosed<Vec<T>>> {
        let mut queue = self.shared.lock();
        if queue.closed {
            return Err(MailboxClosed(items.into_iter().collect()));
        }
        let before = queue.items.len();
        queue.items.extend(items);
        if queue.items.len() != before {
            self.shared.has_messages.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Hint only, may be stale by the time the caller acts on it
    pub fn has_messages(&self) -> bool {
        self.shared.has_messages.load(Ordering::Acquire)
    }
}

/// Consumer half, owned by exactly one thread at a time
#[derive(Debug)]
pub struct MailboxReceiver<T> {
    shared: Arc<MailboxShared<T>>,
    consumer: VecDeque<T>,
    /// Always empty between collects
    scratch: VecDeque<T>,
}

impl<T> MailboxReceiver<T> {
    /// Another producer for this mailbox
    pub fn sender(&self) -> MailboxSender<T> {
        MailboxSender {
            shared: self.shared.clone(),
        }
    }

    /// Swap the producer queue into the empty scratch queue, the only work done under the lock
    fn take_produced(
        scratch: &mut VecDeque<T>,
        has_messages: &AtomicBool,
        mut queue: MutexGuard<'_, ProducerQueue<T>>,
    ) {
        if queue.items.is_empty() {
            return;
        }
        std::mem::swap(scratch, &mut queue.items);
        has_messages.store(false, Ordering::Release);
    }

    fn merge_scratch(&mut self) {
        if self.consumer.is_empty() {
            std::mem::swap(&mut self.consumer, &mut self.scratch);
        } else {
            // older undrained items stay in front
            self.consumer.append(&mut self.scratch);
        }
    }

    /// Move everything producers have enqueued so far into the consumer queue, waiting for the
    /// producer lock if needed
    pub fn collect(&mut self) {
        let queue = self.shared.lock();
        Self::take_produced(&mut self.scratch, &self.shared.has_messages, queue);
        self.merge_scratch();
    }

    /// Same as [`Self::collect`] but gives up if the producer lock is contended. Returns whether
    /// the swap happened.
    pub fn try_collect(&mut self) -> bool {
        let queue = match self.shared.producer.try_lock() {
            Ok(queue) => queue,
            Err(TryLockError::Poisoned(poison)) => poison.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        Self::take_produced(&mut self.scratch, &self.shared.has_messages, queue);
        self.merge_scratch();
        true
    }

    pub fn collect_with(&mut self, blocking: bool) -> bool {
        if blocking {
            self.collect();
            true
        } else {
            self.try_collect()
        }
    }

    pub fn front(&self) -> Option<&T> {
        self.consumer.front()
    }

    pub fn pop(&mut self) -> Option<T> {
        self.consumer.pop_front()
    }

    /// Whether the consumer queue is empty, does not look at the producer queue
    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.consumer.len()
    }

    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, T> {
        self.consumer.drain(..)
    }

    pub fn has_messages(&self) -> bool {
        self.shared.has_messages.load(Ordering::Acquire)
    }

    /// Refuse any further items. Items already enqueued can still be collected.
    pub fn close(&self) {
        self.shared.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_collect_and_drain_in_order() {
        let (sender, mut receiver) = mailbox();
        sender.enqueue(1).unwrap();
        sender.enqueue(2).unwrap();
        assert!(receiver.is_empty());
        assert!(receiver.has_messages());

        receiver.collect();
        assert!(!receiver.has_messages());
        assert_eq!(receiver.front(), Some(&1));
        assert_eq!(receiver.pop(), Some(1));
        assert_eq!(receiver.pop(), Some(2));
        assert_eq!(receiver.pop(), None);
    }

    #[test]
    fn test_undrained_items_stay_in_front() {
        let (sender, mut receiver) = mailbox();
        sender.enqueue_batch([1, 2]).unwrap();
        receiver.collect();
        assert_eq!(receiver.pop(), Some(1));
        sender.enqueue_batch([3, 4]).unwrap();
        receiver.collect();
        assert_eq!(receiver.drain().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_collect_leaves_producer_queue_empty() {
        let (sender, mut receiver) = mailbox();
        sender.enqueue_batch([1, 2, 3]).unwrap();
        receiver.collect();
        assert_eq!(receiver.pop(), Some(1));

        sender.enqueue_batch([4, 5]).unwrap();
        receiver.collect();
        assert!(receiver.shared.lock().items.is_empty());
        assert!(receiver.scratch.is_empty());
        assert_eq!(receiver.len(), 4);

        // the producer side keeps working after the merge
        sender.enqueue(6).unwrap();
        assert!(receiver.try_collect());
        assert_eq!(receiver.drain().collect::<Vec<_>>(), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_try_collect_skips_when_contended() {
        let (sender, mut receiver) = mailbox();
        sender.enqueue(1).unwrap();
        {
            let shared = receiver.shared.clone();
            let _held = shared.lock();
            assert!(!receiver.try_collect());
            assert!(receiver.is_empty());
        }
        assert!(receiver.try_collect());
        assert_eq!(receiver.pop(), Some(1));
    }

    #[test]
    fn test_closed_mailbox_rejects() {
        let (sender, mut receiver) = mailbox();
        sender.enqueue("before").unwrap();
        receiver.close();
        assert!(receiver.is_closed());
        assert_eq!(sender.enqueue("after").unwrap_err().into_inner(), "after");
        assert_eq!(
            sender.enqueue_batch(["a", "b"]).unwrap_err().into_inner(),
            vec!["a", "b"]
        );
        receiver.collect();
        assert_eq!(receiver.pop(), Some("before"));
    }

    #[test]
    fn test_every_item_observed_once_per_producer_order() {
        let (sender, mut receiver) = mailbox::<(usize, usize)>();
        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let sender = sender.clone();
                thread::spawn(move || {
                    for i in 0..1000 {
                        if i % 10 == 0 {
                            sender
                                .enqueue_batch((i..i + 10).map(|j| (producer, j)))
                                .unwrap();
                        }
                    }
                })
            })
            .collect();

        let mut seen: Vec<Vec<usize>> = vec![Vec::new(); 4];
        let mut total = 0;
        while total < 4000 {
            receiver.try_collect();
            while let Some((producer, i)) = receiver.pop() {
                seen[producer].push(i);
                total += 1;
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }
        receiver.collect();
        assert!(receiver.is_empty());
        for items in seen {
            assert_eq!(items, (0..1000).collect::<Vec<_>>());
        }
    }
}
