//! Double-buffered message batch with wait-free slot reservation
//!
//! A [MessageBatch] holds two fixed-capacity generations. Appending
//! reserves a slot with an atomic fetch-add and publishes it with a
//! release increment of the commit counter, so `committed ≤ reserved ≤
//! capacity` holds at all times. Flushing swaps the active generation,
//! seals the retired one, waits for in-flight appends to commit, and
//! drains the contiguous prefix `[0, committed)` in append order.
//!
//! Within one generation, flush order equals append order. Across a
//! generation boundary strict append order is not guaranteed: an append
//! racing the swap may land in the retired generation and surface with
//! the next flush.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::sync::{SpinPriority, Spinner};
use crate::Message;

/// Result of a failed append; the message is handed back to the caller.
#[derive(Debug)]
pub enum AppendError {
    /// both attempts hit a full generation
    Full(Message),
    /// the batch was closed and no longer accepts appends
    Closed(Message),
}

impl AppendError {
    /// Recovers the message for fallback routing.
    pub fn into_message(self) -> Message {
        match self {
            AppendError::Full(m) | AppendError::Closed(m) => m,
        }
    }
}

struct Generation {
    slots: Box<[Mutex<Option<Message>>]>,
    reserved: AtomicUsize,
    committed: AtomicUsize,
}

impl Generation {
    fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        Generation {
            slots,
            reserved: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
        }
    }

    fn store(&self, index: usize, message: Message) {
        match self.slots[index].lock() {
            Ok(mut slot) => *slot = Some(message),
            Err(poisoned) => *poisoned.into_inner() = Some(message),
        }
        let _ = self.committed.fetch_add(1, Ordering::Release);
    }

    fn take(&self, index: usize) -> Option<Message> {
        match self.slots[index].lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Bounded, double-buffered buffer of messages awaiting a flush.
pub struct MessageBatch {
    generations: [Generation; 2],
    active: AtomicUsize,
    sealed: AtomicBool,
    flushing: AtomicBool,
    last_flush: Mutex<Instant>,
    capacity: usize,
}

impl MessageBatch {
    /// Creates a batch holding up to `capacity` messages per generation.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        MessageBatch {
            generations: [Generation::new(capacity), Generation::new(capacity)],
            active: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            last_flush: Mutex::new(Instant::now()),
            capacity,
        }
    }

    /// Messages committed to the active generation.
    pub fn len(&self) -> usize {
        let idx = self.active.load(Ordering::Acquire);
        self.generations[idx].committed.load(Ordering::Acquire)
    }

    /// True when the active generation holds no committed messages.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of one generation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a message. Reservation is a single fetch-add; a full or
    /// sealed generation hands the message back.
    pub fn append(&self, message: Message) -> Result<(), AppendError> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(AppendError::Closed(message));
        }
        let mut carried = Some(message);
        for _ in 0..2 {
            let idx = self.active.load(Ordering::Acquire);
            let generation = &self.generations[idx];
            let slot = generation.reserved.fetch_add(1, Ordering::AcqRel);
            if slot < self.capacity {
                if let Some(m) = carried.take() {
                    generation.store(slot, m);
                }
                return Ok(());
            }
            // generation full or sealed mid-flush; retry once if the
            // active generation moved on under us
            if self.active.load(Ordering::Acquire) == idx {
                break;
            }
        }
        match carried.take() {
            Some(m) => Err(AppendError::Full(m)),
            None => Ok(()),
        }
    }

    /// Appends, flushing once when full. The drained generation is handed
    /// to `on_flush`; a second full generation hands the message back for
    /// fallback routing.
    pub async fn append_or_flush(
        &self,
        message: Message,
        mut on_flush: impl FnMut(Vec<Message>),
    ) -> Result<(), Message> {
        match self.append(message) {
            Ok(()) => Ok(()),
            Err(AppendError::Closed(m)) => Err(m),
            Err(AppendError::Full(m)) => {
                let drained = self.flush().await;
                if !drained.is_empty() {
                    on_flush(drained);
                }
                match self.append(m) {
                    Ok(()) => Ok(()),
                    Err(e) => Err(e.into_message()),
                }
            }
        }
    }

    /// Swaps generations and drains the retired one in append order.
    ///
    /// Single flusher at a time; a racing call drains nothing.
    pub async fn flush(&self) -> Vec<Message> {
        if self.flushing.swap(true, Ordering::AcqRel) {
            warn!("concurrent batch flush ignored");
            return Vec::new();
        }
        let idx = self.active.load(Ordering::Acquire);
        self.active.store(1 - idx, Ordering::Release);
        let generation = &self.generations[idx];

        // seal the retired generation; late reservations see it as full
        let end = generation
            .reserved
            .swap(self.capacity, Ordering::AcqRel)
            .min(self.capacity);

        // wait for in-flight appends to publish their slots
        let mut spinner = Spinner::new(SpinPriority::Realtime);
        while generation.committed.load(Ordering::Acquire) < end {
            spinner.wait().await;
        }

        let mut drained = Vec::with_capacity(end);
        for i in 0..end {
            if let Some(message) = generation.take(i) {
                drained.push(message);
            }
        }

        generation.committed.store(0, Ordering::Release);
        generation.reserved.store(0, Ordering::Release);
        if let Ok(mut last) = self.last_flush.lock() {
            *last = Instant::now();
        }
        self.flushing.store(false, Ordering::Release);
        drained
    }

    /// Flushes when the flush interval elapsed or the active generation is
    /// at least half full.
    pub async fn flush_on_timeout(&self, interval: Duration) -> Option<Vec<Message>> {
        let due = self
            .last_flush
            .lock()
            .map(|last| last.elapsed() >= interval)
            .unwrap_or(true);
        if due || self.len() * 2 >= self.capacity {
            let drained = self.flush().await;
            if !drained.is_empty() {
                return Some(drained);
            }
        }
        None
    }

    /// Stops accepting appends, waits up to `shutdown_timeout` for
    /// in-flight appends, and returns everything still buffered.
    pub async fn close(&self, shutdown_timeout: Duration) -> Vec<Message> {
        self.sealed.store(true, Ordering::Release);
        let mut remaining = match timeout(shutdown_timeout, self.flush()).await {
            Ok(drained) => drained,
            Err(_) => {
                warn!("batch close timed out waiting for in-flight appends");
                return Vec::new();
            }
        };
        // the spare generation may hold appends that raced an earlier swap
        if let Ok(rest) = timeout(shutdown_timeout, self.flush()).await {
            remaining.extend(rest);
        }
        remaining
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn msg(n: usize) -> Message {
        Message {
            bytes: format!("m{n}").into_bytes(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn flush_preserves_append_order() {
        let batch = MessageBatch::new(8);
        for n in 0..5 {
            batch.append(msg(n)).unwrap();
        }
        let drained = batch.flush().await;
        let texts: Vec<_> = drained.iter().map(|m| m.bytes.clone()).collect();
        assert_eq!(texts, vec![b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec(), b"m4".to_vec()]);
    }

    #[tokio::test]
    async fn full_batch_rejects_with_message_returned() {
        let batch = MessageBatch::new(2);
        batch.append(msg(0)).unwrap();
        batch.append(msg(1)).unwrap();
        match batch.append(msg(2)) {
            Err(AppendError::Full(m)) => assert_eq!(m.bytes, b"m2"),
            other => panic!("expected Full, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn append_or_flush_drains_then_retries() {
        let batch = MessageBatch::new(2);
        batch.append(msg(0)).unwrap();
        batch.append(msg(1)).unwrap();

        let mut flushed = Vec::new();
        batch
            .append_or_flush(msg(2), |drained| flushed.extend(drained))
            .await
            .unwrap();

        assert_eq!(flushed.len(), 2);
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn closed_batch_refuses_appends() {
        let batch = MessageBatch::new(4);
        batch.append(msg(0)).unwrap();
        let remaining = batch.close(Duration::from_secs(1)).await;
        assert_eq!(remaining.len(), 1);
        assert!(matches!(batch.append(msg(1)), Err(AppendError::Closed(_))));
    }

    #[tokio::test]
    async fn flush_on_timeout_half_full_trigger() {
        let batch = MessageBatch::new(4);
        batch.append(msg(0)).unwrap();
        batch.append(msg(1)).unwrap();
        // interval far away but batch is half full
        let drained = batch.flush_on_timeout(Duration::from_secs(3600)).await;
        assert_eq!(drained.map(|d| d.len()), Some(2));
    }

    #[tokio::test]
    async fn flush_on_timeout_quiet_batch_stays() {
        let batch = MessageBatch::new(8);
        batch.append(msg(0)).unwrap();
        let drained = batch.flush_on_timeout(Duration::from_secs(3600)).await;
        assert!(drained.is_none());
    }

    #[tokio::test]
    async fn generations_alternate() {
        let batch = MessageBatch::new(4);
        batch.append(msg(0)).unwrap();
        assert_eq!(batch.flush().await.len(), 1);
        batch.append(msg(1)).unwrap();
        batch.append(msg(2)).unwrap();
        assert_eq!(batch.flush().await.len(), 2);
        assert!(batch.flush().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_all_surface() {
        let batch = Arc::new(MessageBatch::new(64));
        let mut tasks = Vec::new();
        for n in 0..32 {
            let batch = Arc::clone(&batch);
            tasks.push(tokio::spawn(async move { batch.append(msg(n)).is_ok() }));
        }
        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 32);
        let drained = batch.flush().await;
        assert_eq!(drained.len(), 32);
    }

    #[tokio::test]
    async fn commit_counter_never_exceeds_reserved() {
        let batch = MessageBatch::new(2);
        batch.append(msg(0)).unwrap();
        // failed appends must not disturb the committed count
        let _ = batch.append(msg(1));
        let _ = batch.append(msg(2));
        let generation = &batch.generations[batch.active.load(Ordering::Acquire)];
        let committed = generation.committed.load(Ordering::Acquire);
        let reserved = generation.reserved.load(Ordering::Acquire).min(batch.capacity);
        assert!(committed <= reserved);
        assert_eq!(batch.flush().await.len(), 2);
    }
}
