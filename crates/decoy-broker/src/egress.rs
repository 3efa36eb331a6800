//! Bounded per-leg egress queues with kind-aware backpressure.
//!
//! Audio is best-effort: on overflow the oldest queued audio envelope is
//! shed first. Transcript, coaching, and intelligence envelopes are never
//! dropped; they block the producer, and a block that outlives the
//! configured timeout marks the consumer slow so the session can drain the
//! leg.

use decoy_types::Envelope;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Failure modes for blocking pushes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EgressError {
    /// The consumer failed to free space within the block timeout.
    #[error("egress queue blocked past the slow-consumer deadline")]
    SlowConsumer,
    /// The queue was closed during teardown.
    #[error("egress queue closed")]
    Closed,
}

struct Shared {
    queue: Mutex<VecDeque<Envelope>>,
    closed: AtomicBool,
    readable: Notify,
    writable: Notify,
    capacity: usize,
    block_timeout: Duration,
}

/// Producer half, held by the session. Clonable so the session can push to
/// a leg from multiple code paths.
#[derive(Clone)]
pub struct EgressQueue {
    shared: Arc<Shared>,
}

/// Consumer half, owned by the leg's writer task.
pub struct EgressReceiver {
    shared: Arc<Shared>,
}

/// Creates one bounded queue pair for a leg.
pub fn egress_queue(capacity: usize, block_timeout: Duration) -> (EgressQueue, EgressReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        closed: AtomicBool::new(false),
        readable: Notify::new(),
        writable: Notify::new(),
        capacity: capacity.max(1),
        block_timeout,
    });
    (
        EgressQueue {
            shared: shared.clone(),
        },
        EgressReceiver { shared },
    )
}

impl EgressQueue {
    /// Enqueues a best-effort audio envelope without blocking.
    ///
    /// Returns how many envelopes were shed to make room (0 or 1). When the
    /// queue is saturated with non-droppable envelopes the incoming chunk
    /// itself is shed.
    pub fn push_audio(&self, envelope: Envelope) -> Result<usize, EgressError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(EgressError::Closed);
        }
        let mut queue = self.shared.queue.lock().expect("egress queue poisoned");
        let mut shed = 0;
        if queue.len() >= self.shared.capacity {
            match queue.iter().position(Envelope::is_droppable) {
                Some(oldest_audio) => {
                    queue.remove(oldest_audio);
                    shed = 1;
                }
                None => return Ok(1), // incoming chunk is the casualty
            }
        }
        queue.push_back(envelope);
        drop(queue);
        self.shared.readable.notify_one();
        Ok(shed)
    }

    /// Enqueues a must-deliver envelope, waiting for space up to the
    /// slow-consumer deadline.
    pub async fn push(&self, envelope: Envelope) -> Result<(), EgressError> {
        let deadline = Instant::now() + self.shared.block_timeout;
        let mut envelope = Some(envelope);
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(EgressError::Closed);
            }
            {
                let mut queue = self.shared.queue.lock().expect("egress queue poisoned");
                if queue.len() < self.shared.capacity {
                    queue.push_back(envelope.take().expect("envelope present"));
                    drop(queue);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }
            let notified = self.shared.writable.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(EgressError::SlowConsumer);
            }
        }
    }

    /// Closes the queue. Already-enqueued envelopes remain receivable; new
    /// pushes fail.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().expect("egress queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl EgressReceiver {
    /// Receives the next envelope; `None` once the queue is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            {
                let mut queue = self.shared.queue.lock().expect("egress queue poisoned");
                if let Some(envelope) = queue.pop_front() {
                    drop(queue);
                    self.shared.writable.notify_one();
                    return Some(envelope);
                }
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.readable.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().expect("egress queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decoy_types::Role;

    fn audio(seq: u64) -> Envelope {
        Envelope::Audio {
            codec: "wav-pcm".to_string(),
            payload: vec![0, 1],
            seq: Some(seq),
            source: Some(Role::Scammer),
        }
    }

    fn transcript(text: &str) -> Envelope {
        Envelope::Transcript {
            speaker: Role::Scammer,
            text: text.to_string(),
            language: "en".to_string(),
            confidence: 0.9,
            started_at_ms: 0,
            ended_at_ms: 100,
        }
    }

    #[tokio::test]
    async fn audio_overflow_sheds_oldest_first() {
        let (tx, mut rx) = egress_queue(3, Duration::from_millis(50));
        for seq in 0..3 {
            assert_eq!(tx.push_audio(audio(seq)).unwrap(), 0);
        }
        // Queue full: pushing sheds the oldest audio envelope.
        assert_eq!(tx.push_audio(audio(3)).unwrap(), 1);

        let mut seqs = Vec::new();
        while let Some(Envelope::Audio { seq, .. }) = rx.recv().await {
            seqs.push(seq.unwrap());
            if seqs.len() == 3 {
                break;
            }
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn non_droppable_envelopes_survive_audio_pressure() {
        let (tx, mut rx) = egress_queue(2, Duration::from_millis(200));
        tx.push(transcript("first")).await.unwrap();
        tx.push_audio(audio(0)).unwrap();
        // Overflow: the audio envelope goes, the transcript stays.
        assert_eq!(tx.push_audio(audio(1)).unwrap(), 1);

        assert!(matches!(rx.recv().await, Some(Envelope::Transcript { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(Envelope::Audio { seq: Some(1), .. })
        ));
    }

    #[tokio::test]
    async fn saturated_queue_of_control_envelopes_sheds_incoming_audio() {
        let (tx, _rx) = egress_queue(2, Duration::from_millis(50));
        tx.push(transcript("a")).await.unwrap();
        tx.push(transcript("b")).await.unwrap();
        assert_eq!(tx.push_audio(audio(9)).unwrap(), 1);
        assert_eq!(tx.len(), 2);
    }

    #[tokio::test]
    async fn blocked_push_times_out_as_slow_consumer() {
        let (tx, _rx) = egress_queue(1, Duration::from_millis(50));
        tx.push(transcript("a")).await.unwrap();
        let err = tx.push(transcript("b")).await.unwrap_err();
        assert_eq!(err, EgressError::SlowConsumer);
    }

    #[tokio::test]
    async fn blocked_push_resumes_when_consumer_drains() {
        let (tx, mut rx) = egress_queue(1, Duration::from_secs(5));
        tx.push(transcript("a")).await.unwrap();

        let tx2 = tx.clone();
        let pusher = tokio::spawn(async move { tx2.push(transcript("b")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(rx.recv().await, Some(Envelope::Transcript { .. })));
        pusher.await.unwrap().unwrap();
        assert!(matches!(rx.recv().await, Some(Envelope::Transcript { .. })));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let (tx, mut rx) = egress_queue(4, Duration::from_millis(50));
        tx.push(transcript("last words")).await.unwrap();
        tx.close();
        assert!(tx.push(transcript("late")).await.is_err());
        assert!(tx.push_audio(audio(0)).is_err());
        assert!(matches!(rx.recv().await, Some(Envelope::Transcript { .. })));
        assert_eq!(rx.recv().await, None);
    }
}
