//! Per-run event fan-out.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::pipeline::{Progress, Run};

use super::{EventPayload, RunEvent};

/// Broadcast channel plus sequence counter for one run.
///
/// Callers publish while holding the run's state lock, so sequence order is
/// state-change order.
pub struct EventBroadcaster {
    run_id: String,
    sender: broadcast::Sender<RunEvent>,
    seq: AtomicU64,
}

impl EventBroadcaster {
    pub fn new(run_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            run_id: run_id.into(),
            sender,
            seq: AtomicU64::new(0),
        }
    }

    /// Sequence number of the last published event.
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Publishes an event and returns its sequence number. Having no
    /// subscribers is not an error.
    pub fn publish(&self, progress: Progress, payload: EventPayload) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = RunEvent {
            run_id: self.run_id.clone(),
            seq,
            progress,
            payload,
        };
        let _ = self.sender.send(event);
        seq
    }

    /// Snapshot event stamped with the current sequence number: it reflects
    /// every event up to and including that number.
    pub fn snapshot(&self, run: &Run) -> RunEvent {
        RunEvent {
            run_id: self.run_id.clone(),
            seq: self.current_seq(),
            progress: run.progress,
            payload: EventPayload::Snapshot {
                run: Box::new(run.clone()),
            },
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Turns a receiver into a subscriber stream.
///
/// Yields `initial` first, then live events. When the receiver lags, the
/// dropped events are replaced by a fresh snapshot from `resnapshot`; events
/// already covered by a snapshot are skipped. The stream ends after the
/// first event announcing a terminal run status.
pub fn event_stream<F, Fut>(
    initial: RunEvent,
    receiver: broadcast::Receiver<RunEvent>,
    resnapshot: F,
) -> impl Stream<Item = RunEvent> + Send
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = RunEvent> + Send,
{
    async_stream::stream! {
        let mut last_seq = initial.seq;
        let done = initial.is_terminal();
        yield initial;
        if done {
            return;
        }

        let mut live = BroadcastStream::new(receiver);
        while let Some(item) = live.next().await {
            match item {
                Ok(event) => {
                    if event.seq <= last_seq {
                        continue;
                    }
                    last_seq = event.seq;
                    let done = event.is_terminal();
                    yield event;
                    if done {
                        break;
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped = skipped, "Subscriber lagged, sending fresh snapshot");
                    let snapshot = resnapshot().await;
                    last_seq = snapshot.seq;
                    let done = snapshot.is_terminal();
                    yield snapshot;
                    if done {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{RunStatus, Task};

    fn patch(b: &EventBroadcaster, id: &str) -> u64 {
        b.publish(
            Progress::default(),
            EventPayload::TaskPatch {
                task: Task::new(id, "doc", "g", "m", 1),
            },
        )
    }

    fn fake_snapshot(b: &EventBroadcaster, status: RunStatus) -> RunEvent {
        // A status event stands in for a snapshot here; both carry a seq
        // and terminal detection.
        RunEvent {
            run_id: "r".to_string(),
            seq: b.current_seq(),
            progress: Progress::default(),
            payload: EventPayload::RunStatus { status },
        }
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let b = EventBroadcaster::new("r", 8);
        assert_eq!(patch(&b, "a"), 1);
        assert_eq!(patch(&b, "b"), 2);
        assert_eq!(b.current_seq(), 2);
    }

    #[tokio::test]
    async fn test_stream_yields_initial_then_live_until_terminal() {
        let b = std::sync::Arc::new(EventBroadcaster::new("r", 8));
        let initial = fake_snapshot(&b, RunStatus::Running);
        let rx = b.subscribe();
        let b2 = b.clone();
        let stream = event_stream(initial, rx, move || {
            let b = b2.clone();
            async move { fake_snapshot(&b, RunStatus::Running) }
        });

        patch(&b, "a");
        b.publish(
            Progress::default(),
            EventPayload::RunStatus {
                status: RunStatus::Completed,
            },
        );
        patch(&b, "after-terminal");

        let events: Vec<_> = stream.collect().await;
        let seqs: Vec<_> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_fresh_snapshot() {
        let b = std::sync::Arc::new(EventBroadcaster::new("r", 2));
        let initial = fake_snapshot(&b, RunStatus::Running);
        let rx = b.subscribe();
        let b2 = b.clone();
        let stream = event_stream(initial, rx, move || {
            let b = b2.clone();
            async move { fake_snapshot(&b, RunStatus::Completed) }
        });

        for i in 0..5 {
            patch(&b, &format!("t{}", i));
        }

        let events: Vec<_> = stream.collect().await;
        // initial, then the snapshot replacing the lost patches; the
        // snapshot is terminal so the stream ends there.
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].seq, 5);
        assert!(matches!(
            events[1].payload,
            EventPayload::RunStatus {
                status: RunStatus::Completed
            }
        ));
    }
}
