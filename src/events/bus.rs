//! Durable, ordered per-job event log with live fan-out

use super::StatusOverlay;
use crate::error::Result;
use crate::metrics::EVENTS_PUBLISHED_TOTAL;
use crate::models::{Event, EventPayload};
use crate::state::Ledger;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 256;
const TERMINAL_GRACE: Duration = Duration::from_millis(500);

/// Appends events to the ledger, folds them into the status overlay and
/// broadcasts them to live subscribers, in that order.
pub struct EventBus {
    ledger: Arc<dyn Ledger>,
    overlay: Arc<StatusOverlay>,
    channels: Arc<DashMap<Uuid, broadcast::Sender<Event>>>,
    /// Held across append and broadcast so live delivery follows `seq` order
    publish_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(ledger: Arc<dyn Ledger>, overlay: Arc<StatusOverlay>) -> Self {
        Self::with_capacity(ledger, overlay, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(ledger: Arc<dyn Ledger>, overlay: Arc<StatusOverlay>, capacity: usize) -> Self {
        Self {
            ledger,
            overlay,
            channels: Arc::new(DashMap::new()),
            publish_locks: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn overlay(&self) -> &Arc<StatusOverlay> {
        &self.overlay
    }

    fn sender(&self, job_id: Uuid) -> broadcast::Sender<Event> {
        self.channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event for `job_id` and return it with its assigned `seq`
    pub async fn publish(&self, job_id: Uuid, payload: EventPayload) -> Result<Event> {
        let lock = self
            .publish_locks
            .entry(job_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        let event = self.ledger.append_event(&job_id, payload).await?;
        self.overlay.apply(&event);

        debug!(
            job_id = %job_id,
            seq = event.seq,
            event_type = event.payload.event_type(),
            "Publishing event"
        );
        EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[event.payload.event_type()])
            .inc();

        if let Some(tx) = self.channels.get(&job_id) {
            // No receivers is not an error; subscribers replay from the ledger
            let _ = tx.send(event.clone());
        }

        if event.payload.is_terminal() {
            self.channels.remove(&job_id);
            drop(guard);
            self.publish_locks.remove(&job_id);
        }

        Ok(event)
    }

    /// Ordered, gap-free stream of events with `seq > after_seq`.
    ///
    /// Persisted events are replayed first, then live ones follow. The stream
    /// ends after a terminal event or when the receiver is dropped.
    pub fn subscribe(&self, job_id: Uuid, after_seq: u64) -> ReceiverStream<Event> {
        // Subscribe before reading the log so nothing published in between is missed
        let live = self.sender(job_id).subscribe();
        let (tx, rx) = mpsc::channel(self.capacity);
        let ledger = self.ledger.clone();
        let channels = self.channels.clone();

        tokio::spawn(async move {
            let mut forwarder = Forwarder {
                job_id,
                last_seq: after_seq,
                ledger,
                tx,
            };
            forwarder.run(live).await;
            channels.remove_if(&job_id, |_, sender| sender.receiver_count() == 0);
        });

        ReceiverStream::new(rx)
    }

    pub fn subscriber_count(&self, job_id: &Uuid) -> usize {
        self.channels
            .get(job_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

struct Forwarder {
    job_id: Uuid,
    last_seq: u64,
    ledger: Arc<dyn Ledger>,
    tx: mpsc::Sender<Event>,
}

enum Flow {
    Continue,
    Finished,
}

impl Forwarder {
    async fn run(&mut self, mut live: broadcast::Receiver<Event>) {
        if let Flow::Finished = self.catch_up().await {
            return;
        }
        // A job that already ended only gets a short window for its final event
        let grace = if self.job_is_terminal().await {
            Some(TERMINAL_GRACE)
        } else {
            None
        };

        loop {
            let received = match grace {
                Some(grace) => match tokio::time::timeout(grace, live.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.catch_up().await;
                        return;
                    }
                },
                None => live.recv().await,
            };
            match received {
                Ok(event) => {
                    let flow = if event.seq <= self.last_seq {
                        Flow::Continue
                    } else if event.seq == self.last_seq + 1 {
                        self.forward(event).await
                    } else {
                        self.catch_up().await
                    };
                    if let Flow::Finished = flow {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(job_id = %self.job_id, skipped, "Event subscriber lagged, refilling from ledger");
                    if let Flow::Finished = self.catch_up().await {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Channel dropped after a terminal event; drain what the ledger has
                    self.catch_up().await;
                    return;
                }
            }
        }
    }

    /// Forward everything persisted after `last_seq`
    async fn catch_up(&mut self) -> Flow {
        let events = match self.ledger.events_after(&self.job_id, self.last_seq).await {
            Ok(events) => events,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Failed to read events from ledger");
                return Flow::Finished;
            }
        };
        for event in events {
            if let Flow::Finished = self.forward(event).await {
                return Flow::Finished;
            }
        }
        Flow::Continue
    }

    async fn forward(&mut self, event: Event) -> Flow {
        self.last_seq = event.seq;
        let terminal = event.payload.is_terminal();
        if self.tx.send(event).await.is_err() || terminal {
            return Flow::Finished;
        }
        Flow::Continue
    }

    async fn job_is_terminal(&self) -> bool {
        matches!(
            self.ledger.get_job(&self.job_id).await,
            Ok(Some(job)) if job.is_terminal()
        )
    }
}
