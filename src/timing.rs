// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Process-wide timer scheduling.
//!
//! One scheduler task serves every proxy instance. Timers are held in a
//! priority queue of deadlines; the nearest deadline determines the sleep,
//! and new registrations interrupt the sleep through the command channel.
//! A firing timer never touches instance state directly: it hands the
//! opaque [`TimerId`] to the owner's sink, which enqueues a message for the
//! instance's own loop to act on.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::logging::{Facility, Logger};
use crate::{log_debug, log_info};

/// Opaque handle to a scheduled timer. Unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Destination for timer expirations. Implementations enqueue a message
/// into the owning instance and must never block.
pub trait TimerSink: Send + Sync {
    fn timer_fired(&self, id: TimerId);
}

enum TimingCommand {
    Register {
        id: TimerId,
        fire_at: Instant,
        period: Option<Duration>,
        sink: Arc<dyn TimerSink>,
    },
    Cancel {
        id: TimerId,
    },
}

/// Cloneable handle for registering and cancelling timers.
#[derive(Clone)]
pub struct TimingService {
    cmd_tx: mpsc::UnboundedSender<TimingCommand>,
    next_id: Arc<AtomicU64>,
}

impl TimingService {
    /// Create the service handle and the worker that drives it. The caller
    /// spawns the worker's `run` future.
    pub fn new(logger: Logger) -> (Self, TimingWorker) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let service = Self {
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let worker = TimingWorker {
            cmd_rx,
            timers: BinaryHeap::new(),
            cancelled: HashSet::new(),
            logger,
        };
        (service, worker)
    }

    /// Schedule a one-shot timer.
    pub fn register(&self, delay: Duration, sink: Arc<dyn TimerSink>) -> TimerId {
        self.submit(delay, None, sink)
    }

    /// Schedule a periodic timer with an initial delay.
    pub fn register_periodic(
        &self,
        initial_delay: Duration,
        period: Duration,
        sink: Arc<dyn TimerSink>,
    ) -> TimerId {
        self.submit(initial_delay, Some(period), sink)
    }

    /// Cancel a timer. Cancelling an already-fired or unknown id is a no-op.
    pub fn cancel(&self, id: TimerId) {
        let _ = self.cmd_tx.send(TimingCommand::Cancel { id });
    }

    fn submit(
        &self,
        delay: Duration,
        period: Option<Duration>,
        sink: Arc<dyn TimerSink>,
    ) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        // Worker gone means process shutdown; the id is still valid to hold.
        let _ = self.cmd_tx.send(TimingCommand::Register {
            id,
            fire_at: Instant::now() + delay,
            period,
            sink,
        });
        id
    }
}

struct ScheduledTimer {
    fire_at: Instant,
    id: TimerId,
    period: Option<Duration>,
    sink: Arc<dyn TimerSink>,
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.id == other.id
    }
}

impl Eq for ScheduledTimer {}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// The scheduler loop. Runs until every [`TimingService`] handle is gone.
pub struct TimingWorker {
    cmd_rx: mpsc::UnboundedReceiver<TimingCommand>,
    timers: BinaryHeap<std::cmp::Reverse<ScheduledTimer>>,
    cancelled: HashSet<TimerId>,
    logger: Logger,
}

impl TimingWorker {
    pub async fn run(mut self) {
        log_info!(self.logger, Facility::Timing, "timing service started");

        loop {
            let deadline = match self.timers.peek() {
                Some(std::cmp::Reverse(next)) => next.fire_at,
                // Nothing pending: park until a command arrives.
                None => Instant::now() + Duration::from_secs(3600),
            };

            tokio::select! {
                _ = sleep_until(deadline) => {
                    self.fire_due();
                }
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(TimingCommand::Register { id, fire_at, period, sink }) => {
                            log_debug!(
                                self.logger,
                                Facility::Timing,
                                &format!("registered {} ({} pending)", id, self.timers.len() + 1)
                            );
                            self.timers.push(std::cmp::Reverse(ScheduledTimer {
                                fire_at,
                                id,
                                period,
                                sink,
                            }));
                        }
                        Some(TimingCommand::Cancel { id }) => {
                            // Tombstone only ids that are actually pending,
                            // so cancels of already-fired timers cannot
                            // accumulate.
                            if self.timers.iter().any(|t| t.0.id == id) {
                                self.cancelled.insert(id);
                            }
                        }
                        None => {
                            log_info!(
                                self.logger,
                                Facility::Timing,
                                "all handles dropped, timing service exiting"
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some(std::cmp::Reverse(next)) = self.timers.peek() {
            if next.fire_at > now {
                break;
            }
            let std::cmp::Reverse(timer) = self.timers.pop().expect("peeked entry");
            if self.cancelled.remove(&timer.id) {
                continue;
            }
            timer.sink.timer_fired(timer.id);
            if let Some(period) = timer.period {
                self.timers.push(std::cmp::Reverse(ScheduledTimer {
                    fire_at: timer.fire_at + period,
                    ..timer
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ChannelSink(mpsc::UnboundedSender<TimerId>);

    impl TimerSink for ChannelSink {
        fn timer_fired(&self, id: TimerId) {
            let _ = self.0.send(id);
        }
    }

    fn fixture() -> (
        TimingService,
        Arc<dyn TimerSink>,
        mpsc::UnboundedReceiver<TimerId>,
    ) {
        let (service, worker) = TimingService::new(Logger::discard());
        tokio::spawn(worker.run());
        let (tx, rx) = mpsc::unbounded_channel();
        (service, Arc::new(ChannelSink(tx)), rx)
    }

    #[tokio::test]
    async fn test_one_shot_timer_fires() {
        let (service, sink, mut rx) = fixture();
        let id = service.register(Duration::from_millis(10), sink);
        assert_eq!(rx.recv().await, Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (service, sink, mut rx) = fixture();
        let cancelled = service.register(Duration::from_millis(30), Arc::clone(&sink));
        let kept = service.register(Duration::from_millis(60), sink);
        service.cancel(cancelled);

        assert_eq!(rx.recv().await, Some(kept));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_in_deadline_order() {
        let (service, sink, mut rx) = fixture();
        let late = service.register(Duration::from_millis(60), Arc::clone(&sink));
        let early = service.register(Duration::from_millis(10), sink);

        assert_eq!(rx.recv().await, Some(early));
        assert_eq!(rx.recv().await, Some(late));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer_repeats() {
        let (service, sink, mut rx) = fixture();
        let id = service.register_periodic(
            Duration::from_millis(5),
            Duration::from_millis(5),
            sink,
        );

        assert_eq!(rx.recv().await, Some(id));
        assert_eq!(rx.recv().await, Some(id));
        service.cancel(id);
    }
}
