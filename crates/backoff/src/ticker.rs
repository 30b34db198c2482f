//! Ticker with a jittered interval
//!
//! Works like `tokio::time::interval` except that every inter-tick interval
//! is `base_duration` plus a freshly sampled backoff delay, so concurrent
//! deployments polling the same table drift apart instead of hammering the
//! database in lockstep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Backoff;

/// Periodic tick source with a randomized interval.
///
/// The first tick fires immediately. Every following interval is computed
/// only after the previous tick has been consumed, so a slow consumer slows
/// the ticking down instead of piling up ticks.
pub struct Ticker {
    rx: mpsc::Receiver<DateTime<Utc>>,
    cancel: CancellationToken,
}

impl Ticker {
    /// Create a ticker and spawn its producer task.
    ///
    /// `seed` bounds the random factor fed into `backoff` each tick; values
    /// below 1 are clamped to 1.
    pub fn new(backoff: Backoff, base_duration: Duration, seed: u32) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let producer = Producer {
            tx,
            cancel: cancel.clone(),
            backoff,
            base_duration,
            seed: seed.max(1),
        };

        tokio::spawn(producer.run());

        Self { rx, cancel }
    }

    /// Receive the next tick. Returns `None` once the ticker is stopped.
    ///
    /// The carried timestamp is the wall-clock moment the tick fired, not
    /// the moment it was received.
    pub async fn tick(&mut self) -> Option<DateTime<Utc>> {
        self.rx.recv().await
    }

    /// Stop the ticker. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Producer {
    tx: mpsc::Sender<DateTime<Utc>>,
    cancel: CancellationToken,
    backoff: Backoff,
    base_duration: Duration,
    seed: u32,
}

impl Producer {
    async fn run(self) {
        let mut first = true;

        loop {
            // The permit resolves once the previous tick has been taken out
            // of the capacity-1 channel.
            let permit = tokio::select! {
                () = self.cancel.cancelled() => break,
                permit = self.tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if first {
                first = false;
            } else {
                let delay = self.interval();

                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }

            permit.send(Utc::now());
        }
    }

    fn interval(&self) -> Duration {
        let factor = rand::rng().random_range(1..=self.seed);
        let factor = i32::try_from(factor).unwrap_or(i32::MAX);

        self.base_duration + self.backoff.next(factor)
    }
}
