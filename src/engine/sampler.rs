//! Global throughput sampling
//!
//! Once a second the sampler diffs the published job table against the
//! previous snapshot and publishes a rolling average of total bytes/sec.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, trace};

use super::models::{JobId, JobTable};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// Samples averaged into the published value
pub const WINDOW: usize = 5;

#[derive(Debug, Default)]
pub struct SpeedSampler {
    last: HashMap<JobId, u64>,
    window: VecDeque<f64>,
}

impl SpeedSampler {
    /// Take one sample `elapsed` after the previous one and return the rolling
    /// average in bytes/sec.
    ///
    /// Jobs seen for the first time count from zero. A job whose progress went
    /// down (a restarted transfer) contributes nothing.
    pub fn sample(&mut self, table: &JobTable, elapsed: Duration) -> f64 {
        let mut delta = 0u64;
        let mut seen = HashMap::with_capacity(table.len());
        for (id, download) in table.iter() {
            let previous = self.last.get(id).copied().unwrap_or(0);
            delta += download.downloaded_bytes.saturating_sub(previous);
            seen.insert(*id, download.downloaded_bytes);
        }
        self.last = seen;

        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { delta as f64 / secs } else { 0.0 };
        if self.window.len() == WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(rate);
        self.current()
    }

    pub fn current(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }
}

/// Run the sampler until `stop` fires; the published speed drops to zero then.
pub(crate) fn spawn(
    jobs: watch::Receiver<JobTable>,
    speed: watch::Sender<f64>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut sampler = SpeedSampler::default();
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            let mut last = Instant::now();

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let table = jobs.borrow().clone();
                        let rate = sampler.sample(&table, now - last);
                        last = now;
                        speed.send_replace(rate);
                        trace!(bytes_per_sec = rate, "Speed sample");
                    }
                }
            }

            speed.send_replace(0.0);
            debug!("Speed sampler stopped");
        }
        .instrument(info_span!("sampler")),
    )
}
