//! Per-variant throughput, sampled on a fixed interval into a gauge.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use pipeline_common::events::EventType;
use pipeline_common::telemetry::Telemetry;
use tokio::sync::watch;
use tracing::info;

/// Successful events per variant since the last sample.
#[derive(Default, Debug)]
pub struct RateCounter {
    counts: [AtomicU64; 4],
}

impl RateCounter {
    pub fn increment(&self, event_type: EventType) {
        self.counts[event_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Take the accumulated counts and reset them to zero.
    pub fn drain(&self) -> [(EventType, u64); 4] {
        EventType::ALL.map(|event_type| {
            (
                event_type,
                self.counts[event_type.index()].swap(0, Ordering::Relaxed),
            )
        })
    }
}

pub struct RateSampler {
    counter: Arc<RateCounter>,
    telemetry: Arc<dyn Telemetry>,
    interval: Duration,
    liveness: HealthHandle,
}

impl RateSampler {
    pub fn new(
        counter: Arc<RateCounter>,
        telemetry: Arc<dyn Telemetry>,
        interval: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            counter,
            telemetry,
            interval,
            liveness,
        }
    }

    /// Publish one sample for every variant, idle ones included.
    pub fn sample(&self) {
        let seconds = self.interval.as_secs_f64();
        for (event_type, count) in self.counter.drain() {
            self.telemetry
                .record_rate(event_type, count as f64 / seconds);
        }
        self.liveness.report_healthy();
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => self.sample(),
                _ = shutdown.changed() => {
                    info!("stopping rate sampler");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthRegistry;
    use pipeline_common::telemetry::RecordingTelemetry;

    #[test]
    fn drain_resets_counts() {
        let counter = RateCounter::default();
        counter.increment(EventType::OrderPlaced);
        counter.increment(EventType::OrderPlaced);
        counter.increment(EventType::UserCreated);

        let drained = counter.drain();
        assert_eq!(drained[EventType::OrderPlaced.index()], (EventType::OrderPlaced, 2));
        assert_eq!(drained[EventType::UserCreated.index()], (EventType::UserCreated, 1));
        assert!(counter.drain().iter().all(|(_, count)| *count == 0));
    }

    #[test]
    fn sample_reports_every_variant_per_second() {
        let counter = Arc::new(RateCounter::default());
        let telemetry = Arc::new(RecordingTelemetry::new());
        let registry = HealthRegistry::new("liveness");
        let sampler = RateSampler::new(
            counter.clone(),
            telemetry.clone(),
            Duration::from_millis(500),
            registry.register("rate-sampler", time::Duration::seconds(30)),
        );

        counter.increment(EventType::PaymentSettled);
        sampler.sample();

        let rates = telemetry.rates();
        assert_eq!(rates.len(), 4);
        assert!(rates.contains(&(EventType::PaymentSettled, 2.0)));
        assert!(rates.contains(&(EventType::InventoryAdjusted, 0.0)));
        assert!(registry.get_status().healthy);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let registry = HealthRegistry::new("liveness");
        let sampler = RateSampler::new(
            Arc::new(RateCounter::default()),
            Arc::new(RecordingTelemetry::new()),
            Duration::from_millis(10),
            registry.register("rate-sampler", time::Duration::seconds(30)),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(sampler.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sampler did not stop")
            .unwrap();
        assert!(registry.get_status().healthy);
    }
}
