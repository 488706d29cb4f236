//! Background tasks driving the engine: the delivery loop, the expiry
//! sweep and the heartbeat tick. Each task takes the broker lock for one
//! unit of work at a time, so socket handlers interleave between passes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::config::BrokerSettings;
use crate::utils::now_millis;

/// Lock the broker, recovering the guard if a previous holder panicked.
pub fn lock(broker: &Mutex<Broker>) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run up to `burst` passes back to back, then yield for `idle`. A pass that
/// delivers nothing ends the burst early.
pub async fn run_delivery_loop(broker: Arc<Mutex<Broker>>, burst: usize, idle: Duration) {
    loop {
        for _ in 0..burst.max(1) {
            let delivered = lock(&broker).run_pass(now_millis());
            if delivered == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        sleep(idle).await;
    }
}

/// Sweep expired messages every `interval`, or every `boost` after a sweep
/// that hit its batch cap.
pub async fn run_garbage_loop(broker: Arc<Mutex<Broker>>, interval: Duration, boost: Duration) {
    let mut next = interval;
    loop {
        sleep(next).await;
        let now = now_millis();
        let report = {
            let mut broker = lock(&broker);
            let report = broker.collect_garbage(now);
            for summary in broker.topic_summaries(now) {
                debug!(
                    "topic {} stored={} added/min={} removed/min={}",
                    summary.topic, summary.stored, summary.rates.added[0], summary.rates.removed[0]
                );
            }
            report
        };
        next = if report.capped { boost } else { interval };
    }
}

pub async fn run_heartbeat_loop(broker: Arc<Mutex<Broker>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        lock(&broker).heartbeat_tick(now_millis());
    }
}

/// Spawn every background task for `broker`.
pub fn spawn_background(broker: Arc<Mutex<Broker>>, settings: &BrokerSettings) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        tokio::spawn(run_delivery_loop(
            broker.clone(),
            settings.burst_passes,
            Duration::from_millis(settings.idle_delay_ms),
        )),
        tokio::spawn(run_garbage_loop(
            broker.clone(),
            Duration::from_secs(settings.gc_interval_sec.max(1)),
            Duration::from_secs(settings.gc_boost_sec.max(1)),
        )),
    ];
    if settings.heartbeat_sec > 0 {
        handles.push(tokio::spawn(run_heartbeat_loop(
            broker,
            Duration::from_secs(settings.heartbeat_sec),
        )));
    }
    info!("Started {} broker background tasks", handles.len());
    handles
}
