//! Synthetic system-info producer
//!
//! Stands in for the CAN and sensor producers: once a second it stages a
//! small system-info payload in the cache and, every 30 s, logs link health.

use embassy_time::{Duration, Instant, Ticker};
use rand_core::RngCore;

use crate::cache::{Cache, PutOutcome};
use crate::radio::LinkRadio;
use crate::router::subtype;
use crate::storage::PersistentStore;
use crate::tasks::SharedLink;
use crate::time::Clock;

const PERIOD_MS: u64 = 1000;
const REPORT_EVERY: u32 = 30;

pub async fn telemetry_task<R, S, G, C>(link: &SharedLink<R, S, G>, cache: &Cache<C>)
where
    R: LinkRadio,
    S: PersistentStore,
    G: RngCore,
    C: Clock,
{
    let mut ticker = Ticker::every(Duration::from_millis(PERIOD_MS));
    let mut seq: u32 = 0;
    loop {
        ticker.next().await;
        let now = Instant::now().as_millis();
        let stats = cache.stats();

        // subtype | uptime_s u32 | queued u16 | dropped u32
        let mut payload = [0u8; 11];
        payload[0] = subtype::SYSTEM_INFO;
        payload[1..5].copy_from_slice(&((now / 1000) as u32).to_le_bytes());
        payload[5..7].copy_from_slice(&(stats.transient_current as u16).to_le_bytes());
        payload[7..11].copy_from_slice(&stats.transient_dropped.to_le_bytes());

        if let PutOutcome::Dropped(reason) = cache.put_transient(&payload, seq, now) {
            log::debug!("telemetry: sample {} dropped ({:?})", seq, reason);
        }
        seq = seq.wrapping_add(1);

        if seq % REPORT_EVERY == 0 {
            let link = link.lock().await;
            let session = link.session_stats();
            log::info!(
                "telemetry: {:?} peer={:?} reconnects={} hb {}/{} rssi={} queued={}",
                link.state(),
                link.peer(),
                session.reconnects,
                session.heartbeats_acked,
                session.heartbeats_sent,
                session.last_rssi,
                stats.transient_current
            );
        }
    }
}
