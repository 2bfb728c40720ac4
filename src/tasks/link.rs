//! Tasks that drive the link session
//!
//! Each task locks the shared [`LinkSession`] only for one step, so a
//! received frame is never held up by more than one tick or pump.

use embassy_futures::select::select;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Ticker, Timer};
use rand_core::RngCore;

use crate::cache::Cache;
use crate::config::{beacon, tx_worker};
use crate::radio::{LinkRadio, LinkReceiver, RadioError};
use crate::storage::PersistentStore;
use crate::tasks::admin::{AdminCommand, ADMIN_CHANNEL};
use crate::tasks::SharedLink;
use crate::time::Clock;

/// Wakes the beacon task ahead of its period (settings or flags changed)
pub static BEACON_WAKE: Signal<CriticalSectionRawMutex, ()> = Signal::new();

fn now_ms() -> u64 {
    Instant::now().as_millis()
}

/// Receive loop: every datagram goes through the router
pub async fn router_task<R, S, G, L, C>(
    mut receiver: L,
    link: &SharedLink<R, S, G>,
    cache: &Cache<C>,
) where
    R: LinkRadio,
    S: PersistentStore,
    G: RngCore,
    L: LinkReceiver,
    C: Clock,
{
    loop {
        match receiver.receive().await {
            Ok(frame) => {
                let mut link = link.lock().await;
                link.handle_rx(now_ms(), frame.src, &frame.data, frame.rssi, cache);
            }
            Err(RadioError::Timeout) => {}
            Err(e) => {
                log::warn!("rx: {}", e);
                Timer::after(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Discovery and keep-alive
pub async fn session_task<R, S, G>(link: &SharedLink<R, S, G>)
where
    R: LinkRadio,
    S: PersistentStore,
    G: RngCore,
{
    let mut ticker = Ticker::every(Duration::from_millis(tx_worker::TICK_MS));
    let mut restart_sent = false;
    loop {
        ticker.next().await;
        let restart = {
            let mut link = link.lock().await;
            link.tick(now_ms());
            link.restart_requested()
        };
        if restart && !restart_sent {
            restart_sent = ADMIN_CHANNEL.try_send(AdminCommand::Restart).is_ok();
        }
    }
}

/// Cache to radio, at most one transient frame per tick
pub async fn tx_worker_task<R, S, G, C>(link: &SharedLink<R, S, G>, cache: &Cache<C>)
where
    R: LinkRadio,
    S: PersistentStore,
    G: RngCore,
    C: Clock,
{
    let mut ticker = Ticker::every(Duration::from_millis(tx_worker::TICK_MS));
    loop {
        ticker.next().await;
        link.lock().await.pump(now_ms(), cache);
    }
}

/// Version beacons: checked every minimum interval, or at once when woken
pub async fn beacon_task<R, S, G>(link: &SharedLink<R, S, G>)
where
    R: LinkRadio,
    S: PersistentStore,
    G: RngCore,
{
    loop {
        select(
            Timer::after(Duration::from_millis(beacon::MIN_INTERVAL_MS)),
            BEACON_WAKE.wait(),
        )
        .await;
        link.lock().await.poll_beacon(now_ms());
    }
}
