//! Admin task for restarts and factory resets
//!
//! Handles requests that reach beyond the link session itself.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver};
use embassy_time::{Duration, Instant, Timer};
use rand_core::RngCore;

use crate::cache::Cache;
use crate::protocol::SectionId;
use crate::radio::LinkRadio;
use crate::storage::PersistentStore;
use crate::tasks::link::BEACON_WAKE;
use crate::tasks::SharedLink;
use crate::time::Clock;

/// Admin command types
#[derive(Clone, Copy, Debug)]
pub enum AdminCommand {
    /// Restart firmware (link recovery exhausted)
    Restart,
    /// Put one settings section back to its defaults
    FactoryReset(SectionId),
}

/// Channel for admin commands
pub static ADMIN_CHANNEL: Channel<CriticalSectionRawMutex, AdminCommand, 4> = Channel::new();

/// Type alias for the admin command receiver
pub type AdminReceiver = Receiver<'static, CriticalSectionRawMutex, AdminCommand, 4>;

fn restart() -> ! {
    esp_hal::system::software_reset()
}

/// Admin task that executes commands from [`ADMIN_CHANNEL`]
pub async fn admin_task<R, S, G, C>(
    receiver: AdminReceiver,
    link: &SharedLink<R, S, G>,
    cache: &Cache<C>,
) where
    R: LinkRadio,
    S: PersistentStore,
    G: RngCore,
    C: Clock,
{
    loop {
        match receiver.receive().await {
            AdminCommand::Restart => {
                log::error!("admin: restarting at {} ms", Instant::now().as_millis());
                // Let the log writer drain
                Timer::after(Duration::from_millis(500)).await;
                restart();
            }
            AdminCommand::FactoryReset(section) => {
                match link.lock().await.factory_reset(section, cache) {
                    Ok(version) => {
                        log::info!("admin: {:?} reset to defaults (v{})", section, version);
                        BEACON_WAKE.signal(());
                    }
                    Err(e) => log::error!("admin: {:?} reset failed: {}", section, e),
                }
            }
        }
    }
}
