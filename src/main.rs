#![no_std]
#![no_main]

extern crate alloc;

// Required for ESP-IDF bootloader compatibility
// Use explicit parameters to ensure correct efuse block revision values
esp_bootloader_esp_idf::esp_app_desc!(
    env!("CARGO_PKG_VERSION"),  // version
    env!("CARGO_PKG_NAME"),     // project_name
    "00:00:00",                 // build_time
    "2025-01-01",               // build_date
    "0.0.0",                    // idf_ver (not using IDF)
    0x10000,                    // mmu_page_size (64KB)
    0,                          // min_efuse_blk_rev_full (accept all)
    u16::MAX                    // max_efuse_blk_rev_full (accept all)
);

use embassy_executor::Spawner;
use embassy_sync::mutex::Mutex;
use esp_backtrace as _;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::usb_serial_jtag::{UsbSerialJtag, UsbSerialJtagTx};
use esp_hal::Async;
use esp_storage::FlashStorage;
use static_cell::StaticCell;

use link_session_firmware::cache::Cache;
use link_session_firmware::config::{channels, storage, LinkConfig, Role};
use link_session_firmware::link_session::LinkSession;
use link_session_firmware::logging;
use link_session_firmware::radio::esp_now::{self, EspNowRadio, EspNowRx, EspNowTx, HwRng};
use link_session_firmware::storage::FlashStore;
use link_session_firmware::tasks::{self, AdminReceiver, SharedLink, ADMIN_CHANNEL};
use link_session_firmware::time::EmbassyClock;

type DeviceStore = FlashStore<FlashStorage<'static>>;
type DeviceLink = SharedLink<EspNowRadio<'static>, DeviceStore, HwRng>;
type DeviceCache = Cache<EmbassyClock>;

/// Static executor for embassy
static EXECUTOR: StaticCell<esp_rtos::embassy::Executor> = StaticCell::new();

/// Static cell for esp-radio controller (needed for 'static lifetime)
static RADIO_CONTROLLER: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();

/// The Wi-Fi controller must outlive ESP-NOW
static WIFI_CONTROLLER: StaticCell<esp_radio::wifi::WifiController<'static>> = StaticCell::new();

static CACHE: StaticCell<DeviceCache> = StaticCell::new();
static LINK: StaticCell<DeviceLink> = StaticCell::new();

#[esp_hal::main]
fn main() -> ! {
    // esp-radio's Wi-Fi stack needs a heap
    esp_alloc::heap_allocator!(size: 72 * 1024);

    let peripherals = esp_hal::init(esp_hal::Config::default());

    logging::init();

    // Initialise the RTOS scheduler with timer - MUST be done before any async operations
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // Logs go out over USB Serial JTAG
    let usb_serial = UsbSerialJtag::new(peripherals.USB_DEVICE).into_async();
    let (_usb_rx, usb_tx) = usb_serial.split();

    let radio_controller = RADIO_CONTROLLER.init(
        esp_radio::init().expect("Failed to initialize esp-radio")
    );
    let (mut wifi, interfaces) =
        esp_radio::wifi::new(radio_controller, peripherals.WIFI, Default::default())
            .expect("Failed to initialize Wi-Fi");
    wifi.set_mode(esp_radio::wifi::WifiMode::Sta).expect("Failed to set station mode");
    wifi.start().expect("Failed to start Wi-Fi");
    WIFI_CONTROLLER.init(wifi);

    let config = LinkConfig::default();
    let start_channel = match config.role {
        Role::Transmitter => channels::SWEEP[0],
        Role::Receiver => config.home_channel,
    };
    let (radio, radio_tx, receiver) =
        esp_now::split(interfaces.esp_now, start_channel).expect("Failed to tune ESP-NOW");

    let store = FlashStore::open(FlashStorage::new(peripherals.FLASH), storage::FLASH_OFFSET)
        .expect("Failed to open settings flash");

    let cache: &'static DeviceCache = CACHE.init(Cache::new(EmbassyClock));
    let mut session = LinkSession::new(config, radio, store, HwRng::new());
    let now = embassy_time::Instant::now().as_millis();
    session.boot(now, cache);
    session.start(now);
    let link: &'static DeviceLink = LINK.init(Mutex::new(session));

    log::info!(
        "link: {} starting on channel {}",
        link_session_firmware::config::firmware::ENV_NAME,
        start_channel
    );

    // Create and run the embassy executor
    let executor = EXECUTOR.init(esp_rtos::embassy::Executor::new());
    executor.run(|spawner| {
        spawner.must_spawn(async_main(spawner, radio_tx, receiver, link, cache, usb_tx));
    })
}

#[embassy_executor::task]
async fn async_main(
    spawner: Spawner,
    radio_tx: EspNowTx<'static>,
    receiver: EspNowRx<'static>,
    link: &'static DeviceLink,
    cache: &'static DeviceCache,
    usb_tx: UsbSerialJtagTx<'static, Async>,
) {
    spawner.spawn(log_writer(usb_tx)).unwrap();
    spawner.spawn(radio_transmit(radio_tx)).unwrap();
    spawner.spawn(router(receiver, link, cache)).unwrap();
    spawner.spawn(session(link)).unwrap();
    spawner.spawn(tx_worker(link, cache)).unwrap();
    spawner.spawn(beacon(link)).unwrap();
    spawner.spawn(admin(ADMIN_CHANNEL.receiver(), link, cache)).unwrap();
    spawner.spawn(telemetry(link, cache)).unwrap();
}

#[embassy_executor::task]
async fn log_writer(usb_tx: UsbSerialJtagTx<'static, Async>) {
    logging::log_writer_task(usb_tx).await;
}

/// Puts queued datagrams on the air and reports MAC-layer acks
#[embassy_executor::task]
async fn radio_transmit(mut radio_tx: EspNowTx<'static>) {
    radio_tx.run().await
}

/// Receives datagrams and routes them
#[embassy_executor::task]
async fn router(receiver: EspNowRx<'static>, link: &'static DeviceLink, cache: &'static DeviceCache) {
    tasks::router_task(receiver, link, cache).await;
}

#[embassy_executor::task]
async fn session(link: &'static DeviceLink) {
    tasks::session_task(link).await;
}

#[embassy_executor::task]
async fn tx_worker(link: &'static DeviceLink, cache: &'static DeviceCache) {
    tasks::tx_worker_task(link, cache).await;
}

#[embassy_executor::task]
async fn beacon(link: &'static DeviceLink) {
    tasks::beacon_task(link).await;
}

#[embassy_executor::task]
async fn admin(receiver: AdminReceiver, link: &'static DeviceLink, cache: &'static DeviceCache) {
    tasks::admin_task(receiver, link, cache).await;
}

/// Stand-in producer until the CAN reader is attached
#[embassy_executor::task]
async fn telemetry(link: &'static DeviceLink, cache: &'static DeviceCache) {
    tasks::telemetry_task(link, cache).await;
}
