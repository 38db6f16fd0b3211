mod buzzer;
mod gatt;

use std::sync::Arc;

use anyhow::Result;
use esp_idf_svc::bt::ble::gap::EspBleGap;
use esp_idf_svc::bt::ble::gatt::server::EspGatts;
use esp_idf_svc::bt::BtDriver;
use esp_idf_svc::hal::delay::FreeRtos;
use esp_idf_svc::hal::gpio::{AnyOutputPin, PinDriver};
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::log::EspLogger;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use log::info;

use notebox::{
    Indicators, NoIndicators, NoteService, PinIndicators, PlaybackDriver, Profile, RngDurations,
    ServiceConfig,
};

use buzzer::LedcBuzzer;
use gatt::BleServer;

// ── Configuration ──────────────────────────────────────────────────────────

/// Deployment profile: `replay`, `immediate` or `gated`. Set in `.env`.
const PROFILE: &str = match option_env!("NOTEBOX_PROFILE") {
    Some(p) => p,
    None => "replay",
};

/// Advertised device name.
const DEVICE_NAME: &str = match option_env!("NOTEBOX_DEVICE_NAME") {
    Some(n) => n,
    None => "notebox",
};

// ── Main ───────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // ESP-IDF boilerplate
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    info!("notebox starting up");

    let profile: Profile = PROFILE.parse()?;
    let config = ServiceConfig::from(profile);
    info!("Profile: {profile} ({:?})", config.trigger);

    // Take peripherals
    let peripherals = Peripherals::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let pins = peripherals.pins;

    // ── Buzzer and indicator lines ─────────────────────────────────────────
    // Passive piezo on GPIO19, LEDs on GPIO25/26/27.
    let tone = LedcBuzzer::new(peripherals.ledc.timer0, peripherals.ledc.channel0, pins.gpio19)?;

    let indicators: Box<dyn Indicators + Send> = if config.indicators {
        Box::new(PinIndicators::new([
            PinDriver::output(AnyOutputPin::from(pins.gpio25))?,
            PinDriver::output(AnyOutputPin::from(pins.gpio26))?,
            PinDriver::output(AnyOutputPin::from(pins.gpio27))?,
        ])?)
    } else {
        Box::new(NoIndicators)
    };

    let driver = PlaybackDriver::from_config(
        tone,
        indicators,
        FreeRtos,
        RngDurations::from_entropy(),
        &config,
    );

    // ── BLE ────────────────────────────────────────────────────────────────
    info!("Initializing BLE...");
    let bt = Arc::new(BtDriver::new(peripherals.modem, Some(nvs))?);
    let server = BleServer::new(
        Arc::new(EspBleGap::new(bt.clone())?),
        Arc::new(EspGatts::new(bt)?),
        DEVICE_NAME,
    );

    let service = NoteService::new(config, Box::new(driver), server.clone())?;
    server.attach(service.clone())?;

    // Without the service there is nothing to write to; give up on BLE.
    service.start()?;

    let _replay = service.schedule_replay()?;
    info!("notebox ready, waiting for notes");

    // BLE callbacks, the playback worker and the replay timer do the work.
    loop {
        FreeRtos::delay_ms(1000);
    }
}
