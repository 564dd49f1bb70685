//! Smoke test against a real CCS spectrometer.
//!
//! Requires a spectrometer on USB with its firmware loaded (or the `.spt`
//! files in `firmware/`) and access rights to the device node.
//! Run with: cargo test --test hardware_smoke_test --features usb -- --ignored --nocapture

#![cfg(feature = "usb")]

use ccs_daq::config::CcsConfig;
use ccs_daq::discovery::find_spectrometer;
use ccs_daq::usb::RusbBus;
use ccs_daq::{CcsDriver, UsbBus, NUM_PIXELS};

#[test]
#[ignore] // Hardware-only test
fn test_open_and_scan_real_device() {
    let config = CcsConfig::default();
    let bus = RusbBus::new(config.transfer_timeout()).unwrap();
    let firmware = config.firmware_map().unwrap();

    let device = find_spectrometer(&bus, &firmware, config.renumeration_policy(), None).unwrap();
    println!("Found {}", device);

    let mut driver = CcsDriver::open_with(bus.open(&device).unwrap(), config.driver_settings()).unwrap();
    let id = driver.identity();
    println!(
        "Serial {} firmware {} hardware {}",
        id.serial_number, id.firmware_version, id.hardware_version
    );

    driver.set_integration_time(0.01).unwrap();
    let readback = driver.get_integration_time().unwrap();
    assert!((readback - 0.01).abs() < 1e-4);

    driver.start_scan().unwrap();
    let spectrum = driver.scan_data().unwrap();
    assert_eq!(spectrum.len(), NUM_PIXELS);
    println!(
        "Peak {:.4}",
        spectrum.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    );
}
