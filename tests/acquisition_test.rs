//! End-to-end acquisition against simulated spectrometers.
//!
//! Each test goes through the same path a real device takes: bus scan, open,
//! initialization from EEPROM, scan trigger, status polling, bulk read and
//! processing.

use ccs_daq::calibration::CalibrationSource;
use ccs_daq::discovery::{find_spectrometer, FirmwareMap, RenumerationPolicy};
use ccs_daq::metadata::{AttributeValue, JsonMetadataSink, Metadata};
use ccs_daq::mock::{MockBus, MockCcs, MOCK_FACTORY_POLY};
use ccs_daq::protocol::{NUM_PIXELS, WCMD_INTEGRATION_TIME};
use ccs_daq::{CcsDriver, CcsError, DriverSettings, ScanKind, ScanPolicy, Spectrometer, UsbBus};
use std::time::Duration;

fn open_first(bus: &MockBus, serial: Option<&str>) -> CcsDriver<MockCcs> {
    let device = find_spectrometer(bus, &FirmwareMap::new(), RenumerationPolicy::default(), serial).unwrap();
    CcsDriver::open(bus.open(&device).unwrap()).unwrap()
}

// =============================================================================
// Initialization
// =============================================================================

#[test]
fn test_open_reads_identity_and_calibration() {
    let bus = MockBus::new().with_device(MockCcs::calibrated());
    let driver = open_first(&bus, None);

    let id = driver.identity();
    assert_eq!(id.serial_number, "M00555555");
    assert_eq!(id.user_label, "mock bench");
    assert_eq!(id.firmware_version.to_string(), "2.1.0");
    assert_eq!(id.hardware_version.to_string(), "1.2.3");

    assert_eq!(driver.calibration_source(), CalibrationSource::User);
    let factory = driver.wavelength_calibration(CalibrationSource::Factory).unwrap();
    assert_eq!(factory.poly, MOCK_FACTORY_POLY);
    assert_eq!(factory.wavelengths.len(), NUM_PIXELS);
    assert!(factory.is_ascending());
}

#[test]
fn test_open_selects_device_by_serial() {
    let bus = MockBus::new()
        .with_device(MockCcs::calibrated().with_serial_number("M00000010").with_port(vec![1]))
        .with_device(MockCcs::calibrated().with_serial_number("M00000020").with_port(vec![2]));

    let driver = open_first(&bus, Some("M00000020"));
    assert_eq!(driver.identity().serial_number, "M00000020");

    let err = find_spectrometer(&bus, &FirmwareMap::new(), RenumerationPolicy::default(), Some("nope")).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_device_without_user_calibration_uses_factory() {
    let bus = MockBus::new().with_device(MockCcs::calibrated().without_user_points());
    let mut driver = open_first(&bus, None);

    assert_eq!(driver.calibration_source(), CalibrationSource::Factory);
    assert!(driver.wavelengths(CalibrationSource::User).is_err());
    assert!(matches!(
        driver.set_calibration_source(CalibrationSource::User),
        Err(CcsError::InvalidCalibrationData { .. })
    ));
}

#[test]
fn test_zero_user_points_opens_on_factory() {
    let driver = CcsDriver::open(MockCcs::calibrated().with_user_points(&[])).unwrap();
    assert_eq!(driver.calibration_source(), CalibrationSource::Factory);
    assert!(driver.calibration().user_points.is_none());
}

#[test]
fn test_non_monotonic_factory_calibration_fails_open() {
    // turns over near pixel 600
    let device = MockCcs::calibrated().with_factory_poly([320.0, 0.12, -1.0e-4, 0.0]);
    let err = CcsDriver::open(device).unwrap_err();
    assert!(matches!(err, CcsError::InvalidCalibrationData { .. }));
}

// =============================================================================
// Integration time
// =============================================================================

#[test]
fn test_integration_time_round_trip() {
    let bus = MockBus::new().with_device(MockCcs::calibrated());
    let mut driver = open_first(&bus, None);

    for seconds in [1.0e-5, 0.0035, 0.05, 1.0, 60.0] {
        driver.set_integration_time(seconds).unwrap();
        let readback = driver.get_integration_time().unwrap();
        assert!(
            (readback - seconds).abs() <= seconds * 1e-3 + 1e-6,
            "set {} read {}",
            seconds,
            readback
        );
        assert_eq!(driver.integration_time(), seconds);
    }
}

#[test]
fn test_invalid_integration_time_sends_nothing() {
    let mut driver = CcsDriver::open(MockCcs::calibrated()).unwrap();
    driver.transport_mut().clear_logs();

    assert!(matches!(
        driver.set_integration_time(61.0),
        Err(CcsError::InvalidIntegrationTime { .. })
    ));
    assert!(driver
        .transport()
        .control_out_log()
        .iter()
        .all(|r| r.request != WCMD_INTEGRATION_TIME));
    assert_eq!(driver.integration_time(), 0.01);
}

// =============================================================================
// Scans
// =============================================================================

#[test]
fn test_plain_scan_is_dark_corrected_and_normalized() {
    let bus = MockBus::new().with_device(MockCcs::calibrated().with_uniform_scan(1000, 33_768));
    let mut driver = open_first(&bus, None);

    driver.start_scan().unwrap();
    let spectrum = driver.scan_data().unwrap();
    assert_eq!(spectrum.len(), NUM_PIXELS);

    let expected = 32_768.0 / 64_535.0;
    assert!(spectrum.iter().all(|&v| (v - expected).abs() < 1e-9));
}

#[test]
fn test_saturated_dark_level_is_overexposure() {
    let mut driver = CcsDriver::open(MockCcs::calibrated().with_uniform_scan(65_000, 65_535)).unwrap();
    driver.start_scan().unwrap();
    assert!(matches!(driver.scan_data(), Err(CcsError::Overexposure { .. })));
}

#[test]
fn test_scan_times_out_when_never_ready() {
    let settings = DriverSettings {
        integration_time: 0.001,
        scan_policy: ScanPolicy {
            timeout: Some(Duration::from_millis(20)),
            poll_interval: Duration::from_millis(1),
        },
    };
    let mut device = MockCcs::calibrated();
    device.set_idle_status(0x0000);
    let mut driver = CcsDriver::open_with(device, settings).unwrap();

    driver.start_scan().unwrap();
    assert!(matches!(driver.scan_data(), Err(CcsError::ScanTimeout { .. })));
}

#[test]
fn test_range_correction_window() {
    let bus = MockBus::new().with_device(MockCcs::calibrated().with_uniform_scan(1000, 20_000));
    let mut driver = open_first(&bus, None);

    driver.start_scan().unwrap();
    let scan = driver.scan_data_corrected_range(400.0, 700.0).unwrap();
    let wavelengths = driver.wavelengths(CalibrationSource::Factory).unwrap();

    for (i, (&value, &wl)) in scan.spectrum.iter().zip(wavelengths).enumerate() {
        if wl > 400.0 && wl <= 700.0 {
            assert!(value > 0.0, "pixel {} at {} nm is inside the window", i, wl);
        } else {
            assert_eq!(value, 0.0, "pixel {} at {} nm is outside the window", i, wl);
        }
    }
    assert!(scan.noise_amplification_db > 0.0);
}

#[test]
fn test_range_correction_rejects_bad_window() {
    let mut driver = CcsDriver::open(MockCcs::calibrated().with_uniform_scan(1000, 20_000)).unwrap();
    driver.start_scan().unwrap();
    assert!(driver.scan_data_corrected_range(700.0, 400.0).is_err());
}

#[test]
fn test_noise_bounded_window_contains_center() {
    let mut driver = CcsDriver::open(MockCcs::calibrated().with_uniform_scan(1000, 20_000)).unwrap();
    driver.start_scan().unwrap();
    let scan = driver.scan_data_corrected_noise(531.78, 1.0).unwrap();
    assert!(scan.wavelength_left < 531.78 && 531.78 < scan.wavelength_right);
    assert_eq!(scan.spectrum.len(), NUM_PIXELS);
}

// =============================================================================
// Spectrometer + metadata
// =============================================================================

#[test]
fn test_spectrometer_writes_metadata_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan.json");

    let bus = MockBus::new().with_device(MockCcs::calibrated().with_uniform_scan(1000, 30_000));
    let mut spec = Spectrometer::new(open_first(&bus, None));
    spec.set_integration_time(0.02).unwrap();

    let mut sink = JsonMetadataSink::to_file(Metadata::default(), &path);
    spec.describe(&mut sink).unwrap();
    let spectrum = spec.scan_spectrum(ScanKind::Factory, Some(&mut sink)).unwrap();
    sink.flush().unwrap();

    assert_eq!(sink.attribute("integration_time_s"), Some(&AttributeValue::Float(0.02)));
    let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["attributes"]["model"], "CCS200");
    assert_eq!(value["arrays"]["wavelength"]["values"].as_array().unwrap().len(), NUM_PIXELS);
    assert_eq!(
        value["arrays"]["intensity"]["values"].as_array().unwrap().len(),
        spectrum.intensity.len()
    );
}

#[test]
fn test_reset_and_close() {
    let bus = MockBus::new().with_device(MockCcs::calibrated());
    let mut driver = open_first(&bus, None);
    assert_eq!(driver.transport().usb_reset_count(), 1);
    driver.reset().unwrap();
    let transport = driver.close();
    // explicit reset plus the one sent on close
    assert_eq!(transport.reset_count(), 2);
    assert!(transport.is_configured());
}
