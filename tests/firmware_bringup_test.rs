//! Firmware upload and re-enumeration through discovery.
//!
//! Firmware files are written to a temporary directory laid out like the
//! configured firmware directory (`CCS100.spt` ... `CCS200.spt`).

use std::path::Path;
use std::time::Duration;

use ccs_daq::config::CcsConfig;
use ccs_daq::discovery::{list_spectrometers, FirmwareMap, RenumerationPolicy};
use ccs_daq::firmware::{FirmwareBlock, FirmwareImage};
use ccs_daq::mock::{MockBus, MockCcs};
use ccs_daq::protocol::{CcsModel, CPUCS_ADDRESS, RCMD_READ_RAM};
use ccs_daq::{CcsDriver, CcsError, UsbBus};

fn fast() -> RenumerationPolicy {
    RenumerationPolicy {
        timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
    }
}

/// Program block followed by the CPU release.
fn two_block_image() -> FirmwareImage {
    FirmwareImage::from_blocks(vec![
        FirmwareBlock {
            request: RCMD_READ_RAM,
            value: 0x0000,
            index: 0,
            payload: (0..64u8).collect(),
        },
        FirmwareBlock {
            request: RCMD_READ_RAM,
            value: CPUCS_ADDRESS,
            index: 0,
            payload: vec![0x00],
        },
    ])
}

fn write_firmware(dir: &Path, model: CcsModel) {
    std::fs::write(dir.join(format!("{}.spt", model.name())), two_block_image().to_bytes()).unwrap();
}

#[test]
fn test_unconfigured_device_is_brought_up() {
    let dir = tempfile::tempdir().unwrap();
    write_firmware(dir.path(), CcsModel::Ccs200);

    let bus = MockBus::new().with_device(
        MockCcs::calibrated()
            .with_product_id(CcsModel::Ccs200.unconfigured_pid())
            .with_port(vec![4]),
    );

    let found = list_spectrometers(&bus, &FirmwareMap::from_directory(dir.path()), fast()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].product_id, CcsModel::Ccs200.configured_pid());
    assert_eq!(found[0].port_numbers, vec![4]);

    // the re-enumerated device opens like any configured one
    let driver = CcsDriver::open(bus.open(&found[0]).unwrap()).unwrap();
    assert_eq!(driver.identity().serial_number, "M00555555");
}

#[test]
fn test_mixed_bus_keeps_configured_devices() {
    let dir = tempfile::tempdir().unwrap();
    write_firmware(dir.path(), CcsModel::Ccs100);

    let bus = MockBus::new()
        .with_device(
            MockCcs::new()
                .with_product_id(CcsModel::Ccs100.unconfigured_pid())
                .with_port(vec![1]),
        )
        .with_device(
            MockCcs::new()
                .with_product_id(CcsModel::Ccs175.configured_pid())
                .with_port(vec![2]),
        );

    let found = list_spectrometers(&bus, &FirmwareMap::from_directory(dir.path()), fast()).unwrap();
    let mut pids: Vec<u16> = found.iter().map(|d| d.product_id).collect();
    pids.sort_unstable();
    assert_eq!(pids, vec![0x8081, 0x8087]);
}

#[test]
fn test_failing_block_aborts_bring_up() {
    let dir = tempfile::tempdir().unwrap();
    write_firmware(dir.path(), CcsModel::Ccs200);

    let bus = MockBus::new().with_device(
        MockCcs::new()
            .with_product_id(CcsModel::Ccs200.unconfigured_pid())
            .fail_control_out_at(1),
    );

    let err = list_spectrometers(&bus, &FirmwareMap::from_directory(dir.path()), fast()).unwrap_err();
    assert!(matches!(
        err,
        CcsError::FirmwareUploadIncomplete {
            block: 2,
            total: 2,
            sent: 1,
            ..
        }
    ));
    // still on the boot loader
    assert_eq!(bus.descriptors()[0].product_id, 0x8088);
}

#[test]
fn test_missing_firmware_file() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new().with_device(MockCcs::new().with_product_id(CcsModel::Ccs150.unconfigured_pid()));

    let err = list_spectrometers(&bus, &FirmwareMap::from_directory(dir.path()), fast()).unwrap_err();
    assert!(matches!(err, CcsError::Io { .. }));
}

#[test]
fn test_device_that_never_returns_times_out() {
    let dir = tempfile::tempdir().unwrap();
    write_firmware(dir.path(), CcsModel::Ccs125);

    let bus = MockBus::new().with_device(
        MockCcs::new()
            .with_product_id(CcsModel::Ccs125.unconfigured_pid())
            .without_renumeration(),
    );

    let err = list_spectrometers(&bus, &FirmwareMap::from_directory(dir.path()), fast()).unwrap_err();
    assert!(matches!(err, CcsError::RenumerationTimeout { product_id: 0x8083, .. }));
}

#[test]
fn test_configured_firmware_override() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("custom.spt"), two_block_image().to_bytes()).unwrap();

    let mut config = CcsConfig::default();
    config.firmware.directory = dir.path().to_path_buf();
    config.firmware.files.insert("0x8088".to_string(), "custom.spt".into());
    config.firmware.renumeration_timeout_ms = 50;
    config.firmware.renumeration_poll_interval_ms = 5;
    assert!(config.validate().is_ok());

    let bus = MockBus::new().with_device(MockCcs::new().with_product_id(0x8088));
    let found = list_spectrometers(&bus, &config.firmware_map().unwrap(), config.renumeration_policy()).unwrap();
    assert_eq!(found[0].product_id, 0x8089);
}
