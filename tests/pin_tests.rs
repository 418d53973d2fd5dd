use std::path::PathBuf;
use std::sync::Arc;

use sysgpio::{
    AppConfig, Direction, EdgeDetect, EdgeEvent, GpioError, GpioManager, MockSysfs, SysfsConfig,
    Value,
};

fn setup() -> (Arc<MockSysfs>, GpioManager<MockSysfs>) {
    let config = Arc::new(SysfsConfig::default());
    let sysfs = Arc::new(MockSysfs::new(&config));
    let manager = GpioManager::new(config, sysfs.clone());
    (sysfs, manager)
}

fn control(name: &str) -> PathBuf {
    SysfsConfig::default().gpio_root.join(name)
}

fn attribute(line: u32, name: &str) -> PathBuf {
    SysfsConfig::default().attribute_path(line, name)
}

#[test]
fn export_writes_line_number_then_direction() {
    let (sysfs, manager) = setup();
    let pin = manager.export(17, Some(Direction::Out)).unwrap();

    assert_eq!(
        sysfs.writes(),
        vec![
            (control("export"), "17".to_string()),
            (attribute(17, "direction"), "out".to_string()),
        ]
    );
    assert!(pin.is_exported());
    assert_eq!(pin.direction().unwrap(), Direction::Out);
    assert_eq!(pin.edge(), EdgeDetect::None);
}

#[test]
fn export_without_direction_leaves_default() {
    let (sysfs, manager) = setup();
    let pin = manager.export(4, None).unwrap();

    assert_eq!(sysfs.writes_to(attribute(4, "direction")), 0);
    assert_eq!(pin.direction().unwrap(), Direction::In);
}

#[test]
fn double_export_is_resource_busy() {
    let (_sysfs, manager) = setup();
    let pin = manager.export(5, None).unwrap();

    let err = manager.export(5, None).err().unwrap();
    assert!(matches!(err, GpioError::ResourceBusy(_)));

    let err = pin.export(None).unwrap_err();
    assert!(matches!(err, GpioError::ResourceBusy(_)));
}

#[test]
fn export_failures_are_classified() {
    let (sysfs, manager) = setup();
    sysfs.deny(9);
    assert!(matches!(
        manager.export(9, None),
        Err(GpioError::PermissionDenied(_))
    ));

    sysfs.unload_driver();
    assert!(matches!(
        manager.export(10, None),
        Err(GpioError::NotFound(_))
    ));
}

#[test]
fn close_after_failed_export_skips_unexport() {
    let (sysfs, manager) = setup();
    let owner = manager.export(3, None).unwrap();

    let pin = manager.pin(3);
    assert!(pin.export(None).is_err());
    assert!(!pin.is_exported());

    pin.close().unwrap();
    pin.close().unwrap();
    assert_eq!(sysfs.writes_to(control("unexport")), 0);
    assert!(sysfs.is_exported(3));

    owner.close().unwrap();
    assert!(!sysfs.is_exported(3));
}

#[test]
fn close_never_exported_pin_is_noop() {
    let (sysfs, manager) = setup();
    let pin = manager.pin(8);

    pin.close().unwrap();
    assert!(sysfs.writes().is_empty());
}

#[test]
fn repeated_close_unexports_once_and_releases_value_file() {
    let (sysfs, manager) = setup();
    let pin = manager.export(12, Some(Direction::In)).unwrap();
    pin.read_value().unwrap();
    assert_eq!(sysfs.open_value_files(), 1);

    pin.close().unwrap();
    pin.close().unwrap();

    assert_eq!(sysfs.writes_to(control("unexport")), 1);
    assert_eq!(sysfs.open_value_files(), 0);
    assert!(!pin.is_exported());
    assert!(!sysfs.is_exported(12));
}

#[test]
fn value_file_is_opened_once_and_read_from_start() {
    let (sysfs, manager) = setup();
    let pin = manager.export(21, Some(Direction::In)).unwrap();

    assert_eq!(pin.read_value().unwrap(), Value::Low);
    sysfs.drive(21, Value::High).unwrap();
    assert_eq!(pin.read_value().unwrap(), Value::High);
    sysfs.drive(21, Value::Low).unwrap();
    assert_eq!(pin.read_value().unwrap(), Value::Low);

    assert_eq!(sysfs.value_opens(), 1);
    assert_eq!(sysfs.read_offsets(), vec![0, 0, 0]);
}

#[test]
fn write_value_drives_output_line() {
    let (sysfs, manager) = setup();
    let pin = manager.export(6, Some(Direction::Out)).unwrap();

    pin.write_value(Value::High).unwrap();
    assert_eq!(sysfs.level(6), Some(Value::High));
    assert_eq!(pin.read_value().unwrap(), Value::High);

    pin.write_value(Value::Low).unwrap();
    assert_eq!(sysfs.level(6), Some(Value::Low));
    assert_eq!(sysfs.value_opens(), 1);
}

#[test]
fn write_value_on_input_is_rejected() {
    let (_sysfs, manager) = setup();
    let pin = manager.export(7, Some(Direction::In)).unwrap();

    assert!(matches!(
        pin.write_value(Value::High),
        Err(GpioError::PermissionDenied(_))
    ));
}

#[test]
fn set_direction_switches_and_reads_back() {
    let (sysfs, manager) = setup();
    let pin = manager.export(11, Some(Direction::In)).unwrap();

    pin.set_direction(Direction::Out).unwrap();
    assert_eq!(sysfs.direction(11), Some(Direction::Out));
    assert_eq!(pin.direction().unwrap(), Direction::Out);
}

#[test]
fn attribute_access_on_unexported_pin_is_not_found() {
    let (_sysfs, manager) = setup();
    let pin = manager.pin(30);

    assert!(matches!(
        pin.set_direction(Direction::Out),
        Err(GpioError::NotFound(_))
    ));
    assert!(matches!(pin.direction(), Err(GpioError::NotFound(_))));
    assert!(matches!(pin.read_value(), Err(GpioError::NotFound(_))));
}

#[test]
fn custom_root_drives_every_path() {
    let config = Arc::new(SysfsConfig::new("/tmp/fake-gpio"));
    let sysfs = Arc::new(MockSysfs::new(&config));
    let manager = GpioManager::new(config, sysfs.clone());

    let pin = manager.export(2, Some(Direction::Out)).unwrap();
    pin.close().unwrap();

    let paths: Vec<PathBuf> = sysfs.writes().into_iter().map(|(p, _)| p).collect();
    assert_eq!(
        paths,
        vec![
            PathBuf::from("/tmp/fake-gpio/export"),
            PathBuf::from("/tmp/fake-gpio/gpio2/direction"),
            PathBuf::from("/tmp/fake-gpio/unexport"),
        ]
    );
}

#[test]
fn values_and_attribute_strings() {
    assert_eq!(Value::try_from(1).unwrap(), Value::High);
    assert!(Value::try_from(2).is_err());
    assert!(Value::from_ascii(b'x').is_err());
    assert_eq!(Value::from(true).as_ascii(), b'1');

    assert_eq!("in".parse::<Direction>().unwrap(), Direction::In);
    assert_eq!("out\n".parse::<Direction>().unwrap(), Direction::Out);
    assert!("input".parse::<Direction>().is_err());
    for mode in ["none", "rising", "falling", "both"] {
        assert_eq!(mode.parse::<EdgeDetect>().unwrap().as_str(), mode);
    }
    assert!("high".parse::<EdgeDetect>().is_err());

    let event = EdgeEvent {
        timestamp_ms: 42,
        value: Value::High,
    };
    assert_eq!(
        serde_json::to_value(event).unwrap(),
        serde_json::json!({ "timestamp_ms": 42, "value": 1 })
    );
}

#[test]
fn app_config_parses_pins() {
    let config = AppConfig::from_json(
        r#"
        {
            "gpios": {
                "1": { "name": "LED 1", "line": 60, "direction": "out" },
                "2": { "name": "BUTTON 1", "line": 48, "direction": "in", "edge": "falling" }
            },
            "event_buffer_capacity": 16
        }
        "#,
    )
    .expect("valid sample config");

    assert_eq!(config.sysfs, SysfsConfig::default());
    assert_eq!(config.event_buffer_capacity, 16);
    assert_eq!(config.gpios.len(), 2);
    assert_eq!(config.gpios[&1].edge, EdgeDetect::None);
    assert_eq!(config.gpios[&2].line, 48);
    assert_eq!(config.gpios[&2].edge, EdgeDetect::Falling);
    assert_eq!(config.gpios[&2].direction, Direction::In);
}

#[test]
fn app_config_rejects_bad_input() {
    assert!(matches!(
        AppConfig::from_json(r#"{ "gpios": {}, "event_buffer_capacity": 0 }"#),
        Err(GpioError::Config(_))
    ));
    assert!(matches!(
        AppConfig::from_json(r#"{ "gpios": { "1": { "name": "x", "line": 1, "direction": "sideways" } } }"#),
        Err(GpioError::Config(_))
    ));
    assert!(matches!(
        AppConfig::load_from_file("/nonexistent/sysgpio.json"),
        Err(GpioError::Config(_))
    ));
}
