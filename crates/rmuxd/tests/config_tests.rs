//! Integration tests for configuration parsing
//!
//! Exercises the TOML surface of the daemon configuration: full and minimal
//! documents, defaulted fields, and invalid values.

const MINIMAL_CONFIG: &str = r#"
[daemon]
log_level = "info"

[usb]
desired_mode = 1
auto_discover = true
"#;

const FULL_CONFIG: &str = r#"
[daemon]
log_level = "debug"

[usb]
desired_mode = 3
auto_discover = false
"#;

#[test]
fn test_parse_minimal_config() {
    let config: toml::Value = toml::from_str(MINIMAL_CONFIG).unwrap();

    let daemon = config.get("daemon").unwrap();
    assert_eq!(daemon.get("log_level").unwrap().as_str().unwrap(), "info");

    let usb = config.get("usb").unwrap();
    assert_eq!(usb.get("desired_mode").unwrap().as_integer().unwrap(), 1);
    assert!(usb.get("auto_discover").unwrap().as_bool().unwrap());
}

#[test]
fn test_parse_full_config() {
    let config: toml::Value = toml::from_str(FULL_CONFIG).unwrap();

    let daemon = config.get("daemon").unwrap();
    assert_eq!(daemon.get("log_level").unwrap().as_str().unwrap(), "debug");

    let usb = config.get("usb").unwrap();
    assert_eq!(usb.get("desired_mode").unwrap().as_integer().unwrap(), 3);
    assert!(!usb.get("auto_discover").unwrap().as_bool().unwrap());
}

#[test]
fn test_empty_document_is_valid_toml() {
    let config: toml::Value = toml::from_str("").unwrap();
    assert!(config.get("daemon").is_none());
    assert!(config.get("usb").is_none());
}

#[test]
fn test_unknown_mode_is_still_valid_toml() {
    // range checking happens at load time, not parse time
    let config: toml::Value = toml::from_str("[usb]\ndesired_mode = 9\n").unwrap();
    assert_eq!(
        config
            .get("usb")
            .unwrap()
            .get("desired_mode")
            .unwrap()
            .as_integer()
            .unwrap(),
        9
    );
}
