//! Coverage for config parsing, file resolution and env overrides.

use std::path::{Path, PathBuf};

use switchboard::config::Config;

#[test]
fn parse_partial_config_keeps_defaults() {
    let config = Config::from_toml(
        r#"
[server]
listen = "127.0.0.1:9090"

[webhook]
timeout_secs = 10
max_in_flight = 64
"#,
    )
    .expect("parse");
    assert_eq!(config.server.listen, "127.0.0.1:9090");
    assert_eq!(config.webhook.timeout_secs, 10);
    assert_eq!(config.webhook.max_in_flight, Some(64));
    assert_eq!(config.webhook.max_redirects, 15);
    assert_eq!(config.bridge.url, "http://127.0.0.1:3001");
    assert_eq!(config.storage.files_dir, PathBuf::from("files"));
}

#[test]
fn empty_config_is_all_defaults() {
    let config = Config::from_toml("").expect("parse");
    assert_eq!(config.server.listen, "0.0.0.0:8080");
    assert_eq!(config.storage.database, PathBuf::from("data/switchboard.db"));
    assert_eq!(config.session.connect_grace_secs, 10);
    assert_eq!(config.logging.dir, PathBuf::from("logs"));
}

#[test]
fn wrong_field_type_is_rejected() {
    assert!(Config::from_toml("[webhook]\ntimeout_secs = \"soon\"\n").is_err());
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Config::load_with(Some(&dir.path().join("absent.toml")), |_| None)
        .expect("defaults");
    assert_eq!(config.server.listen, "0.0.0.0:8080");
}

#[test]
fn file_then_env_overrides() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[storage]\ndatabase = \"/var/lib/switchboard/db.sqlite\"\n[bridge]\nurl = \"http://bridge:3001\"\n",
    )
    .expect("write config");

    let config = Config::load_with(Some(&path), |key| match key {
        "SWITCHBOARD_BRIDGE_URL" => Some("http://10.0.0.5:3001".to_owned()),
        "SWITCHBOARD_FILES_DIR" => Some("/srv/files".to_owned()),
        "SWITCHBOARD_WEBHOOK_MAX_IN_FLIGHT" => Some("8".to_owned()),
        _ => None,
    })
    .expect("load");
    assert_eq!(
        config.storage.database,
        Path::new("/var/lib/switchboard/db.sqlite")
    );
    assert_eq!(config.bridge.url, "http://10.0.0.5:3001");
    assert_eq!(config.storage.files_dir, Path::new("/srv/files"));
    assert_eq!(config.webhook.max_in_flight, Some(8));
}

#[test]
fn config_path_comes_from_env() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("custom.toml");
    std::fs::write(&path, "[server]\nlisten = \"127.0.0.1:7000\"\n").expect("write config");
    let path_str = path.to_string_lossy().into_owned();

    let config = Config::load_with(None, |key| {
        (key == "SWITCHBOARD_CONFIG").then(|| path_str.clone())
    })
    .expect("load");
    assert_eq!(config.server.listen, "127.0.0.1:7000");
}

#[test]
fn malformed_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[server\nlisten = ").expect("write config");
    assert!(Config::load_with(Some(&path), |_| None).is_err());
}
