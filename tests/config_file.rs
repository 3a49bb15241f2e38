//! Loading servers from TOML configuration files.

#![cfg(feature = "config-file")]

mod common;

use common::{init_test_logging, MemoryClient};
use serde_json::json;
use std::io::Write;
use std::time::Duration;
use wschannel::{ConfigError, ErrorCategory, ErrorKind, Server, ServerConfig};

const FULL: &str = r#"
host = "127.0.0.1"
port = 9100
max_connections = 8
max_connections_per_ip = 2
max_requests_per_minute = 20
check_origin = false
max_payload_size = 4096
tick_interval_ms = 25

[[channels]]
name = "lobby"
reconnection_period_secs = 30

[channels.parameters]
maxPlayers = 4

[[channels]]
name = "vault"
password = "hunter2"
"#;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write config");
    file.flush().expect("flush config");
    file
}

#[test]
fn test_full_file_builds_configured_server() {
    init_test_logging();
    let file = write_config(FULL);
    let config = ServerConfig::from_toml_file(file.path()).expect("parses");

    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 9100);
    assert_eq!(config.limits().max_connections_per_ip, 2);
    assert_eq!(config.limits().max_payload_size, 4096);
    assert_eq!(config.tick_interval(), Duration::from_millis(25));
    assert_eq!(config.channels.len(), 2);
    assert_eq!(config.channels[0].kind, "default");

    let mut server = Server::builder(config).secret("cfg").build().expect("builds");
    assert_eq!(server.channels().names(), vec!["lobby", "vault"]);

    let lobby = server.channels().get("lobby").expect("lobby");
    assert!(lobby.is_reconnection_allowed());
    assert_eq!(lobby.reconnection_period(), Duration::from_secs(30));
    assert_eq!(lobby.parameter("maxPlayers"), Some(&json!(4)));
    assert!(server.channels().get("vault").is_some_and(|c| c.requires_password()));

    let (_, bootstrap) = MemoryClient::upgrade(&mut server, "10.0.0.1:1", "lobby");
    assert_eq!(bootstrap["reconnectionAllowed"], json!(true));
}

#[test]
fn test_partial_file_keeps_defaults() {
    let file = write_config("port = 7000\n");
    let config = ServerConfig::from_toml_file(file.path()).expect("parses");

    let expected = ServerConfig {
        port: 7000,
        ..ServerConfig::default()
    };
    assert_eq!(config, expected);
}

#[test]
fn test_bad_files_are_config_errors() {
    let file = write_config("port = \"not a number\"\n");
    let err = ServerConfig::from_toml_file(file.path()).expect_err("bad type");
    assert!(matches!(err, ConfigError::Toml(_)));

    let missing = std::path::Path::new("/nonexistent/wschannel.toml");
    let err = ServerConfig::from_toml_file(missing).expect_err("missing file");
    assert!(matches!(err, ConfigError::Io { .. }));

    let err: wschannel::Error = err.into();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert_eq!(err.category(), ErrorCategory::Config);
}

#[test]
fn test_unknown_kind_in_file_fails_build() {
    let file = write_config("[[channels]]\nname = \"arena\"\nkind = \"game\"\n");
    let config = ServerConfig::from_toml_file(file.path()).expect("parses");

    let err = Server::builder(config.clone()).secret("cfg").build().expect_err("no kind");
    assert_eq!(err.kind(), ErrorKind::UnknownKind);

    let server = Server::builder(config)
        .secret("cfg")
        .kind("game", |_| {})
        .build()
        .expect("builds");
    assert!(server.channels().has("arena"));
}
