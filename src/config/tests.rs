use super::*;

#[test]
fn defaults_fail_validation_without_default_vhost() {
    let cfg = GatewayConfig::default();
    assert!(cfg.validate().is_err());
}

#[test]
fn normalize_lowercases_headers_and_sets_server_banner() {
    let mut cfg = GatewayConfig {
        default: "all".to_string(),
        headers: HashMap::from([("X-Powered-By".to_string(), "me".to_string())]),
        ..GatewayConfig::default()
    };
    cfg.normalize();
    assert_eq!(cfg.headers.get("x-powered-by"), Some(&"me".to_string()));
    assert!(cfg.headers.get("server").unwrap().starts_with("turtle.io/"));
}

#[test]
fn normalize_sets_default_x_powered_by_when_unset() {
    let mut cfg = GatewayConfig {
        default: "all".to_string(),
        ..GatewayConfig::default()
    };
    cfg.normalize();
    assert_eq!(cfg.headers.get("x-powered-by"), Some(&"turtle.io".to_string()));
}

#[test]
fn load_json_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"default":"all","root":"/srv","vhosts":{"all":"."}}"#,
    )
    .unwrap();
    let cfg = GatewayConfig::load(&path).unwrap();
    assert_eq!(cfg.default, "all");
    assert_eq!(cfg.root, PathBuf::from("/srv"));
}

#[test]
fn missing_file_uses_defaults_and_still_requires_default_vhost() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.toml");
    let err = GatewayConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("default"));
}
