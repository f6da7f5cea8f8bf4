use keyserver_types::{DeviceId, ServerName, UserId};
use std::collections::HashSet;
use std::str::FromStr;

// ── UserId ────────────────────────────────────────────────────────

#[test]
fn user_id_parse_valid() {
    let user = UserId::parse("@alice:example.org").unwrap();
    assert_eq!(user.localpart(), "alice");
    assert_eq!(user.server_name().as_str(), "example.org");
    assert_eq!(user.to_string(), "@alice:example.org");
}

#[test]
fn user_id_keeps_port_in_server_name() {
    let user = UserId::parse("@bob:matrix.example.com:8448").unwrap();
    assert_eq!(user.localpart(), "bob");
    assert_eq!(user.server_name().as_str(), "matrix.example.com:8448");
}

#[test]
fn user_id_rejects_missing_sigil() {
    assert!(UserId::parse("alice:example.org").is_err());
}

#[test]
fn user_id_rejects_missing_server() {
    assert!(UserId::parse("@alice").is_err());
    assert!(UserId::parse("@alice:").is_err());
}

#[test]
fn user_id_rejects_empty_localpart() {
    assert!(UserId::parse("@:example.org").is_err());
}

#[test]
fn user_id_from_str_and_display_roundtrip() {
    let user = UserId::from_str("@carol:example.net").unwrap();
    let again: UserId = user.to_string().parse().unwrap();
    assert_eq!(user, again);
}

#[test]
fn user_id_serde_is_plain_string() {
    let user = UserId::parse("@dave:example.org").unwrap();
    let json = serde_json::to_string(&user).unwrap();
    assert_eq!(json, "\"@dave:example.org\"");
    let parsed: UserId = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, user);
}

#[test]
fn user_id_serde_rejects_invalid() {
    let result: Result<UserId, _> = serde_json::from_str("\"not-a-user\"");
    assert!(result.is_err());
}

#[test]
fn user_id_hash_eq() {
    let a = UserId::parse("@erin:example.org").unwrap();
    let mut set = HashSet::new();
    set.insert(a.clone());
    set.insert(a);
    assert_eq!(set.len(), 1);
}

// ── ServerName ────────────────────────────────────────────────────

#[test]
fn server_name_rejects_empty_and_whitespace() {
    assert!(ServerName::parse("").is_err());
    assert!(ServerName::parse("exa mple.org").is_err());
    assert!(ServerName::parse("example.org/path").is_err());
}

#[test]
fn server_name_valid() {
    let name: ServerName = "example.org".parse().unwrap();
    assert_eq!(name.to_string(), "example.org");
}

// ── DeviceId ──────────────────────────────────────────────────────

#[test]
fn device_id_rejects_empty() {
    assert!(DeviceId::new("").is_err());
}

#[test]
fn device_id_orders_lexicographically() {
    let mut ids = vec![
        DeviceId::new("CCC").unwrap(),
        DeviceId::new("AAA").unwrap(),
        DeviceId::new("BBB").unwrap(),
    ];
    ids.sort();
    let names: Vec<&str> = ids.iter().map(|d| d.as_str()).collect();
    assert_eq!(names, vec!["AAA", "BBB", "CCC"]);
}
