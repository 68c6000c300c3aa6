use std::io::Write;

use thttpd_core::config::load_config;

fn write_yaml(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("thttpd.yaml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn loads_a_minimal_single_server_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_yaml(
        &dir,
        r#"
servers:
  - host: "127.0.0.1"
    ports: [8080]
    server_name: "localhost"
    default_server: true
    routes:
      - path: "/"
        root: "./www"
"#,
    );

    let config = load_config(&path).unwrap();
    assert_eq!(config.servers.len(), 1);
    let server = &config.servers[0];
    assert_eq!(server.host, "127.0.0.1");
    assert_eq!(server.ports, vec![8080]);
    assert!(server.default_server);
    assert_eq!(server.routes[0].root, "./www");
}

#[test]
fn rejects_a_config_with_no_servers() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_yaml(&dir, "servers: []\n");
    assert!(load_config(&path).is_err());
}

#[test]
fn rejects_malformed_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_yaml(&dir, "servers: [this is not valid: : yaml\n");
    assert!(load_config(&path).is_err());
}

#[test]
fn drops_servers_with_colliding_bind_triples() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_yaml(
        &dir,
        r#"
servers:
  - host: "0.0.0.0"
    ports: [9000]
    server_name: "a"
  - host: "0.0.0.0"
    ports: [9000]
    server_name: "a"
  - host: "0.0.0.0"
    ports: [9001]
    server_name: "b"
"#,
    );

    let config = load_config(&path).unwrap();
    // The two colliding (0.0.0.0, 9000, "a") entries are both dropped;
    // the unrelated 9001 binding survives.
    assert_eq!(config.servers.len(), 1);
    assert_eq!(config.servers[0].server_name, "b");
}

#[test]
fn throttle_rules_round_trip_through_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_yaml(
        &dir,
        r#"
servers:
  - host: "127.0.0.1"
    ports: [8080]
    throttles:
      - pattern: "*.cgi"
        max_limit: 2000
        min_limit: 100
"#,
    );

    let config = load_config(&path).unwrap();
    let rule = &config.servers[0].throttles[0];
    assert_eq!(rule.pattern, "*.cgi");
    assert_eq!(rule.max_limit, 2000);
    assert_eq!(rule.min_limit, Some(100));
}
