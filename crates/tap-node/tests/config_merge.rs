use clap::Parser;
use std::fs;
use tap_node::config::{AdmissionFront, NodeConfig};
use tap_node::Cli;
use tempfile::NamedTempFile;

#[test]
fn file_then_cli_overrides_merge_in_order() {
    let file = NamedTempFile::with_suffix(".toml").unwrap();
    fs::write(
        &file,
        r#"
node_name = "from-file"
http_listen_addr = "1.2.3.4:1111"
front = "memtap"
coin_per_tap = 3
"#,
    )
    .unwrap();

    let args = ["tap-node", "--config", file.path().to_str().unwrap(), "--coin-per-tap", "9", "--worker-count", "8"];
    let cli = Cli::parse_from(args);

    let mut cfg = NodeConfig::from_file(file.path()).unwrap();
    assert_eq!(cfg.node_name, "from-file");
    assert_eq!(cfg.front, AdmissionFront::Memtap);

    cfg.apply_cli_overrides(&cli);

    assert_eq!(cfg.http_listen_addr, "1.2.3.4:1111", "unset CLI flags must not clobber file values");
    assert_eq!(cfg.coin_per_tap, 9, "CLI flag must override the file value");
    assert_eq!(cfg.worker_count, 8);
}

#[test]
fn defaults_used_when_no_config_file_given() {
    let cli = Cli::parse_from(["tap-node"]);
    let mut cfg = NodeConfig::default();
    cfg.apply_cli_overrides(&cli);
    assert_eq!(cfg.front, AdmissionFront::Script);
    assert_eq!(cfg.http_listen_addr, "127.0.0.1:8080");
}
