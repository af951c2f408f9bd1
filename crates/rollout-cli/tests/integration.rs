#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn rollout(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("rollout").unwrap();
    cmd.current_dir(dir.path())
        .env("ROLLOUT_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

/// `rollout init`, then point every path into the temp dir and swap the
/// proxy commands for no-ops.
fn init_root(dir: &TempDir) {
    rollout(dir).arg("init").assert().success();

    let path = dir.path().join(".rollout/config.yaml");
    let mut config: serde_yaml::Value =
        serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let base = dir.path().to_string_lossy().into_owned();
    for (key, sub) in [
        ("deploy_root", "www"),
        ("backup_root", "backups"),
        ("proxy_sites_dir", "conf.d"),
        ("acme_webroot", "acme"),
        ("cert_dir", "live"),
    ] {
        config["paths"][key] = format!("{base}/{sub}").into();
    }
    let noop = serde_yaml::Value::Sequence(vec!["true".into()]);
    config["proxy"]["test_command"] = noop.clone();
    config["proxy"]["reload_command"] = noop;
    std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();
}

fn provision_static(dir: &TempDir, domain: &str) {
    rollout(dir)
        .args(["provision", domain, "static"])
        .assert()
        .success();
}

// ---------------------------------------------------------------------------
// rollout init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_state_dir() {
    let dir = TempDir::new().unwrap();
    rollout(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .rollout/config.yaml"));

    assert!(dir.path().join(".rollout/sites").is_dir());
    assert!(dir.path().join(".rollout/locks").is_dir());
    assert!(dir.path().join(".rollout/config.yaml").exists());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    rollout(&dir).arg("init").assert().success();
    rollout(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .rollout/config.yaml"));
}

#[test]
fn commands_before_init_are_precondition_failures() {
    let dir = TempDir::new().unwrap();
    rollout(&dir)
        .args(["site", "list"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("rollout init"));
}

// ---------------------------------------------------------------------------
// rollout provision / site
// ---------------------------------------------------------------------------

#[test]
fn provision_and_list_sites() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    rollout(&dir)
        .args([
            "provision",
            "api.example.com",
            "process",
            "--port",
            "8020",
            "--database-url",
            "env:API_DATABASE_URL",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Provisioned api.example.com (process)"));
    provision_static(&dir, "front.example.com");

    rollout(&dir)
        .args(["site", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("api.example.com"))
        .stdout(predicate::str::contains("front.example.com"))
        .stdout(predicate::str::contains("dns_only"));

    assert!(dir.path().join("conf.d/api.example.com.conf").exists());
    assert!(dir.path().join("www/front.example.com/releases").is_dir());
}

#[test]
fn site_show_json_has_expected_fields() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_static(&dir, "front.example.com");

    let output = rollout(&dir)
        .args(["site", "show", "front.example.com", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["domain"], "front.example.com");
    assert_eq!(value["kind"], "static");
    assert_eq!(value["tls_state"], "dns_only");
    assert!(value["current_release_id"].is_null());
}

#[test]
fn static_site_has_no_backend_to_start() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_static(&dir, "front.example.com");
    rollout(&dir)
        .args(["site", "start", "front.example.com", "--json"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("not_a_process"));
}

#[test]
fn provision_process_without_port_fails() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    rollout(&dir)
        .args(["provision", "api.example.com", "process"])
        .assert()
        .code(2);
}

#[test]
fn provision_rejects_bad_domain() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    rollout(&dir)
        .args(["provision", "Not_A_Domain", "static", "--json"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("\"code\":\"invalid_domain\""));
}

#[test]
fn unknown_site_is_not_found() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    rollout(&dir)
        .args(["status", "missing.example.com", "--json"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("\"code\":\"not_found\""))
        .stdout(predicate::str::contains("\"retryable\":false"));
}

// ---------------------------------------------------------------------------
// rollout proxy / tls / release
// ---------------------------------------------------------------------------

#[test]
fn proxy_render_matches_installed_config() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_static(&dir, "front.example.com");

    let output = rollout(&dir)
        .args(["proxy", "render", "front.example.com"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let installed = std::fs::read(dir.path().join("conf.d/front.example.com.conf")).unwrap();
    assert_eq!(output.stdout, installed);
    let text = String::from_utf8(output.stdout).unwrap();
    assert!(text.contains("server_name front.example.com;"));
    assert!(!text.contains("listen 443"));
}

#[test]
fn tls_show_reports_dns_only() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_static(&dir, "front.example.com");
    rollout(&dir)
        .args(["tls", "show", "front.example.com"])
        .assert()
        .success()
        .stdout(predicate::str::contains("front.example.com: tls dns_only"));
}

#[test]
fn tls_enable_before_issuance_is_rejected() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_static(&dir, "front.example.com");
    rollout(&dir)
        .args(["tls", "enable", "front.example.com", "--json"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("certificate_not_verified"));
}

#[test]
fn release_list_empty_and_rollback_without_history() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_static(&dir, "front.example.com");

    rollout(&dir)
        .args(["release", "list", "front.example.com"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No releases for front.example.com."));

    rollout(&dir)
        .args(["rollback", "front.example.com"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("no rollback target"));
}

#[test]
fn static_release_without_index_is_rejected() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_static(&dir, "front.example.com");
    let artifact = dir.path().join("build");
    std::fs::create_dir_all(&artifact).unwrap();
    std::fs::write(artifact.join("app.js"), "console.log(1)").unwrap();

    rollout(&dir)
        .args(["release", "ship", "front.example.com"])
        .arg(&artifact)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("index.html"));
}

// ---------------------------------------------------------------------------
// rollout migrate / backup
// ---------------------------------------------------------------------------

fn provision_api(dir: &TempDir) {
    rollout(dir)
        .args([
            "provision",
            "api.example.com",
            "process",
            "--port",
            "8020",
            "--database-url",
            "postgres://localhost/api",
        ])
        .assert()
        .success();
}

#[test]
fn migrate_reset_requires_confirmation() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_api(&dir);
    rollout(&dir)
        .args(["migrate", "reset", "api.example.com", "--json"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("confirmation_required"));
    assert!(!dir.path().join("backups").exists());
}

#[test]
fn migrate_status_lists_outstanding() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_api(&dir);
    let scripts = dir.path().join("migrations");
    std::fs::create_dir_all(&scripts).unwrap();
    std::fs::write(scripts.join("1_init.up.sql"), "create table t (id int);").unwrap();
    std::fs::write(scripts.join("1_init.down.sql"), "drop table t;").unwrap();

    rollout(&dir)
        .args(["migrate", "status", "api.example.com", "--dir"])
        .arg(&scripts)
        .assert()
        .success()
        .stdout(predicate::str::contains("schema version 0"))
        .stdout(predicate::str::contains("1 init"));
}

#[test]
fn restore_unknown_backup_is_not_found() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_api(&dir);
    rollout(&dir)
        .args([
            "backup",
            "restore",
            "api.example.com",
            "20260101T000000Z-deadbeef",
            "--confirm",
            "api.example.com",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn backup_prune_with_nothing_expired() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_api(&dir);
    rollout(&dir)
        .args(["backup", "prune"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pruned 0 backups."));
}

// ---------------------------------------------------------------------------
// rollout status / config
// ---------------------------------------------------------------------------

#[test]
fn status_shows_recent_operations() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    provision_static(&dir, "front.example.com");

    let output = rollout(&dir)
        .args(["status", "front.example.com", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let ops = value["recent_operations"].as_array().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["command"], "provision");
    assert_eq!(ops[0]["status"]["type"], "completed");
    assert!(value["locks"].as_array().unwrap().is_empty());
    assert!(value.get("process").is_none());
}

#[test]
fn config_validate_flags_missing_zone() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    rollout(&dir)
        .args(["config", "validate", "--json"])
        .assert()
        .stdout(predicate::str::contains("dns.zone_id"));
}
