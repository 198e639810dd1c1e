use assert_cmd::Command;
use httpmock::Method::GET;
use httpmock::MockServer;
use predicates::prelude::*;
use serde_json::json;
use std::net::TcpListener;
use std::path::Path;
use tempfile::TempDir;

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn write_config(dir: &TempDir, catalog_url: &str) -> std::path::PathBuf {
    let mirror = dir.path().join("mirror");
    std::fs::create_dir_all(&mirror).unwrap();
    let config_path = dir.path().join("bottlesync.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[storage]
type = "filesystem"
path = "{}"

[catalog]
url = "{catalog_url}"
timeout_secs = 5

[sync]
target_platforms = ["arm64_sonoma"]

[retry]
attempts = 0
base_delay_ms = 1
max_delay_ms = 1
jitter = 0.0
"#,
            mirror.display()
        ),
    )
    .unwrap();
    config_path
}

fn bottlesync(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("bottlesync").unwrap();
    cmd.env_remove("BOTTLESYNC_CONFIG")
        .env("RUST_LOG", "warn")
        .arg("--config")
        .arg(config);
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("bottlesync")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("ledger"));
}

#[test]
fn test_explicit_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    bottlesync(&dir.path().join("nope.toml"))
        .args(["ledger", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration file not found"));
}

#[test]
fn test_invalid_threshold_from_env_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "https://formulae.brew.sh/api/formula.json");
    bottlesync(&config)
        .env("BOTTLESYNC_SYNC__PARTIAL_FAILURE_THRESHOLD", "2")
        .args(["ledger", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn test_unbounded_run_deadline_from_env_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "https://formulae.brew.sh/api/formula.json");
    bottlesync(&config)
        .env("BOTTLESYNC_WORKERS__BATCH__RUN_DEADLINE_SECS", u64::MAX.to_string())
        .args(["ledger", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("run_deadline_secs"));
}

#[test]
fn test_ledger_check_without_ledger() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "https://formulae.brew.sh/api/formula.json");
    bottlesync(&config)
        .args(["ledger", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No ledger at bottles_hash.json"));
}

#[test]
fn test_ledger_check_reports_entries_and_statistics() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "https://formulae.brew.sh/api/formula.json");
    let ledger = json!({
        "last_updated": "2025-07-21T10:15:30Z",
        "bottles": {
            "curl-8.2.1-arm64_sonoma": {
                "sha256": "a".repeat(64),
                "download_date": "2025-07-21",
                "file_size": 1000
            },
            "wget-1.21.4-arm64_sonoma": {
                "sha256": "b".repeat(64),
                "download_date": "2025-07-20",
                "file_size": 3000
            }
        }
    });
    std::fs::write(
        dir.path().join("mirror/bottles_hash.json"),
        serde_json::to_vec(&ledger).unwrap(),
    )
    .unwrap();

    let output = bottlesync(&config)
        .args(["ledger", "check", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["valid"], true);
    assert_eq!(report["entries"], 2);
    assert_eq!(report["statistics"]["total_size"], 4000);
    assert_eq!(report["statistics"]["platforms"]["arm64_sonoma"]["mean_size"], 2000);
}

#[test]
fn test_ledger_check_flags_dropped_entries() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "https://formulae.brew.sh/api/formula.json");
    let ledger = json!({
        "last_updated": "2025-07-21T10:15:30Z",
        "bottles": {
            "curl-8.2.1-arm64_sonoma": {"sha256": "not-a-digest", "download_date": "2025-07-21", "file_size": 1}
        }
    });
    std::fs::write(
        dir.path().join("mirror/bottles_hash.json"),
        serde_json::to_vec(&ledger).unwrap(),
    )
    .unwrap();

    bottlesync(&config)
        .args(["ledger", "check"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Dropped:      1"));
}

#[test]
fn test_ledger_check_does_not_touch_corrupt_ledger() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "https://formulae.brew.sh/api/formula.json");
    let ledger_path = dir.path().join("mirror/bottles_hash.json");
    std::fs::write(&ledger_path, b"{\"bottles\": [").unwrap();

    bottlesync(&config)
        .args(["ledger", "check"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("is corrupt"));

    assert_eq!(std::fs::read(&ledger_path).unwrap(), b"{\"bottles\": [");
    assert!(!dir.path().join("mirror/backups").exists());
}

#[test]
fn test_plan_routes_without_writing() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    let catalog = server.mock(|when, then| {
        when.method(GET).path("/api/formula.json");
        then.status(200).json_body(json!([
            {
                "name": "jq",
                "versions": {"stable": "1.7.1"},
                "bottle": {"stable": {"files": {
                    "arm64_sonoma": {"url": server.url("/blobs/jq"), "sha256": "c".repeat(64)}
                }}}
            }
        ]));
    });

    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, &server.url("/api/formula.json"));
    let output = bottlesync(&config).args(["plan", "--json"]).output().unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["candidates"], 1);
    assert_eq!(plan["worker"], "lightweight");
    assert_eq!(plan["keys"][0], "jq-1.7.1-arm64_sonoma");
    catalog.assert();

    let written: Vec<_> = std::fs::read_dir(dir.path().join("mirror")).unwrap().collect();
    assert!(written.is_empty());
}

#[test]
fn test_sync_exits_nonzero_when_catalog_is_down() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/formula.json");
        then.status(503);
    });

    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, &server.url("/api/formula.json"));
    bottlesync(&config)
        .args(["sync", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"state\": \"FAILED\""));
}
