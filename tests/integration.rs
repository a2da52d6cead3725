use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn operator_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("grafana-operator");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[unit]
name = "grafana/0"
address = "10.0.0.1"

[db]
path = "{root}/data/operator.sqlite"

[storage]
mount_path = "{root}/volume"

[workload]
root = "{root}/container"
backoff_base_ms = 0
ready_interval_ms = 0

[server]
bind = "127.0.0.1:7341"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("operator.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_operator(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = operator_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run operator binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

const DATABASE_RELATION: &str = r#"{"id": 4, "name": "database", "interface": "mysql",
    "local-unit": "grafana/0", "remote-units": ["mysql/0"],
    "data": {"mysql/0": {"type": "mysql", "host": "0.1.2.3:3306", "name": "my-test-db",
                         "user": "test-user", "password": "super!secure!password"}}}"#;

const PROMETHEUS_RELATION: &str = r#"{"id": 1, "name": "grafana-source", "interface": "grafana-datasource",
    "local-unit": "grafana/0", "remote-units": ["prometheus/0"],
    "data": {"prometheus/0": {"name": "prometheus", "type": "prometheus", "url": "http://prom:9090"}}}"#;

fn write_relations(dir: &Path, relations: &[&str]) -> PathBuf {
    let path = dir.join("relations.json");
    fs::write(&path, format!("[{}]", relations.join(","))).unwrap();
    path
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_operator(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("State database initialized."));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_operator(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_operator(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_operator(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_render_prints_fingerprint_and_files() {
    let (tmp, config_path) = setup_test_env();
    let file = write_relations(tmp.path(), &[DATABASE_RELATION, PROMETHEUS_RELATION]);
    let file = file.to_str().unwrap();

    let (stdout, stderr, success) = run_operator(&config_path, &["render", file]);
    assert!(success, "render failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.starts_with("fingerprint: "));
    assert!(stdout.contains("--- /etc/grafana/grafana.ini ---"));
    assert!(stdout.contains("host = 0.1.2.3:3306"));
    assert!(stdout.contains("name = my-test-db"));
    assert!(stdout.contains("\"prometheus\""));

    // Rendering is deterministic.
    let (again, _, _) = run_operator(&config_path, &["render", file]);
    assert_eq!(stdout, again);
}

#[test]
fn test_render_without_database_fails() {
    let (tmp, config_path) = setup_test_env();
    let file = write_relations(tmp.path(), &[PROMETHEUS_RELATION]);

    let (_, stderr, success) = run_operator(&config_path, &["render", file.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("database"));
}

#[test]
fn test_replay_dry_run_reaches_active() {
    let (tmp, config_path) = setup_test_env();
    let events = tmp.path().join("events.jsonl");
    let relation: String = DATABASE_RELATION.split_whitespace().collect::<Vec<_>>().join(" ");
    fs::write(
        &events,
        format!(
            "# unit boot\n\
             {{\"event\": \"leader-changed\", \"leader\": true}}\n\
             {{\"event\": \"start\"}}\n\
             {{\"event\": \"storage-attached\", \"size-mb\": 1024}}\n\
             {{\"event\": \"pebble-ready\"}}\n\
             {{\"event\": \"relation-changed\", \"relation\": {}}}\n",
            relation
        ),
    )
    .unwrap();

    let (stdout, stderr, success) = run_operator(
        &config_path,
        &["replay", events.to_str().unwrap(), "--dry-run"],
    );
    assert!(success, "replay failed: stdout={}, stderr={}", stdout, stderr);

    let statuses: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
        .filter(|v| v["kind"] == "status")
        .collect();
    assert_eq!(statuses.len(), 5);
    assert_eq!(statuses[3]["message"], "waiting for database");
    assert_eq!(statuses[4]["status"], "active");
    assert_eq!(statuses[4]["message"], "grafana started");

    let ini = fs::read_to_string(tmp.path().join("container/etc/grafana/grafana.ini")).unwrap();
    assert!(ini.contains("host = 0.1.2.3:3306"));
    assert!(tmp.path().join("volume/.grafana-operator").exists());

    let (stdout, _, success) = run_operator(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("Generation:        1"));
    assert!(stdout.contains("Container ready:   true"));
}

#[test]
fn test_status_without_state() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_operator(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("No state recorded for grafana/0."));
}
