use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

fn write_config(root: &Path, extra: &str) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[storage]
root = "{}/data"

[collection]
start_year = 2023
end_year = 2023
data_types = ["sentinel_monthly_age"]
refresh_recent_periods = 0
{}
"#,
        root.display(),
        extra
    );

    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();
    config_path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "");
    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

#[test]
fn test_dry_run_lists_backlog_without_fetching() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_harvest(&config_path, &["run", "--dry-run", "--progress", "off"]);
    assert_eq!(code, Some(0), "dry run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("items due: 12"), "stdout={}", stdout);
    assert!(stdout.contains("sentinel_monthly_age"));
    assert!(stdout.contains("2023-01 .. 2023-12"));
    assert!(!tmp.path().join("data/raw").exists());
    assert!(!tmp.path().join("data/state/checkpoint.json").exists());
}

#[test]
fn test_status_without_checkpoint() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_harvest(&config_path, &["status"]);
    assert_eq!(code, Some(0), "status failed: stderr={}", stderr);
    assert!(stdout.contains("Suspended run:   none"));
    assert!(stdout.contains("Permanently failed items: 0"));
}

#[test]
fn test_missing_on_empty_store() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_harvest(&config_path, &["missing"]);
    assert_eq!(code, Some(0), "missing failed: stderr={}", stderr);
    assert!(stdout.contains("[sentinel_monthly_age] 12 missing"), "stdout={}", stdout);
    assert!(stdout.contains("2023: 1-12"));
}

#[test]
fn test_missing_json() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, code) = run_harvest(&config_path, &["missing", "--json"]);
    assert_eq!(code, Some(0));
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed["total_missing"], 12);
    assert_eq!(
        parsed["data_types"]["sentinel_monthly_age"]
            .as_array()
            .unwrap()
            .len(),
        12
    );
}

#[test]
fn test_continuity_gaps_exit_nonzero() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, code) = run_harvest(&config_path, &["continuity"]);
    assert_eq!(code, Some(1));
    assert!(stdout.contains("GAPS"), "stdout={}", stdout);
}

#[test]
fn test_continuity_unknown_data_type() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, code) = run_harvest(&config_path, &["continuity", "--data-type", "nope"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("not being collected"), "stderr={}", stderr);
}

#[test]
fn test_stats_and_verify_on_empty_store() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_harvest(&config_path, &["stats"]);
    assert_eq!(code, Some(0), "stats failed: stderr={}", stderr);
    assert!(stdout.contains("Files:       0"));

    let (stdout, stderr, code) = run_harvest(&config_path, &["verify"]);
    assert_eq!(code, Some(0), "verify failed: stderr={}", stderr);
    assert!(stdout.contains("all files intact"));
}

#[test]
fn test_plain_http_base_url_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(
        tmp.path(),
        "\n[upstream]\nbase_url = \"http://survey.example.org\"\n",
    );

    let (_, stderr, code) = run_harvest(&config_path, &["status"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("https"), "stderr={}", stderr);
}

#[test]
fn test_missing_config_file() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, code) = run_harvest(&tmp.path().join("nope.toml"), &["status"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("Failed to read config file"));
}
