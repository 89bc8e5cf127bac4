use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn tgw_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("tgw");
    path
}

/// A Telegram Desktop export for `@demo` with three posts, one with a photo.
fn write_export(root: &Path) {
    let channel_dir = root.join("export/demo");
    fs::create_dir_all(channel_dir.join("photos")).unwrap();
    fs::write(channel_dir.join("photos/photo_2.jpg"), b"\xff\xd8\xff\xe0fakejpeg").unwrap();
    fs::write(
        channel_dir.join("result.json"),
        r#"{
  "name": "Demo Pharmacy",
  "type": "public_channel",
  "messages": [
    {"id": 1, "type": "message", "date": "2024-05-01T08:00:00", "date_unixtime": "1714550400",
     "text": "Paracetamol 500mg back in stock", "views": 120},
    {"id": 2, "type": "message", "date": "2024-05-01T12:00:00", "date_unixtime": "1714564800",
     "text": ["New ", {"type": "bold", "text": "sunscreen"}, " arrivals"], "photo": "photos/photo_2.jpg", "views": 80},
    {"id": 3, "type": "message", "date": "2024-05-02T09:00:00", "date_unixtime": "1714640400",
     "text": "Paracetamol syrup for kids", "views": 45, "forwards": 2}
  ]
}"#,
    )
    .unwrap();
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    write_export(&root);

    let config_content = format!(
        r#"[db]
path = "{root}/data/warehouse.sqlite"

[scrape]
channels = ["@demo"]
limit = 50
source = "export"

[source.export]
root = "{root}/export"

[storage]
raw_messages = "{root}/data/raw/telegram_messages"
images = "{root}/data/raw/images"
checkpoints = "{root}/logs/checkpoints.json"
detections_csv = "{root}/data/processed/yolo_detections.csv"

[enrich]
detector = "placeholder"

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("tgw.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_tgw(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = tgw_binary();
    let workdir = config_path.parent().unwrap().parent().unwrap();
    let output = Command::new(&binary)
        .current_dir(workdir)
        .env_remove("TG_API_ID")
        .env_remove("TG_API_HASH")
        .env_remove("TG_PHONE")
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run tgw binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_tgw(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/warehouse.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_tgw(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_tgw(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_scrape_lands_batch_and_advances_checkpoint() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_tgw(&config_path, &["scrape"]);
    assert!(success, "scrape failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("@demo: 3 messages, checkpoint 0 -> 3"), "got: {}", stdout);

    let (stdout, _, _) = run_tgw(&config_path, &["checkpoints"]);
    assert!(stdout.contains("@demo"));
    assert!(stdout.trim_end().ends_with('3'));

    let photo = tmp.path().join("data/raw/images/demo/2.jpg");
    assert!(photo.exists(), "photo not downloaded");
}

#[test]
fn test_scrape_incremental() {
    let (_tmp, config_path) = setup_test_env();

    run_tgw(&config_path, &["scrape"]);
    let (stdout, _, success) = run_tgw(&config_path, &["scrape"]);
    assert!(success);
    assert!(
        stdout.contains("@demo: 0 messages, checkpoint 3 -> 3"),
        "Expected nothing new on second scrape, got: {}",
        stdout
    );
}

#[test]
fn test_scrape_limit_resumes_from_checkpoint() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, _) = run_tgw(&config_path, &["scrape", "--limit", "2"]);
    assert!(stdout.contains("checkpoint 0 -> 2"), "got: {}", stdout);

    let (stdout, _, _) = run_tgw(&config_path, &["scrape", "--limit", "2"]);
    assert!(stdout.contains("@demo: 1 messages, checkpoint 2 -> 3"), "got: {}", stdout);
}

#[test]
fn test_channel_flag_matches_configured_spelling() {
    let (tmp, config_path) = setup_test_env();

    run_tgw(&config_path, &["scrape"]);
    let (stdout, _, success) = run_tgw(&config_path, &["scrape", "--channel", "DEMO", "--channel", "demo"]);
    assert!(success);
    assert!(stdout.contains("@demo: 0 messages, checkpoint 3 -> 3"), "got: {}", stdout);
    assert_eq!(stdout.matches("checkpoint").count(), 1, "got: {}", stdout);

    let (stdout, _, _) = run_tgw(&config_path, &["checkpoints"]);
    assert!(!stdout.contains("DEMO"));

    let (stdout, _, success) = run_tgw(&config_path, &["load"]);
    assert!(success);
    assert!(stdout.contains("3 inserted"), "got: {}", stdout);
    let day_dirs: Vec<_> = fs::read_dir(tmp.path().join("data/raw/telegram_messages"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    for dir in day_dirs {
        let names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["demo.json"]);
    }
}

#[test]
fn test_unknown_channel_fails_without_checkpoint() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_tgw(&config_path, &["scrape", "--channel", "@ghost"]);
    assert!(!success, "scrape of only-missing channel should fail");
    assert!(stdout.contains("@ghost: FAILED"));

    let (stdout, _, _) = run_tgw(&config_path, &["checkpoints"]);
    assert!(!stdout.contains("@ghost"));
}

#[test]
fn test_load_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    run_tgw(&config_path, &["scrape"]);

    let (stdout, stderr, success) = run_tgw(&config_path, &["load"]);
    assert!(success, "load failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("3 inserted"), "got: {}", stdout);

    let (stdout, _, success) = run_tgw(&config_path, &["load"]);
    assert!(success);
    assert!(stdout.contains("0 inserted, 3 already present"), "got: {}", stdout);
}

#[test]
fn test_enrich_writes_detection_csv() {
    let (tmp, config_path) = setup_test_env();

    run_tgw(&config_path, &["scrape"]);
    let (stdout, stderr, success) = run_tgw(&config_path, &["enrich"]);
    assert!(success, "enrich failed: stdout={}, stderr={}", stdout, stderr);

    let csv = fs::read_to_string(tmp.path().join("data/processed/yolo_detections.csv")).unwrap();
    let mut lines = csv.lines();
    assert_eq!(
        lines.next(),
        Some("image_path,channel_name,message_id,detected_objects,confidence_scores,classification")
    );
    let row = lines.next().expect("one detection row");
    assert!(row.contains(",demo,2,"), "got: {}", row);
    assert!(lines.next().is_none());
}

#[test]
fn test_run_then_query() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_tgw(&config_path, &["run"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("pipeline finished"));

    let (stdout, _, success) = run_tgw(&config_path, &["query", "activity", "@demo"]);
    assert!(success);
    assert!(stdout.contains("2024-05-01"));
    assert!(stdout.contains("2024-05-02"));
    assert!(stdout.contains("200"), "views for 2024-05-01 should sum to 200: {}", stdout);

    let (_, stderr, success) = run_tgw(&config_path, &["query", "activity", "@ghost"]);
    assert!(!success);
    assert!(stderr.contains("channel not found"));

    let (stdout, _, success) = run_tgw(&config_path, &["query", "top-terms", "--limit", "1"]);
    assert!(success);
    assert!(stdout.contains("paracetamol"));

    let (stdout, _, success) = run_tgw(&config_path, &["query", "search", "SUNSCREEN"]);
    assert!(success);
    assert!(stdout.contains("#2"));

    let (_, _, success) = run_tgw(&config_path, &["query", "categories"]);
    assert!(success);
}

#[test]
fn test_stats_after_load() {
    let (_tmp, config_path) = setup_test_env();

    run_tgw(&config_path, &["scrape"]);
    run_tgw(&config_path, &["load"]);

    let (stdout, _, success) = run_tgw(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Messages:    3"));
    assert!(stdout.contains("@demo"));
}

#[test]
fn test_http_source_requires_credentials() {
    let (_tmp, config_path) = setup_test_env();
    let content = fs::read_to_string(&config_path)
        .unwrap()
        .replace("source = \"export\"", "source = \"http\"");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_tgw(&config_path, &["scrape"]);
    assert!(!success);
    assert!(stderr.contains("TG_API_ID"), "got: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("config/none.toml");
    let (_, stderr, success) = run_tgw(&missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
