// End-to-end runs of the `momentum` binary against temporary paths
use momentum_core::STREAM_HEADER_SIZE;
use std::path::Path;
use std::process::{Command, Output};

fn momentum(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_momentum"))
        .args(args)
        .current_dir(root)
        .env("MOMENTUM_RUN_PATH", root.join("run"))
        .env("MOMENTUM_DATA_PATH", root.join("data"))
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to run momentum")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_stream_create_list_remove() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let out = momentum(
        root,
        &["stream", "create", "mx://frames", "audio", "--buffer-size", "1024", "--buffer-count", "4"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = momentum(root, &["stream", "list"]);
    assert!(out.status.success());
    let listing = stdout(&out);
    let lines: Vec<&str> = listing.lines().collect();
    assert!(lines[0].starts_with("STREAM_NAME"));
    assert_eq!(lines.len(), 3);
    let frames: Vec<&str> = lines[2].split_whitespace().collect();
    let total = (1024 * 4 + STREAM_HEADER_SIZE).to_string();
    assert_eq!(frames, vec!["frames", "1024", "4", total.as_str()]);

    let out = momentum(root, &["stream", "remove", "frames", "audio"]);
    assert!(out.status.success());
    let out = momentum(root, &["stream", "list"]);
    assert_eq!(stdout(&out).lines().count(), 1);
}

#[test]
fn test_missing_resources_exit_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let out = momentum(root, &["stream", "remove", "ghost"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("stream 'ghost' does not exist"));

    let out = momentum(root, &["route", "remove", "ghost"]);
    assert!(!out.status.success());
}

#[test]
fn test_routes_through_cli() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    assert!(momentum(root, &["route", "create", "video", "audio"]).status.success());
    assert!(momentum(root, &["route", "attach", "video", "mx://cam"]).status.success());
    let out = momentum(root, &["route", "list"]);
    let names: Vec<String> = stdout(&out)
        .lines()
        .skip(1)
        .map(|l| l.trim().to_string())
        .collect();
    assert_eq!(names, vec!["audio", "video"]);

    let out = momentum(root, &["route", "create", "video"]);
    assert!(!out.status.success());
}

#[test]
fn test_application_start_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::write(
        root.join("momentum.yaml"),
        "processors:\n  idle:\n    command: sleep 30\nstreams:\n  app:\n    buffer_size: 256\n    buffer_count: 2\nroutes:\n  - name: main\n    streams: [app]\n",
    )
    .unwrap();

    let out = momentum(root, &["application", "start"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout(&momentum(root, &["stream", "list"])).contains("app"));
    assert!(stdout(&momentum(root, &["route", "list"])).contains("main"));
    assert!(stdout(&momentum(root, &["processor", "list"])).contains("sleep 30"));

    let out = momentum(root, &["application", "-f", "momentum.yaml", "stop"]);
    assert!(out.status.success());
    assert_eq!(stdout(&momentum(root, &["stream", "list"])).lines().count(), 1);
    assert_eq!(stdout(&momentum(root, &["route", "list"])).lines().count(), 1);
    assert_eq!(stdout(&momentum(root, &["processor", "list"])).lines().count(), 1);
}
