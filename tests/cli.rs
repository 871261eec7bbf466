//! CLI surface smoke tests.

use assert_cmd::Command;

#[test]
fn help_lists_the_subcommands() {
    let output = Command::cargo_bin("partsmith")
        .expect("binary")
        .arg("--help")
        .output()
        .expect("run");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["start", "enqueue", "status"] {
        assert!(
            stdout.contains(subcommand),
            "--help should mention {subcommand}"
        );
    }
}

#[test]
fn status_rejects_a_malformed_batch_id() {
    let output = Command::cargo_bin("partsmith")
        .expect("binary")
        .args(["status", "not-a-uuid"])
        .output()
        .expect("run");
    assert!(!output.status.success());
}
