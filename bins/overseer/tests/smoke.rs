use assert_cmd::Command;
use predicates::prelude::*;

fn config_with(jobs: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, format!("log_level = \"warn\"\n{jobs}")).unwrap();
    (dir, path)
}

#[test]
fn check_lists_jobs_with_next_run() {
    let (_dir, path) = config_with(
        r#"
[[jobs]]
name = "backup"
schedule = "*/5 * * * *"
command = ["/bin/true"]

[[jobs]]
name = "report"
schedule = "0 9 * * 1-5"
timezone = "Europe/Berlin"
command = ["/bin/echo", "report"]
"#,
    );
    Command::cargo_bin("overseer").unwrap()
        .arg("--config").arg(&path)
        .arg("--check")
        .assert()
        .success()
        .stdout(predicate::str::contains("backup\t*/5 * * * *\tUTC"))
        .stdout(predicate::str::contains("report\t0 9 * * 1-5\tEurope/Berlin"));
}

#[test]
fn check_rejects_invalid_schedule() {
    let (_dir, path) = config_with(
        r#"
[[jobs]]
name = "broken"
schedule = "0 */5 * * * *"
command = ["/bin/true"]
"#,
    );
    Command::cargo_bin("overseer").unwrap()
        .arg("--config").arg(&path)
        .arg("--check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("add job broken"));
}

#[test]
fn check_rejects_empty_command() {
    let (_dir, path) = config_with(
        r#"
[[jobs]]
name = "nothing"
schedule = "* * * * *"
command = []
"#,
    );
    Command::cargo_bin("overseer").unwrap()
        .arg("--config").arg(&path)
        .arg("--check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("empty command"));
}

#[test]
fn prints_help() {
    Command::cargo_bin("overseer").unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--check"));
}
