use predicates::prelude::*;

fn provisioner_binary() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("ci-provisioner").expect("binary built");
    cmd.env_clear();
    cmd
}

#[test]
fn help_lists_commands() {
    provisioner_binary()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("cleanup"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn create_without_token_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();

    provisioner_binary()
        .current_dir(dir.path())
        .args(["create", "--state-dir"])
        .arg(dir.path().join("state"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("H_API_TOKEN"));

    // nothing was recorded
    assert!(!dir.path().join("state").join("controller_vm_info.json").exists());
}

#[test]
fn create_with_only_token_names_next_missing_input() {
    let dir = tempfile::tempdir().unwrap();

    provisioner_binary()
        .current_dir(dir.path())
        .env("H_API_TOKEN", "token")
        .arg("create_jenkins")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("SERVER_TYPE"));
}

#[test]
fn status_prints_recorded_inventory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("controller_vm_info.json"),
        r#"{"id": 42, "role": "controller", "name": "jenkins-server-1700000000", "public_ipv4": "192.0.2.10", "status": "running"}"#,
    )
    .unwrap();

    provisioner_binary()
        .current_dir(dir.path())
        .args(["status", "--state-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("jenkins-server-1700000000"))
        .stdout(predicate::str::contains("192.0.2.10"));
}

#[test]
fn invalid_config_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("provisioner.toml");
    std::fs::write(&config, "agent_count = \"many\"\n").unwrap();

    provisioner_binary()
        .current_dir(dir.path())
        .args(["status", "--config"])
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid config"));
}

#[test]
fn cleanup_keep_vms_on_empty_inventory() {
    let dir = tempfile::tempdir().unwrap();

    provisioner_binary()
        .current_dir(dir.path())
        .args(["cleanup", "--keep-vms", "--skip-dns", "--state-dir"])
        .arg(dir.path().join("state"))
        .assert()
        .success();
}

#[test]
fn branch_requires_config_repo() {
    provisioner_binary()
        .args(["create", "--branch", "main"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--config-repo"));
}
