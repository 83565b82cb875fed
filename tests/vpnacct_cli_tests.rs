//! Integration tests for the vpnacct CLI
//!
//! The community daemon is pointed at a closed port and the control utility
//! at a fake script, so no real VPN server is needed.

use assert_cmd::Command;
use libvpnacct::test_util::FakeSacli;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

struct Setup {
    dir: TempDir,
    config: PathBuf,
    sacli: FakeSacli,
}

impl Setup {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let sacli = FakeSacli::install(dir.path());

        // Grab a free port and release it so connections are refused
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let config = dir.path().join("vpnacct.toml");
        fs::write(
            &config,
            format!(
                r#"
[paths]
credential_file = "{root}/psw-file"
user_db = "{root}/users.toml"
status_log = "{root}/openvpn-status.log"

[community]
port = {port}
timeout_secs = 1

[commercial]
sacli_path = "{sacli}"
timeout_secs = 5
"#,
                root = dir.path().display(),
                port = port,
                sacli = sacli.path().display(),
            ),
        )
        .unwrap();

        Self { dir, config, sacli }
    }

    fn vpnacct(&self) -> Command {
        let mut cmd = Command::cargo_bin("vpnacct").unwrap();
        for var in [
            "OPENVPN_MGMT_HOST",
            "OPENVPN_MGMT_PORT",
            "OPENVPN_MGMT_TIMEOUT",
            "OPENVPN_PSW_FILE",
            "VPNACCT_SACLI",
        ] {
            cmd.env_remove(var);
        }
        cmd.arg("--config").arg(&self.config);
        cmd
    }

    fn credential_file(&self) -> String {
        fs::read_to_string(self.dir.path().join("psw-file")).unwrap_or_default()
    }
}

#[test]
fn test_help_command() {
    Command::cargo_bin("vpnacct")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("VPN account CLI"));
}

#[test]
fn test_user_add_and_list() {
    let s = Setup::new();

    s.vpnacct()
        .args(["user", "add", "alice", "--secret", "s3cret", "--expiry", "2999-01-01", "--max-connections", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("write-credential alice on community: ok"));
    assert_eq!(s.credential_file(), "alice:s3cret:2\n");

    s.vpnacct()
        .args(["-t", "user", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice:community:true:2999-01-01:2:enabled"));

    // Secrets never appear in listings
    s.vpnacct()
        .args(["--json", "user", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"username\": \"alice\"").and(predicate::str::contains("s3cret").not()));
}

#[test]
fn test_duplicate_user_fails() {
    let s = Setup::new();
    let add = ["user", "add", "bob", "--secret", "pw", "--expiry", "2999-01-01"];

    s.vpnacct().args(add).assert().success();
    s.vpnacct()
        .args(add)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::starts_with("Error: Already exists"));
}

#[test]
fn test_disable_reports_unreachable_daemon() {
    let s = Setup::new();
    s.vpnacct()
        .args(["user", "add", "carol", "--secret", "pw", "--expiry", "2999-01-01"])
        .assert()
        .success();

    // Intent is recorded even though the kill cannot be delivered
    s.vpnacct()
        .args(["-t", "user", "set", "carol", "--active", "false"])
        .assert()
        .success()
        .stdout(predicate::str::contains("remove-credential:carol:community:ok:"))
        .stdout(predicate::str::contains("disconnect:carol:community:failed:"));
    assert_eq!(s.credential_file(), "");
}

#[test]
fn test_commercial_user_add() {
    let s = Setup::new();
    s.vpnacct()
        .args(["user", "add", "dave", "--secret", "pw", "--expiry", "2999-01-01", "--backend", "commercial"])
        .assert()
        .success();

    assert_eq!(s.sacli.calls().len(), 4);
    assert_eq!(s.credential_file(), "");
}

#[test]
fn test_disconnect_rejects_invalid_username() {
    let s = Setup::new();
    s.vpnacct()
        .args(["disconnect", "bad/name"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid parameter"));
    assert!(s.sacli.calls().is_empty());
}

#[test]
fn test_sync_rebuilds_credential_file() {
    let s = Setup::new();
    s.vpnacct()
        .args(["user", "add", "erin", "--secret", "pw", "--expiry", "2999-01-01"])
        .assert()
        .success();
    fs::write(s.dir.path().join("psw-file"), "erin:pw:1\nghost:pw:1\n").unwrap();

    s.vpnacct()
        .args(["--json", "sync"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"entries\": 1"));
    assert_eq!(s.credential_file(), "erin:pw:1\n");
}

#[test]
fn test_status_from_log() {
    let s = Setup::new();
    fs::write(
        s.dir.path().join("openvpn-status.log"),
        "HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address\nCLIENT_LIST,frank,192.0.2.7:4000,10.8.0.30\nEND\n",
    )
    .unwrap();

    s.vpnacct()
        .args(["-t", "status", "--from-log"])
        .assert()
        .success()
        .stdout(predicate::str::contains("frank:community:192.0.2.7:4000:10.8.0.30"));
}
