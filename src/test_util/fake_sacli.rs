//! Shell-script stand-in for the Access Server control utility

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Writes an executable `sacli` into a caller-provided directory.
///
/// The script appends its arguments (one invocation per line) to `calls.log`,
/// prints `status.json` for `VPNStatus`, and exits 1 with a diagnostic on
/// stderr when a `fail_<Subcommand>` marker file exists.
pub struct FakeSacli {
    dir: PathBuf,
}

impl FakeSacli {
    pub fn install(dir: &Path) -> Self {
        let script = format!(
            r#"#!/bin/sh
DIR='{dir}'
echo "$*" >> "$DIR/calls.log"
for last in "$@"; do :; done
if [ -f "$DIR/fail_$last" ]; then
    echo "simulated failure: $last" >&2
    exit 1
fi
case "$last" in
    VPNStatus) cat "$DIR/status.json" ;;
    *) echo '{{}}' ;;
esac
"#,
            dir = dir.display()
        );

        let path = dir.join("sacli");
        std::fs::write(&path, script).expect("write fake sacli");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod fake sacli");
        std::fs::write(dir.join("status.json"), r#"{"openvpn_0": {"client_list": []}}"#).expect("write status");

        Self { dir: dir.to_path_buf() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join("sacli")
    }

    /// Replace the `VPNStatus` output
    pub fn set_status(&self, json: &str) {
        std::fs::write(self.dir.join("status.json"), json).expect("write status");
    }

    /// Make every invocation of `subcommand` fail
    pub fn fail(&self, subcommand: &str) {
        std::fs::write(self.dir.join(format!("fail_{}", subcommand)), "").expect("write fail marker");
    }

    /// Recorded invocations, arguments joined by spaces
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
