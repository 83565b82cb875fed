//! Passive view of community sessions from the daemon's status log
//!
//! The daemon periodically rewrites its status file with the same
//! `CLIENT_LIST` lines the management interface returns, so session state can
//! be read without a protocol round-trip.

use std::path::Path;
use tracing::debug;

use crate::error::VpnAcctResult;
use crate::model::LiveSession;
use crate::vpn::common;
use crate::vpn::community::parse_client_list;

/// Sessions listed in a status log body
pub fn parse(content: &str) -> Vec<LiveSession> {
    let lines: Vec<&str> = content.lines().collect();
    parse_client_list(lines.as_slice())
}

/// Read and parse the status log; a missing file means no sessions
pub async fn read(path: &Path) -> VpnAcctResult<Vec<LiveSession>> {
    match common::read_optional(path).await? {
        Some(content) => Ok(parse(&content)),
        None => {
            debug!("Status log {:?} not present", path);
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackendKind;

    const STATUS_V2: &str = "\
TITLE,OpenVPN 2.5.9 x86_64-pc-linux-gnu
TIME,2026-05-20 10:00:00,1779271200
HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address,Virtual IPv6 Address,Bytes Received,Bytes Sent
CLIENT_LIST,alice,203.0.113.5:51234,10.8.0.6,,3021,4450
CLIENT_LIST,bob,198.51.100.7:1194,10.8.0.10,,120,80
HEADER,ROUTING_TABLE,Virtual Address,Common Name,Real Address,Last Ref
ROUTING_TABLE,10.8.0.6,alice,203.0.113.5:51234,2026-05-20 09:59:58
GLOBAL_STATS,Max bcast/mcast queue length,0
END
";

    #[test]
    fn test_parse_status_log() {
        let sessions = parse(STATUS_V2);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].username, "alice");
        assert_eq!(sessions[1].real_address.as_deref(), Some("198.51.100.7:1194"));
        assert!(sessions.iter().all(|s| s.backend == BackendKind::Community));
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(&dir.path().join("openvpn-status.log")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("openvpn-status.log");
        std::fs::write(&path, STATUS_V2).unwrap();
        assert_eq!(read(&path).await.unwrap().len(), 2);
    }
}
