// SPDX-License-Identifier: Apache-2.0

use super::*;

fn sample() -> Endpoints {
    Endpoints {
        inproc: "inproc://veld-m".to_string(),
        ipc: "ipc:///tmp/veld-m.ipc".to_string(),
        tcp: "tcp://0.0.0.0:5555".to_string(),
    }
}

#[test]
fn same_process_prefers_inproc() {
    assert_eq!(sample().select_for(true, true), "inproc://veld-m");
}

#[test]
fn same_host_prefers_ipc_over_tcp() {
    assert_eq!(sample().select_for(false, true), "ipc:///tmp/veld-m.ipc");
}

#[test]
fn cross_host_falls_back_to_tcp() {
    assert_eq!(sample().select_for(false, false), "tcp://0.0.0.0:5555");
}

#[test]
fn default_tcp_port_range_matches_original_rndtcp_bounds() {
    assert_eq!(*DEFAULT_TCP_PORT_RANGE.start(), 1024);
    assert_eq!(*DEFAULT_TCP_PORT_RANGE.end(), 65535);
}

#[tokio::test]
async fn bind_removes_a_stale_ipc_socket_file_first() {
    let dir = std::env::temp_dir();
    let stale_path = dir.join("veld-stale-bind-test.ipc");
    std::fs::write(&stale_path, b"not a real socket").unwrap();

    let mut socket = RouterSocket::new();
    bind(&mut socket, "stale-bind-test", &dir, 41000..=41100).await.unwrap();

    // The stale placeholder content is gone either way: either the file was
    // unlinked and never recreated in this form, or it now holds a real
    // socket rather than the marker bytes written above.
    let contents = std::fs::read(&stale_path).unwrap_or_default();
    assert_ne!(contents, b"not a real socket");
}
