//! Serving through descriptor exhaustion.
//!
//! Lowers the process descriptor limit, so it lives in its own test binary.

#![cfg(target_os = "linux")]

mod common;

use std::time::Duration;

use tokio::net::TcpStream;

use common::*;

/// Lower the soft descriptor limit to `headroom` above what is open now
fn limit_open_files(headroom: u64) {
    let open = std::fs::read_dir("/proc/self/fd").unwrap().count() as u64;
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of both calls
    unsafe {
        assert_eq!(libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit), 0);
        limit.rlim_cur = (open + headroom).min(limit.rlim_max) as libc::rlim_t;
        assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &limit), 0);
    }
}

#[tokio::test]
async fn test_descriptor_exhaustion_keeps_sessions() {
    let server = start_server(test_options()).await;
    let (mut x, mut y) = paired(server.addr, "x1", "y1").await;

    limit_open_files(48);

    // Idle connections until the process runs out of descriptors
    let mut held = Vec::new();
    for _ in 0..256 {
        match TcpStream::connect(server.addr).await {
            Ok(stream) => held.push(stream),
            Err(_) => break,
        }
    }
    assert!(held.len() < 256, "descriptor limit never reached");

    // Let the accept loop run into the limit a few times
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!server.task.is_finished(), "accept loop gave up");
    assert_eq!(server.state.peer_count(), 2);
    assert_eq!(server.state.session_count(), 1);

    drop(held);

    send(&mut x, r#"{"ice":null}"#).await;
    assert_eq!(recv_text(&mut y).await, r#"{"ice":null}"#);

    // New peers are accepted again once descriptors are released
    let _z = hello(server.addr, "z1").await;
    assert_eq!(server.state.peer_count(), 3);
}
