//! Two-phase disconnect: half-states are observable in order, and data
//! sent before the reciprocal shutdown is still delivered.

use anyhow::Result;
use msglink::{ConnectionStatus, NetAddress, Packet, Profile, Registry, SendStatus};
use std::time::{Duration, Instant};

/// Install the env-filtered test subscriber (`RUST_LOG` controls level);
/// later calls are no-ops.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server profile pinned to loopback so the advertised addresses are
/// directly connectable.
fn server_profile() -> Profile {
    let mut profile = Profile::default();
    profile.set_local_tcp(NetAddress::parse("127.0.0.1", 0).unwrap());
    profile
}

fn wait_until<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = f() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn both_fins_exchange_without_data_loss() -> Result<()> {
    init_logging();
    // Graceful disconnect is on by default on both sides.
    let net = Registry::start(2, 2)?;
    net.start_server(0, 1, server_profile())?;
    let status = net.connect(
        1,
        net.local_tcp_addr(0)?,
        Some(net.local_udp_addr(0)?),
        Duration::from_secs(5),
        true,
        Profile::default(),
    )?;
    assert_eq!(status, ConnectionStatus::Connected);

    let joined = wait_until(Duration::from_secs(2), || match net.client_joined(0) {
        0 => None,
        id => Some(id),
    });

    // The server parts with a final message before anyone shuts down.
    let mut gift = Packet::from_bytes(b"parting gift");
    assert_eq!(net.send_tcp(0, &mut gift, joined, true, true), SendStatus::Completed);

    // Client half-closes first: its send direction is gone, receiving
    // still works.
    net.shutdown_client(1, 0)?;
    assert_eq!(net.client_connected(1, 0), ConnectionStatus::NoSend);

    let mut rejected = Packet::from_bytes(b"too late");
    assert_eq!(net.send_tcp(1, &mut rejected, 0, true, true), SendStatus::Failed);

    // The server observes the client's FIN.
    wait_until(Duration::from_secs(2), || {
        (net.client_connected(0, joined) == ConnectionStatus::NoRecv).then_some(())
    });

    // Server reciprocates; both sides converge on NoSendRecv.
    net.shutdown_client(0, joined)?;
    wait_until(Duration::from_secs(2), || {
        (net.client_connected(1, 0) == ConnectionStatus::NoSendRecv).then_some(())
    });
    assert_eq!(net.client_connected(0, joined), ConnectionStatus::NoSendRecv);

    // The pre-shutdown message is still deliverable after both FINs.
    let received = wait_until(Duration::from_secs(2), || net.recv_tcp(1, 0).unwrap());
    assert_eq!(received.data(), b"parting gift");

    // The completed disconnect surfaces exactly once.
    let left = wait_until(Duration::from_secs(2), || match net.client_left(0) {
        0 => None,
        id => Some(id),
    });
    assert_eq!(left, joined);
    assert_eq!(net.client_left(0), 0);

    net.finish_all();
    Ok(())
}
