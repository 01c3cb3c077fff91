//! Stream round-trip over the admission handshake: a client connects,
//! sends a small prefix-framed payload, the server echoes it back.

use anyhow::Result;
use msglink::{ConnectionStatus, NetAddress, NetError, Packet, Profile, Registry, SendStatus};
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
fn prefix_size_echo_round_trip() -> Result<()> {
    init_logging();
    let net = Registry::start(2, 2)?;
    net.start_server(0, 4, server_profile())?;
    let tcp = net.local_tcp_addr(0)?;
    let udp = net.local_udp_addr(0)?;

    let status = net.connect(1, tcp, Some(udp), Duration::from_secs(5), true, Profile::default())?;
    assert_eq!(status, ConnectionStatus::Connected);

    let joined = wait_until(Duration::from_secs(2), || match net.client_joined(0) {
        0 => None,
        id => Some(id),
    });
    assert_eq!(joined, 1, "first admitted client gets the lowest id");
    assert_eq!(net.client_id(1), 1);
    assert_eq!(net.max_clients(1), 4, "handshake reports the server's table size");

    let mut packet = Packet::new();
    packet.add_str(b"hello!!", false)?;
    assert_eq!(net.send_tcp(1, &mut packet, 0, false, true), SendStatus::Completed);
    assert_eq!(packet.used_size(), 0, "keep = false clears the packet");

    let received = wait_until(Duration::from_secs(2), || net.recv_tcp(0, joined).unwrap());
    assert_eq!(received.used_size(), 7);
    assert_eq!(received.data(), b"hello!!");
    assert_eq!(received.client_from(), 1, "tagged with the handshake-assigned id");
    assert!(received.age().is_some());

    // Echo it back; the client sees the server as peer 0.
    let mut echo = Packet::from_bytes(received.data());
    assert_eq!(net.send_tcp(0, &mut echo, joined, true, true), SendStatus::Completed);
    assert_eq!(echo.data(), b"hello!!", "keep = true leaves the packet intact");

    let back = wait_until(Duration::from_secs(2), || net.recv_tcp(1, 0).unwrap());
    assert_eq!(back.data(), b"hello!!");
    assert_eq!(back.client_from(), 0);

    net.finish_all();
    Ok(())
}

#[test]
fn send_cap_failure_is_reported_and_nonfatal() -> Result<()> {
    init_logging();
    let net = Registry::start(2, 2)?;
    net.start_server(0, 1, server_profile())?;

    let mut client_profile = Profile::default();
    client_profile.set_send_cap_tcp(8);
    let status = net.connect(
        1,
        net.local_tcp_addr(0)?,
        Some(net.local_udp_addr(0)?),
        Duration::from_secs(5),
        true,
        client_profile,
    )?;
    assert_eq!(status, ConnectionStatus::Connected);

    let mut packet = Packet::new();
    packet.add_str(&[0u8; 100], false)?;
    assert_eq!(net.send_tcp(1, &mut packet, 0, true, true), SendStatus::Failed);
    match msglink::take_last_error() {
        Some(NetError::SendCapExceeded { requested, cap: 8, .. }) => {
            assert_eq!(requested, 104, "length prefix counts against the cap");
        }
        other => panic!("expected SendCapExceeded, got {other:?}"),
    }

    // The failure never kills the connection.
    assert_eq!(net.client_connected(1, 0), ConnectionStatus::Connected);

    net.finish_all();
    Ok(())
}

#[test]
fn wrong_instance_type_is_poll_visible() -> Result<()> {
    init_logging();
    let net = Registry::start(1, 1)?;
    net.start_server(0, 1, server_profile())?;

    // Server slots answer 0 to client-only polls and record the detail.
    assert_eq!(net.client_id(0), 0);
    assert_eq!(net.poll_connect(0), ConnectionStatus::NotConnected);
    assert!(matches!(
        msglink::take_last_error(),
        Some(NetError::WrongInstanceType { .. })
    ));

    net.finish(0)?;
    assert_eq!(net.instance_type(0), msglink::InstanceType::Inactive);
    Ok(())
}
