//! Datagram demultiplexing: per-client routing with source-address
//! verification, per-operation queues, and catch-all delivery.

use anyhow::Result;
use msglink::{ConnectionStatus, DatagramMode, NetError, Packet, Profile, Registry, SendStatus};
use std::time::{Duration, Instant};

/// Install the env-filtered test subscriber (`RUST_LOG` controls level);
/// later calls are no-ops.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
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

fn per_client_profile() -> Profile {
    let mut profile = Profile::default();
    profile
        .set_mode_udp(DatagramMode::PerClient)
        .set_local_tcp(msglink::NetAddress::parse("127.0.0.1", 0).unwrap());
    profile
}

#[test]
fn spoofed_client_id_is_dropped() -> Result<()> {
    init_logging();
    let net = Registry::start(2, 2)?;
    net.start_server(0, 2, per_client_profile())?;
    let tcp = net.local_tcp_addr(0)?;
    let udp = net.local_udp_addr(0)?;

    let status = net.connect(1, tcp, Some(udp), Duration::from_secs(5), true, per_client_profile())?;
    assert_eq!(status, ConnectionStatus::Connected);
    let id = net.client_id(1);
    assert_eq!(id, 1);

    // The genuine client's datagram arrives under its id.
    let mut packet = Packet::from_bytes(b"legit");
    assert_eq!(net.send_udp(1, &mut packet, 0, 0, true, true), SendStatus::Completed);
    let received = wait_until(Duration::from_secs(2), || {
        net.recv_udp(0, id as usize, 0).unwrap()
    });
    assert_eq!(received.data(), b"legit");
    assert_eq!(received.client_from(), id as usize);
    assert_eq!(received.operation_from(), 0);

    // An attacker on a different source address claims the same id.
    let attacker = std::net::UdpSocket::bind("127.0.0.1:0")?;
    let mut spoof = Vec::new();
    spoof.extend_from_slice(&id.to_le_bytes());
    spoof.extend_from_slice(b"spoof");
    attacker.send_to(&spoof, std::net::SocketAddr::from(udp))?;

    // The spoofed datagram never surfaces.
    std::thread::sleep(Duration::from_millis(200));
    assert!(net.recv_udp(0, id as usize, 0)?.is_none());

    net.finish_all();
    Ok(())
}

#[test]
fn per_operation_queues_are_independent() -> Result<()> {
    init_logging();
    let mut profile = Profile::default();
    profile
        .set_mode_udp(DatagramMode::PerClientPerOperation)
        .set_num_operations(3)
        .set_local_tcp(msglink::NetAddress::parse("127.0.0.1", 0).unwrap());

    let net = Registry::start(2, 2)?;
    net.start_server(0, 1, profile.clone())?;
    let status = net.connect(
        1,
        net.local_tcp_addr(0)?,
        Some(net.local_udp_addr(0)?),
        Duration::from_secs(5),
        true,
        profile,
    )?;
    assert_eq!(status, ConnectionStatus::Connected);
    assert_eq!(net.num_operations(1), 3, "handshake reports the operation count");

    let mut packet = Packet::from_bytes(b"op two");
    assert_eq!(net.send_udp(1, &mut packet, 0, 2, true, true), SendStatus::Completed);

    let received = wait_until(Duration::from_secs(2), || net.recv_udp(0, 1, 2).unwrap());
    assert_eq!(received.data(), b"op two");
    assert_eq!(received.operation_from(), 2);
    assert!(net.recv_udp(0, 1, 0)?.is_none(), "other operations stay empty");

    // Operation ids outside the negotiated range are rejected at send.
    let mut bad = Packet::from_bytes(b"nope");
    assert_eq!(net.send_udp(1, &mut bad, 0, 7, true, true), SendStatus::Failed);
    assert!(matches!(
        msglink::take_last_error(),
        Some(NetError::InvalidOperation { id: 7, .. })
    ));

    net.finish_all();
    Ok(())
}

#[test]
fn server_replies_over_the_probed_address() -> Result<()> {
    init_logging();
    let net = Registry::start(2, 2)?;
    net.start_server(0, 1, per_client_profile())?;
    let status = net.connect(
        1,
        net.local_tcp_addr(0)?,
        Some(net.local_udp_addr(0)?),
        Duration::from_secs(5),
        true,
        per_client_profile(),
    )?;
    assert_eq!(status, ConnectionStatus::Connected);
    let id = net.client_id(1);

    // The handshake probe bound the client's UDP source address.
    assert!(!net.client_udp_addr(0, id)?.is_unset());

    let mut packet = Packet::from_bytes(b"state update");
    assert_eq!(net.send_udp(0, &mut packet, id, 0, true, true), SendStatus::Completed);

    let received = wait_until(Duration::from_secs(2), || {
        net.recv_udp(1, id as usize, 0).unwrap()
    });
    assert_eq!(received.data(), b"state update");
    assert_eq!(received.client_from(), id as usize);

    net.finish_all();
    Ok(())
}

#[test]
fn broadcast_catch_all_round_trip() -> Result<()> {
    init_logging();
    // Grab a free port for the receiver to sit on.
    let port = {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0")?;
        probe.local_addr()?.port()
    };
    let target = msglink::NetAddress::parse("127.0.0.1", port)?;

    let net = Registry::start(2, 2)?;
    net.start_broadcast(0, target, false, true, Profile::default())?;
    net.start_broadcast(1, target, true, false, Profile::default())?;

    let mut packet = Packet::from_bytes(b"anyone listening?");
    assert_eq!(net.send_udp(1, &mut packet, 0, 0, true, true), SendStatus::Completed);

    let received = wait_until(Duration::from_secs(2), || net.recv_udp(0, 0, 0).unwrap());
    assert_eq!(received.data(), b"anyone listening?");
    assert_eq!(received.client_from(), 0, "broadcast receives carry no client tag");

    // Receive-only instances refuse sends.
    let mut refused = Packet::from_bytes(b"x");
    assert_eq!(net.send_udp(0, &mut refused, 0, 0, true, true), SendStatus::Failed);
    assert!(matches!(
        msglink::take_last_error(),
        Some(NetError::Shutdown)
    ));

    net.finish_all();
    Ok(())
}
