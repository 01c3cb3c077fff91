//! Large-message reassembly: the OS delivers a 1 MiB stream message in
//! many chunks; the receiver produces exactly one packet and its partial
//! progress never goes backwards mid-message.

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

const PAYLOAD_LEN: usize = 1 << 20;

/// Server profile pinned to loopback so the advertised addresses are
/// directly connectable.
fn server_profile() -> Profile {
    let mut profile = Profile::default();
    profile.set_local_tcp(NetAddress::parse("127.0.0.1", 0).unwrap());
    profile
}

#[test]
fn fragmented_reassembly_with_monotone_progress() -> Result<()> {
    init_logging();
    let net = Registry::start(2, 2)?;

    let mut server_profile = server_profile();
    // The 1 MiB message exceeds the 8 KiB initial limit; the limit must
    // grow instead of killing the connection.
    server_profile.set_auto_grow_tcp(true);
    net.start_server(0, 1, server_profile)?;

    let mut client_profile = Profile::default();
    client_profile.set_send_cap_tcp(4 << 20);
    let status = net.connect(
        1,
        net.local_tcp_addr(0)?,
        Some(net.local_udp_addr(0)?),
        Duration::from_secs(5),
        true,
        client_profile,
    )?;
    assert_eq!(status, ConnectionStatus::Connected);

    let joined = {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match net.client_joined(0) {
                0 => assert!(Instant::now() < deadline, "client never joined"),
                id => break id,
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    };

    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect();
    let mut packet = Packet::new();
    packet.add_str(&payload, false)?;
    assert_eq!(net.send_tcp(1, &mut packet, 0, true, true), SendStatus::Completed);

    // Sample reassembly progress until the message lands. A sample of 0
    // after nonzero ones means the message just completed.
    let mut samples = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    let received = loop {
        if let Some(packet) = net.recv_tcp(0, joined)? {
            break packet;
        }
        samples.push(net.percent_tcp(0, joined));
        assert!(Instant::now() < deadline, "reassembly never completed");
        std::thread::sleep(Duration::from_millis(1));
    };

    assert_eq!(received.used_size(), PAYLOAD_LEN);
    assert_eq!(received.data(), &payload[..]);
    for pair in samples.windows(2) {
        assert!(
            pair[1] >= pair[0] || pair[1] == 0.0,
            "progress went backwards mid-message: {} -> {}",
            pair[0],
            pair[1]
        );
    }
    assert!(samples.iter().all(|p| (0.0..=100.0).contains(p)));

    // The limit grew to fit the announced message size.
    assert!(net.recv_limit_tcp(0, joined) >= PAYLOAD_LEN);

    net.finish_all();
    Ok(())
}

#[test]
fn oversize_message_kills_connection_without_auto_grow() -> Result<()> {
    init_logging();
    let net = Registry::start(2, 2)?;
    // Default limits: 8 KiB reassembly cap, auto-grow off.
    net.start_server(0, 1, server_profile())?;

    let mut client_profile = Profile::default();
    client_profile.set_send_cap_tcp(4 << 20);
    net.connect(
        1,
        net.local_tcp_addr(0)?,
        Some(net.local_udp_addr(0)?),
        Duration::from_secs(5),
        true,
        client_profile,
    )?;

    let joined = {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match net.client_joined(0) {
                0 => assert!(Instant::now() < deadline, "client never joined"),
                id => break id,
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    };

    let mut packet = Packet::new();
    packet.add_str(&vec![0u8; 64 << 10], false)?;
    net.send_tcp(1, &mut packet, 0, true, true);

    // The server terminates the connection on the oversize announcement.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if net.client_connected(0, joined) == ConnectionStatus::NotConnected {
            break;
        }
        assert!(Instant::now() < deadline, "connection survived buffer overflow");
        std::thread::sleep(Duration::from_millis(5));
    }

    net.finish_all();
    Ok(())
}
