//! Postfix and raw framing end to end.

use anyhow::Result;
use msglink::{ConnectionStatus, Packet, Profile, Registry, SendStatus, StreamMode};
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

fn postfix_profile() -> Profile {
    let mut profile = Profile::default();
    profile
        .set_mode_tcp(StreamMode::Postfix)
        .set_postfix_tcp(&[0xDE, 0xAD])
        .set_udp_enabled(false)
        .set_local_tcp(msglink::NetAddress::parse("127.0.0.1", 0).unwrap());
    profile
}

#[test]
fn postfix_mode_splits_on_sentinel() -> Result<()> {
    init_logging();
    let net = Registry::start(2, 2)?;
    net.start_server(0, 1, postfix_profile())?;
    let status = net.connect(
        1,
        net.local_tcp_addr(0)?,
        None,
        Duration::from_secs(5),
        true,
        postfix_profile(),
    )?;
    assert_eq!(status, ConnectionStatus::Connected);

    let joined = wait_until(Duration::from_secs(2), || match net.client_joined(0) {
        0 => None,
        id => Some(id),
    });

    // On the wire this is "AA \xDE\xAD BB \xDE\xAD": the sentinel ends
    // each message and never reaches the receiver's payload.
    let mut first = Packet::from_bytes(b"AA");
    let mut second = Packet::from_bytes(b"BB");
    assert_eq!(net.send_tcp(1, &mut first, 0, true, true), SendStatus::Completed);
    assert_eq!(net.send_tcp(1, &mut second, 0, true, true), SendStatus::Completed);

    let a = wait_until(Duration::from_secs(2), || net.recv_tcp(0, joined).unwrap());
    let b = wait_until(Duration::from_secs(2), || net.recv_tcp(0, joined).unwrap());
    assert_eq!(a.data(), b"AA");
    assert_eq!(b.data(), b"BB");

    net.finish_all();
    Ok(())
}

#[test]
fn raw_mode_delivers_bytes_unframed() -> Result<()> {
    init_logging();
    let mut profile = Profile::default();
    profile
        .set_mode_tcp(StreamMode::Raw)
        .set_udp_enabled(false)
        .set_local_tcp(msglink::NetAddress::parse("127.0.0.1", 0).unwrap());

    let net = Registry::start(2, 2)?;
    net.start_server(0, 1, profile.clone())?;
    let status = net.connect(
        1,
        net.local_tcp_addr(0)?,
        None,
        Duration::from_secs(5),
        true,
        profile,
    )?;
    assert_eq!(status, ConnectionStatus::Connected);

    let joined = wait_until(Duration::from_secs(2), || match net.client_joined(0) {
        0 => None,
        id => Some(id),
    });

    let mut packet = Packet::from_bytes(b"raw bytes, no framing");
    assert_eq!(net.send_tcp(1, &mut packet, 0, true, true), SendStatus::Completed);

    // Raw mode has no boundaries; the payload may arrive split across
    // several chunks, but concatenated it is byte-identical.
    let mut collected = Vec::new();
    while collected.len() < b"raw bytes, no framing".len() {
        let chunk = wait_until(Duration::from_secs(2), || net.recv_tcp(0, joined).unwrap());
        collected.extend_from_slice(chunk.data());
    }
    assert_eq!(collected, b"raw bytes, no framing");

    net.finish_all();
    Ok(())
}

#[test]
fn postfix_profile_without_sentinel_is_rejected() -> Result<()> {
    init_logging();
    let mut profile = Profile::default();
    profile.set_mode_tcp(StreamMode::Postfix);

    let net = Registry::start(1, 1)?;
    assert!(net.start_server(0, 1, profile).is_err());
    assert_eq!(net.instance_type(0), msglink::InstanceType::Inactive);
    Ok(())
}
