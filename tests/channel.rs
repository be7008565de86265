use std::{
    io,
    net::{Ipv4Addr, SocketAddr, TcpListener},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::Level;

use vfl_mpc::{
    channel::{self, Channel, ChannelOptions},
    config::{PeerConfig, SessionConfig},
    error::Error,
    session::{Role, Session},
};

mod common;

use common::init_tracing;

#[tokio::test]
async fn missing_values_time_out() -> Result<(), channel::Error> {
    init_tracing();
    let (_a, b) = Channel::pair("a", "b", ChannelOptions::default());
    let start = Instant::now();
    let result = b.recv::<u32>("never sent", Duration::from_secs(1)).await;
    let elapsed = start.elapsed();
    assert!(matches!(result, Err(channel::Error::Timeout { .. })));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1200), "timed out after {elapsed:?}");
    Ok(())
}

/// Collects formatted log lines in memory.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

// the current-thread runtime polls the receive loop on this thread, so its events reach the
// thread-local subscriber
#[tokio::test]
async fn overwritten_tags_keep_the_latest_value_and_warn() -> Result<(), channel::Error> {
    let logs = Captured::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::WARN)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let (a, b) = Channel::pair("a", "b", ChannelOptions::default());
    a.send("round", &1u32).await?;
    a.send("round", &2u32).await?;
    let v: u32 = b.recv("round", Duration::from_secs(1)).await?;
    assert_eq!(v, 2);
    assert_eq!(b.overwritten_count(), 1);
    let text = logs.text();
    assert!(text.contains("WARN"), "{text}");
    assert!(text.contains("`round` from a overwrote an unconsumed value"), "{text}");
    Ok(())
}

#[tokio::test]
async fn sent_envelopes_are_recorded_on_request() -> Result<(), channel::Error> {
    init_tracing();
    let options = ChannelOptions {
        record_traffic: true,
        ..Default::default()
    };
    let (a, b) = Channel::pair("a", "b", options);
    a.send("x", &7u8).await?;
    let _: u8 = b.recv("x", Duration::from_secs(1)).await?;
    let log = a.sent_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].tag, "x");
    assert!(b.sent_log().is_empty());
    Ok(())
}

fn free_ports<const N: usize>() -> std::io::Result<[SocketAddr; N]> {
    // all listeners stay bound until every port is picked, so the ports are distinct
    let listeners = (0..N)
        .map(|_| TcpListener::bind((Ipv4Addr::LOCALHOST, 0)))
        .collect::<Result<Vec<_>, _>>()?;
    let mut addrs = [SocketAddr::from((Ipv4Addr::LOCALHOST, 0)); N];
    for (addr, listener) in addrs.iter_mut().zip(&listeners) {
        *addr = listener.local_addr()?;
    }
    Ok(addrs)
}

#[tokio::test]
async fn sessions_connect_over_tcp() -> Result<(), Error> {
    init_tracing();
    let addrs: [SocketAddr; 3] = free_ports()?;
    let roles = [Role::Active, Role::Passive, Role::Arbiter];
    let configs: Vec<SessionConfig> = roles
        .iter()
        .zip(addrs)
        .map(|(&role, listen)| SessionConfig {
            role,
            listen: Some(listen),
            peers: roles
                .iter()
                .zip(addrs)
                .filter(|&(&peer, _)| peer != role)
                .map(|(&role, address)| PeerConfig { role, address })
                .collect(),
            recv_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            channel: ChannelOptions::default(),
        })
        .collect();
    let (active, passive, arbiter) = tokio::try_join!(
        Session::connect(&configs[0]),
        Session::connect(&configs[1]),
        Session::connect(&configs[2]),
    )?;
    arbiter
        .broadcast(&[Role::Active, Role::Passive], "hello", &"from the arbiter")
        .await?;
    passive.send(Role::Active, "partial", &vec![1.5f64, -2.0]).await?;
    let greeting: String = active.recv(Role::Arbiter, "hello").await?;
    let partial: Vec<f64> = active.recv_vec(Role::Passive, "partial", 2).await?;
    let _: String = passive.recv(Role::Arbiter, "hello").await?;
    assert_eq!(greeting, "from the arbiter");
    assert_eq!(partial, vec![1.5, -2.0]);
    for session in [active, passive, arbiter] {
        assert!(session.close().await.is_empty());
    }
    Ok(())
}
