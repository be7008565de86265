//! Per-role wiring of channels to the peers of a party.

use std::{collections::BTreeMap, fmt, time::Duration};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{Level, debug, info, instrument, warn};

use crate::{
    channel::{self, Channel, ChannelOptions, read_frame, write_frame},
    config::{self, SessionConfig},
    crypto::Scheme,
    error::{Error, transport},
};

/// The role a party plays in one of the protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Holds the labels and a feature shard (linear models).
    Active,
    /// Holds only a feature shard (linear models).
    Passive,
    /// Owns the decryption key and decrypts masked values on request (linear models).
    Arbiter,
    /// Holds the labels and the decryption key (trees).
    Host,
    /// Holds only a feature shard (trees), numbered from 0.
    Guest(usize),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Active => f.write_str("active"),
            Role::Passive => f.write_str("passive"),
            Role::Arbiter => f.write_str("arbiter"),
            Role::Host => f.write_str("host"),
            Role::Guest(i) => write!(f, "guest-{i}"),
        }
    }
}

/// The first frame on every TCP connection, sent by the dialing party.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    version: u32,
    role: Role,
}

const PROTOCOL_VERSION: u32 = 1;

/// A public key together with the fingerprint the sender computed for it.
#[derive(Debug, Serialize, Deserialize)]
struct KeyAnnouncement<K> {
    key: K,
    fingerprint: String,
}

/// An acknowledgement that is still in flight, see [`Session::send_nowait`].
pub type PendingAck = JoinHandle<Result<(), channel::Error>>;

/// Waits until a value sent with [`Session::send_nowait`] was acknowledged.
pub async fn acknowledged(pending: PendingAck) -> Result<(), Error> {
    pending
        .await
        .map_err(|e| transport("awaiting an acknowledgement", e))??;
    Ok(())
}

/// The channels of one party to all of its peers.
#[derive(Debug)]
pub struct Session {
    role: Role,
    recv_timeout: Duration,
    channels: BTreeMap<Role, Channel>,
}

impl Session {
    /// Connects to all peers over TCP.
    ///
    /// For every pair of parties the one with the smaller [`Role`] dials and the other accepts, so
    /// that both sides agree on who connects without further coordination.
    #[instrument(level = Level::DEBUG, skip_all, fields(role = %config.role), err)]
    pub async fn connect(config: &SessionConfig) -> Result<Self, Error> {
        config.validate()?;
        let (dial, accept): (Vec<_>, Vec<_>) =
            config.peers.iter().partition(|p| config.role < p.role);
        let listener = match (accept.is_empty(), config.listen) {
            (true, _) => None,
            (false, Some(addr)) => Some(
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| transport(format!("binding {addr}"), e))?,
            ),
            (false, None) => return Err(config::Error::MissingListenAddress(config.role).into()),
        };
        let expected: Vec<Role> = accept.iter().map(|p| p.role).collect();
        let accepting = async {
            let mut accepted = vec![];
            let Some(listener) = &listener else {
                return Ok(accepted);
            };
            while accepted.len() < expected.len() {
                let (mut stream, addr) = listener
                    .accept()
                    .await
                    .map_err(|e| transport("accepting a peer", e))?;
                let hello: Hello = read_frame(&mut stream)
                    .await
                    .map_err(|e| transport(format!("reading hello from {addr}"), e))?;
                if hello.version != PROTOCOL_VERSION {
                    return Err(Error::ProtocolViolation(format!(
                        "{addr} speaks protocol version {}, expected {PROTOCOL_VERSION}",
                        hello.version
                    )));
                }
                if !expected.contains(&hello.role)
                    || accepted.iter().any(|(role, _)| *role == hello.role)
                {
                    warn!("Rejecting unexpected connection from {} at {addr}", hello.role);
                    continue;
                }
                debug!("Accepted {} from {addr}", hello.role);
                accepted.push((hello.role, stream));
            }
            Ok::<_, Error>(accepted)
        };
        let dialing = try_join_all(dial.iter().map(|peer| async move {
            let mut stream = dial_with_retry(peer.address, config.connect_timeout).await?;
            let hello = Hello {
                version: PROTOCOL_VERSION,
                role: config.role,
            };
            write_frame(&mut stream, &hello)
                .await
                .map_err(|e| transport(format!("greeting {}", peer.role), e))?;
            debug!("Connected to {} at {}", peer.role, peer.address);
            Ok::<_, Error>((peer.role, stream))
        }));
        let (accepted, dialed) = tokio::try_join!(accepting, dialing)?;
        let channels = accepted
            .into_iter()
            .chain(dialed)
            .map(|(role, stream)| {
                let channel = Channel::from_tcp(stream, role.to_string(), config.channel.clone());
                (role, channel)
            })
            .collect();
        info!("{} connected to {} peers", config.role, config.peers.len());
        Ok(Self {
            role: config.role,
            recv_timeout: config.recv_timeout,
            channels,
        })
    }

    /// Creates fully connected in-memory sessions for the given roles (in the same order).
    ///
    /// Must be called from within a tokio runtime.
    pub fn local(roles: &[Role], options: ChannelOptions, recv_timeout: Duration) -> Vec<Session> {
        let mut sessions: Vec<Session> = roles
            .iter()
            .map(|&role| Session {
                role,
                recv_timeout,
                channels: BTreeMap::new(),
            })
            .collect();
        for a in 0..roles.len() {
            for b in (a + 1)..roles.len() {
                let (to_b, to_a) =
                    Channel::pair(roles[a].to_string(), roles[b].to_string(), options.clone());
                sessions[a].channels.insert(roles[b], to_b);
                sessions[b].channels.insert(roles[a], to_a);
            }
        }
        sessions
    }

    /// The role of the local party.
    pub fn role(&self) -> Role {
        self.role
    }

    /// All peers this party has a channel to.
    pub fn peers(&self) -> impl Iterator<Item = Role> + '_ {
        self.channels.keys().copied()
    }

    /// The channel to the given peer.
    pub fn channel(&self, peer: Role) -> Result<&Channel, Error> {
        self.channels.get(&peer).ok_or(Error::UnknownPeer(peer))
    }

    /// Sends a value to a peer and waits for the acknowledgement.
    pub async fn send(&self, to: Role, tag: &str, value: &impl Serialize) -> Result<(), Error> {
        Ok(self.channel(to)?.send(tag, value).await?)
    }

    /// Sends a value to a peer without waiting for the acknowledgement.
    pub fn send_nowait(
        &self,
        to: Role,
        tag: &str,
        value: &impl Serialize,
    ) -> Result<PendingAck, Error> {
        Ok(self.channel(to)?.send_nowait(tag, value)?)
    }

    /// Sends the same value to several peers concurrently.
    pub async fn broadcast(
        &self,
        to: &[Role],
        tag: &str,
        value: &(impl Serialize + Sync),
    ) -> Result<(), Error> {
        try_join_all(to.iter().map(|&peer| self.send(peer, tag, value))).await?;
        Ok(())
    }

    /// Receives a value from a peer, waiting at most the configured `recv_timeout`.
    pub async fn recv<T: DeserializeOwned>(&self, from: Role, tag: &str) -> Result<T, Error> {
        Ok(self.channel(from)?.recv(tag, self.recv_timeout).await?)
    }

    /// Receives a Vec of the given length from a peer.
    pub async fn recv_vec<T: DeserializeOwned>(
        &self,
        from: Role,
        tag: &str,
        len: usize,
    ) -> Result<Vec<T>, Error> {
        Ok(self
            .channel(from)?
            .recv_vec(tag, len, self.recv_timeout)
            .await?)
    }

    /// Sends a public key and its fingerprint to the given peers.
    pub async fn send_public_key<S: Scheme>(
        &self,
        to: &[Role],
        key: &S::PublicKey,
    ) -> Result<(), Error> {
        let fingerprint = S::fingerprint(key)?;
        info!(
            "{} distributes {} key {fingerprint} ({:?})",
            self.role,
            S::NAME,
            S::PROFILE
        );
        let announcement = KeyAnnouncement { key, fingerprint };
        self.broadcast(to, "public_key", &announcement).await
    }

    /// Receives a public key and checks its fingerprint.
    pub async fn recv_public_key<S: Scheme>(&self, from: Role) -> Result<S::PublicKey, Error> {
        let announcement: KeyAnnouncement<S::PublicKey> = self.recv(from, "public_key").await?;
        let fingerprint = S::fingerprint(&announcement.key)?;
        if fingerprint != announcement.fingerprint {
            return Err(Error::ProtocolViolation(format!(
                "public key from {from} has fingerprint {fingerprint}, announced as {}",
                announcement.fingerprint
            )));
        }
        debug!("{} received {} key {fingerprint} from {from}", self.role, S::NAME);
        Ok(announcement.key)
    }

    /// Closes all channels, returning the unconsumed tags per peer.
    pub async fn close(self) -> BTreeMap<Role, Vec<String>> {
        let mut unconsumed = BTreeMap::new();
        for (peer, channel) in self.channels {
            let tags = channel.close().await;
            if !tags.is_empty() {
                unconsumed.insert(peer, tags);
            }
        }
        unconsumed
    }
}

async fn dial_with_retry(
    addr: std::net::SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, Error> {
    let deadline = Instant::now() + connect_timeout;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                debug!("Could not reach {addr} yet: {e}");
                sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(transport(format!("connecting to {addr}"), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_ordered_for_dialing() {
        assert!(Role::Active < Role::Passive);
        assert!(Role::Passive < Role::Arbiter);
        assert!(Role::Host < Role::Guest(0));
        assert!(Role::Guest(0) < Role::Guest(1));
        assert_eq!(Role::Guest(3).to_string(), "guest-3");
    }

    #[tokio::test]
    async fn local_sessions_are_fully_connected() -> Result<(), Error> {
        let roles = [Role::Host, Role::Guest(0), Role::Guest(1)];
        let sessions = Session::local(&roles, ChannelOptions::default(), Duration::from_secs(1));
        let [host, g0, g1]: [Session; 3] = sessions
            .try_into()
            .map_err(|_| Error::ProtocolViolation("expected 3 sessions".into()))?;
        host.broadcast(&[Role::Guest(0), Role::Guest(1)], "hi", &7u8)
            .await?;
        assert_eq!(g0.recv::<u8>(Role::Host, "hi").await?, 7);
        assert_eq!(g1.recv::<u8>(Role::Host, "hi").await?, 7);
        assert!(matches!(
            g0.channel(Role::Arbiter),
            Err(Error::UnknownPeer(Role::Arbiter))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn public_keys_are_fingerprinted() -> Result<(), Error> {
        use crate::crypto::plain::Plain;

        let roles = [Role::Active, Role::Arbiter];
        let sessions = Session::local(&roles, ChannelOptions::default(), Duration::from_secs(1));
        let [active, arbiter]: [Session; 2] = sessions
            .try_into()
            .map_err(|_| Error::ProtocolViolation("expected 2 sessions".into()))?;
        let pending = arbiter.send_nowait(
            Role::Active,
            "public_key",
            &KeyAnnouncement {
                key: (),
                fingerprint: "forged".to_string(),
            },
        )?;
        let forged = active.recv_public_key::<Plain>(Role::Arbiter).await;
        assert!(matches!(forged, Err(Error::ProtocolViolation(_))));
        acknowledged(pending).await?;
        arbiter.send_public_key::<Plain>(&[Role::Active], &()).await?;
        active.recv_public_key::<Plain>(Role::Arbiter).await?;
        Ok(())
    }
}
