// Trawler is a decentralized web crawling and archiving cluster.
// Copyright (C) 2024 Stract ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Peer links. Each connected socket is split into a reader task feeding the
//! node loop and a writer task draining the peer's transmit queue, so the
//! node loop itself never blocks on peer IO. A link is torn down when either
//! half errors; the node loop observes this as a single
//! [`NetEvent::Closed`].

use hashbrown::HashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::frame;
use crate::protocol::{Address, Command};

pub type PeerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Connected but not yet announced.
    Unclassified,
    Stager,
    Crawler,
}

/// What the node loop hears from the outside world.
#[derive(Debug)]
pub enum NetEvent {
    Message(PeerId, Command),
    Closed(PeerId),
    /// Outcome of an async dial started from a handler.
    Dialed(Address, std::io::Result<TcpStream>),
}

pub struct Peer {
    pub id: PeerId,
    /// The listener address the remote end declared for itself.
    pub addr: Option<Address>,
    pub role: PeerRole,
    pub confirmed: bool,
    pub pong_received: bool,
    tx: mpsc::UnboundedSender<Command>,
}

impl Peer {
    /// Queues a command on the link. A send to a peer whose writer already
    /// died is dropped silently; the matching [`NetEvent::Closed`] is either
    /// queued already or about to be.
    pub fn send(&self, command: Command) {
        tracing::debug!(peer = self.id, verb = command.verb(), "queueing message");
        let _ = self.tx.send(command);
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
    by_addr: HashMap<Address, PeerId>,
    next_id: PeerId,
}

impl PeerRegistry {
    /// Registers a freshly connected byte stream and spawns its
    /// reader/writer tasks. The peer starts out unclassified until it
    /// announces itself. The stream only has to carry bytes; handlers never
    /// see it, so a TLS wrapper can slot in here without touching them.
    pub fn register<S>(&mut self, stream: S, events: mpsc::Sender<NetEvent>) -> PeerId
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;

        let tx = spawn_link(id, stream, events);
        self.peers.insert(
            id,
            Peer {
                id,
                addr: None,
                role: PeerRole::Unclassified,
                confirmed: false,
                pong_received: true,
                tx,
            },
        );

        id
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn send(&self, id: PeerId, command: Command) {
        if let Some(peer) = self.peers.get(&id) {
            peer.send(command);
        }
    }

    /// Tags a peer with its declared listener address. Returns false if
    /// another live peer already claims the address.
    pub fn set_addr(&mut self, id: PeerId, addr: Address) -> bool {
        match self.by_addr.get(&addr) {
            Some(&existing) if existing != id => false,
            _ => {
                self.by_addr.insert(addr.clone(), id);
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.addr = Some(addr);
                }
                true
            }
        }
    }

    pub fn id_by_addr(&self, addr: &Address) -> Option<PeerId> {
        self.by_addr.get(addr).copied()
    }

    pub fn addr_of(&self, id: PeerId) -> Option<Address> {
        self.peers.get(&id).and_then(|p| p.addr.clone())
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        let peer = self.peers.remove(&id)?;
        if let Some(addr) = &peer.addr {
            if self.by_addr.get(addr) == Some(&id) {
                self.by_addr.remove(addr);
            }
        }
        Some(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn with_role(&self, role: PeerRole) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.role == role)
            .map(|p| p.id)
            .collect()
    }

    pub fn addrs_with_role(&self, role: PeerRole) -> Vec<Address> {
        self.peers
            .values()
            .filter(|p| p.role == role)
            .filter_map(|p| p.addr.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Starts the connect attempt for `addr` in the background; the node loop
/// receives the outcome as [`NetEvent::Dialed`] and finishes registration
/// there. Handlers stay non-blocking this way.
pub fn dial(addr: Address, events: mpsc::Sender<NetEvent>) {
    tokio::spawn(async move {
        tracing::debug!(%addr, "dialing");
        let res = TcpStream::connect((addr.host.clone(), addr.port)).await;
        if let Ok(stream) = &res {
            let _ = stream.set_nodelay(true);
        }
        let _ = events.send(NetEvent::Dialed(addr, res)).await;
    });
}

/// Like [`dial`], but keeps retrying with back-off. Used for bootstrap peers
/// that may simply not be up yet.
pub fn dial_with_retry(
    addr: Address,
    events: mpsc::Sender<NetEvent>,
    retry: impl Iterator<Item = std::time::Duration> + Send + 'static,
) {
    tokio::spawn(async move {
        let mut last_err = std::io::Error::new(std::io::ErrorKind::Other, "no dial attempts");

        for delay in retry {
            match TcpStream::connect((addr.host.clone(), addr.port)).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let _ = events.send(NetEvent::Dialed(addr, Ok(stream))).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(%addr, "bootstrap dial failed, retrying: {e}");
                    last_err = e;
                }
            }

            tokio::time::sleep(delay).await;
        }

        let _ = events.send(NetEvent::Dialed(addr, Err(last_err))).await;
    });
}

fn spawn_link<S>(id: PeerId, stream: S, events: mpsc::Sender<NetEvent>) -> mpsc::UnboundedSender<Command>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

    let reader_events = events.clone();
    tokio::spawn(async move {
        loop {
            match frame::read(&mut read_half).await {
                Ok(command) => {
                    if reader_events
                        .send(NetEvent::Message(id, command))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = id, "link closed: {e}");
                    let _ = reader_events.send(NetEvent::Closed(id)).await;
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            if let Err(e) = frame::write(&mut write_half, &command).await {
                tracing::debug!(peer = id, "write failed: {e}");
                let _ = events.send(NetEvent::Closed(id)).await;
                break;
            }
        }
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair(events: mpsc::Sender<NetEvent>) -> (PeerRegistry, PeerId, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let mut registry = PeerRegistry::default();
        let id = registry.register(accepted, events);
        (registry, id, dialed)
    }

    #[tokio::test]
    async fn messages_flow_through_the_link() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (registry, id, mut remote) = pair(events_tx).await;

        frame::write(&mut remote, &Command::Ping).await.unwrap();
        match events_rx.recv().await.unwrap() {
            NetEvent::Message(got_id, Command::Ping) => assert_eq!(got_id, id),
            other => panic!("unexpected event {other:?}"),
        }

        registry.send(id, Command::Pong);
        assert_eq!(frame::read(&mut remote).await.unwrap(), Command::Pong);
    }

    #[tokio::test]
    async fn dropped_link_raises_closed() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_registry, id, remote) = pair(events_tx).await;

        drop(remote);

        match events_rx.recv().await.unwrap() {
            NetEvent::Closed(got_id) => assert_eq!(got_id, id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn registry_tracks_declared_addresses() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (mut registry, id, _remote) = pair(events_tx).await;

        let addr = Address::new("192.0.2.1", 3100);
        assert!(registry.set_addr(id, addr.clone()));
        assert_eq!(registry.id_by_addr(&addr), Some(id));
        assert_eq!(registry.addr_of(id), Some(addr.clone()));

        registry.remove(id);
        assert_eq!(registry.id_by_addr(&addr), None);
    }
}
