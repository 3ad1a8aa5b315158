//! The UDP rendezvous point: transport listener, tick loop, and local API.
//!
//! The broker owns exactly one inbound socket. All remote peers are
//! demultiplexed by their source address, and replies go back out through
//! the same socket with per-destination sends; per-peer listening sockets
//! are deliberately never created. Each [`Broker::tick`] drains every
//! queued datagram, then sweeps the peer table, in that order, so a peer
//! can never expire in the tick in which it just sent.
//!
//! Simulation collaborators in the same process use the local API
//! ([`subscribe`](Broker::subscribe), [`read`](Broker::read),
//! [`publish`](Broker::publish), [`clear`](Broker::clear)) between ticks;
//! nothing else runs concurrently with the tick, so no locking is needed.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::peers::PeerTable;
use crate::protocol::{self, Packet, Value};
use crate::store::{FanOut, VariableStore};

pub const DEFAULT_PORT: u16 = 4444;
pub const DEFAULT_TTL_SECS: f64 = 3.0;
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

const RECV_BUF_LEN: usize = 2048;

/// Startup configuration. No state persists across restarts.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address the single UDP socket binds to.
    pub listen: SocketAddr,
    /// Seconds of silence after which a peer is dropped.
    pub ttl_secs: f64,
    /// Scheduler tick period for the run loop.
    pub tick: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            ttl_secs: DEFAULT_TTL_SECS,
            tick: DEFAULT_TICK,
        }
    }
}

/// The publish/subscribe broker. One instance per process, constructed at
/// startup and passed by reference to collaborators.
pub struct Broker {
    socket: UdpSocket,
    peers: PeerTable,
    store: VariableStore,
    tick_period: Duration,
}

impl Broker {
    /// Binds the broker socket. A busy or forbidden port is fatal: the
    /// service does not run and local reads would return defaults forever.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind broker socket on {}", config.listen))?;
        Ok(Self {
            socket,
            peers: PeerTable::new(config.ttl_secs),
            store: VariableStore::new(),
            tick_period: config.tick,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// One scheduler pass: drain every queued datagram, then advance peer
    /// clocks by `dt` seconds and drop the expired.
    pub fn tick(&mut self, dt: f64) {
        self.drain();
        self.sweep(dt);
    }

    fn drain(&mut self) {
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, src)) => self.handle_datagram(src, &buf[..len]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = ?err, "receive failed; skipping rest of drain");
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, src: SocketAddr, bytes: &[u8]) {
        // Intake refreshes liveness before any decoding, so even a
        // malformed datagram keeps its sender alive.
        if self.peers.refresh(src) {
            debug!(peer = %src, "new peer");
        }

        match protocol::decode(bytes) {
            Ok(Packet::KeepAlive) => {}
            Ok(Packet::Subscribe { names }) => {
                for name in &names {
                    self.store.subscribe_remote(src, name);
                }
                debug!(peer = %src, ?names, "subscribe");
            }
            Ok(Packet::Publish { name, value }) => {
                let plan = self.store.apply_publish(&name, value);
                self.fan_out(&plan);
            }
            Err(err) => debug!(peer = %src, error = ?err, "dropped undecodable datagram"),
        }
    }

    /// Fire-and-forget delivery to every planned recipient still in the
    /// peer table. A send failure is not a removal trigger; only the TTL
    /// sweep removes peers.
    fn fan_out(&self, plan: &FanOut) {
        for addr in &plan.recipients {
            if !self.peers.contains(addr) {
                continue;
            }
            if let Err(err) = self.socket.try_send_to(&plan.datagram, *addr) {
                debug!(peer = %addr, error = ?err, "publish send failed");
            }
        }
    }

    fn sweep(&mut self, dt: f64) {
        for addr in self.peers.sweep(dt) {
            info!(peer = %addr, "peer expired");
            self.store.prune_subscriber(&addr);
        }
    }

    // ------------------------------------------------------------------
    // Local API, the only surface simulation collaborators use.
    // ------------------------------------------------------------------

    /// Makes `name` readable in-process. Never joins the remote subscriber
    /// set: local consumption bypasses network fan-out entirely.
    pub fn subscribe(&mut self, name: &str) {
        self.store.subscribe_local(name);
    }

    /// Last locally visible value, 0.0 for names never subscribed.
    pub fn read(&self, name: &str) -> f64 {
        self.store.read(name)
    }

    /// Same effect as receiving a decoded remote publish: store and shadow
    /// update plus fan-out to remote subscribers, with no wire decode step.
    pub fn publish(&mut self, name: &str, value: Value) {
        let plan = self.store.apply_publish(name, value);
        self.fan_out(&plan);
    }

    /// Resets the stored value and any shadow entry to zero. Subscribers
    /// are not notified.
    pub fn clear(&mut self, name: &str) {
        self.store.clear(name);
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Ticks the broker at its configured period until `shutdown` resolves.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let dt = self.tick_period.as_secs_f64();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("broker shutting down");
                    break;
                }
                _ = ticker.tick() => self.tick(dt),
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, encode};
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(1);

    async fn test_broker() -> Broker {
        let broker = Broker::bind(BrokerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..BrokerConfig::default()
        })
        .await
        .expect("bind test broker");
        // Let the I/O driver observe write readiness so try_send_to works
        // before the test first yields, as the run loop's tick await does.
        broker.socket.writable().await.expect("socket writable");
        broker
    }

    fn subscribe_bytes(names: &[&str]) -> Vec<u8> {
        encode(&Packet::Subscribe {
            names: names.iter().map(|n| n.to_string()).collect(),
        })
    }

    fn publish_bytes(name: &str, value: Value) -> Vec<u8> {
        encode(&Packet::Publish {
            name: name.into(),
            value,
        })
    }

    async fn recv_publish(socket: &UdpSocket) -> Packet {
        let mut buf = [0u8; 2048];
        let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .expect("recv failed");
        decode(&buf[..len]).expect("received datagram should decode")
    }

    async fn expect_silence(socket: &UdpSocket) {
        let mut buf = [0u8; 2048];
        let got = timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await;
        assert!(got.is_err(), "expected no datagram, got one");
    }

    #[tokio::test]
    async fn publish_fans_out_to_subscriber_and_updates_local_shadow() {
        let mut broker = test_broker().await;
        let subscriber = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sub_addr = subscriber.local_addr().unwrap();
        let publisher_addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        broker.subscribe("wind");
        broker.handle_datagram(sub_addr, &subscribe_bytes(&["wind"]));
        broker.handle_datagram(publisher_addr, &publish_bytes("wind", Value::Float32(3.5)));

        let got = recv_publish(&subscriber).await;
        assert_eq!(
            got,
            Packet::Publish {
                name: "wind".into(),
                value: Value::Float32(3.5),
            }
        );
        assert_eq!(broker.read("wind"), 3.5);
    }

    #[tokio::test]
    async fn non_subscribers_receive_nothing() {
        let mut broker = test_broker().await;
        let bystander = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bystander_addr = bystander.local_addr().unwrap();

        // The bystander is a live peer subscribed to a different variable.
        broker.handle_datagram(bystander_addr, &subscribe_bytes(&["rain"]));
        broker.handle_datagram("127.0.0.1:9999".parse().unwrap(), &publish_bytes("wind", Value::Int32(1)));

        expect_silence(&bystander).await;
    }

    #[tokio::test]
    async fn local_publish_matches_remote_publish() {
        let mut local = test_broker().await;
        let mut remote = test_broker().await;
        let subscriber = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sub_addr = subscriber.local_addr().unwrap();

        local.subscribe("wind");
        remote.subscribe("wind");
        local.handle_datagram(sub_addr, &subscribe_bytes(&["wind"]));
        remote.handle_datagram(sub_addr, &subscribe_bytes(&["wind"]));

        local.publish("wind", Value::Float32(3.5));
        remote.handle_datagram("127.0.0.1:9999".parse().unwrap(), &publish_bytes("wind", Value::Float32(3.5)));

        let from_local = recv_publish(&subscriber).await;
        let from_remote = recv_publish(&subscriber).await;
        assert_eq!(from_local, from_remote);
        assert_eq!(local.read("wind"), remote.read("wind"));
        assert_eq!(local.store.value("wind"), remote.store.value("wind"));
    }

    #[tokio::test]
    async fn clear_sends_no_datagrams() {
        let mut broker = test_broker().await;
        let subscriber = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sub_addr = subscriber.local_addr().unwrap();

        broker.subscribe("wind");
        broker.handle_datagram(sub_addr, &subscribe_bytes(&["wind"]));
        broker.publish("wind", Value::Float32(3.5));
        let _ = recv_publish(&subscriber).await;

        broker.clear("wind");

        expect_silence(&subscriber).await;
        assert_eq!(broker.read("wind"), 0.0);
    }

    #[tokio::test]
    async fn two_datagrams_same_address_one_peer() {
        let mut broker = test_broker().await;
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        broker.handle_datagram(addr, &[]);
        broker.handle_datagram(addr, &subscribe_bytes(&["wind"]));

        assert_eq!(broker.peers.len(), 1);
    }

    #[tokio::test]
    async fn expired_peer_is_excised_from_subscriber_sets() {
        let mut broker = test_broker().await;
        let subscriber = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sub_addr = subscriber.local_addr().unwrap();

        broker.handle_datagram(sub_addr, &subscribe_bytes(&["wind"]));
        assert_eq!(broker.store.subscribers("wind"), 1);

        // Past the 3.0s default TTL with no traffic from the subscriber.
        broker.tick(4.0);

        assert_eq!(broker.store.subscribers("wind"), 0);
        assert!(broker.peers.is_empty());

        broker.publish("wind", Value::Float32(1.0));
        expect_silence(&subscriber).await;
    }

    #[tokio::test]
    async fn regular_keep_alives_prevent_expiry() {
        let mut broker = test_broker().await;
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        broker.handle_datagram(addr, &subscribe_bytes(&["wind"]));
        for _ in 0..10 {
            broker.handle_datagram(addr, &[protocol::OPCODE_KEEP_ALIVE]);
            broker.tick(1.0);
        }

        assert!(broker.peers.contains(&addr));
        assert_eq!(broker.store.subscribers("wind"), 1);
    }

    #[tokio::test]
    async fn malformed_datagram_still_refreshes_liveness() {
        let mut broker = test_broker().await;
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        // Truncated publish and an unknown opcode are both dropped, but the
        // sender stays alive.
        broker.handle_datagram(addr, &[protocol::OPCODE_PUBLISH, 2, 1]);
        assert!(broker.peers.contains(&addr));
        broker.handle_datagram(addr, &[0x42, 0x42]);
        assert_eq!(broker.peers.len(), 1);
    }

    #[tokio::test]
    async fn unknown_type_publish_zeroes_stored_value() {
        let mut broker = test_broker().await;
        broker.subscribe("wind");
        broker.handle_datagram("127.0.0.1:9001".parse().unwrap(), &publish_bytes("wind", Value::Float32(3.5)));
        assert_eq!(broker.read("wind"), 3.5);

        broker.handle_datagram("127.0.0.1:9001".parse().unwrap(), &publish_bytes("wind", Value::Unknown));

        assert_eq!(broker.read("wind"), 0.0);
        assert_eq!(broker.store.value("wind"), Some(Value::Unknown));
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let first = test_broker().await;
        let occupied = first.local_addr().unwrap();
        let second = Broker::bind(BrokerConfig {
            listen: occupied,
            ..BrokerConfig::default()
        })
        .await;
        assert!(second.is_err());
    }
}
