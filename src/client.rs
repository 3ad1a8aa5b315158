//! Remote DDS client: talks to a broker over the wire.
//!
//! [`DdsClient`] binds an ephemeral UDP socket so broker fan-out has
//! somewhere to land, registers interest with a subscribe datagram, and
//! runs a background task that receives publishes and sends periodic
//! keep-alives so the broker's TTL sweep never drops us. Received values
//! land in per-name `watch` channels, giving callers both a latest-value
//! [`read`](DdsClient::read) and an awaitable [`wait`](DdsClient::wait).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::ClientArgs;
use crate::protocol::{self, Packet, Value};

/// Keep-alive cadence. Must stay below the broker TTL (3.0s by default).
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

type WatcherMap = Arc<Mutex<HashMap<String, watch::Sender<Option<f64>>>>>;

pub struct DdsClient {
    server: SocketAddr,
    socket: Arc<UdpSocket>,
    watchers: WatcherMap,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl DdsClient {
    /// Binds an ephemeral local socket and starts the background
    /// receive/keep-alive task. No handshake happens; the broker learns
    /// about us from the first datagram we send.
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind client socket")?;
        let socket = Arc::new(socket);
        let watchers: WatcherMap = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(background_loop(
            Arc::clone(&socket),
            server,
            Arc::clone(&watchers),
            shutdown_rx,
        ));

        Ok(Self {
            server,
            socket,
            watchers,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Tells the broker which variables we want fanned out to us. Callable
    /// repeatedly; subscriptions accumulate and repeats are idempotent.
    pub async fn subscribe(&self, names: &[&str]) -> Result<()> {
        {
            let mut watchers = self.watchers.lock().unwrap();
            for name in names {
                watchers
                    .entry(name.to_string())
                    .or_insert_with(|| watch::channel(None).0);
            }
        }

        let bytes = protocol::encode(&Packet::Subscribe {
            names: names.iter().map(|n| n.to_string()).collect(),
        });
        self.socket
            .send_to(&bytes, self.server)
            .await
            .context("failed to send subscribe")?;
        Ok(())
    }

    /// Publishes a value to the broker, which fans it out to every other
    /// subscriber of `name`.
    pub async fn publish(&self, name: &str, value: Value) -> Result<()> {
        let bytes = protocol::encode(&Packet::Publish {
            name: name.to_string(),
            value,
        });
        self.socket
            .send_to(&bytes, self.server)
            .await
            .context("failed to send publish")?;
        Ok(())
    }

    pub async fn publish_i32(&self, name: &str, value: i32) -> Result<()> {
        self.publish(name, Value::Int32(value)).await
    }

    pub async fn publish_f32(&self, name: &str, value: f32) -> Result<()> {
        self.publish(name, Value::Float32(value)).await
    }

    /// Last received value for `name`, `None` before the first update or
    /// for names never subscribed.
    pub fn read(&self, name: &str) -> Option<f64> {
        let watchers = self.watchers.lock().unwrap();
        watchers.get(name).and_then(|tx| *tx.borrow())
    }

    /// A receiver tracking every update for `name`, or `None` if the name
    /// was never subscribed.
    pub fn watch(&self, name: &str) -> Option<watch::Receiver<Option<f64>>> {
        let watchers = self.watchers.lock().unwrap();
        watchers.get(name).map(watch::Sender::subscribe)
    }

    /// Awaits the next published value for `name`. Returns `None` for
    /// names never subscribed.
    pub async fn wait(&self, name: &str) -> Option<f64> {
        let mut rx = self.watch(name)?;
        loop {
            rx.changed().await.ok()?;
            let latest = *rx.borrow();
            if latest.is_some() {
                return latest;
            }
        }
    }

    /// Stops the background task. The broker notices our absence through
    /// its TTL sweep once the keep-alives stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

async fn background_loop(
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    watchers: WatcherMap,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    // First tick fires immediately, announcing us to the broker.
    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    let mut buf = [0u8; 2048];

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = keep_alive.tick() => {
                if let Err(err) = socket.send_to(&[protocol::OPCODE_KEEP_ALIVE], server).await {
                    warn!(error = ?err, "keep-alive send failed");
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _)) => handle_datagram(&watchers, &buf[..len]),
                Err(err) => warn!(error = ?err, "client receive failed"),
            }
        }
    }
}

fn handle_datagram(watchers: &WatcherMap, bytes: &[u8]) {
    match protocol::decode(bytes) {
        Ok(Packet::Publish { name, value }) => {
            // An unknown-typed publish carries no usable number.
            if value == Value::Unknown {
                return;
            }
            let watchers = watchers.lock().unwrap();
            if let Some(tx) = watchers.get(&name) {
                tx.send_replace(Some(value.as_f64()));
            }
        }
        Ok(_) => {}
        Err(err) => debug!(error = ?err, "ignored undecodable datagram"),
    }
}

/// Interactive client mode for the binary: print every update for the
/// subscribed names and publish `name=value` lines typed on stdin.
pub async fn run(args: ClientArgs) -> Result<()> {
    let client = DdsClient::connect(args.server).await?;
    info!("client socket {} -> broker {}", client.local_addr()?, args.server);

    let names: Vec<&str> = args.subscribe.iter().map(String::as_str).collect();
    if !names.is_empty() {
        client.subscribe(&names).await?;
    }

    let mut printers = Vec::new();
    for name in &args.subscribe {
        let Some(mut rx) = client.watch(name) else {
            continue;
        };
        let name = name.clone();
        printers.push(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                if let Some(value) = *rx.borrow() {
                    println!("{name} = {value}");
                }
            }
        }));
    }

    run_publish_loop(&client).await?;

    client.shutdown().await;
    for printer in printers {
        printer.abort();
    }
    Ok(())
}

async fn run_publish_loop(client: &DdsClient) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut line = String::new();

    loop {
        line.clear();
        let bytes = stdin.read_line(&mut line).await?;
        if bytes == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "/quit" {
            break;
        }

        match parse_publish(trimmed) {
            Some((name, value)) => client.publish(name, value).await?,
            None => warn!("expected 'name=value' or /quit, got {trimmed:?}"),
        }
    }

    Ok(())
}

/// Integer literals publish as int32, everything else numeric as float32.
fn parse_publish(line: &str) -> Option<(&str, Value)> {
    let (name, raw) = line.split_once('=')?;
    let (name, raw) = (name.trim(), raw.trim());
    if name.is_empty() {
        return None;
    }
    if let Ok(v) = raw.parse::<i32>() {
        return Some((name, Value::Int32(v)));
    }
    raw.parse::<f32>().ok().map(|v| (name, Value::Float32(v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_lines_infer_the_wire_type() {
        assert_eq!(parse_publish("f1=12"), Some(("f1", Value::Int32(12))));
        assert_eq!(parse_publish("f1=-3"), Some(("f1", Value::Int32(-3))));
        assert_eq!(parse_publish("f1=3.5"), Some(("f1", Value::Float32(3.5))));
        assert_eq!(
            parse_publish(" wind = 0.25 "),
            Some(("wind", Value::Float32(0.25)))
        );
        assert_eq!(parse_publish("no-equals"), None);
        assert_eq!(parse_publish("f1=abc"), None);
        assert_eq!(parse_publish("=1"), None);
    }

    #[tokio::test]
    async fn read_before_any_update_is_none() {
        let client = DdsClient::connect("127.0.0.1:4444".parse().unwrap())
            .await
            .expect("connect binds locally even with no broker");
        client.subscribe(&["wind"]).await.expect("subscribe send");
        assert_eq!(client.read("wind"), None);
        assert_eq!(client.read("never-subscribed"), None);
        client.shutdown().await;
    }
}
