//! TCP transport for the failover engine.
//!
//! The engine runs on the task that calls [`FailoverServer::run`]. Every
//! listener and every connection gets a task of its own that turns socket
//! activity into [`Event`]s on a single channel; the engine's [`Action`]s
//! go back out as writes on per-connection channels.
//!
//! Engine calls may commit to storage, which blocks on file I/O. On a
//! multi-threaded runtime they run under `block_in_place`, so the worker's
//! other tasks move elsewhere while the commit is in progress.
//!
//! ```text
//!   listener task ──┐
//!   connect task  ──┼──> events ──> run loop ──> Failover ──> actions
//!   reader tasks  ──┘                  │                          │
//!                                      └── sleep until deadline   │
//!   writer tasks  <───────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::failover::{Action, Failover};
use crate::link::LinkId;
use crate::store::{JsonStorage, Storage};

const READ_BUFFER_SIZE: usize = 4096;
const LISTEN_BACKLOG: i32 = 16;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Current time in unix seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Socket activity reported to the run loop.
#[derive(Debug)]
enum Event {
    Connected {
        relationship: String,
        stream: TcpStream,
        peer: SocketAddr,
    },
    ConnectFailed {
        relationship: String,
        error: String,
    },
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
    },
    Received {
        link: LinkId,
        data: Vec<u8>,
    },
    Closed {
        link: LinkId,
    },
}

enum Outgoing {
    Data(Vec<u8>),
    Close,
}

struct Connection {
    writer: mpsc::UnboundedSender<Outgoing>,
    reader: JoinHandle<()>,
}

pub struct FailoverServer<S: Storage = JsonStorage> {
    failover: Failover<S>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    connections: HashMap<LinkId, Connection>,
    listening: HashSet<SocketAddr>,
}

impl FailoverServer<JsonStorage> {
    /// Opens the state file named in the configuration and builds the
    /// engine from it.
    pub fn new(config: &Config) -> Result<Self> {
        let storage = JsonStorage::open(&config.state_file)?;
        Self::with_storage(config, storage)
    }
}

impl<S: Storage> FailoverServer<S> {
    pub fn with_storage(config: &Config, storage: S) -> Result<Self> {
        let failover = Failover::new(config, storage, now())?;
        for relationship in failover.relationships() {
            info!(
                "failover peer {}: {} {} <-> {}",
                relationship.name,
                relationship.role,
                relationship.local_socket(),
                relationship.peer_socket()
            );
        }
        info!("{} lease(s) under failover", failover.leases().len());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            failover,
            events_tx,
            events_rx,
            connections: HashMap::new(),
            listening: HashSet::new(),
        })
    }

    pub fn failover(&self) -> &Failover<S> {
        &self.failover
    }

    /// Runs the engine until the task is cancelled.
    pub async fn run(&mut self) -> Result<()> {
        blocking(|| self.failover.start(now()));
        self.perform_actions();
        info!("Failover server running");

        loop {
            let deadline = self.failover.next_deadline();
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => blocking(|| self.handle_event(event)),
                    None => return Ok(()),
                },
                _ = sleep_until(deadline) => {}
            }

            blocking(|| self.failover.fire_timers(now()));
            self.perform_actions();
        }
    }

    /// Commits whatever the engine has written but not yet made durable.
    pub fn shutdown(&mut self) -> Result<()> {
        for (_, connection) in self.connections.drain() {
            connection.reader.abort();
            let _ = connection.writer.send(Outgoing::Close);
        }
        blocking(|| self.failover.storage_mut().commit())
    }

    fn handle_event(&mut self, event: Event) {
        let now = now();
        match event {
            Event::Connected {
                relationship,
                stream,
                peer,
            } => match self.failover.connected(&relationship, peer, now) {
                Ok(link) => self.attach(link, stream),
                Err(error) => warn!("Dropping connection to {}: {}", peer, error),
            },
            Event::ConnectFailed { relationship, error } => {
                debug!("failover peer {}: connect failed: {}", relationship, error);
                self.failover.connect_failed(&relationship, now);
            }
            Event::Accepted { stream, peer } => {
                if let Some(link) = self.failover.accepted(peer, now) {
                    self.attach(link, stream);
                }
            }
            Event::Received { link, data } => self.failover.receive(link, &data, now),
            Event::Closed { link } => {
                if self.connections.remove(&link).is_some() {
                    self.failover.link_closed(link, now);
                }
            }
        }
    }

    fn perform_actions(&mut self) {
        for action in self.failover.take_actions() {
            match action {
                Action::Send { link, bytes } => {
                    if let Some(connection) = self.connections.get(&link) {
                        let _ = connection.writer.send(Outgoing::Data(bytes));
                    }
                }
                Action::Close { link } => {
                    if let Some(connection) = self.connections.remove(&link) {
                        connection.reader.abort();
                        let _ = connection.writer.send(Outgoing::Close);
                    }
                }
                Action::Connect { relationship, addr } => self.spawn_connect(relationship, addr),
                Action::Listen { addr } => self.spawn_listener(addr),
            }
        }
    }

    fn attach(&mut self, link: LinkId, stream: TcpStream) {
        if let Err(error) = stream.set_nodelay(true) {
            debug!("{}: cannot set TCP_NODELAY: {}", link, error);
        }
        let (mut read_half, mut write_half) = stream.into_split();
        let (writer, mut outgoing) = mpsc::unbounded_channel::<Outgoing>();

        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match read_half.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(size) => {
                        let data = buffer[..size].to_vec();
                        if events.send(Event::Received { link, data }).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        debug!("{}: read failed: {}", link, error);
                        break;
                    }
                }
            }
            let _ = events.send(Event::Closed { link });
        });

        tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                match message {
                    Outgoing::Data(bytes) => {
                        if let Err(error) = write_half.write_all(&bytes).await {
                            debug!("{}: write failed: {}", link, error);
                            break;
                        }
                    }
                    Outgoing::Close => break,
                }
            }
            let _ = write_half.shutdown().await;
        });

        self.connections.insert(link, Connection { writer, reader });
    }

    fn spawn_connect(&self, relationship: String, addr: SocketAddr) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => Event::Connected {
                    relationship,
                    stream,
                    peer: addr,
                },
                Ok(Err(error)) => Event::ConnectFailed {
                    relationship,
                    error: error.to_string(),
                },
                Err(_) => Event::ConnectFailed {
                    relationship,
                    error: "timed out".to_string(),
                },
            };
            let _ = events.send(event);
        });
    }

    fn spawn_listener(&mut self, addr: SocketAddr) {
        if !self.listening.insert(addr) {
            return;
        }

        let listener = match create_listener(addr) {
            Ok(listener) => listener,
            Err(error) => {
                error!("{}", error);
                self.listening.remove(&addr);
                self.failover.listen_failed(addr, now());
                return;
            }
        };
        info!("Listening for failover peers on {}", addr);

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if events.send(Event::Accepted { stream, peer }).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        warn!("Accept on {} failed: {}", addr, error);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        });
    }
}

/// Runs engine work that may block on storage.
fn blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(work),
        _ => work(),
    }
}

async fn sleep_until(deadline: Option<i64>) {
    match deadline {
        Some(deadline) => {
            let wait = u64::try_from(deadline - now()).unwrap_or(0);
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }
        None => std::future::pending().await,
    }
}

fn create_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    socket
        .bind(&addr.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", addr, error)))?;

    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|error| Error::Socket(format!("Failed to listen on {}: {}", addr, error)))?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|error| {
        Error::Socket(format!("Failed to convert to tokio listener: {}", error))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeerConfig, PoolConfig};
    use crate::state::{FailoverState, Role, ServiceState};
    use crate::store::MemoryStorage;
    use std::net::Ipv4Addr;

    fn test_config(role: Role, local: SocketAddr, peer: SocketAddr) -> Config {
        Config {
            state_file: "unused.json".to_string(),
            relationships: vec![PeerConfig::new("loopback", role, local, peer)],
            pools: vec![PoolConfig {
                name: "lan".to_string(),
                failover_peer: "loopback".to_string(),
                range_start: Ipv4Addr::new(10, 9, 0, 1),
                range_end: Ipv4Addr::new(10, 9, 0, 4),
            }],
        }
    }

    fn is_network_error(err: &Error) -> bool {
        matches!(err, Error::Socket(_) | Error::Io(_))
    }

    #[tokio::test]
    async fn test_create_listener() {
        match create_listener("127.0.0.1:0".parse().unwrap()) {
            Ok(listener) => {
                assert_ne!(listener.local_addr().unwrap().port(), 0);
                assert!(socket2::SockRef::from(&listener).reuse_address().unwrap());
            }
            Err(error) => assert!(is_network_error(&error)),
        }
    }

    #[tokio::test]
    async fn test_listener_rebinds_released_port() {
        let first = match create_listener("127.0.0.1:0".parse().unwrap()) {
            Ok(listener) => listener,
            Err(error) => {
                assert!(is_network_error(&error));
                return;
            }
        };
        let addr = first.local_addr().unwrap();
        drop(first);
        match create_listener(addr) {
            Ok(listener) => assert_eq!(listener.local_addr().unwrap(), addr),
            Err(error) => assert!(is_network_error(&error)),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_work_leaves_runtime_free() {
        // on the only worker: the inner task runs only if the worker is handed off
        let finished = tokio::spawn(async {
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            blocking(|| {
                tokio::spawn(async move {
                    let _ = done_tx.send(());
                });
                done_rx.recv_timeout(Duration::from_secs(5)).is_ok()
            })
        })
        .await
        .unwrap();
        assert!(finished);
    }

    #[tokio::test]
    async fn test_blocking_runs_inline_on_current_thread() {
        assert_eq!(blocking(|| 7), 7);
    }

    #[tokio::test]
    async fn test_sleep_until_past_deadline_returns() {
        tokio::time::timeout(Duration::from_secs(1), sleep_until(Some(now() - 10)))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_partners_reach_normal_over_loopback() {
        let primary_addr: SocketAddr = "127.0.0.1:46471".parse().unwrap();
        let secondary_addr: SocketAddr = "127.0.0.1:46472".parse().unwrap();

        let mut primary = FailoverServer::with_storage(
            &test_config(Role::Primary, primary_addr, secondary_addr),
            MemoryStorage::new(),
        )
        .unwrap();
        let mut secondary = FailoverServer::with_storage(
            &test_config(Role::Secondary, secondary_addr, primary_addr),
            MemoryStorage::new(),
        )
        .unwrap();

        let _ = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(primary.run(), secondary.run())
        })
        .await;

        for server in [&primary.failover, &secondary.failover] {
            let status = server.status("loopback").unwrap();
            assert_eq!(status.local_state, FailoverState::Normal);
            assert_eq!(status.partner_state, FailoverState::Normal);
            assert_eq!(status.service_state, ServiceState::Cooperating);
        }
        assert!(primary.shutdown().is_ok());
    }
}
