//! One process per rank, linked to the coordinator over QUIC.
//!
//! Rank 0 creates a throwaway self-signed certificate, binds the
//! coordinator address and publishes the certificate at a rendezvous path
//! on the filesystem the ranks share. Workers wait for that file, trust
//! exactly that certificate and introduce themselves with `Hello(rank)` on
//! a bidirectional stream. Links form a star: workers only talk to rank 0.

use std::{
    fs, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use hashbrown::HashMap;
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use tokio::{
    runtime::Runtime,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, debug_span, trace, warn, Instrument};
use typed_builder::TypedBuilder;

use super::{
    mailbox::Mailbox,
    wire::{self, FRAME_LEN},
    Envelope, Fabric, FabricError, Result, SendRequest, Source, Tag,
};

/// Name the coordinator certificate is issued for and verified against.
const SERVER_NAME: &str = "localhost";

#[derive(Debug, Clone, TypedBuilder)]
pub struct QuicConfig {
    pub rank: usize,
    pub world: usize,
    /// Address rank 0 listens on and workers dial.
    pub coordinator: SocketAddr,
    /// Where rank 0 publishes its certificate for the workers.
    pub rendezvous: PathBuf,
    #[builder(default = 200)]
    pub connect_attempts: u32,
    #[builder(default = Duration::from_millis(50))]
    pub retry_delay: Duration,
}

struct Outgoing {
    frame: [u8; FRAME_LEN],
    sent: oneshot::Sender<Result<()>>,
}

struct Link {
    outbox: mpsc::UnboundedSender<Outgoing>,
    writer: JoinHandle<()>,
    connection: Connection,
}

impl Link {
    /// Starts the tasks that move frames between `connection` and the
    /// local mailbox. A single writer per link keeps sends in order.
    fn spawn(
        peer: usize,
        connection: Connection,
        send: SendStream,
        recv: RecvStream,
        mailbox: Arc<Mailbox>,
    ) -> Self {
        let (outbox, queued) = mpsc::unbounded_channel();
        let writer = tokio::spawn(pump(peer, send, queued));
        tokio::spawn(drain(peer, recv, mailbox));
        Self {
            outbox,
            writer,
            connection,
        }
    }
}

async fn pump(
    peer: usize,
    mut stream: SendStream,
    mut queued: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(Outgoing { frame, sent }) = queued.recv().await {
        let result = stream.write_all(&frame).await.map_err(FabricError::from);
        let failed = result.is_err();
        let _ = sent.send(result);
        if failed {
            warn!(peer, "link write failed, abandoning queued sends");
            break;
        }
    }
    // waits until the peer has acknowledged everything written
    if let Err(e) = stream.finish().await {
        debug!(peer, error = %e, "link finish failed");
    }
}

async fn drain(peer: usize, mut stream: RecvStream, mailbox: Arc<Mailbox>) {
    let mut frame = [0u8; FRAME_LEN];
    loop {
        if let Err(e) = stream.read_exact(&mut frame).await {
            debug!(peer, error = %e, "link closed");
            break;
        }
        match wire::decode(peer, &frame) {
            Ok(envelope) => mailbox.deliver(envelope),
            Err(e) => {
                warn!(peer, error = %e, "dropping link");
                break;
            }
        }
    }
    mailbox.disconnect(peer);
}

fn transport() -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(Duration::from_secs(1)));
    transport.max_idle_timeout(Some(VarInt::from_u32(10_000).into()));
    Arc::new(transport)
}

/// Writes the certificate next to `path` and renames it into place so that
/// workers never read a partial file.
fn publish(path: &Path, der: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, der)?;
    fs::rename(&tmp, path)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn serve(
    config: &QuicConfig,
    mailbox: &Arc<Mailbox>,
) -> Result<(Endpoint, HashMap<usize, Link>)> {
    let cert =
        rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])?;
    let der = cert.serialize_der()?;
    let key = rustls::PrivateKey(cert.serialize_private_key_der());

    // a certificate left by an earlier run would send workers to a dead end
    remove_if_present(&config.rendezvous)?;
    let mut server_config = quinn::ServerConfig::with_single_cert(
        vec![rustls::Certificate(der.clone())],
        key,
    )?;
    server_config.transport_config(transport());
    let endpoint = Endpoint::server(server_config, config.coordinator)?;
    publish(&config.rendezvous, &der)?;
    debug!(addr = %config.coordinator, "waiting for workers");

    let mut links = HashMap::with_capacity(config.world - 1);
    while links.len() < config.world - 1 {
        let connecting = endpoint.accept().await.ok_or_else(|| {
            FabricError::Handshake("endpoint closed while accepting".into())
        })?;
        let connection = connecting.await?;
        let (send, mut recv) = connection.accept_bi().await?;
        let mut hello = [0u8; FRAME_LEN];
        recv.read_exact(&mut hello).await?;
        let peer = match wire::decode(0, &hello)? {
            Envelope {
                tag: Tag::Hello,
                payload,
                ..
            } if payload > 0 && (payload as usize) < config.world => {
                payload as usize
            }
            other => {
                return Err(FabricError::Handshake(format!(
                    "unexpected first message {:?}",
                    other
                )))
            }
        };
        if links.contains_key(&peer) {
            return Err(FabricError::Handshake(format!(
                "rank {} connected twice",
                peer
            )));
        }
        debug!(peer, remote = %connection.remote_address(), "worker joined");
        links.insert(
            peer,
            Link::spawn(peer, connection, send, recv, mailbox.clone()),
        );
    }
    // every worker has read it by now
    remove_if_present(&config.rendezvous)?;
    Ok((endpoint, links))
}

async fn dial(endpoint: &Endpoint, config: &QuicConfig) -> Result<Connection> {
    let der = tokio::fs::read(&config.rendezvous).await?;
    let mut roots = rustls::RootCertStore::empty();
    roots.add(&rustls::Certificate(der))?;
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(transport());
    let connection = endpoint
        .connect_with(client_config, config.coordinator, SERVER_NAME)?
        .await?;
    Ok(connection)
}

async fn join(
    config: &QuicConfig,
    mailbox: &Arc<Mailbox>,
) -> Result<(Endpoint, HashMap<usize, Link>)> {
    let local: SocketAddr = if config.coordinator.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let endpoint = Endpoint::client(local)?;
    let mut attempt = 0;
    let connection = loop {
        attempt += 1;
        match dial(&endpoint, config).await {
            Ok(connection) => break connection,
            Err(e) if attempt < config.connect_attempts => {
                trace!(attempt, error = %e, "coordinator not ready");
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    };
    let (mut send, recv) = connection.open_bi().await?;
    send.write_all(&wire::encode(Tag::Hello, config.rank as i64))
        .await?;
    debug!(
        remote = %connection.remote_address(),
        attempt,
        "joined coordinator"
    );

    let mut links = HashMap::with_capacity(1);
    links.insert(0, Link::spawn(0, connection, send, recv, mailbox.clone()));
    Ok((endpoint, links))
}

/// One rank of a multi-process world.
pub struct QuicFabric {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
    links: HashMap<usize, Link>,
    endpoint: Option<Endpoint>,
    // dropped last: the endpoint and link tasks run on it
    runtime: Runtime,
}

impl QuicFabric {
    /// Joins the world described by `config`, blocking until every worker
    /// is linked to the coordinator.
    pub fn connect(config: &QuicConfig) -> Result<Self> {
        if config.world == 0 || config.rank >= config.world {
            return Err(FabricError::Handshake(format!(
                "rank {} is outside a world of {}",
                config.rank, config.world
            )));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("fabric")
            .enable_all()
            .build()?;
        let peers = if config.rank == 0 { config.world - 1 } else { 1 };
        let mailbox = Arc::new(Mailbox::new(peers));

        let (endpoint, links) = if config.world == 1 {
            (None, HashMap::new())
        } else {
            let span =
                debug_span!("fabric", rank = config.rank, world = config.world);
            let (endpoint, links) = runtime.block_on(
                async {
                    if config.rank == 0 {
                        serve(config, &mailbox).await
                    } else {
                        join(config, &mailbox).await
                    }
                }
                .instrument(span),
            )?;
            (Some(endpoint), links)
        };
        Ok(Self {
            rank: config.rank,
            size: config.world,
            mailbox,
            links,
            endpoint,
            runtime,
        })
    }
}

impl Fabric for QuicFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(
        &self,
        dest: usize,
        tag: Tag,
        payload: i64,
    ) -> Result<SendRequest> {
        if dest == self.rank {
            self.mailbox.deliver(Envelope {
                source: self.rank,
                tag,
                payload,
            });
            return Ok(SendRequest::complete());
        }
        let link = self.links.get(&dest).ok_or(FabricError::NoRoute(dest))?;
        let (sent, completion) = oneshot::channel();
        link.outbox
            .send(Outgoing {
                frame: wire::encode(tag, payload),
                sent,
            })
            .map_err(|_| FabricError::Disconnected(dest))?;
        Ok(SendRequest::pending(completion))
    }

    fn try_recv(&self, source: Source, tag: Tag) -> Result<Option<Envelope>> {
        self.mailbox.try_take(source, tag)
    }

    fn recv(&self, source: Source, tag: Tag) -> Result<Envelope> {
        self.mailbox.take(source, tag)
    }

    fn barrier(&self) -> Result<()> {
        super::star_barrier(self)
    }
}

impl Drop for QuicFabric {
    fn drop(&mut self) {
        let links = std::mem::take(&mut self.links);
        let endpoint = self.endpoint.take();
        let coordinator = self.rank == 0;
        self.runtime.block_on(async move {
            for (peer, link) in links {
                drop(link.outbox);
                if let Err(e) = link.writer.await {
                    debug!(peer, error = %e, "link writer failed");
                }
                // workers hang up first so nothing unread is cut off
                if coordinator {
                    let closed = link.connection.closed();
                    let _ = tokio::time::timeout(Duration::from_secs(5), closed)
                        .await;
                }
                link.connection.close(VarInt::from_u32(0), b"done");
            }
            if let Some(endpoint) = endpoint {
                let idle = endpoint.wait_idle();
                let _ =
                    tokio::time::timeout(Duration::from_secs(1), idle).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{net::UdpSocket, thread};

    use super::*;

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn ranks_exchange_messages_over_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let rendezvous = dir.path().join("out.h5.fabric");
        let coordinator: SocketAddr = ([127, 0, 0, 1], free_port()).into();
        let config = |rank| {
            QuicConfig::builder()
                .rank(rank)
                .world(2)
                .coordinator(coordinator)
                .rendezvous(rendezvous.clone())
                .build()
        };

        let worker = {
            let config = config(1);
            thread::spawn(move || {
                let fabric = QuicFabric::connect(&config).unwrap();
                let frame = fabric.recv(Source::Rank(0), Tag::Frame).unwrap();
                fabric
                    .isend(0, Tag::Done, frame.payload + 1)
                    .unwrap()
                    .wait()
                    .unwrap();
                let stop = fabric.recv(Source::Rank(0), Tag::Frame).unwrap();
                assert_eq!(stop.payload, -1);
                fabric.barrier().unwrap();
            })
        };

        let fabric = QuicFabric::connect(&config(0)).unwrap();
        assert!(!rendezvous.exists());
        let first = fabric.isend(1, Tag::Frame, 41).unwrap();
        let stop = fabric.isend(1, Tag::Frame, -1).unwrap();
        let done = fabric.recv(Source::Any, Tag::Done).unwrap();
        assert_eq!((done.source, done.payload), (1, 42));
        first.wait().unwrap();
        stop.wait().unwrap();
        fabric.barrier().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn single_rank_worlds_need_no_network() {
        let dir = tempfile::tempdir().unwrap();
        let config = QuicConfig::builder()
            .rank(0)
            .world(1)
            .coordinator(([127, 0, 0, 1], 9).into())
            .rendezvous(dir.path().join("unused"))
            .build();
        let fabric = QuicFabric::connect(&config).unwrap();
        fabric.barrier().unwrap();
        assert!(matches!(
            fabric.isend(1, Tag::Frame, 0),
            Err(FabricError::NoRoute(1))
        ));
        assert!(!dir.path().join("unused").exists());
    }

    #[test]
    fn ranks_outside_the_world_are_refused() {
        let config = QuicConfig::builder()
            .rank(3)
            .world(2)
            .coordinator(([127, 0, 0, 1], 9).into())
            .rendezvous(PathBuf::from("unused"))
            .build();
        assert!(matches!(
            QuicFabric::connect(&config),
            Err(FabricError::Handshake(_))
        ));
    }
}
