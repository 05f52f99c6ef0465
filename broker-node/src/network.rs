//! TCP transport: listening, dialing, the hello handshake, and the framed
//! reader/writer tasks behind every link.
//!
//! A frame is a u32-LE payload length followed by one encoded peer message.
//! The first frame in each direction is a `Hello` announcing the endpoint
//! id; everything afterwards goes straight to the hub. Outbound peerings
//! are supervised: when the link drops and a retry interval is configured,
//! the supervisor re-dials after the interval plus a little jitter.

use crate::hub::HubMsg;
use broker_core::{wire, Error, PeerMessage, PeerId, Result};
use dashmap::DashMap;
use rand::Rng;
use std::{net::IpAddr, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, oneshot, watch},
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

/// One registered connection, keyed by address in the endpoint's registry.
#[derive(Debug)]
pub(crate) struct ConnEntry {
    /// Remote endpoint id (invalid until the handshake finished).
    pub peer: PeerId,
    /// Closing signal for this connection.
    pub close: watch::Sender<bool>,
}

/// Everything a link task needs from its endpoint.
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub hub: mpsc::Sender<HubMsg>,
    pub local_id: PeerId,
    pub max_frame: usize,
    pub queue_capacity: usize,
    pub connect_timeout: Duration,
    pub shutdown: watch::Receiver<bool>,
    pub registry: Arc<DashMap<String, ConnEntry>>,
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &PeerMessage,
    max_frame: usize,
) -> Result<()> {
    let framed = wire::frame(msg, max_frame)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message<R: AsyncRead + Unpin>(reader: &mut R, max_frame: usize) -> Result<PeerMessage> {
    let mut header = [0u8; wire::FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = u32::from_le_bytes(header) as usize;
    if len > max_frame {
        return Err(Error::FrameTooLarge { actual: len, max: max_frame });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    wire::decode_payload(&payload)
}

async fn read_hello<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame: usize,
    local: &PeerId,
) -> Result<PeerId> {
    match read_message(reader, max_frame).await? {
        PeerMessage::Hello(id) if !id.is_valid() => {
            Err(Error::network("handshake announced an invalid peer id"))
        },
        PeerMessage::Hello(id) if id == *local => Err(Error::network("connected to ourselves")),
        PeerMessage::Hello(id) => Ok(id),
        other => Err(Error::network(format!("handshake expected hello, got {}", other.kind()))),
    }
}

async fn handshake(
    stream: &mut TcpStream,
    local: &PeerId,
    max_frame: usize,
    originator: bool,
) -> Result<PeerId> {
    if originator {
        write_message(stream, &PeerMessage::Hello(local.clone()), max_frame).await?;
        read_hello(stream, max_frame, local).await
    } else {
        let remote = read_hello(stream, max_frame, local).await?;
        write_message(stream, &PeerMessage::Hello(local.clone()), max_frame).await?;
        Ok(remote)
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<PeerMessage>,
    max_frame: usize,
) {
    while let Some(msg) = rx.recv().await {
        match wire::frame(&msg, max_frame) {
            Ok(framed) => {
                if writer.write_all(&framed).await.is_err() {
                    break;
                }
            },
            Err(error) => warn!(%error, "refusing to send oversized frame"),
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_reader(
    mut reader: OwnedReadHalf,
    remote: PeerId,
    mut close: watch::Receiver<bool>,
    ctx: &LinkContext,
) {
    let mut shutdown = ctx.shutdown.clone();
    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => break None,
            _ = close.changed() => break None,
            result = read_message(&mut reader, ctx.max_frame) => match result {
                Ok(msg) => {
                    let from = HubMsg::FromPeer { peer: remote.clone(), msg };
                    if ctx.hub.send(from).await.is_err() {
                        break None;
                    }
                },
                Err(error) => break Some(error.to_string()),
            },
        }
    };
    let graceful = reason.is_none();
    if let Some(ref reason) = reason {
        debug!(peer = %remote, reason, "link failed");
    }
    let _ = ctx.hub.send(HubMsg::PeerDown { peer: remote, graceful, reason }).await;
}

/// Register a handshaken connection with the hub and run its reader to
/// completion. `ready` resolves once the hub has actually accepted the
/// peer, so callers observe the routing table entry afterwards. Returns
/// whether the link was established at all. The writer task ends when the
/// hub drops the link handle.
async fn run_link(
    stream: TcpStream,
    remote: PeerId,
    close: watch::Receiver<bool>,
    ctx: &LinkContext,
    ready: Option<oneshot::Sender<Result<PeerId>>>,
) -> bool {
    let (tx, rx) = mpsc::channel(ctx.queue_capacity);
    let (accepted_tx, accepted_rx) = oneshot::channel();
    let up = HubMsg::PeerUp { peer: remote.clone(), tx, accepted: accepted_tx };
    if ctx.hub.send(up).await.is_err() {
        if let Some(reply) = ready {
            let _ = reply.send(Err(Error::Detached));
        }
        return false;
    }
    if !accepted_rx.await.unwrap_or(false) {
        debug!(peer = %remote, "hub rejected the connection");
        if let Some(reply) = ready {
            let _ = reply.send(Err(Error::network(format!("peering with {remote} rejected"))));
        }
        return false;
    }
    if let Some(reply) = ready {
        let _ = reply.send(Ok(remote.clone()));
    }
    let (read_half, write_half) = stream.into_split();
    tokio::spawn(run_writer(write_half, rx, ctx.max_frame));
    run_reader(read_half, remote, close, ctx).await;
    true
}

/// Bind a listener and spawn its accept loop. Returns the bound port.
pub(crate) async fn listen(ctx: LinkContext, host: IpAddr, port: u16) -> Result<u16> {
    let listener = TcpListener::bind((host, port)).await?;
    let bound = listener.local_addr()?.port();
    info!(%host, port = bound, "listening for peers");
    tokio::spawn(accept_loop(listener, ctx));
    Ok(bound)
}

async fn accept_loop(listener: TcpListener, ctx: LinkContext) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(run_inbound(stream, addr, ctx.clone()));
                },
                Err(error) => warn!(%error, "accepting a connection failed"),
            },
        }
    }
    debug!("listener stopped");
}

async fn run_inbound(mut stream: TcpStream, addr: SocketAddr, ctx: LinkContext) {
    stream.set_nodelay(true).ok();
    let greeting = handshake(&mut stream, &ctx.local_id, ctx.max_frame, false);
    let remote = match timeout(ctx.connect_timeout, greeting).await {
        Ok(Ok(remote)) => remote,
        Ok(Err(error)) => {
            debug!(%addr, %error, "inbound handshake failed");
            return;
        },
        Err(_) => {
            debug!(%addr, "inbound handshake timed out");
            return;
        },
    };
    let (close_tx, close_rx) = watch::channel(false);
    let key = addr.to_string();
    ctx.registry.insert(key.clone(), ConnEntry { peer: remote.clone(), close: close_tx });
    run_link(stream, remote, close_rx, &ctx, None).await;
    ctx.registry.remove(&key);
}

async fn connect_and_handshake(
    host: &str,
    port: u16,
    ctx: &LinkContext,
) -> Result<(TcpStream, PeerId)> {
    let connecting = TcpStream::connect((host, port));
    let mut stream = match timeout(ctx.connect_timeout, connecting).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => return Err(error.into()),
        Err(_) => return Err(Error::network(format!("connecting to {host}:{port} timed out"))),
    };
    stream.set_nodelay(true).ok();
    let greeting = handshake(&mut stream, &ctx.local_id, ctx.max_frame, true);
    match timeout(ctx.connect_timeout, greeting).await {
        Ok(Ok(remote)) => Ok((stream, remote)),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(Error::network(format!("handshake with {host}:{port} timed out"))),
    }
}

/// Supervise one outbound peering: dial, run the link, and re-dial after
/// `retry` (plus jitter) for as long as neither the connection nor the
/// endpoint has been closed. The first attempt's outcome goes to `first`.
pub(crate) async fn run_outbound(
    host: String,
    port: u16,
    ctx: LinkContext,
    retry: Option<Duration>,
    close: watch::Receiver<bool>,
    first: oneshot::Sender<Result<PeerId>>,
    registry_key: String,
) {
    let mut first = Some(first);
    let mut close_rx = close;
    loop {
        match connect_and_handshake(&host, port, &ctx).await {
            Ok((stream, remote)) => {
                debug!(host = %host, port, peer = %remote, "outbound link established");
                if let Some(mut entry) = ctx.registry.get_mut(&registry_key) {
                    entry.peer = remote.clone();
                }
                if !run_link(stream, remote, close_rx.clone(), &ctx, first.take()).await {
                    break;
                }
            },
            Err(error) => {
                if let Some(reply) = first.take() {
                    let _ = reply.send(Err(error));
                    ctx.registry.remove(&registry_key);
                    return;
                }
                debug!(host = %host, port, %error, "reconnect attempt failed");
            },
        }
        if *close_rx.borrow() || *ctx.shutdown.borrow() {
            break;
        }
        let Some(retry) = retry else { break };
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        info!(host = %host, port, "will retry peering in {:?}", retry + jitter);
        let mut shutdown = ctx.shutdown.clone();
        tokio::select! {
            _ = close_rx.changed() => break,
            _ = shutdown.changed() => break,
            () = sleep(retry + jitter) => {},
        }
    }
    ctx.registry.remove(&registry_key);
}
