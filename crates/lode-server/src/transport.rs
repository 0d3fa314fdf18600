//! TCP transport between member processes.
//!
//! Each frame is a 4-byte big-endian length followed by an encoded
//! [`Envelope`]. A member keeps one outbound connection per peer, fed by a
//! writer task, so messages to the same peer leave in the order they were
//! queued. Inbound connections are accepted on the member's bind address
//! and every decoded envelope lands in the member's inbox.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use lode_cluster::{Envelope, MAX_MESSAGE_SIZE};
use lode_grid::{Inbox, Transport, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Writes one length-prefixed envelope.
pub(crate) async fn write_frame<W>(w: &mut W, envelope: &Envelope) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let data = envelope
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = data.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&data).await?;
    Ok(())
}

/// Reads one length-prefixed envelope, rejecting oversized frames before
/// allocating for them.
pub(crate) async fn read_frame<R>(r: &mut R) -> io::Result<Envelope>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {len} exceeds limit {MAX_MESSAGE_SIZE}"),
        ));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    Envelope::decode(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

type Peers = Arc<DashMap<SocketAddr, mpsc::UnboundedSender<Envelope>>>;

/// Sends envelopes to peers over TCP.
#[derive(Clone, Default)]
pub struct TcpTransport {
    peers: Peers,
}

impl TcpTransport {
    /// Listens on `addr` and returns the transport, the inbox and the
    /// address actually bound (useful with port 0).
    pub async fn bind(addr: SocketAddr) -> io::Result<(Self, Inbox, SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let (tx, inbox) = mpsc::unbounded_channel();
        let accept = tokio::spawn(run_listener(listener, tx));
        info!(addr = %local, "member transport listening");
        Ok((Self::default(), inbox, local, accept))
    }

    fn writer_for(&self, to: SocketAddr) -> mpsc::UnboundedSender<Envelope> {
        self.peers
            .entry(to)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_writer(to, rx, Arc::clone(&self.peers)));
                tx
            })
            .clone()
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: SocketAddr, envelope: Envelope) -> Result<(), TransportError> {
        match self.writer_for(to).send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(envelope)) => {
                // the writer died between lookup and send; one fresh try
                self.peers.remove_if(&to, |_, tx| tx.is_closed());
                self.writer_for(to)
                    .send(envelope)
                    .map_err(|_| TransportError::Disconnected(to))
            }
        }
    }
}

async fn run_writer(to: SocketAddr, mut rx: mpsc::UnboundedReceiver<Envelope>, peers: Peers) {
    match TcpStream::connect(to).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            let mut w = BufWriter::new(stream);
            if let Err(e) = drain(&mut w, &mut rx).await {
                debug!(peer = %to, "connection lost: {e}");
            }
        }
        Err(e) => debug!(peer = %to, "connect failed: {e}"),
    }
    // queued messages are lost; the next send opens a new connection
    drop(rx);
    peers.remove_if(&to, |_, tx| tx.is_closed());
}

async fn drain(
    w: &mut BufWriter<TcpStream>,
    rx: &mut mpsc::UnboundedReceiver<Envelope>,
) -> io::Result<()> {
    while let Some(envelope) = rx.recv().await {
        write_frame(w, &envelope).await?;
        while let Ok(envelope) = rx.try_recv() {
            write_frame(w, &envelope).await?;
        }
        w.flush().await?;
    }
    Ok(())
}

async fn run_listener(listener: TcpListener, inbox: mpsc::UnboundedSender<Envelope>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                trace!(%peer, "accepted member connection");
                tokio::spawn(run_reader(stream, peer, inbox.clone()));
            }
            Err(e) => debug!("accept failed: {e}"),
        }
        if inbox.is_closed() {
            break;
        }
    }
}

async fn run_reader(stream: TcpStream, peer: SocketAddr, inbox: mpsc::UnboundedSender<Envelope>) {
    let mut r = BufReader::new(stream);
    loop {
        match read_frame(&mut r).await {
            Ok(envelope) => {
                if inbox.send(envelope).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                debug!(%peer, "dropping connection: {e}");
                break;
            }
        }
    }
}
