//! One tunnel TCP connection: bidirectional frame pumps, heartbeat, stats

use super::frame::{Frame, FRAME_HEADER_SIZE};
use super::TunnelError;
use crate::protocol::{
    ProtocolError, Signal, CLOSE_TUNNEL_FRAME, HEARTBEAT_FRAME, HEARTBEAT_INTERVAL_SECS,
    STAT_REPORT_INTERVAL_SECS,
};
use crate::stats::Statistic;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// Egress queue shared by every worker: whichever one wakes first takes the
/// next frame.
pub type SharedEgress = Arc<Mutex<mpsc::Receiver<Frame>>>;

/// Which side of the link this worker runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Dials the tunnel; receiving CREATE_CONN here is a protocol error
    Client,
    /// Accepted the tunnel; forwards CREATE_CONN to the connection manager
    Server,
}

/// Owner of one tunnel TCP connection.
///
/// The outbound pump drains the shared egress queue onto the wire and carries
/// the heartbeat; the inbound pump reads exact frames off the wire and feeds
/// the ingress channel. Either pump failing ends the worker; a supervisor may
/// start it again.
pub struct TunnelWorker {
    role: WorkerRole,
    dial: Option<(String, String)>,
    egress: SharedEgress,
    ingress: mpsc::Sender<Frame>,
    cancel: broadcast::Sender<()>,
    heartbeat_interval: Duration,
    stat_interval: Duration,
}

impl TunnelWorker {
    /// Client-side worker dialing `remote_addr` from `local_addr` with an
    /// ephemeral port.
    pub fn connect(
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
        egress: SharedEgress,
        ingress: mpsc::Sender<Frame>,
        cancel: broadcast::Sender<()>,
    ) -> Self {
        Self {
            role: WorkerRole::Client,
            dial: Some((local_addr.into(), remote_addr.into())),
            egress,
            ingress,
            cancel,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            stat_interval: Duration::from_secs(STAT_REPORT_INTERVAL_SECS),
        }
    }

    /// Server-side worker for a tunnel the listener already accepted; run it
    /// with [`TunnelWorker::run_on`].
    pub fn accept(
        egress: SharedEgress,
        ingress: mpsc::Sender<Frame>,
        cancel: broadcast::Sender<()>,
    ) -> Self {
        Self {
            role: WorkerRole::Server,
            dial: None,
            egress,
            ingress,
            cancel,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            stat_interval: Duration::from_secs(STAT_REPORT_INTERVAL_SECS),
        }
    }

    /// Override the keep-alive period (protocol default 300 s)
    pub fn heartbeat_interval(mut self, period: Duration) -> Self {
        self.heartbeat_interval = period;
        self
    }

    /// Override the traffic-report period (default 30 s)
    pub fn stat_interval(mut self, period: Duration) -> Self {
        self.stat_interval = period;
        self
    }

    /// Dial the remote endpoint and pump frames until the tunnel ends.
    pub async fn start(&self) -> Result<(), TunnelError> {
        // subscribe before dialing so a cancellation during the dial still
        // reaches the pumps
        let cancel_rx = self.cancel.subscribe();

        let (local, remote) = self
            .dial
            .as_ref()
            .ok_or_else(|| TunnelError::Resolve("worker has no dial target".to_string()))?;

        let remote_addr = resolve(remote).await?;
        let local_addr = lookup_host((local.as_str(), 0))
            .await?
            .find(|a| a.is_ipv4() == remote_addr.is_ipv4())
            .ok_or_else(|| TunnelError::Resolve(local.clone()))?;

        let socket = if remote_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(local_addr)?;
        let stream = socket.connect(remote_addr).await?;

        info!(
            local = %stream.local_addr()?,
            remote = %stream.peer_addr()?,
            "tunnel established"
        );
        self.pump(stream, cancel_rx).await
    }

    /// Pump frames over an already-established tunnel connection.
    pub async fn run_on(&self, stream: TcpStream) -> Result<(), TunnelError> {
        let cancel_rx = self.cancel.subscribe();
        self.pump(stream, cancel_rx).await
    }

    async fn pump(
        &self,
        stream: TcpStream,
        cancel_rx: broadcast::Receiver<()>,
    ) -> Result<(), TunnelError> {
        stream.set_nodelay(true).ok();
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        let (rd, wr) = stream.into_split();
        let stats = Arc::new(Statistic::new());

        let mut outbound = tokio::spawn(outbound_pump(
            wr,
            self.egress.clone(),
            cancel_rx,
            Arc::clone(&stats),
            self.heartbeat_interval,
        ));
        let mut inbound = tokio::spawn(inbound_pump(
            rd,
            self.role,
            self.ingress.clone(),
            Arc::clone(&stats),
        ));
        let reporter = tokio::spawn(report_loop(
            Arc::clone(&stats),
            self.stat_interval,
            local,
            peer,
        ));

        // the first pump to stop takes the tunnel down with it
        let result = tokio::select! {
            r = &mut outbound => {
                inbound.abort();
                flatten(r)
            }
            r = &mut inbound => {
                outbound.abort();
                flatten(r)
            }
        };
        reporter.abort();

        debug!(
            ?local,
            ?peer,
            sent = stats.sent_bytes(),
            received = stats.received_bytes(),
            "tunnel worker finished"
        );
        result
    }
}

fn flatten(
    joined: Result<Result<(), TunnelError>, tokio::task::JoinError>,
) -> Result<(), TunnelError> {
    joined.unwrap_or_else(|e| Err(TunnelError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))))
}

async fn resolve(addr: &str) -> Result<SocketAddr, TunnelError> {
    lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| TunnelError::Resolve(addr.to_string()))
}

/// Egress queue / heartbeat timer / cancellation → wire
async fn outbound_pump(
    mut wr: OwnedWriteHalf,
    egress: SharedEgress,
    mut cancel: broadcast::Receiver<()>,
    stats: Arc<Statistic>,
    heartbeat_every: Duration,
) -> Result<(), TunnelError> {
    let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    loop {
        tokio::select! {
            frame = async { egress.lock().await.recv().await } => {
                match frame {
                    Some(frame) => {
                        let bytes = frame.encode()?;
                        wr.write_all(&bytes).await?;
                        stats.add_sent(bytes.len() as u64);
                        debug!(cid = frame.conn_id, seq = frame.seq, len = frame.payload.len(), "frame sent");
                    }
                    None => return Ok(()),
                }
            }
            _ = heartbeat.tick() => {
                wr.write_all(&HEARTBEAT_FRAME).await?;
                debug!("heartbeat sent");
            }
            _ = cancelled(&mut cancel) => {
                wr.write_all(&CLOSE_TUNNEL_FRAME).await?;
                info!("close-tunnel sent, worker shutting down");
                return Ok(());
            }
        }
    }
}

/// Resolves once cancellation is requested; never resolves if the engine
/// runs without a cancellation sender.
async fn cancelled(cancel: &mut broadcast::Receiver<()>) {
    loop {
        match cancel.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Wire → ingress channel. Headers and payloads are read in full; a stream
/// ending mid-frame is a transport error, between frames a clean close.
async fn inbound_pump(
    mut rd: OwnedReadHalf,
    role: WorkerRole,
    ingress: mpsc::Sender<Frame>,
    stats: Arc<Statistic>,
) -> Result<(), TunnelError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    loop {
        match rd.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("tunnel closed by peer");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let hdr = Frame::decode_header(&header)?;
        if hdr.is_control() {
            match hdr.signal()? {
                Signal::Heartbeat => {
                    debug!("heartbeat received");
                }
                Signal::CloseTunnel => {
                    info!("peer closed the tunnel");
                    return Ok(());
                }
                Signal::CreateConn if role == WorkerRole::Client => {
                    warn!(cid = hdr.conn_id, "create signal on the originating side");
                    return Err(ProtocolError::WrongSide(Signal::CreateConn).into());
                }
                signal => {
                    debug!(cid = hdr.conn_id, ?signal, "control frame forwarded");
                    ingress
                        .send(Frame::control(hdr.conn_id, signal))
                        .await
                        .map_err(|_| TunnelError::ChannelClosed)?;
                }
            }
            continue;
        }

        let mut payload = vec![0u8; hdr.length as usize];
        rd.read_exact(&mut payload).await?;
        stats.add_received(hdr.length as u64);
        ingress
            .send(Frame::data(hdr.conn_id, hdr.seq, payload.into()))
            .await
            .map_err(|_| TunnelError::ChannelClosed)?;
    }
}

async fn report_loop(
    stats: Arc<Statistic>,
    every: Duration,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
) {
    let mut tick = interval_at(Instant::now() + every, every);
    loop {
        tick.tick().await;
        info!(
            ?local,
            ?peer,
            sent_bytes = stats.sent_bytes(),
            sent_rate = stats.send_rate(),
            received_bytes = stats.received_bytes(),
            receive_rate = stats.receive_rate(),
            "tunnel traffic report"
        );
    }
}
