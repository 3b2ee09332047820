//! Per-user-connection read/write loops

use super::state::Connection;
use super::ConnError;
use crate::protocol::Signal;
use crate::tunnel::Frame;
use crate::MAX_FRAME_PAYLOAD;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Why a handler stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// User socket reported EOF
    LocalEof,
    /// User socket read failed
    ReadError,
    /// User socket write failed
    WriteError,
    /// Peer sent CLOSE_CONN (or confirmed ours)
    PeerClosed,
    /// Reorder buffer overflowed
    ReorderOverflow,
    /// Engine channels went away
    ChannelClosed,
}

/// Handler for one live user connection.
///
/// Owns the user TCP socket, the private queue of frames dispatched to this
/// cid, and both sequence counters. The outbound loop turns socket reads into
/// data frames on the shared egress channel; the inbound loop reassembles
/// frames from the private queue back into the socket.
pub struct ConnHandler {
    cid: u16,
    stream: TcpStream,
    inbound: mpsc::Receiver<Frame>,
    egress: mpsc::Sender<Frame>,
    close_tx: mpsc::Sender<u16>,
}

impl ConnHandler {
    pub fn new(
        cid: u16,
        stream: TcpStream,
        inbound: mpsc::Receiver<Frame>,
        egress: mpsc::Sender<Frame>,
        close_tx: mpsc::Sender<u16>,
    ) -> Self {
        Self {
            cid,
            stream,
            inbound,
            egress,
            close_tx,
        }
    }

    /// Run as the originating side: ask the peer to create its end, wait for
    /// the ack, then start the loops. A missing or wrong ack tears the user
    /// socket down without starting them.
    pub async fn originate(mut self) {
        let mut conn = Connection::new(self.cid);

        match self.handshake().await {
            Ok(()) => conn.establish(),
            Err(e) => {
                warn!(cid = self.cid, error = %e, "connection create failed");
                let _ = self.close_tx.send(self.cid).await;
                return;
            }
        }
        debug!(cid = self.cid, "peer connection created");
        self.run(conn).await;
    }

    /// Run as the accepting side: the peer asked us to create this
    /// connection, so confirm before any data frames can follow for the cid.
    pub async fn accept(self) {
        let conn = Connection::established(self.cid);

        if self
            .egress
            .send(Frame::control(self.cid, Signal::CreateConnOk))
            .await
            .is_err()
        {
            let _ = self.close_tx.send(self.cid).await;
            return;
        }
        self.run(conn).await;
    }

    async fn handshake(&mut self) -> Result<(), ConnError> {
        self.egress
            .send(Frame::control(self.cid, Signal::CreateConn))
            .await
            .map_err(|_| ConnError::ChannelClosed)?;
        debug!(cid = self.cid, "requested peer connection");

        match self.inbound.recv().await {
            Some(f) if f.is_control() && matches!(f.signal(), Ok(Signal::CreateConnOk)) => Ok(()),
            Some(_) => Err(ConnError::CreateRejected(self.cid)),
            None => Err(ConnError::ChannelClosed),
        }
    }

    async fn run(self, conn: Connection) {
        let Self {
            cid,
            stream,
            inbound,
            egress,
            close_tx,
        } = self;

        let (rd, wr) = stream.into_split();
        let mut outbound = tokio::spawn(outbound_loop(cid, rd, egress.clone()));
        let mut inbound = tokio::spawn(inbound_loop(conn, wr, inbound, egress.clone()));

        // whichever loop finishes first decides the close; the other is torn
        // down with it so both socket halves drop together
        let reason = tokio::select! {
            r = &mut outbound => {
                inbound.abort();
                r.unwrap_or(CloseReason::ReadError)
            }
            r = &mut inbound => {
                outbound.abort();
                r.unwrap_or(CloseReason::WriteError)
            }
        };

        if reason != CloseReason::PeerClosed {
            let _ = egress.send(Frame::control(cid, Signal::CloseConn)).await;
        }
        debug!(cid, ?reason, "connection handler finished");
        let _ = close_tx.send(cid).await;
    }
}

/// User socket → egress channel. Each non-empty read becomes one data frame
/// with the next tx sequence number.
async fn outbound_loop(cid: u16, mut rd: OwnedReadHalf, egress: mpsc::Sender<Frame>) -> CloseReason {
    let mut tx_seq: u32 = 1;
    let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => return CloseReason::LocalEof,
            Ok(n) => {
                let frame = Frame::data(cid, tx_seq, Bytes::copy_from_slice(&buf[..n]));
                tx_seq += 1;
                if egress.send(frame).await.is_err() {
                    return CloseReason::ChannelClosed;
                }
            }
            Err(e) => {
                debug!(cid, error = %e, "user socket read failed");
                return CloseReason::ReadError;
            }
        }
    }
}

/// Private queue → user socket, delivering strictly in sequence order.
async fn inbound_loop(
    mut conn: Connection,
    mut wr: OwnedWriteHalf,
    mut inbound: mpsc::Receiver<Frame>,
    egress: mpsc::Sender<Frame>,
) -> CloseReason {
    let cid = conn.cid();
    while let Some(frame) = inbound.recv().await {
        if frame.is_control() {
            match frame.signal() {
                Ok(Signal::CloseConn) => {
                    conn.close();
                    let _ = egress.send(Frame::control(cid, Signal::CloseConnOk)).await;
                    return CloseReason::PeerClosed;
                }
                Ok(Signal::CloseConnOk) => {
                    conn.close();
                    return CloseReason::PeerClosed;
                }
                Ok(other) => {
                    warn!(cid, signal = ?other, "unexpected control signal, dropping");
                }
                Err(e) => {
                    warn!(cid, error = %e, "undecodable control signal, dropping");
                }
            }
            continue;
        }

        let batch = match conn.accept(frame.seq, frame.payload) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(cid, error = %e, "closing connection");
                return CloseReason::ReorderOverflow;
            }
        };
        for payload in batch {
            if let Err(e) = wr.write_all(&payload).await {
                debug!(cid, error = %e, "user socket write failed");
                return CloseReason::WriteError;
            }
        }
    }
    CloseReason::ChannelClosed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Connected pair: one side plays the user socket, the other the user
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn test_peer_close_confirms_and_tears_down() {
        let (user_side, mut user_peer) = socket_pair().await;
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (egress_tx, mut egress_rx) = mpsc::channel(8);
        let (close_tx, mut close_rx) = mpsc::channel(8);

        let handler = ConnHandler::new(5, user_side, inbound_rx, egress_tx, close_tx);
        tokio::spawn(handler.accept());

        // the accepting side confirms the create before anything else
        let ack = egress_rx.recv().await.unwrap();
        assert_eq!(ack.signal().unwrap(), Signal::CreateConnOk);

        inbound_tx
            .send(Frame::control(5, Signal::CloseConn))
            .await
            .unwrap();

        // the close is confirmed, not echoed
        let confirm = timeout(Duration::from_secs(5), egress_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(confirm.is_control());
        assert_eq!(confirm.conn_id, 5);
        assert_eq!(confirm.signal().unwrap(), Signal::CloseConnOk);

        // the manager is asked to reap the cid
        let reaped = timeout(Duration::from_secs(5), close_rx.recv())
            .await
            .unwrap();
        assert_eq!(reaped, Some(5));

        // and the user socket is gone
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), user_peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_local_eof_sends_close_conn() {
        let (user_side, user_peer) = socket_pair().await;
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (egress_tx, mut egress_rx) = mpsc::channel(8);
        let (close_tx, mut close_rx) = mpsc::channel(8);

        let handler = ConnHandler::new(9, user_side, inbound_rx, egress_tx, close_tx);
        tokio::spawn(handler.accept());

        let ack = egress_rx.recv().await.unwrap();
        assert_eq!(ack.signal().unwrap(), Signal::CreateConnOk);

        // user hangs up
        drop(user_peer);

        let close = timeout(Duration::from_secs(5), egress_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(close.is_control());
        assert_eq!(close.conn_id, 9);
        assert_eq!(close.signal().unwrap(), Signal::CloseConn);

        let reaped = timeout(Duration::from_secs(5), close_rx.recv())
            .await
            .unwrap();
        assert_eq!(reaped, Some(9));

        // the inbound queue stayed open for the handler's whole lifetime
        drop(inbound_tx);
    }

    #[tokio::test]
    async fn test_create_rejection_closes_user_socket() {
        let (user_side, mut user_peer) = socket_pair().await;
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (egress_tx, mut egress_rx) = mpsc::channel(8);
        let (close_tx, mut close_rx) = mpsc::channel(8);

        let handler = ConnHandler::new(3, user_side, inbound_rx, egress_tx, close_tx);
        tokio::spawn(handler.originate());

        let req = egress_rx.recv().await.unwrap();
        assert_eq!(req.signal().unwrap(), Signal::CreateConn);

        // anything but the ack fails the create
        inbound_tx
            .send(Frame::control(3, Signal::CloseConn))
            .await
            .unwrap();

        let reaped = timeout(Duration::from_secs(5), close_rx.recv())
            .await
            .unwrap();
        assert_eq!(reaped, Some(3));

        // the loops never started and the user socket is closed
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), user_peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
