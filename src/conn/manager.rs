//! Connection table ownership, id allocation and ingress dispatch

use super::handler::ConnHandler;
use crate::protocol::Signal;
use crate::tunnel::Frame;
use crate::MAX_CONN_ID;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Depth of each handler's private inbound queue
const CONN_QUEUE_DEPTH: usize = 256;

/// Which side of the link this manager serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerRole {
    /// Accepts user sockets locally and originates creates
    Client,
    /// Dials the upstream target when the peer asks for a create
    Server,
}

/// The connection table: live cids mapped to their handlers' inbound queues.
///
/// Shared by the manager's dispatcher, acceptor and reaper tasks. The lock
/// covers lookups and edits only, never a channel send or socket operation,
/// so a slow connection cannot stall the table for its siblings.
struct ConnTable {
    next_cid: u16,
    conns: HashMap<u16, mpsc::Sender<Frame>>,
}

impl ConnTable {
    fn new() -> Self {
        Self {
            next_cid: 1,
            conns: HashMap::new(),
        }
    }

    /// Next free cid: counter from 1, wraps at `MAX_CONN_ID`, probing past
    /// ids still live in the table.
    fn alloc_cid(&mut self) -> Option<u16> {
        if self.conns.len() >= MAX_CONN_ID as usize {
            return None;
        }
        loop {
            let cid = self.next_cid;
            self.next_cid = if self.next_cid == MAX_CONN_ID {
                1
            } else {
                self.next_cid + 1
            };
            if !self.conns.contains_key(&cid) {
                return Some(cid);
            }
        }
    }
}

type SharedTable = Arc<Mutex<ConnTable>>;

/// Owner of the connection table.
///
/// Runs three sibling tasks so no single stalled connection can starve the
/// others: an acceptor turning fresh user sockets into handlers, a
/// dispatcher routing ingress frames by cid, and a reaper consuming close
/// requests. Handlers reach the table exclusively through the close channel.
pub struct ConnManager {
    role: ManagerRole,
    accept_rx: Option<mpsc::Receiver<TcpStream>>,
    upstream: Option<String>,
    ingress_rx: mpsc::Receiver<Frame>,
    egress_tx: mpsc::Sender<Frame>,
    close_tx: mpsc::Sender<u16>,
    close_rx: mpsc::Receiver<u16>,
}

impl ConnManager {
    /// Client-side manager: `accept_rx` feeds freshly accepted user sockets.
    pub fn client(
        accept_rx: mpsc::Receiver<TcpStream>,
        ingress_rx: mpsc::Receiver<Frame>,
        egress_tx: mpsc::Sender<Frame>,
    ) -> Self {
        Self::new(ManagerRole::Client, Some(accept_rx), None, ingress_rx, egress_tx)
    }

    /// Server-side manager: dials `upstream` for every CREATE_CONN.
    pub fn server(
        upstream: String,
        ingress_rx: mpsc::Receiver<Frame>,
        egress_tx: mpsc::Sender<Frame>,
    ) -> Self {
        Self::new(ManagerRole::Server, None, Some(upstream), ingress_rx, egress_tx)
    }

    fn new(
        role: ManagerRole,
        accept_rx: Option<mpsc::Receiver<TcpStream>>,
        upstream: Option<String>,
        ingress_rx: mpsc::Receiver<Frame>,
        egress_tx: mpsc::Sender<Frame>,
    ) -> Self {
        let (close_tx, close_rx) = mpsc::channel(CONN_QUEUE_DEPTH);
        Self {
            role,
            accept_rx,
            upstream,
            ingress_rx,
            egress_tx,
            close_tx,
            close_rx,
        }
    }

    /// Run the dispatcher in this task, with the acceptor and the close
    /// reaper as siblings, until the ingress channel closes (every tunnel
    /// worker gone and the engine shutting down).
    pub async fn run(self) {
        let ConnManager {
            role,
            accept_rx,
            upstream,
            ingress_rx,
            egress_tx,
            close_tx,
            close_rx,
        } = self;
        info!(?role, "connection manager running");

        let table: SharedTable = Arc::new(Mutex::new(ConnTable::new()));

        let reaper = tokio::spawn(close_reaper(Arc::clone(&table), close_rx));
        let acceptor = accept_rx.map(|accept_rx| {
            tokio::spawn(accept_loop(
                Arc::clone(&table),
                accept_rx,
                egress_tx.clone(),
                close_tx.clone(),
            ))
        });

        dispatch_loop(Arc::clone(&table), ingress_rx, upstream, egress_tx, close_tx).await;

        if let Some(handle) = acceptor {
            handle.abort();
        }
        reaper.abort();
        let live = table.lock().await.conns.len();
        info!(live, "connection manager stopped");
    }
}

/// Freshly accepted user sockets → new cids and originating handlers
async fn accept_loop(
    table: SharedTable,
    mut accept_rx: mpsc::Receiver<TcpStream>,
    egress_tx: mpsc::Sender<Frame>,
    close_tx: mpsc::Sender<u16>,
) {
    while let Some(stream) = accept_rx.recv().await {
        let (tx, rx) = mpsc::channel(CONN_QUEUE_DEPTH);
        let cid = {
            let mut table = table.lock().await;
            match table.alloc_cid() {
                Some(cid) => {
                    table.conns.insert(cid, tx);
                    cid
                }
                None => {
                    warn!("connection table full, dropping new user connection");
                    continue;
                }
            }
        };
        let handler = ConnHandler::new(cid, stream, rx, egress_tx.clone(), close_tx.clone());
        tokio::spawn(handler.originate());
        debug!(cid, "registered user connection");
    }
}

/// Inbound frames → the owning handler's private queue
async fn dispatch_loop(
    table: SharedTable,
    mut ingress_rx: mpsc::Receiver<Frame>,
    upstream: Option<String>,
    egress_tx: mpsc::Sender<Frame>,
    close_tx: mpsc::Sender<u16>,
) {
    while let Some(frame) = ingress_rx.recv().await {
        if frame.is_control() && matches!(frame.signal(), Ok(Signal::CreateConn)) {
            create_peer(&table, frame.conn_id, upstream.as_deref(), &egress_tx, &close_tx).await;
            continue;
        }

        let target = table.lock().await.conns.get(&frame.conn_id).cloned();
        match target {
            Some(tx) => {
                if tx.send(frame).await.is_err() {
                    // handler already stopping; the reaper will remove it
                }
            }
            None => {
                warn!(cid = frame.conn_id, "frame for unknown connection, dropping");
            }
        }
    }
}

/// Server side: dial the upstream for a peer-requested connection. The cid
/// is registered before the dial completes, so data frames arriving
/// meanwhile queue up behind the handler instead of being dropped.
async fn create_peer(
    table: &SharedTable,
    cid: u16,
    upstream: Option<&str>,
    egress_tx: &mpsc::Sender<Frame>,
    close_tx: &mpsc::Sender<u16>,
) {
    let Some(upstream) = upstream else {
        warn!(cid, "create signal on the originating side, dropping");
        return;
    };

    let (tx, rx) = mpsc::channel(CONN_QUEUE_DEPTH);
    {
        let mut table = table.lock().await;
        if table.conns.contains_key(&cid) {
            warn!(cid, "create for a live connection id, dropping");
            return;
        }
        table.conns.insert(cid, tx);
    }

    let upstream = upstream.to_string();
    let egress = egress_tx.clone();
    let close_tx = close_tx.clone();
    tokio::spawn(async move {
        match TcpStream::connect(&upstream).await {
            Ok(stream) => {
                info!(cid, %upstream, "created upstream connection");
                ConnHandler::new(cid, stream, rx, egress, close_tx).accept().await;
            }
            Err(e) => {
                error!(cid, %upstream, error = %e, "upstream dial failed");
                let _ = egress.send(Frame::control(cid, Signal::CloseConn)).await;
                let _ = close_tx.send(cid).await;
            }
        }
    });
}

/// Close requests from handlers → table removal
async fn close_reaper(table: SharedTable, mut close_rx: mpsc::Receiver<u16>) {
    while let Some(cid) = close_rx.recv().await {
        if table.lock().await.conns.remove(&cid).is_some() {
            debug!(cid, "connection removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_allocation_counts_up() {
        let mut table = ConnTable::new();
        assert_eq!(table.alloc_cid(), Some(1));
        assert_eq!(table.alloc_cid(), Some(2));
        assert_eq!(table.alloc_cid(), Some(3));
    }

    #[test]
    fn test_cid_wraps_at_limit() {
        let mut table = ConnTable::new();
        table.next_cid = MAX_CONN_ID;
        assert_eq!(table.alloc_cid(), Some(MAX_CONN_ID));
        assert_eq!(table.alloc_cid(), Some(1));
    }

    #[test]
    fn test_cid_probe_skips_live_ids() {
        let mut table = ConnTable::new();
        let (tx, _rx) = mpsc::channel(1);
        table.conns.insert(1, tx.clone());
        table.conns.insert(2, tx);
        assert_eq!(table.alloc_cid(), Some(3));
    }

    #[test]
    fn test_full_table_refuses() {
        let mut table = ConnTable::new();
        let (tx, _rx) = mpsc::channel(1);
        for cid in 1..=MAX_CONN_ID {
            table.conns.insert(cid, tx.clone());
        }
        assert_eq!(table.alloc_cid(), None);
    }
}
