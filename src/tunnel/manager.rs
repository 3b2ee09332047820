//! Work-mode expansion and tunnel worker supervision

use super::worker::{SharedEgress, TunnelWorker};
use super::{Frame, TunnelError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How local and remote addresses combine into tunnels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkMode {
    /// Pair local and remote addresses index-wise, one tunnel per pair
    Biunique,
    /// One tunnel per (local, remote) combination
    Overlap,
    /// Biunique with `fanout` tunnels per pair
    MultiBiunique,
    /// Overlap with `fanout` tunnels per pair
    MultiOverlap,
}

impl Default for WorkMode {
    fn default() -> Self {
        WorkMode::Biunique
    }
}

/// Restart behavior for a failed worker
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Relaunch attempts before giving up; `None` is unbounded
    pub max_retries: Option<u32>,
    /// Pause between relaunches
    pub retry_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Expand a work mode over the address lists into (local, remote) dial pairs.
pub fn expand_pairs(
    mode: WorkMode,
    fanout: usize,
    locals: &[String],
    remotes: &[String],
) -> Result<Vec<(String, String)>, TunnelError> {
    let base: Vec<(String, String)> = match mode {
        WorkMode::Biunique | WorkMode::MultiBiunique => {
            if locals.len() != remotes.len() {
                return Err(TunnelError::MismatchedAddrs {
                    locals: locals.len(),
                    remotes: remotes.len(),
                });
            }
            locals.iter().cloned().zip(remotes.iter().cloned()).collect()
        }
        WorkMode::Overlap | WorkMode::MultiOverlap => locals
            .iter()
            .flat_map(|l| remotes.iter().map(move |r| (l.clone(), r.clone())))
            .collect(),
    };

    let k = match mode {
        WorkMode::MultiBiunique | WorkMode::MultiOverlap => fanout.max(1),
        WorkMode::Biunique | WorkMode::Overlap => 1,
    };

    Ok(base
        .into_iter()
        .flat_map(|pair| std::iter::repeat(pair).take(k))
        .collect())
}

/// Spawns and supervises the client-side tunnel workers.
pub struct TunnelManager {
    mode: WorkMode,
    fanout: usize,
    local_addrs: Vec<String>,
    remote_addrs: Vec<String>,
    egress: SharedEgress,
    ingress: mpsc::Sender<Frame>,
    cancel: broadcast::Sender<()>,
    restart: RestartPolicy,
}

impl TunnelManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: WorkMode,
        fanout: usize,
        local_addrs: Vec<String>,
        remote_addrs: Vec<String>,
        egress: SharedEgress,
        ingress: mpsc::Sender<Frame>,
        cancel: broadcast::Sender<()>,
        restart: RestartPolicy,
    ) -> Self {
        Self {
            mode,
            fanout,
            local_addrs,
            remote_addrs,
            egress,
            ingress,
            cancel,
            restart,
        }
    }

    /// Spawn one supervised worker per expanded pair.
    pub fn start(&self) -> Result<Vec<JoinHandle<()>>, TunnelError> {
        info!(mode = ?self.mode, "work mode");
        let pairs = expand_pairs(self.mode, self.fanout, &self.local_addrs, &self.remote_addrs)?;

        let handles = pairs
            .into_iter()
            .map(|(local, remote)| {
                info!(%local, %remote, "spawning tunnel worker");
                let worker = TunnelWorker::connect(
                    local,
                    remote,
                    self.egress.clone(),
                    self.ingress.clone(),
                    self.cancel.clone(),
                );
                tokio::spawn(supervise(worker, self.restart, self.cancel.subscribe()))
            })
            .collect();
        Ok(handles)
    }
}

/// Run a worker, relaunching it per policy until it is cancelled or runs
/// out of retries.
async fn supervise(
    worker: TunnelWorker,
    policy: RestartPolicy,
    mut cancelled: broadcast::Receiver<()>,
) {
    let mut attempts: u32 = 0;
    loop {
        if cancel_requested(&mut cancelled) {
            break;
        }

        match worker.start().await {
            Ok(()) => info!("tunnel ended"),
            Err(e) => warn!(error = %e, "tunnel worker failed"),
        }
        if cancel_requested(&mut cancelled) {
            break;
        }

        attempts += 1;
        if let Some(max) = policy.max_retries {
            if attempts > max {
                error!(attempts, "tunnel worker exhausted its retries");
                break;
            }
        }
        tokio::time::sleep(policy.retry_delay).await;
    }
}

fn cancel_requested(rx: &mut broadcast::Receiver<()>) -> bool {
    matches!(
        rx.try_recv(),
        Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_biunique_pairs_indexwise() {
        let pairs = expand_pairs(
            WorkMode::Biunique,
            2,
            &addrs(&["10.0.0.1", "10.0.0.2"]),
            &addrs(&["a:1", "b:2"]),
        )
        .unwrap();
        assert_eq!(
            pairs,
            vec![
                ("10.0.0.1".to_string(), "a:1".to_string()),
                ("10.0.0.2".to_string(), "b:2".to_string()),
            ]
        );
    }

    #[test]
    fn test_biunique_rejects_mismatched_lists() {
        let err = expand_pairs(
            WorkMode::Biunique,
            1,
            &addrs(&["10.0.0.1"]),
            &addrs(&["a:1", "b:2"]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TunnelError::MismatchedAddrs { locals: 1, remotes: 2 }
        ));
    }

    #[test]
    fn test_overlap_is_cartesian() {
        let pairs = expand_pairs(
            WorkMode::Overlap,
            9,
            &addrs(&["l1", "l2"]),
            &addrs(&["r1", "r2"]),
        )
        .unwrap();
        assert_eq!(pairs.len(), 4);
        // fanout only applies to the multi modes
        assert!(pairs.contains(&("l1".to_string(), "r2".to_string())));
    }

    #[test]
    fn test_multi_modes_apply_fanout() {
        let pairs = expand_pairs(
            WorkMode::MultiBiunique,
            3,
            &addrs(&["l1"]),
            &addrs(&["r1"]),
        )
        .unwrap();
        assert_eq!(pairs.len(), 3);

        let pairs = expand_pairs(
            WorkMode::MultiOverlap,
            2,
            &addrs(&["l1", "l2"]),
            &addrs(&["r1", "r2"]),
        )
        .unwrap();
        assert_eq!(pairs.len(), 8);
    }

    #[test]
    fn test_zero_fanout_still_spawns_one() {
        let pairs =
            expand_pairs(WorkMode::MultiBiunique, 0, &addrs(&["l1"]), &addrs(&["r1"])).unwrap();
        assert_eq!(pairs.len(), 1);
    }
}
