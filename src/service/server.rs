use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{IoInterest, ReplicationStreamReceiver};
use crate::replica::ReplicationSlaveManager;
use crate::{AppError, AppResult, FaultKind};

use super::{ReceiverConfig, ServerConfig, Shutdown};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type TcpReceiver<M> = ReplicationStreamReceiver<M, TcpStream>;

/// Idle receivers kept for the next accepted connection, so header buffers
/// and binding slots are allocated once per receiver, not per connection.
pub struct ReceiverPool<M: ReplicationSlaveManager> {
    manager: Arc<M>,
    config: ReceiverConfig,
    idle: Mutex<Vec<TcpReceiver<M>>>,
}

impl<M: ReplicationSlaveManager> ReceiverPool<M> {
    pub fn new(manager: Arc<M>, config: ReceiverConfig) -> Self {
        ReceiverPool {
            manager,
            config,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> TcpReceiver<M> {
        self.idle.lock().pop().unwrap_or_else(|| {
            ReplicationStreamReceiver::new(self.manager.clone(), self.config.clone())
        })
    }

    pub fn release(&self, mut receiver: TcpReceiver<M>) {
        receiver.clear();
        self.idle.lock().push(receiver);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

pub struct ReplicationServer<M: ReplicationSlaveManager> {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    receiver_pool: Arc<ReceiverPool<M>>,
    lease_backoff: Duration,
}

impl<M: ReplicationSlaveManager + 'static> ReplicationServer<M> {
    pub fn new(
        listener: TcpListener,
        manager: Arc<M>,
        config: &ServerConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        ReplicationServer {
            listener,
            limit_connections: Arc::new(Semaphore::new(config.network.max_connection)),
            notify_shutdown,
            shutdown_complete_tx,
            receiver_pool: Arc::new(ReceiverPool::new(manager, config.receiver.clone())),
            lease_backoff: Duration::from_millis(config.receiver.lease_backoff_ms),
        }
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts master connections until accepting fails.
    ///
    /// Every connection is driven by its own task holding one pooled
    /// receiver. Whatever ends the connection (fault, end of stream,
    /// shutdown), the receiver is cleared and goes back to the pool.
    pub async fn run(&self) -> AppResult<()> {
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::IllegalStateError(e.to_string()))?;

            let (socket, peer) = self.accept().await?;
            let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            info!("accepted master connection {} from {}", connection_id, peer);

            let pool = self.receiver_pool.clone();
            let mut shutdown = Shutdown::new(
                self.notify_shutdown.subscribe(),
                self.shutdown_complete_tx.clone(),
            );
            let lease_backoff = self.lease_backoff;

            tokio::spawn(async move {
                let mut receiver = pool.acquire();
                receiver.of(socket);
                if let Err(err) = drive_connection(&mut receiver, &mut shutdown, lease_backoff).await {
                    match err.fault_kind() {
                        FaultKind::ConnectionFault => {
                            info!("master connection {} closed: {}", connection_id, err)
                        }
                        _ => error!("master connection {} faulted: {}", connection_id, err),
                    }
                }
                pool.release(receiver);
                drop(shutdown);
                drop(permit);
            });
        }
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept replication connection error: {}",
                            err
                        )));
                    }
                    warn!("accept failed, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

/// Calls `handle_io` and waits for whatever readiness it asks for, until
/// the connection faults or shutdown is signalled.
async fn drive_connection<M: ReplicationSlaveManager>(
    receiver: &mut TcpReceiver<M>,
    shutdown: &mut Shutdown,
    lease_backoff: Duration,
) -> AppResult<()> {
    loop {
        let interest = receiver.handle_io()?;
        let stream = receiver
            .channel()
            .ok_or_else(|| AppError::IllegalStateError("receiver lost its connection".into()))?;
        let ready = async {
            match interest {
                IoInterest::NeedsRead => stream.readable().await,
                IoInterest::NeedsWrite => stream.writable().await,
                IoInterest::NeedsBackoffRetry => {
                    time::sleep(lease_backoff).await;
                    Ok(())
                }
            }
        };
        tokio::select! {
            res = ready => res?,
            _ = shutdown.recv() => {
                debug!("replication connection exits after shutdown signal");
                return Ok(());
            }
        }
    }
}

/// Serves replication connections on `listener` until `shutdown_signal`
/// resolves, then waits for every connection task to release its receiver.
pub async fn run_server<M, F>(
    listener: TcpListener,
    manager: Arc<M>,
    config: &ServerConfig,
    shutdown_signal: F,
) -> AppResult<()>
where
    M: ReplicationSlaveManager + 'static,
    F: Future,
{
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    let server = ReplicationServer::new(
        listener,
        manager,
        config,
        notify_shutdown.clone(),
        shutdown_complete_tx,
    );
    info!("replication server listening on {}", server.local_addr()?);

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown_signal => {
            info!("get shutdown signal");
        }
    }

    // no connection task may be subscribed yet, nothing to notify then
    let _ = notify_shutdown.send(());
    drop(server);
    let _ = shutdown_complete_rx.recv().await;
    info!("replication server shutdown complete");
    Ok(())
}
