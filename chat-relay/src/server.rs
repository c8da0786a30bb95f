use std::{
    future::Future,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    config::RelayConfig,
    connection::handle_connection,
    coordinator::{self, ClientId, CoordinatorHandle},
};

pub struct Server {
    listener: TcpListener,
    config: RelayConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self { listener, config }
    }

    /// Binds `config.addr` and wraps the listener.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.addr)
            .await
            .with_context(|| format!("failed to bind {}", config.addr))?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, config } = self;
        let (coordinator, coordinator_task) = coordinator::spawn(config.event_queue_capacity);
        let acceptor = Acceptor {
            coordinator,
            queue_capacity: config.client_queue_capacity,
            next_id: AtomicU64::new(1),
        };
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("chat server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    acceptor.handle_accept_result(accept_result);
                }
            }
        }

        // Connection tasks still hold handles; the coordinator keeps running
        // until the last of them finishes.
        drop(acceptor);
        drop(coordinator_task);
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

struct Acceptor {
    coordinator: CoordinatorHandle,
    queue_capacity: usize,
    next_id: AtomicU64,
}

impl Acceptor {
    fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn handle_accept_result(&self, result: std::io::Result<(TcpStream, SocketAddr)>) {
        match result {
            Ok((stream, peer)) => self.spawn_connection(stream, peer),
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id();
        let coordinator = self.coordinator.clone();
        let queue_capacity = self.queue_capacity;
        info!(%peer, client_id = id, "accepted connection");

        tokio::spawn(async move {
            let result = handle_connection(stream, peer, id, coordinator, queue_capacity).await;
            if let Err(err) = result {
                warn!(%peer, client_id = id, error = ?err, "client connection closed with error");
            }
        });
    }
}
