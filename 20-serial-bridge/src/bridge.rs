use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    config::BridgeConfig,
    device::DevicePort,
    hub::{Hub, HubExit, HubHandle},
    session,
};

/// Listener loop tying TCP clients to one serial device.
pub struct Bridge {
    listener: TcpListener,
    device: DevicePort,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(listener: TcpListener, device: DevicePort, config: BridgeConfig) -> Self {
        Self {
            listener,
            device,
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves clients until `shutdown` resolves.
    ///
    /// Returns an error if the serial device is lost, since nothing can be
    /// served without it.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Bridge {
            listener,
            device,
            config,
        } = self;
        config.validate()?;
        tokio::pin!(shutdown);

        let device_name = device.name().to_string();
        let (hub, handle) = Hub::new(config.session_queue_capacity);
        let mut hub_task = tokio::spawn(hub.run());

        let (device_tx, device_rx) = mpsc::channel(config.device_queue_capacity);
        device
            .start(device_rx, handle.clone())
            .context("failed to start device threads")?;

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("bridge shutting down");
                    if let Err(err) = handle.shutdown().await {
                        warn!(error = ?err, "hub already stopped");
                    }
                    let _ = hub_task.await;
                    break;
                }
                exit = &mut hub_task => {
                    return match exit.context("connection hub panicked")? {
                        HubExit::DeviceLost { reason } => {
                            Err(anyhow!("serial device {device_name} lost: {reason}"))
                        }
                        other => Err(anyhow!("connection hub stopped unexpectedly: {other:?}")),
                    };
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &handle, &device_tx).await;
                }
            }
        }

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

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    hub: &HubHandle,
    device_tx: &mpsc::Sender<Bytes>,
) {
    match result {
        Ok((stream, peer)) => admit_connection(stream, peer, hub, device_tx).await,
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn admit_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: &HubHandle,
    device_tx: &mpsc::Sender<Bytes>,
) {
    match hub.admit(peer).await {
        Ok(Some(admission)) => {
            info!(%peer, session = admission.id, "client admitted");
            session::spawn(stream, peer, admission, hub.clone(), device_tx.clone());
        }
        // Dropping the stream closes the rejected connection.
        Ok(None) => info!(%peer, "client rejected, bridge already in use"),
        Err(err) => warn!(%peer, error = ?err, "could not admit client"),
    }
}
