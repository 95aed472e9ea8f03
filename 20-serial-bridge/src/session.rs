//! Per-client I/O loops.
//!
//! Each admitted connection runs two tasks: the receive loop forwards
//! client bytes to the device queue, the send loop drains the session's
//! outbound queue onto the socket. Any read or write failure unregisters
//! the session; once the hub closes the outbound queue the send loop
//! stops the receive loop and both socket halves are dropped.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use crate::hub::{Admission, HubHandle, SessionId};

/// Largest chunk read from a client in one call.
pub const READ_BUFFER_SIZE: usize = 4096;

pub fn spawn(
    stream: TcpStream,
    peer: SocketAddr,
    admission: Admission,
    hub: HubHandle,
    device_tx: mpsc::Sender<Bytes>,
) {
    let Admission { id, outbound } = admission;
    let (reader, writer) = stream.into_split();
    let (stop_tx, stop_rx) = oneshot::channel();

    let receive_hub = hub.clone();
    tokio::spawn(async move {
        receive_loop(reader, id, receive_hub, device_tx, stop_rx).await;
        debug!(session = id, %peer, "receive loop finished");
    });
    tokio::spawn(async move {
        send_loop(writer, id, outbound, hub, stop_tx).await;
        info!(session = id, %peer, "connection closed");
    });
}

pub async fn receive_loop<R>(
    mut reader: R,
    id: SessionId,
    hub: HubHandle,
    device_tx: mpsc::Sender<Bytes>,
    mut stop: oneshot::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = select! {
            read = reader.read(&mut buffer) => read,
            _ = &mut stop => return,
        };

        match read {
            Ok(0) => {
                debug!(session = id, "client closed the connection");
                break;
            }
            Ok(length) => {
                debug!(session = id, bytes = length, "client -> device");
                let chunk = Bytes::copy_from_slice(&buffer[..length]);
                // A backed-up device queue must not keep a dropped session alive.
                let sent = select! {
                    sent = device_tx.send(chunk) => sent,
                    _ = &mut stop => return,
                };
                if sent.is_err() {
                    warn!(session = id, "device queue closed");
                    break;
                }
            }
            Err(err) => {
                warn!(session = id, error = ?err, "failed to read from client");
                break;
            }
        }
    }

    unregister(&hub, id).await;
}

pub async fn send_loop<W>(
    mut writer: W,
    id: SessionId,
    mut outbound: mpsc::Receiver<Bytes>,
    hub: HubHandle,
    stop: oneshot::Sender<()>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = outbound.recv().await {
        if let Err(err) = write_chunk(&mut writer, &chunk).await {
            warn!(session = id, error = ?err, "failed to write to client");
            unregister(&hub, id).await;
            break;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(session = id, error = ?err, "failed to shut down client writer");
    }
    let _ = stop.send(());
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}

async fn unregister(hub: &HubHandle, id: SessionId) {
    if let Err(err) = hub.unregister(id).await {
        debug!(session = id, error = ?err, "hub gone before unregister");
    }
}
