#![cfg(unix)]

use std::{
    io::{Read, Write},
    net::SocketAddr,
    os::unix::net::UnixStream,
    time::Duration,
};

use anyhow::{Result, anyhow};
use serial_bridge::{
    bridge::Bridge,
    config::{BridgeConfig, DeviceConfig},
    device::DevicePort,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(2);

struct RunningBridge {
    addr: SocketAddr,
    device: UnixStream,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl RunningBridge {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (bridge_side, far_side) = UnixStream::pair()?;
        let reader = bridge_side.try_clone()?;
        let device = DevicePort::new("test-device", Box::new(reader), Box::new(bridge_side));

        let mut config = BridgeConfig::new(DeviceConfig::new("test-device"));
        config.listen = addr;
        let bridge = Bridge::new(listener, device, config);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(bridge.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        Ok(Self {
            addr,
            device: far_side,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    /// Bytes written here show up as device output.
    async fn device_emits(&self, bytes: &'static [u8]) -> Result<()> {
        let mut device = self.device.try_clone()?;
        tokio::task::spawn_blocking(move || device.write_all(bytes)).await??;
        Ok(())
    }

    /// Reads exactly `len` bytes the bridge wrote to the device.
    async fn device_receives(&self, len: usize) -> Result<Vec<u8>> {
        let mut device = self.device.try_clone()?;
        device.set_read_timeout(Some(WAIT))?;
        let bytes = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            device.read_exact(&mut buf).map(|()| buf)
        })
        .await??;
        Ok(bytes)
    }

    async fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        timeout(WAIT, self.task).await??
    }
}

/// Connects and waits until the bridge has admitted this client.
async fn connect_admitted(bridge: &RunningBridge) -> Result<TcpStream> {
    for _ in 0..20 {
        let mut stream = TcpStream::connect(bridge.addr).await?;
        let mut probe = [0u8; 1];
        match timeout(Duration::from_millis(150), stream.read(&mut probe)).await {
            // Still open after the admission window: the hub kept us.
            Err(_) => return Ok(stream),
            Ok(_) => sleep(Duration::from_millis(50)).await,
        }
    }
    Err(anyhow!("bridge never admitted a client"))
}

async fn expect_closed(stream: &mut TcpStream) -> Result<()> {
    let mut buf = [0u8; 16];
    match timeout(WAIT, stream.read(&mut buf)).await? {
        Ok(0) | Err(_) => Ok(()),
        Ok(n) => Err(anyhow!("rejected client unexpectedly read {n} bytes")),
    }
}

#[tokio::test]
async fn ping_pong_with_single_occupancy() -> Result<()> {
    let bridge = RunningBridge::start().await?;

    let mut alice = connect_admitted(&bridge).await?;
    alice.write_all(b"PING").await?;
    assert_eq!(bridge.device_receives(4).await?, b"PING");

    let mut bob = TcpStream::connect(bridge.addr).await?;
    expect_closed(&mut bob).await?;

    bridge.device_emits(b"PONG").await?;
    let mut reply = [0u8; 4];
    timeout(WAIT, alice.read_exact(&mut reply)).await??;
    assert_eq!(&reply, b"PONG");

    bridge.stop().await
}

#[tokio::test]
async fn concurrent_attempts_leave_exactly_one_session() -> Result<()> {
    let bridge = RunningBridge::start().await?;
    let mut alice = connect_admitted(&bridge).await?;

    let mut rejected = Vec::new();
    for _ in 0..5 {
        rejected.push(TcpStream::connect(bridge.addr).await?);
    }
    for stream in &mut rejected {
        expect_closed(stream).await?;
    }

    alice.write_all(b"still here").await?;
    assert_eq!(bridge.device_receives(10).await?, b"still here");

    bridge.stop().await
}

#[tokio::test]
async fn client_bytes_reach_the_device_in_order() -> Result<()> {
    let bridge = RunningBridge::start().await?;
    let mut alice = connect_admitted(&bridge).await?;

    let mut expected = Vec::new();
    for index in 0..50u8 {
        let chunk = [b'a' + index % 26; 7];
        alice.write_all(&chunk).await?;
        expected.extend_from_slice(&chunk);
    }

    assert_eq!(bridge.device_receives(expected.len()).await?, expected);
    bridge.stop().await
}

#[tokio::test]
async fn a_new_client_is_admitted_after_the_first_leaves() -> Result<()> {
    let bridge = RunningBridge::start().await?;

    let alice = connect_admitted(&bridge).await?;
    drop(alice);

    let mut carol = connect_admitted(&bridge).await?;
    carol.write_all(b"hi").await?;
    assert_eq!(bridge.device_receives(2).await?, b"hi");

    bridge.device_emits(b"yo").await?;
    let mut reply = [0u8; 2];
    timeout(WAIT, carol.read_exact(&mut reply)).await??;
    assert_eq!(&reply, b"yo");

    bridge.stop().await
}

#[tokio::test]
async fn losing_the_device_stops_the_bridge() -> Result<()> {
    let bridge = RunningBridge::start().await?;
    let mut alice = connect_admitted(&bridge).await?;

    let RunningBridge {
        device,
        shutdown: _shutdown,
        task,
        ..
    } = bridge;
    drop(device);

    let result = timeout(WAIT, task).await??;
    assert!(result.is_err());
    expect_closed(&mut alice).await
}
