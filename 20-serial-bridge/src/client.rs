use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

const READ_BUFFER_SIZE: usize = 4096;

/// Manual test client: stdin lines go to the device, device bytes go to stdout.
pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (mut reader, mut writer) = stream.into_split();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    run_client_loop(&mut reader, &mut writer, &mut stdin).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn run_client_loop(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> Result<()> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        // `next_line` keeps a partly read line across cancellation.
        select! {
            bytes_read = reader.read(&mut buffer) => {
                if !handle_bridge_bytes(bytes_read, &buffer).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                if !handle_stdin_input(line, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_bridge_bytes(bytes_read: io::Result<usize>, buffer: &[u8]) -> Result<bool> {
    let length = bytes_read?;
    if length == 0 {
        info!("bridge closed the connection");
        return Ok(false);
    }

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&buffer[..length]).await?;
    stdout.flush().await?;
    Ok(true)
}

async fn handle_stdin_input(
    line: io::Result<Option<String>>,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let Some(line) = line? else {
        return Ok(false);
    };

    let payload = line.trim_end_matches('\r');
    if payload.is_empty() {
        return Ok(true);
    }

    writer.write_all(payload.as_bytes()).await?;
    Ok(true)
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shut down client writer cleanly");
    }
}
