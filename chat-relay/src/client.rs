use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
};
use tracing::{debug, info, warn};

use crate::{
    config::{RelayConfig, MAX_CONSECUTIVE_READ_ERRORS},
    packet::{decode, read_record, write_packet, Action, Packet},
};

/// Console line that ends the session.
const QUIT_LINE: &str = "q";

pub async fn run(userid: String, config: &RelayConfig) -> Result<()> {
    let (reader, mut writer) = establish_connection(&config.addr).await?;
    write_packet(&mut writer, &Packet::login(&userid))
        .await
        .context("failed to send login")?;
    info!(%userid, "chat client has started; enter q to quit");

    let mut receiver = tokio::spawn(receive_loop(reader, tokio::io::stdout()));
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            received = &mut receiver => {
                return received.context("receive task failed")?;
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_stdin_input(bytes_read, &input, &userid, &mut writer).await? {
                    break;
                }
            }
        }
    }

    shutdown_connection(&mut writer).await;
    receiver.abort();
    Ok(())
}

async fn establish_connection(addr: &str) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;

    info!("connected to {}", addr);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// Renders server packets to `out` until the server closes the connection.
///
/// Read errors are retried the way the server retries them; only a run of
/// [`MAX_CONSECUTIVE_READ_ERRORS`] failures ends the loop.
async fn receive_loop<R, W>(mut reader: R, mut out: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut pending = Vec::new();
    let mut read_errors = 0;

    loop {
        let record = match read_record(&mut reader, &mut pending).await {
            Ok(Some(record)) => {
                read_errors = 0;
                record
            }
            Ok(None) => return Err(anyhow!("chat server has unexpectedly disconnected")),
            Err(error) => {
                read_errors += 1;
                warn!(?error, attempt = read_errors, "failed to read from chat server");
                if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    return Err(error).context("failed to read from chat server");
                }
                continue;
            }
        };

        match decode(&record) {
            Ok(packet) => {
                if let Some(line) = render(&packet) {
                    write_line(&mut out, &line).await?;
                }
            }
            Err(error) => warn!(%error, "unable to decode packet from chat server"),
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    userid: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    let text = input.trim_end_matches(['\n', '\r']);

    if bytes_read == 0 || text == QUIT_LINE {
        write_packet(writer, &Packet::quit(userid))
            .await
            .context("failed to send quit")?;
        return Ok(false);
    }

    write_packet(writer, &Packet::msg(userid, text))
        .await
        .context("failed to send message")?;
    Ok(true)
}

/// Console rendering of a packet received from the server.
pub fn render(packet: &Packet) -> Option<String> {
    match packet.action {
        Action::Msg => Some(format!("{} -> {}", packet.userid, packet.data)),
        action => {
            debug!(?action, "ignoring non-message packet from server");
            None
        }
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_line<W>(out: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
