use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    coordinator::ChatEvent,
    packet::{write_packet, Packet},
};

/// Spawns the task that drains one client's outbound queue onto its connection.
pub fn spawn_output_task<W>(
    userid: String,
    inbox: mpsc::Receiver<ChatEvent>,
    writer: W,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(run_output_task(userid, inbox, writer))
}

/// Writes queued events as `MSG` packets until the queue is closed, then shuts
/// the writer down.
///
/// Events sent by `userid` itself are skipped. A failed write is logged and the
/// task moves on to the next event.
pub async fn run_output_task<W>(userid: String, mut inbox: mpsc::Receiver<ChatEvent>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    debug!(%userid, "output task running");

    while let Some(event) = inbox.recv().await {
        if event.from == userid {
            continue;
        }

        let packet = Packet::msg(event.from, event.text);
        if let Err(error) = write_packet(&mut writer, &packet).await {
            warn!(%userid, ?error, "failed to deliver message to client");
        }
    }

    if let Err(error) = writer.shutdown().await {
        debug!(%userid, ?error, "failed to shut down client writer");
    }
    debug!(%userid, "output task leaving");
}
