use std::net::SocketAddr;

use anyhow::{bail, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::TcpStream,
    select,
    sync::oneshot,
};
use tracing::{debug, info, warn};

use crate::{
    config::MAX_CONSECUTIVE_READ_ERRORS,
    coordinator::{
        ChatEvent, ClientHandle, ClientId, CoordinatorHandle, JoinOutcome, SYSTEM_USERID,
    },
    output::spawn_output_task,
    packet::{decode, read_record, Action},
};

/// Serves one accepted TCP connection until it quits, disconnects, is rejected
/// as a duplicate login, or sends a malformed record.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: ClientId,
    coordinator: CoordinatorHandle,
    queue_capacity: usize,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    run_connection(
        BufReader::new(reader),
        writer,
        peer,
        id,
        coordinator,
        queue_capacity,
    )
    .await
}

/// Connection loop over any split byte stream.
///
/// The write half is handed to the client's output task on login and is closed
/// by that task once the coordinator drops the client. A malformed record ends
/// only this connection and is returned as the error.
pub async fn run_connection<R, W>(
    mut reader: R,
    writer: W,
    peer: SocketAddr,
    id: ClientId,
    coordinator: CoordinatorHandle,
    queue_capacity: usize,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer = Some(writer);
    let mut userid: Option<String> = None;
    let mut pending_join: Option<oneshot::Receiver<JoinOutcome>> = None;
    let mut pending = Vec::new();
    let mut read_errors = 0;

    debug!(%peer, client_id = id, "connection task running");

    loop {
        let record = select! {
            outcome = join_outcome(&mut pending_join) => {
                pending_join = None;
                match outcome {
                    Ok(JoinOutcome::Accepted) => {
                        debug!(%peer, client_id = id, "login accepted");
                        continue;
                    }
                    Ok(JoinOutcome::Rejected) => {
                        info!(
                            %peer,
                            client_id = id,
                            userid = ?userid,
                            "login rejected; closing connection"
                        );
                        return Ok(());
                    }
                    Err(_) => bail!("broadcast coordinator dropped the join request"),
                }
            }
            record = read_record(&mut reader, &mut pending) => record,
        };

        let record = match record {
            Ok(Some(record)) => {
                read_errors = 0;
                record
            }
            Ok(None) => {
                info!(%peer, userid = ?userid, "peer closed the connection");
                break;
            }
            Err(error) => {
                read_errors += 1;
                warn!(%peer, ?error, attempt = read_errors, "failed to read from peer");
                if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    warn!(
                        %peer,
                        userid = ?userid,
                        "too many consecutive read errors; treating peer as disconnected"
                    );
                    break;
                }
                continue;
            }
        };

        let packet = match decode(&record) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(
                    %peer,
                    userid = ?userid,
                    %error,
                    "malformed record; closing connection"
                );
                if let Some(userid) = userid {
                    coordinator.leave(userid, id).await?;
                }
                return Err(error.into());
            }
        };

        match packet.action {
            Action::Login => {
                if userid.is_some() {
                    warn!(%peer, requested = %packet.userid, "ignoring repeated login");
                    continue;
                }
                if packet.userid.is_empty() || packet.userid == SYSTEM_USERID {
                    warn!(
                        %peer,
                        requested = %packet.userid,
                        "ignoring login with unusable userid"
                    );
                    continue;
                }
                let Some(writer) = writer.take() else {
                    continue;
                };

                let (handle, inbox) =
                    ClientHandle::new(id, packet.userid.clone(), peer, queue_capacity);
                spawn_output_task(packet.userid.clone(), inbox, writer);
                pending_join = Some(coordinator.join(handle).await?);
                info!(%peer, client_id = id, userid = %packet.userid, "login requested");
                userid = Some(packet.userid);
            }
            Action::Msg => match &userid {
                Some(userid) => {
                    coordinator
                        .chat(ChatEvent::new(userid.clone(), packet.data, id))
                        .await?
                }
                None => warn!(%peer, "dropping message sent before login"),
            },
            Action::Quit => {
                info!(%peer, userid = ?userid, "peer quit");
                break;
            }
        }
    }

    if let Some(userid) = userid {
        coordinator.leave(userid, id).await?;
    }
    Ok(())
}

async fn join_outcome(
    pending: &mut Option<oneshot::Receiver<JoinOutcome>>,
) -> Result<JoinOutcome, oneshot::error::RecvError> {
    match pending {
        Some(outcome) => outcome.await,
        None => std::future::pending().await,
    }
}
