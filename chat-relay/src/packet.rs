use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::DecodeError;

const RECORD_TERMINATOR: u8 = b'\n';
const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Login,
    Msg,
    Quit,
}

/// One record of the line protocol spoken by both the server and the console client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Packet {
    pub action: Action,
    #[serde(default)]
    pub userid: String,
    #[serde(default)]
    pub data: String,
}

impl Packet {
    pub fn login(userid: impl Into<String>) -> Self {
        Self {
            action: Action::Login,
            userid: userid.into(),
            data: String::new(),
        }
    }

    pub fn msg(userid: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            action: Action::Msg,
            userid: userid.into(),
            data: data.into(),
        }
    }

    pub fn quit(userid: impl Into<String>) -> Self {
        Self {
            action: Action::Quit,
            userid: userid.into(),
            data: String::new(),
        }
    }
}

/// Encodes a packet as a single JSON object followed by the record terminator.
pub fn encode(packet: &Packet) -> Vec<u8> {
    // Serializing a struct of strings and a unit enum into a Vec cannot fail.
    let mut encoded = serde_json::to_vec(packet).unwrap_or_default();
    encoded.push(RECORD_TERMINATOR);
    encoded
}

/// Decodes one record, with or without its line ending.
pub fn decode(record: &[u8]) -> Result<Packet, DecodeError> {
    let text = std::str::from_utf8(record)?;
    let trimmed = text.trim_end_matches(LINE_ENDINGS);
    Ok(serde_json::from_str(trimmed)?)
}

/// Reads the next complete record from `reader`.
///
/// Bytes of an unfinished record accumulate in `pending`, which the caller keeps
/// across calls. A call dropped mid-record (for example as a losing `select!`
/// branch) therefore loses nothing; the next call picks up where it stopped.
///
/// Returns `Ok(None)` at end of stream. Blank lines are skipped, and bytes left
/// over without a terminator when the stream ends are discarded.
pub async fn read_record<R>(
    reader: &mut R,
    pending: &mut Vec<u8>,
) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        reader.read_until(RECORD_TERMINATOR, pending).await?;

        // `read_until` only stops short of a terminator at end of stream.
        if pending.last() != Some(&RECORD_TERMINATOR) {
            if !pending.is_empty() {
                debug!(bytes = pending.len(), "discarding unterminated record at end of stream");
                pending.clear();
            }
            return Ok(None);
        }

        let record = std::mem::take(pending);
        if record.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        return Ok(Some(record));
    }
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(packet)).await?;
    writer.flush().await?;
    Ok(())
}
