use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, BufReader, ReadBuf};

/// Replays a fixed script of reads and read failures, then reports end of stream.
pub struct ScriptedReader {
    script: VecDeque<io::Result<Vec<u8>>>,
}

impl ScriptedReader {
    pub fn new(script: impl IntoIterator<Item = io::Result<Vec<u8>>>) -> BufReader<Self> {
        BufReader::new(Self {
            script: script.into_iter().collect(),
        })
    }
}

impl AsyncRead for ScriptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.script.pop_front() {
            Some(Ok(mut chunk)) => {
                let len = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..len]);
                if len < chunk.len() {
                    self.script.push_front(Ok(chunk.split_off(len)));
                }
                Poll::Ready(Ok(()))
            }
            Some(Err(error)) => Poll::Ready(Err(error)),
            None => Poll::Ready(Ok(())),
        }
    }
}

pub fn reset() -> io::Result<Vec<u8>> {
    Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
}
