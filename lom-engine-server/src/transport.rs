//! FIFO transport (§4.1). Per-client bidirectional named pipes, framed with
//! a 4-byte native-endian length prefix. Each client gets its own reader
//! task that decodes frames and forwards them into one bounded channel;
//! `read()` just drains that channel, which is the "single logical reader"
//! the main loop actually sees (§5). Writer ends are opened lazily on first
//! outbound message, since a FIFO writer can't open until a reader exists.

use async_trait::async_trait;
use lom_engine_core::engine::Transport as EngineTransport;
use lom_engine_core::error::TransportError;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const MAX_FRAME_BYTES: usize = 2048;
const FRAME_CHANNEL_CAPACITY: usize = 64;

type Frame = Result<(String, Vec<u8>), TransportError>;

fn to_engine_path(client: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/lom_fifo_{client}_to_engine"))
}

fn from_engine_path(client: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/lom_fifo_engine_to_{client}"))
}

fn io_err(client: &str, source: io::Error) -> TransportError {
    TransportError::Io {
        client: client.to_string(),
        source,
    }
}

/// Idempotently creates a FIFO node at `path`; an existing node is not an
/// error (§4.1).
fn ensure_fifo(path: &PathBuf) -> io::Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IWGRP) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

async fn read_frame(client: &str, rx: &mut pipe::Receiver) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match rx.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_ne_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes from {client} exceeds the maximum"),
        ));
    }
    let mut payload = vec![0u8; len];
    rx.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Reads frames from one client's FIFO for as long as the channel has a
/// receiver, isolating that client's read errors from the rest (§4.1).
async fn reader_loop(client: String, mut rx: pipe::Receiver, tx: mpsc::Sender<Frame>) {
    loop {
        match read_frame(&client, &mut rx).await {
            Ok(Some(payload)) => {
                if tx.send(Ok((client.clone(), payload))).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                // Writer closed its end; back off briefly rather than busy-looping
                // until it reopens.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                let _ = tx.send(Err(io_err(&client, e))).await;
                return;
            }
        }
    }
}

/// Real FIFO-backed transport used by the server binary.
pub struct FifoTransport {
    frame_tx: mpsc::Sender<Frame>,
    frame_rx: mpsc::Receiver<Frame>,
    readers: Vec<JoinHandle<()>>,
    writers: HashMap<String, pipe::Sender>,
}

impl FifoTransport {
    pub fn new() -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            frame_tx,
            frame_rx,
            readers: Vec::new(),
            writers: HashMap::new(),
        }
    }
}

impl Default for FifoTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineTransport for FifoTransport {
    async fn init(&mut self, clients: &[String]) -> Result<(), TransportError> {
        for client in clients {
            let read_path = to_engine_path(client);
            ensure_fifo(&read_path).map_err(|e| io_err(client, e))?;
            ensure_fifo(&from_engine_path(client)).map_err(|e| io_err(client, e))?;

            let rx = pipe::OpenOptions::new()
                .open_receiver(&read_path)
                .map_err(|e| io_err(client, e))?;
            let handle = tokio::spawn(reader_loop(client.clone(), rx, self.frame_tx.clone()));
            self.readers.push(handle);
        }
        Ok(())
    }

    async fn read(&mut self, timeout: Option<Duration>) -> Result<Option<(String, Vec<u8>)>, TransportError> {
        match timeout {
            None => match self.frame_rx.recv().await {
                Some(frame) => frame.map(Some),
                None => Ok(None),
            },
            Some(d) if d.is_zero() => match self.frame_rx.try_recv() {
                Ok(frame) => frame.map(Some),
                Err(_) => Ok(None),
            },
            Some(d) => match tokio::time::timeout(d, self.frame_rx.recv()).await {
                Ok(Some(frame)) => frame.map(Some),
                Ok(None) | Err(_) => Ok(None),
            },
        }
    }

    async fn write(&mut self, client: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }
        if !self.writers.contains_key(client) {
            let path = from_engine_path(client);
            let tx = pipe::OpenOptions::new()
                .open_sender(&path)
                .map_err(|e| io_err(client, e))?;
            self.writers.insert(client.to_string(), tx);
        }
        let tx = self
            .writers
            .get_mut(client)
            .ok_or_else(|| TransportError::UnknownClient(client.to_string()))?;
        let len = (payload.len() as u32).to_ne_bytes();
        tx.write_all(&len).await.map_err(|e| io_err(client, e))?;
        tx.write_all(&payload).await.map_err(|e| io_err(client, e))?;
        Ok(())
    }

    async fn deinit(&mut self) {
        for handle in self.readers.drain(..) {
            handle.abort();
        }
        self.writers.clear();
    }
}
