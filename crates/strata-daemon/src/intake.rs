//! Unix socket accepting task messages
//!
//! One JSON task per line; each line is answered with one JSON
//! [`IntakeResponse`] line. Tasks are parsed before they are queued, so
//! malformed ones are refused at the socket.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::error::{DaemonError, Result};
use crate::task::Task;
use crate::worker::ChannelQueue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IntakeResponse {
    /// Task accepted and queued
    Queued { delivery: u64, task: String },

    /// Task refused
    Error { message: String },
}

pub struct TaskIntake {
    socket_path: PathBuf,
    queue: Arc<ChannelQueue>,
}

impl TaskIntake {
    pub fn new(socket_path: PathBuf, queue: Arc<ChannelQueue>) -> Self {
        Self { socket_path, queue }
    }

    pub async fn run(&self) -> Result<()> {
        // Remove existing socket if present
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| DaemonError::Intake(format!("Failed to bind socket: {}", e)))?;

        info!("Accepting tasks on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let queue = Arc::clone(&self.queue);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, queue).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, queue: Arc<ChannelQueue>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        if !line.trim().is_empty() {
            let response = accept_line(line.trim(), &queue);
            send_response(&mut writer, &response).await?;
        }
        line.clear();
    }

    Ok(())
}

fn accept_line(line: &str, queue: &ChannelQueue) -> IntakeResponse {
    let task = match Task::parse(line.as_bytes()) {
        Ok(task) => task,
        Err(e) => {
            debug!("Refused task: {}", e);
            return IntakeResponse::Error {
                message: e.to_string(),
            };
        }
    };
    match queue.publish_task(&task) {
        Ok(delivery) => IntakeResponse::Queued {
            delivery,
            task: task.label().to_string(),
        },
        Err(e) => IntakeResponse::Error {
            message: e.to_string(),
        },
    }
}

async fn send_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &IntakeResponse,
) -> Result<()> {
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Send one task to a running daemon
pub async fn submit(socket_path: &Path, task: &Task) -> Result<IntakeResponse> {
    let stream = UnixStream::connect(socket_path).await.map_err(|e| {
        DaemonError::Intake(format!("cannot reach daemon at {:?}: {}", socket_path, e))
    })?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let json = serde_json::to_string(&task.to_json())?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(serde_json::from_str(&line)?)
}
