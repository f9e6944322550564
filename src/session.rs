//! Per-connection session: authentication state machine and dispatch of
//! chat, upload, listing and download requests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::framing::FrameReader;
use crate::registry::{BroadcastRegistry, Outbound};
use crate::transfer::{FileStore, UploadState};
use crate::users::{Registration, UserStore};
use crate::{ClientMessage, FileUpload, Inbound, LanshareError, Result, ServerMessage};

/// Shared services every session works against
#[derive(Clone)]
pub struct ServerContext {
    pub registry: Arc<BroadcastRegistry>,
    pub users: Arc<dyn UserStore>,
    pub files: Arc<FileStore>,
    pub max_frame_bytes: usize,
    pub outbound_queue: usize,
    pub outbound_budget_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated { nickname: String },
    Closed,
}

/// What the read loop does after handling a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

pub struct Session {
    ctx: ServerContext,
    outbound: Outbound,
    state: SessionState,
    uploads: HashMap<String, UploadState>,
}

impl Session {
    pub fn new(ctx: ServerContext, outbound: Outbound) -> Self {
        Self {
            ctx,
            outbound,
            state: SessionState::Unauthenticated,
            uploads: HashMap::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn nickname(&self) -> Option<&str> {
        match &self.state {
            SessionState::Authenticated { nickname } => Some(nickname),
            _ => None,
        }
    }

    /// Read and handle messages until the peer leaves, a protocol error
    /// occurs or the connection is closed from outside. Always ends in
    /// `Closed` with the connection deregistered.
    pub async fn run<R: AsyncRead + Unpin>(mut self, reader: R) -> SessionState {
        let peer = self.outbound.peer();
        let shutdown = self.outbound.shutdown_token();
        let mut frames = FrameReader::new(reader, self.ctx.max_frame_bytes);
        tracing::info!(peer = %peer, "Client connected");

        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(peer = %peer, "Connection closed by server");
                    break;
                }
                line = frames.next_line() => line,
            };

            let result = match line {
                Ok(Some(line)) => self.handle_line(&line).await,
                Ok(None) => {
                    if self.state == SessionState::Unauthenticated {
                        tracing::info!(peer = %peer, "Client left before authenticating");
                    }
                    break;
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    tracing::warn!(peer = %peer, nickname = ?self.nickname(), error = %e, "Session error");
                    if e.is_reportable() {
                        let _ = self.outbound.send(&ServerMessage::error(e.to_string())).await;
                    }
                    break;
                }
            }
        }

        self.close().await
    }

    async fn close(mut self) -> SessionState {
        self.ctx.registry.deregister(self.outbound.id()).await;
        if !self.uploads.is_empty() {
            tracing::info!(
                peer = %self.outbound.peer(),
                pending = self.uploads.len(),
                "Discarding unfinished uploads"
            );
            self.uploads.clear();
        }
        tracing::info!(peer = %self.outbound.peer(), nickname = ?self.nickname(), "Client disconnected");
        self.state = SessionState::Closed;
        self.state
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        let inbound = Inbound::decode(line)?;

        if self.state == SessionState::Unauthenticated {
            return self.handle_unauthenticated(inbound).await;
        }
        let Some(nickname) = self.nickname().map(str::to_string) else {
            return Ok(Flow::Close);
        };

        match inbound {
            Inbound::Known(ClientMessage::Message { content }) => self.handle_chat(&nickname, content).await?,
            Inbound::Known(ClientMessage::File(upload)) => self.handle_upload(&nickname, upload).await?,
            Inbound::Known(ClientMessage::ListFiles {}) => self.handle_list().await?,
            Inbound::Known(ClientMessage::DownloadFile { file_name }) => self.handle_download(&file_name).await?,
            Inbound::Known(ClientMessage::Login { .. } | ClientMessage::Register { .. }) => {
                self.outbound.send(&ServerMessage::error("already authenticated")).await?;
            }
            Inbound::Unknown(kind) => {
                tracing::debug!(nickname = %nickname, kind = %kind, "Unknown message type");
                self.outbound.send(&ServerMessage::error("unknown message type")).await?;
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_unauthenticated(&mut self, inbound: Inbound) -> Result<Flow> {
        let (nickname, outcome) = match inbound {
            Inbound::Known(ClientMessage::Login { nickname, password }) => {
                let outcome = match self.ctx.users.authenticate(&nickname, &password).await {
                    Ok(true) => Ok("login successful"),
                    Ok(false) => Err("invalid credentials".to_string()),
                    Err(e) => {
                        tracing::error!(nickname = %nickname, error = %e, "User store failed during login");
                        Err("authentication unavailable".to_string())
                    }
                };
                (nickname, outcome)
            }
            Inbound::Known(ClientMessage::Register { nickname, password }) => {
                let outcome = match self.ctx.users.register(&nickname, &password).await {
                    Ok(Registration::Created) => Ok("registration successful"),
                    Ok(Registration::AlreadyExists) => Err("user already exists".to_string()),
                    Err(LanshareError::Auth(reason)) => Err(reason),
                    Err(e) => {
                        tracing::error!(nickname = %nickname, error = %e, "User store failed during registration");
                        Err("registration unavailable".to_string())
                    }
                };
                (nickname, outcome)
            }
            _ => {
                tracing::info!(peer = %self.outbound.peer(), "First message was not login or register");
                self.outbound.send(&ServerMessage::error("invalid request type")).await?;
                return Ok(Flow::Close);
            }
        };

        match outcome {
            Ok(message) => {
                self.outbound.send(&ServerMessage::success(message)).await?;
                self.ctx.registry.register(self.outbound.clone(), nickname.clone()).await;
                tracing::info!(peer = %self.outbound.peer(), nickname = %nickname, "Client authenticated");
                self.state = SessionState::Authenticated { nickname };
                Ok(Flow::Continue)
            }
            Err(reason) => {
                tracing::info!(peer = %self.outbound.peer(), nickname = %nickname, reason = %reason, "Authentication rejected");
                self.outbound.send(&ServerMessage::error(reason)).await?;
                Ok(Flow::Close)
            }
        }
    }

    async fn handle_chat(&self, nickname: &str, content: String) -> Result<()> {
        tracing::info!(nickname = %nickname, "Chat message");
        let message = ServerMessage::Message {
            sender: nickname.to_string(),
            content,
        };
        self.ctx.registry.broadcast(&message, Some(nickname)).await?;
        Ok(())
    }

    /// Chunk 1 (re)starts the upload of a name; every later chunk must be the
    /// next one in sequence. Any failure drops the upload and replies an error.
    async fn handle_upload(&mut self, nickname: &str, upload: FileUpload) -> Result<()> {
        tracing::debug!(
            nickname = %nickname,
            file_name = %upload.file_name,
            chunk = upload.current_chunk,
            total = upload.total_chunks,
            "Upload chunk"
        );

        match self.store_chunk(nickname, &upload).await {
            Ok(Some(state)) => {
                let entry = match self.ctx.files.commit(&state).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::error!(file_name = %state.file_name, error = %e, "Failed to record upload");
                        return self.outbound.send(&ServerMessage::error(format!("failed to save file {}", state.file_name))).await;
                    }
                };
                tracing::info!(nickname = %nickname, file_name = %state.file_name, "Upload complete");
                self.ctx.registry.broadcast(&ServerMessage::NewFile(entry), None).await?;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.uploads.remove(&upload.file_name);
                tracing::warn!(nickname = %nickname, file_name = %upload.file_name, error = %e, "Upload failed");
                let reason = match e {
                    LanshareError::Transfer(reason) => reason,
                    _ => format!("failed to save file {}", upload.file_name),
                };
                self.outbound.send(&ServerMessage::error(reason)).await
            }
        }
    }

    /// Store one chunk; returns the finished upload once the last chunk is in
    async fn store_chunk(&mut self, nickname: &str, upload: &FileUpload) -> Result<Option<UploadState>> {
        let data = hex::decode(&upload.file_data)
            .map_err(|e| LanshareError::Transfer(format!("chunk {} of {} is not valid hex: {e}", upload.current_chunk, upload.file_name)))?;

        if upload.current_chunk == 1 {
            let state = self.ctx.files.begin_upload(
                &upload.file_name,
                nickname,
                upload.total_chunks,
                &upload.file_size,
                &upload.date,
            )?;
            self.uploads.insert(upload.file_name.clone(), state);
        }

        let state = self.uploads.get_mut(&upload.file_name).ok_or_else(|| {
            LanshareError::Transfer(format!("chunk {} of {} arrived before chunk 1", upload.current_chunk, upload.file_name))
        })?;

        if !state.expects(upload.current_chunk) {
            return Err(LanshareError::Transfer(format!(
                "unexpected chunk {} of {}, expected {} of {}",
                upload.current_chunk,
                upload.file_name,
                state.received_chunks + 1,
                state.total_chunks
            )));
        }

        self.ctx.files.write_chunk(state, &data).await?;

        if state.is_complete() {
            Ok(self.uploads.remove(&upload.file_name))
        } else {
            Ok(None)
        }
    }

    async fn handle_list(&self) -> Result<()> {
        match self.ctx.files.list().await {
            Ok(files) => {
                tracing::debug!(peer = %self.outbound.peer(), count = files.len(), "Sending file list");
                self.outbound.send(&ServerMessage::FilesList { files }).await
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to list files");
                self.outbound.send(&ServerMessage::error("failed to list files")).await
            }
        }
    }

    /// `file_info`, then every chunk in order, then `file_complete`
    async fn handle_download(&self, file_name: &str) -> Result<()> {
        let stored = match self.ctx.files.find(file_name).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                tracing::warn!(peer = %self.outbound.peer(), file_name = %file_name, "Download of unknown file");
                return self.outbound.send(&ServerMessage::error(format!("file {file_name} not found"))).await;
            }
            Err(e) => {
                tracing::error!(file_name = %file_name, error = %e, "Failed to look up file");
                return self.outbound.send(&ServerMessage::error(format!("failed to send file {file_name}"))).await;
            }
        };

        let total_chunks = stored.total_chunks();
        self.outbound
            .send(&ServerMessage::FileInfo {
                file_name: file_name.to_string(),
                file_size: stored.entry.file_size.clone(),
                file_type: stored.entry.file_type,
                total_chunks,
                sender: stored.entry.sender.clone(),
                date: stored.entry.date.clone(),
            })
            .await?;

        let mut reader = match stored.open_reader().await {
            Ok(reader) => reader,
            Err(e) => {
                tracing::error!(file_name = %file_name, error = %e, "Failed to open file for download");
                return self.outbound.send(&ServerMessage::error(format!("failed to send file {file_name}"))).await;
            }
        };

        loop {
            let (chunk_number, bytes) = match reader.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(file_name = %file_name, error = %e, "Failed to read file for download");
                    return self.outbound.send(&ServerMessage::error(format!("failed to send file {file_name}"))).await;
                }
            };

            self.outbound
                .send(&ServerMessage::FileChunk {
                    file_name: file_name.to_string(),
                    chunk_number,
                    total_chunks,
                    file_data: hex::encode(&bytes),
                })
                .await?;
            tracing::debug!(file_name = %file_name, chunk = chunk_number, total = total_chunks, "Sent chunk");
        }

        self.outbound
            .send(&ServerMessage::FileComplete {
                file_name: file_name.to_string(),
            })
            .await?;
        tracing::info!(peer = %self.outbound.peer(), file_name = %file_name, "Download complete");
        Ok(())
    }
}
