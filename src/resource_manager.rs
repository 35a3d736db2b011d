// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::{GovernorError, OpenError, SocketError};
use crate::fd_cache::{FileIndex, OwnerId, PreallocationMode};
use crate::governor::ResourceGovernor;

use socket2::{Domain, Socket, Type};
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Everything needed to check out one file.
#[derive(Debug, Clone)]
pub struct FileRequest {
    pub owner_id: OwnerId,
    pub file_index: FileIndex,
    pub path: PathBuf,
    pub writable: bool,
    pub preallocation: PreallocationMode,
    pub expected_size: u64,
}

type FileJob = Box<dyn FnOnce(Result<&mut File, OpenError>) + Send>;

enum Command {
    Checkout {
        request: FileRequest,
        job: FileJob,
    },
    ReleaseFile {
        owner_id: OwnerId,
        file_index: FileIndex,
        respond_to: oneshot::Sender<()>,
    },
    CachedMtime {
        owner_id: OwnerId,
        file_index: FileIndex,
        respond_to: oneshot::Sender<Option<SystemTime>>,
    },
    CloseOwner {
        owner_id: OwnerId,
        respond_to: oneshot::Sender<()>,
    },
    CreateSocket {
        domain: Domain,
        ty: Type,
        respond_to: oneshot::Sender<Result<Socket, SocketError>>,
    },
    AcceptSocket {
        listener: Arc<Socket>,
        respond_to: oneshot::Sender<Result<(Socket, SocketAddr), SocketError>>,
    },
    CloseSocket {
        socket: Socket,
    },
    SetSocketLimit {
        limit: usize,
    },
    SocketCount {
        respond_to: oneshot::Sender<usize>,
    },
}

/// Cloneable handle other tasks use to reach the governor.
#[derive(Clone)]
pub struct GovernorClient {
    command_tx: mpsc::Sender<Command>,
}

impl GovernorClient {
    /// Checks out a file and runs `work` against it on the governor task.
    ///
    /// The handle never leaves the governor; only `work`'s result does.
    /// `work` must not panic: a panic unwinds the governor task, which closes
    /// every cached handle and fails all later requests with
    /// [`GovernorError::Shutdown`].
    pub async fn with_file<F, R>(&self, request: FileRequest, work: F) -> Result<R, GovernorError>
    where
        F: FnOnce(&mut File) -> io::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (respond_to, rx) = oneshot::channel();
        let job: FileJob = Box::new(move |checkout: Result<&mut File, OpenError>| {
            let result = match checkout {
                Ok(file) => work(file).map_err(GovernorError::from),
                Err(e) => Err(GovernorError::from(e)),
            };
            let _ = respond_to.send(result);
        });

        self.send(Command::Checkout { request, job }).await?;
        rx.await.map_err(|_| GovernorError::Shutdown)?
    }

    pub async fn release_file(
        &self,
        owner_id: OwnerId,
        file_index: FileIndex,
    ) -> Result<(), GovernorError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Command::ReleaseFile {
            owner_id,
            file_index,
            respond_to,
        })
        .await?;
        rx.await.map_err(|_| GovernorError::Shutdown)
    }

    pub async fn cached_mtime(
        &self,
        owner_id: OwnerId,
        file_index: FileIndex,
    ) -> Result<Option<SystemTime>, GovernorError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Command::CachedMtime {
            owner_id,
            file_index,
            respond_to,
        })
        .await?;
        rx.await.map_err(|_| GovernorError::Shutdown)
    }

    pub async fn close_owner(&self, owner_id: OwnerId) -> Result<(), GovernorError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Command::CloseOwner {
            owner_id,
            respond_to,
        })
        .await?;
        rx.await.map_err(|_| GovernorError::Shutdown)
    }

    pub async fn create_socket(&self, domain: Domain, ty: Type) -> Result<Socket, GovernorError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Command::CreateSocket {
            domain,
            ty,
            respond_to,
        })
        .await?;
        let socket = rx.await.map_err(|_| GovernorError::Shutdown)??;
        Ok(socket)
    }

    /// The listener should be non-blocking; a blocking accept stalls every
    /// other request until a peer connects.
    pub async fn accept_socket(
        &self,
        listener: Arc<Socket>,
    ) -> Result<(Socket, SocketAddr), GovernorError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Command::AcceptSocket {
            listener,
            respond_to,
        })
        .await?;
        let accepted = rx.await.map_err(|_| GovernorError::Shutdown)??;
        Ok(accepted)
    }

    pub async fn close_socket(&self, socket: Socket) -> Result<(), GovernorError> {
        self.send(Command::CloseSocket { socket }).await
    }

    pub async fn set_socket_limit(&self, limit: usize) -> Result<(), GovernorError> {
        self.send(Command::SetSocketLimit { limit }).await
    }

    pub async fn open_socket_count(&self) -> Result<usize, GovernorError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Command::SocketCount { respond_to }).await?;
        rx.await.map_err(|_| GovernorError::Shutdown)
    }

    async fn send(&self, command: Command) -> Result<(), GovernorError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| GovernorError::Shutdown)
    }
}

/// Owns the session's governor and applies requests one at a time.
pub struct GovernorActor {
    governor: ResourceGovernor,
    command_rx: mpsc::Receiver<Command>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl GovernorActor {
    pub fn new(
        governor: ResourceGovernor,
        shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, GovernorClient) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let client = GovernorClient { command_tx };
        // Subscribe before `run` so an early shutdown is not missed.
        let shutdown_rx = shutdown_tx.subscribe();
        let actor = Self {
            governor,
            command_rx,
            shutdown_tx,
            shutdown_rx,
        };
        (actor, client)
    }

    /// Serves requests until shutdown is broadcast or every client is gone,
    /// then tears the governor down.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                shutdown = self.shutdown_rx.recv() => match shutdown {
                    Ok(()) | Err(RecvError::Lagged(_)) => break,
                    // Unreachable while `shutdown_tx` is held.
                    Err(RecvError::Closed) => continue,
                },
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
            }
        }

        drop(self.shutdown_tx);
        self.governor.teardown();
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Checkout { request, job } => {
                let checkout = self.governor.checkout_file(
                    request.owner_id,
                    request.file_index,
                    &request.path,
                    request.writable,
                    request.preallocation,
                    request.expected_size,
                );
                job(checkout);
            }
            Command::ReleaseFile {
                owner_id,
                file_index,
                respond_to,
            } => {
                self.governor.release_file(owner_id, file_index);
                let _ = respond_to.send(());
            }
            Command::CachedMtime {
                owner_id,
                file_index,
                respond_to,
            } => {
                let _ = respond_to.send(self.governor.cached_mtime(owner_id, file_index));
            }
            Command::CloseOwner {
                owner_id,
                respond_to,
            } => {
                self.governor.close_owner(owner_id);
                let _ = respond_to.send(());
            }
            Command::CreateSocket {
                domain,
                ty,
                respond_to,
            } => {
                let result = self.governor.create_socket(domain, ty);
                if let Err(Ok(socket)) = respond_to.send(result) {
                    // Requester went away; don't leak the count.
                    self.governor.close_socket(socket);
                }
            }
            Command::AcceptSocket {
                listener,
                respond_to,
            } => {
                let result = self.governor.accept_socket(&listener);
                if let Err(Ok((socket, _))) = respond_to.send(result) {
                    self.governor.close_socket(socket);
                }
            }
            Command::CloseSocket { socket } => self.governor.close_socket(socket),
            Command::SetSocketLimit { limit } => self.governor.set_socket_limit(limit),
            Command::SocketCount { respond_to } => {
                let _ = respond_to.send(self.governor.open_socket_count());
            }
        }
    }
}
