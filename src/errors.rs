// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a cached file slot could not be opened. The slot is always left closed.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Couldn't create \"{}\": {source}", .path.display())]
    DirectoryCreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Couldn't open \"{}\": {source}", .path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Couldn't truncate \"{}\": {source}", .path.display())]
    TruncateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl OpenError {
    /// The OS error underneath, whichever step failed.
    pub fn io_error(&self) -> &io::Error {
        match self {
            OpenError::DirectoryCreateFailed { source, .. }
            | OpenError::OpenFailed { source, .. }
            | OpenError::TruncateFailed { source, .. } => source,
        }
    }
}

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Couldn't create socket: {0}")]
    SocketCreateFailed(#[source] io::Error),
    #[error("Peer socket limit of {limit} reached.")]
    SocketCapExceeded { limit: usize },
    #[error("Accepted connection has an address that is not an IP peer.")]
    AddressDecodeFailed,
    #[error("Couldn't accept connection: {0}")]
    AcceptFailed(#[source] io::Error),
}

/// Errors seen by tasks talking to the governor through its client.
#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("The resource governor has been shut down.")]
    Shutdown,
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("I/O error on checked-out file: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine the application directories.")]
    NoAppPaths,
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] Box<figment::Error>),
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Settings I/O error: {0}")]
    Io(#[from] io::Error),
}
