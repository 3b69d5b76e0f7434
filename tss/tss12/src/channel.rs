// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Command Channel seam.
//!
//! The stack is agnostic to what sits on the other end - a device node, a
//! daemon socket, or an in-process emulator - as long as command blobs go
//! out and correlated reply blobs come back in order.

use thiserror::Error;

/// Errors a channel implementation may surface. The stack never retries;
/// retry policy belongs to the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is gone and the binding is unusable.
    #[error("the command channel is closed")]
    ChannelClosed,
    /// An I/O failure on the underlying link.
    #[error("command channel i/o failure")]
    Io(#[from] std::io::Error),
}

/// A reliable, ordered, blocking request/response link to a TPM.
///
/// Each `send` must return the reply correlated to exactly that command.
/// Once a command has been handed to the channel its authorization nonces
/// are consumed whether or not a reply ever arrives.
pub trait CommandChannel: Send {
    /// Send one command blob and block for its reply blob.
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;
}

impl<F> CommandChannel for F
where
    F: FnMut(&[u8]) -> Result<Vec<u8>, TransportError> + Send,
{
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        self(command)
    }
}
