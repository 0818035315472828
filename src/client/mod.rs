//! Client side of the remote fit-control protocol.
//!
//! # Example
//!
//! ```rust,ignore
//! use remotefit::client::RemoteClient;
//! use remotefit::protocol::{Message, SharedKey};
//!
//! let mut client = RemoteClient::connect("127.0.0.1:3000", &SharedKey::default()).await?;
//! client.transfer_model(model_json, fit_params_json).await?;
//! client.start_fit().await?;
//! while let Some(message) = client.recv().await? {
//!     println!("{}", message.kind());
//! }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::config::Config;
use crate::error::{RemoteFitError, Result};
use crate::protocol::{self, read_message, write_message, Authenticator, Message, SharedKey, MAX_FRAME_SIZE};

/// Authenticated connection to a session server
pub struct RemoteClient<S = TcpStream> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    /// Messages read while waiting for an echo reply
    pending: VecDeque<Message>,
    max_frame_size: u32,
}

impl RemoteClient<TcpStream> {
    /// Connect and authenticate
    pub async fn connect(addr: impl ToSocketAddrs, key: &SharedKey) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, key).await
    }

    /// Connect with a deadline on the TCP connect
    pub async fn connect_timeout(
        addr: impl ToSocketAddrs,
        key: &SharedKey,
        timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RemoteFitError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timed out after {timeout:?}"),
                ))
            })??;
        stream.set_nodelay(true)?;
        Self::handshake(stream, key).await
    }

    /// Connect using the `[client]` and `[auth]` sections of a config
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::connect_timeout(
            config.client.server_addr(),
            &config.shared_key()?,
            Duration::from_secs(config.client.connect_timeout_secs),
        )
        .await
    }
}

impl<S> RemoteClient<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Run the client half of the handshake over an open stream
    pub async fn handshake(stream: S, key: &SharedKey) -> Result<Self> {
        let auth = Authenticator::new(key)?;
        let (mut reader, mut writer) = tokio::io::split(stream);
        protocol::initiate(&auth, &mut reader, &mut writer).await?;
        tracing::debug!("Handshake complete");

        Ok(Self {
            reader,
            writer,
            pending: VecDeque::new(),
            max_frame_size: MAX_FRAME_SIZE,
        })
    }

    /// Set max accepted frame size
    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Send one message
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.writer, message).await
    }

    /// Receive the next message; `None` once the server has closed
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        read_message(&mut self.reader, self.max_frame_size).await
    }

    /// Round-trip an `ECHO`.
    ///
    /// Messages that arrive before the matching reply stay queued for
    /// [`recv`](Self::recv).
    pub async fn echo(&mut self, text: &str) -> Result<String> {
        self.send(&Message::echo(text)).await?;
        loop {
            match read_message(&mut self.reader, self.max_frame_size).await? {
                Some(Message::Text(reply)) if reply == text => return Ok(reply),
                Some(other) => self.pending.push_back(other),
                None => {
                    return Err(RemoteFitError::TransportReset(
                        "server closed before answering echo".to_string(),
                    ))
                },
            }
        }
    }

    /// Replace the server's model and fit parameters
    pub async fn transfer_model(&mut self, model: Bytes, fit_params: Bytes) -> Result<()> {
        self.send(&Message::model_transfer(model, fit_params)).await
    }

    /// Start a fit
    pub async fn start_fit(&mut self) -> Result<()> {
        self.send(&Message::start_fit()).await
    }

    /// Stop the fit; the server closes the session afterwards
    pub async fn stop_fit(&mut self) -> Result<()> {
        self.send(&Message::stop_fit()).await
    }

    /// Close the write side
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
