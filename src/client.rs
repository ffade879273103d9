//! Query execution against an IDWDB server.
//!
//! # Overview
//!
//! A [`DatabaseClient`] owns at most one [`SecureSession`]. Running a query is a strictly
//! alternating exchange:
//!
//! 1. The serialized [`Query`] is sent as one message.
//! 2. The server answers with a batch of rows, or an empty message once it is done.
//! 3. The client passes the batch to the handler and acknowledges it with `1` (continue) or
//!    `0` (stop) before the next batch is read.
//!
//! Only one batch is ever in flight. Any failure during the exchange drops the session; the
//! caller decides when to [`reconnect`](DatabaseClient::reconnect).
use std::{future::Future, sync::Arc};

use futures::future;
use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::{
    config::{ClientConfig, ConfigError},
    data::{CodecError, Row, decode_rows},
    protocol::{
        AsyncSocket, Credentials, MessageChannel, ReactorHandle, SecureSession, SessionError,
        SocketError,
    },
    query::Query,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,

    #[error("connection closed by the server while awaiting results")]
    ConnectionClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to encode query: {0}")]
    Codec(#[from] CodecError),

    #[error("failed to connect: {0}")]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct DatabaseClient {
    config: ClientConfig,
    credentials: Arc<Credentials>,
    reactor: ReactorHandle,
    session: Option<SecureSession>,
    #[cfg(any(test, feature = "local-bypass"))]
    local_secret: Option<Vec<u8>>,
}

impl DatabaseClient {
    pub fn new(config: ClientConfig, credentials: Credentials, reactor: ReactorHandle) -> Self {
        Self {
            config,
            credentials: Arc::new(credentials),
            reactor,
            session: None,
            #[cfg(any(test, feature = "local-bypass"))]
            local_secret: None,
        }
    }

    /// Connects without the handshake, presenting `secret` in the clear. Only servers on the
    /// local machine accept this.
    #[cfg(any(test, feature = "local-bypass"))]
    pub fn with_local_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.local_secret = Some(secret.into());
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// An unconnected client with the same configuration and credentials.
    pub fn fork(&self) -> Self {
        Self {
            config: self.config.clone(),
            credentials: Arc::clone(&self.credentials),
            reactor: self.reactor.clone(),
            session: None,
            #[cfg(any(test, feature = "local-bypass"))]
            local_secret: self.local_secret.clone(),
        }
    }

    /// Connects to the first reachable address of the endpoint and runs the handshake. Does
    /// nothing when already connected.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.session.is_some() {
            return Ok(());
        }

        let mut last_err = None;
        for addr in self.config.endpoint.resolve()? {
            let socket = match AsyncSocket::connect(self.reactor.clone(), addr).await {
                Ok(socket) => socket,
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_err = Some(e);
                    continue;
                }
            };
            let channel = MessageChannel::with_limit(socket, self.config.max_message_size);
            self.session = Some(self.open_session(channel).await?);
            info!("connected to {} ({addr})", self.config.endpoint);
            return Ok(());
        }
        Err(last_err.map_or(ClientError::NotConnected, ClientError::Socket))
    }

    async fn open_session(&self, channel: MessageChannel) -> Result<SecureSession, SessionError> {
        #[cfg(any(test, feature = "local-bypass"))]
        if let Some(secret) = &self.local_secret {
            return SecureSession::bypass(channel, secret).await;
        }
        SecureSession::establish(channel, &self.credentials).await
    }

    /// Tears the current session down, ignoring failures, and connects again.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        self.disconnect();
        self.connect().await
    }

    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close() {
                debug!("ignoring close failure during teardown: {e}");
            }
            info!("disconnected from {}", self.config.endpoint);
        }
    }

    /// Runs `query`, calling `handler` once per batch. Returning `false` asks the server to
    /// stop sending further batches.
    pub async fn run_query<F>(&mut self, query: &Query, mut handler: F) -> Result<(), ClientError>
    where
        F: FnMut(Vec<Row>) -> bool,
    {
        self.run_query_async(query, |rows| future::ready(handler(rows)))
            .await
    }

    /// Like [`run_query`](Self::run_query), but the acknowledgment waits for the future the
    /// handler returns.
    pub async fn run_query_async<F, Fut>(
        &mut self,
        query: &Query,
        mut handler: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(Vec<Row>) -> Fut,
        Fut: Future<Output = bool>,
    {
        let payload = query.serialize()?;
        let session = self.session.as_mut().ok_or(ClientError::NotConnected)?;

        let res = execute(session, &payload, &mut handler).await;
        if let Err(e) = &res {
            warn!("query on '{}' failed, dropping session: {e}", query.table());
            self.disconnect();
        }
        res
    }

    /// Runs `query` to completion and collects every returned row.
    pub async fn fetch_all(&mut self, query: &Query) -> Result<Vec<Row>, ClientError> {
        let mut rows = Vec::new();
        self.run_query(query, |batch| {
            rows.extend(batch);
            true
        })
        .await?;
        Ok(rows)
    }
}

async fn execute<F, Fut>(
    session: &mut SecureSession,
    payload: &[u8],
    handler: &mut F,
) -> Result<(), ClientError>
where
    F: FnMut(Vec<Row>) -> Fut,
    Fut: Future<Output = bool>,
{
    session.send(payload).await?;

    let mut batches = 0usize;
    loop {
        let message = session
            .receive()
            .await?
            .ok_or(ClientError::ConnectionClosed)?;
        if message.is_empty() {
            debug!("query finished after {batches} batches");
            return Ok(());
        }

        let rows = decode_rows(&message)?;
        batches += 1;
        trace!("batch {batches}: {} rows", rows.len());

        let more = handler(rows).await;
        session.send(&[u8::from(more)]).await?;
    }
}
