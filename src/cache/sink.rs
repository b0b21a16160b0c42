//! Handler contract and client-side response writers.
//!
//! A [`Handler`] produces a response by mutating headers, writing a status
//! once and then streaming body chunks into a [`ResponseWriter`]. The cache
//! interposes on that writer; everything the handler cannot observe lives in
//! the concrete writers below.

use std::error::Error;
use std::io;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Destination of a handler's response.
///
/// Header mutations made after the status has been written are not sent.
/// Only the first status write counts; a body write without a prior status
/// implies 200.
#[async_trait]
pub trait ResponseWriter: Send {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    async fn write_status(&mut self, status: StatusCode) -> io::Result<()>;

    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// The status written so far, if any.
    fn status(&self) -> Option<StatusCode>;
}

/// The wrapped request handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, request: &Parts, writer: &mut dyn ResponseWriter)
    -> Result<(), HandlerError>;
}

/// Collects the whole response in memory.
#[derive(Debug, Default)]
pub struct BufferedWriter {
    headers: HeaderMap,
    head: Option<(StatusCode, HeaderMap)>,
    body: BytesMut,
}

impl BufferedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Headers as they were when the status went out.
    pub fn sent_headers(&self) -> Option<&HeaderMap> {
        self.head.as_ref().map(|(_, headers)| headers)
    }

    pub fn into_response(self) -> Response {
        let (status, headers) = self.head.unwrap_or((StatusCode::OK, self.headers));
        let mut response = Response::new(Body::from(self.body.freeze()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

#[async_trait]
impl ResponseWriter for BufferedWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_status(&mut self, status: StatusCode) -> io::Result<()> {
        if self.head.is_none() {
            self.head = Some((status, self.headers.clone()));
        }
        Ok(())
    }

    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.head.is_none() {
            self.write_status(StatusCode::OK).await?;
        }
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().map(|(status, _)| *status)
    }
}

/// Drops the body; keeps only what a caller needs to log the result.
#[derive(Debug, Default)]
pub struct DiscardWriter {
    headers: HeaderMap,
    status: Option<StatusCode>,
    body_bytes: u64,
}

impl DiscardWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }
}

#[async_trait]
impl ResponseWriter for DiscardWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_status(&mut self, status: StatusCode) -> io::Result<()> {
        self.status.get_or_insert(status);
        Ok(())
    }

    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.status.get_or_insert(StatusCode::OK);
        self.body_bytes += chunk.len() as u64;
        Ok(())
    }

    fn status(&self) -> Option<StatusCode> {
        self.status
    }
}

type Head = (StatusCode, HeaderMap);

/// Writer half of a streamed response; see [`streaming_channel`].
#[derive(Debug)]
pub struct StreamingWriter {
    headers: HeaderMap,
    status: Option<StatusCode>,
    head_tx: Option<oneshot::Sender<Head>>,
    body_tx: mpsc::Sender<Bytes>,
}

/// Receiving half: becomes the client response once the head arrives.
#[derive(Debug)]
pub struct PendingResponse {
    head_rx: oneshot::Receiver<Head>,
    body_rx: mpsc::Receiver<Bytes>,
}

/// A writer that forwards the head as soon as the status is written and body
/// chunks as they are produced, with at most `capacity` chunks in flight.
pub fn streaming_channel(capacity: usize) -> (StreamingWriter, PendingResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(capacity.max(1));
    (
        StreamingWriter {
            headers: HeaderMap::new(),
            status: None,
            head_tx: Some(head_tx),
            body_tx,
        },
        PendingResponse { head_rx, body_rx },
    )
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client response dropped")
}

impl StreamingWriter {
    /// End the response, sending an empty 200 head if nothing was written.
    pub async fn finish(mut self) {
        if self.status.is_none() {
            let _ = self.write_status(StatusCode::OK).await;
        }
    }
}

#[async_trait]
impl ResponseWriter for StreamingWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_status(&mut self, status: StatusCode) -> io::Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        self.status = Some(status);
        let head_tx = self.head_tx.take().ok_or_else(client_gone)?;
        head_tx
            .send((status, self.headers.clone()))
            .map_err(|_| client_gone())
    }

    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.status.is_none() {
            self.write_status(StatusCode::OK).await?;
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.body_tx
            .send(Bytes::copy_from_slice(chunk))
            .await
            .map_err(|_| client_gone())
    }

    fn status(&self) -> Option<StatusCode> {
        self.status
    }
}

impl PendingResponse {
    /// Wait for the head; a writer dropped before writing one yields a 500.
    pub async fn into_response(self) -> Response {
        let Self {
            head_rx,
            mut body_rx,
        } = self;

        let Ok((status, headers)) = head_rx.await else {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };

        let stream = async_stream::stream! {
            while let Some(chunk) = body_rx.recv().await {
                yield Ok::<_, io::Error>(chunk);
            }
        };

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}
