//! Stream primitives the upload protocol runs on.
//!
//! The uploader and the receiver only see [`ClientStream`] and
//! [`ServerStream`]. Two implementations exist: the tonic one used over the
//! network, and an in-process pipe built on flume channels.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::Stream;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tonic::{transport::Channel, Request, Response, Status, Streaming};
use tracing::debug;

use crate::{
    error::RpcError,
    pb::{upload_service_client::UploadServiceClient, UploadFileRequest, UploadFileResponse},
};

/// Cancellation and deadline signals of one stream.
#[derive(Debug, Clone)]
pub struct StreamContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl StreamContext {
    pub fn new(deadline: Option<Instant>, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    /// A context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration, cancel: CancellationToken) -> Self {
        Self::new(Some(Instant::now() + timeout), cancel)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Non-blocking check of both signals. Cancellation wins when both fired.
    pub fn interrupted(&self) -> Option<RpcError> {
        if self.cancel.is_cancelled() {
            return Some(RpcError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(RpcError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Drive `fut` unless cancellation or the deadline fires first.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, RpcError>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RpcError::Cancelled),
            _ = deadline => Err(RpcError::DeadlineExceeded),
            res = fut => res,
        }
    }
}

/// Receiving end of an upload stream.
#[async_trait]
pub trait ServerStream: Send {
    fn context(&self) -> &StreamContext;

    /// Next request, or `None` once the uploader closed its side.
    async fn recv(&mut self) -> Result<Option<UploadFileRequest>, RpcError>;

    /// Send the single acknowledgement and close the stream.
    async fn send_and_close(&mut self, resp: UploadFileResponse) -> Result<(), RpcError>;
}

/// Sending end of an upload stream.
#[async_trait]
pub trait ClientStream: Send {
    async fn send(&mut self, req: UploadFileRequest) -> Result<(), RpcError>;

    /// Close the send side and wait for the acknowledgement.
    async fn close_and_recv(&mut self) -> Result<UploadFileResponse, RpcError>;
}

/// What travels from a client stream to its transport.
#[derive(Debug)]
enum Outbound {
    Message(UploadFileRequest),
    /// Explicit end of input. A sender dropped without it is an abandoned
    /// attempt and must never look like a finished upload.
    Close,
}

/// Parse a `grpc-timeout` header value such as `59998m` or `1S`.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || !value.is_ascii() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

/// Server side of a tonic upload call.
pub struct GrpcServerStream {
    inner: Streaming<UploadFileRequest>,
    context: StreamContext,
    response: Option<UploadFileResponse>,
}

impl GrpcServerStream {
    pub fn new(inner: Streaming<UploadFileRequest>, context: StreamContext) -> Self {
        Self {
            inner,
            context,
            response: None,
        }
    }

    /// Build the stream from an incoming request. The deadline is the
    /// earlier of the caller's `grpc-timeout` and `max_timeout`.
    pub fn from_request(
        request: Request<Streaming<UploadFileRequest>>,
        max_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let timeout = request
            .metadata()
            .get("grpc-timeout")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map_or(max_timeout, |timeout| timeout.min(max_timeout));
        debug!("Upload stream deadline in {:?}", timeout);
        Self::new(
            request.into_inner(),
            StreamContext::with_timeout(timeout, cancel),
        )
    }

    /// The acknowledgement handed to [`ServerStream::send_and_close`], if any.
    pub fn take_response(&mut self) -> Option<UploadFileResponse> {
        self.response.take()
    }
}

#[async_trait]
impl ServerStream for GrpcServerStream {
    fn context(&self) -> &StreamContext {
        &self.context
    }

    async fn recv(&mut self) -> Result<Option<UploadFileRequest>, RpcError> {
        let inner = &mut self.inner;
        self.context
            .guard(async move { inner.message().await.map_err(RpcError::from) })
            .await
    }

    async fn send_and_close(&mut self, resp: UploadFileResponse) -> Result<(), RpcError> {
        if self.response.is_some() {
            return Err(RpcError::Transport("response already sent".to_string()));
        }
        // tonic writes it once the handler returns.
        self.response = Some(resp);
        Ok(())
    }
}

/// Request body of a tonic upload call, fed from a [`GrpcClientStream`].
struct OutboundStream {
    rx: mpsc::Receiver<Outbound>,
    closed: bool,
}

impl Stream for OutboundStream {
    type Item = UploadFileRequest;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Outbound::Message(req))) => Poll::Ready(Some(req)),
            Poll::Ready(Some(Outbound::Close)) => {
                self.closed = true;
                Poll::Ready(None)
            }
            // Abandoned: stay open until the call is aborted.
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}

type UploadCall = JoinHandle<Result<Response<UploadFileResponse>, Status>>;

/// Client side of a tonic upload call.
///
/// Dropping it before [`ClientStream::close_and_recv`] completes aborts the
/// call, which resets the HTTP/2 stream so the receiver sees a cancellation.
pub struct GrpcClientStream {
    tx: mpsc::Sender<Outbound>,
    call: Option<UploadCall>,
}

impl GrpcClientStream {
    /// Start the call. `timeout` is forwarded as `grpc-timeout`.
    pub fn open(client: &UploadServiceClient<Channel>, timeout: Duration, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut request = Request::new(OutboundStream { rx, closed: false });
        request.set_timeout(timeout);

        let mut client = client.clone();
        let call = tokio::spawn(async move { client.upload_file(request).await });
        Self {
            tx,
            call: Some(call),
        }
    }

    async fn finish(&mut self) -> Result<UploadFileResponse, RpcError> {
        let call = self
            .call
            .take()
            .ok_or_else(|| RpcError::Transport("upload stream already closed".to_string()))?;
        match call.await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(status.into()),
            Err(err) => Err(RpcError::Transport(err.to_string())),
        }
    }
}

#[async_trait]
impl ClientStream for GrpcClientStream {
    async fn send(&mut self, req: UploadFileRequest) -> Result<(), RpcError> {
        if self.call.is_none() {
            return Err(RpcError::Transport("upload stream already closed".to_string()));
        }
        if self.tx.send(Outbound::Message(req)).await.is_err() {
            // The call ended early; its status says why.
            return match self.finish().await {
                Err(err) => Err(err),
                Ok(_) => Err(RpcError::Transport(
                    "server answered before the upload was complete".to_string(),
                )),
            };
        }
        Ok(())
    }

    async fn close_and_recv(&mut self) -> Result<UploadFileResponse, RpcError> {
        // A failed send means the call already ended; finish() reports it.
        let _ = self.tx.send(Outbound::Close).await;
        self.finish().await
    }
}

impl Drop for GrpcClientStream {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            debug!("Aborting unfinished upload call");
            call.abort();
        }
    }
}

/// Create a connected in-process stream pair.
///
/// `buffer` bounds the requests in flight; the server end is subject to
/// `context`.
pub fn pipe(buffer: usize, context: StreamContext) -> (MemoryClientStream, MemoryServerStream) {
    let (req_tx, req_rx) = flume::bounded(buffer.max(1));
    let (resp_tx, resp_rx) = flume::bounded(1);
    (
        MemoryClientStream {
            tx: req_tx,
            resp_rx,
            closed: false,
        },
        MemoryServerStream {
            rx: req_rx,
            resp_tx: Some(resp_tx),
            context,
            ended: false,
        },
    )
}

/// Client end of [`pipe`].
pub struct MemoryClientStream {
    tx: flume::Sender<Outbound>,
    resp_rx: flume::Receiver<Result<UploadFileResponse, Status>>,
    closed: bool,
}

impl MemoryClientStream {
    async fn answer(&self) -> Result<UploadFileResponse, RpcError> {
        match self.resp_rx.recv_async().await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(status)) => Err(status.into()),
            Err(_) => Err(RpcError::Transport(
                "receiver went away without answering".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ClientStream for MemoryClientStream {
    async fn send(&mut self, req: UploadFileRequest) -> Result<(), RpcError> {
        if self.closed {
            return Err(RpcError::Transport("upload stream already closed".to_string()));
        }
        if self.tx.send_async(Outbound::Message(req)).await.is_err() {
            self.closed = true;
            return match self.answer().await {
                Err(err) => Err(err),
                Ok(_) => Err(RpcError::Transport(
                    "server answered before the upload was complete".to_string(),
                )),
            };
        }
        Ok(())
    }

    async fn close_and_recv(&mut self) -> Result<UploadFileResponse, RpcError> {
        if !self.closed {
            self.closed = true;
            let _ = self.tx.send_async(Outbound::Close).await;
        }
        self.answer().await
    }
}

/// Server end of [`pipe`].
pub struct MemoryServerStream {
    rx: flume::Receiver<Outbound>,
    resp_tx: Option<flume::Sender<Result<UploadFileResponse, Status>>>,
    context: StreamContext,
    ended: bool,
}

impl MemoryServerStream {
    /// End the stream with an error status instead of an acknowledgement.
    pub fn reject(&mut self, status: Status) {
        if let Some(resp_tx) = self.resp_tx.take() {
            let _ = resp_tx.send(Err(status));
        }
    }
}

#[async_trait]
impl ServerStream for MemoryServerStream {
    fn context(&self) -> &StreamContext {
        &self.context
    }

    async fn recv(&mut self) -> Result<Option<UploadFileRequest>, RpcError> {
        if self.ended {
            return Ok(None);
        }
        let rx = &self.rx;
        let next = self
            .context
            .guard(async move {
                match rx.recv_async().await {
                    Ok(Outbound::Message(req)) => Ok(Some(req)),
                    Ok(Outbound::Close) => Ok(None),
                    // The uploader dropped its end without closing.
                    Err(_) => Err(RpcError::Cancelled),
                }
            })
            .await?;
        if next.is_none() {
            self.ended = true;
        }
        Ok(next)
    }

    async fn send_and_close(&mut self, resp: UploadFileResponse) -> Result<(), RpcError> {
        let resp_tx = self
            .resp_tx
            .take()
            .ok_or_else(|| RpcError::Transport("response already sent".to_string()))?;
        resp_tx
            .send_async(Ok(resp))
            .await
            .map_err(|_| RpcError::Transport("uploader went away before the answer".to_string()))
    }
}
