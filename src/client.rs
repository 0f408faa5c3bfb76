use std::{future::Future, path::Path, sync::Arc};

use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt},
    time::{timeout, timeout_at, Instant},
};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::{
    common::UploadOptions,
    error::RpcError,
    message::{file_extension, UploadMetadata, UploadReceipt},
    pb::{upload_service_client::UploadServiceClient, UploadFileRequest},
    progress::{ProgressCallback, ProgressReporter},
    transport::{ClientStream, GrpcClientStream},
};

/// Requests queued between the uploader and the gRPC call.
const OUTBOUND_BUFFER: usize = 16;

/// Sends one file per call over a [`ClientStream`].
#[derive(Clone)]
pub struct Uploader {
    options: Arc<UploadOptions>,
    progress: Option<ProgressCallback>,
}

impl Uploader {
    pub fn new(options: UploadOptions) -> Self {
        Self {
            options: Arc::new(options),
            progress: None,
        }
    }

    /// Deliver progress observations to `callback` as well as the log.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Upload the file at `path` over the stream returned by `open`.
    ///
    /// The size limit is checked before `open` is called. The whole attempt,
    /// opening the file included, is bounded by the upload deadline.
    pub async fn upload_file<F, Fut, S>(&self, path: &Path, open: F) -> Result<UploadReceipt, RpcError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, RpcError>>,
        S: ClientStream,
    {
        let deadline = Instant::now() + self.options.timeout.upload_deadline;
        self.within(deadline, async {
            let file = fs::File::open(path).await.map_err(|err| {
                RpcError::local_io(format!("failed to open file {}", path.display()), err)
            })?;
            let size = file
                .metadata()
                .await
                .map_err(|err| {
                    RpcError::local_io(format!("cannot access file {}", path.display()), err)
                })?
                .len();
            self.transfer(file, size, &file_extension(path), open).await
        })
        .await
    }

    /// Upload `size` bytes read from `reader`, declaring `extension`.
    pub async fn upload_reader<R, F, Fut, S>(
        &self,
        reader: R,
        size: u64,
        extension: &str,
        open: F,
    ) -> Result<UploadReceipt, RpcError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, RpcError>>,
        S: ClientStream,
    {
        let deadline = Instant::now() + self.options.timeout.upload_deadline;
        self.within(deadline, self.transfer(reader, size, extension, open))
            .await
    }

    async fn within<T>(
        &self,
        deadline: Instant,
        fut: impl Future<Output = Result<T, RpcError>>,
    ) -> Result<T, RpcError> {
        match timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Upload deadline of {:?} exceeded, abandoning the attempt",
                    self.options.timeout.upload_deadline
                );
                Err(RpcError::DeadlineExceeded)
            }
        }
    }

    async fn transfer<R, F, Fut, S>(
        &self,
        reader: R,
        size: u64,
        extension: &str,
        open: F,
    ) -> Result<UploadReceipt, RpcError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, RpcError>>,
        S: ClientStream,
    {
        self.check_size(size)?;
        let mut stream = open().await?;
        self.send_all(reader, size, extension, &mut stream).await
    }

    fn check_size(&self, size: u64) -> Result<(), RpcError> {
        if size > self.options.max_file_size {
            return Err(RpcError::size_limit(size, self.options.max_file_size));
        }
        Ok(())
    }

    /// Send metadata, then the reader's content chunk by chunk, then wait for
    /// the acknowledgement.
    ///
    /// No deadline applies here; [`Uploader::upload_file`] and
    /// [`Uploader::upload_reader`] add it.
    pub async fn send_all<R, S>(
        &self,
        mut reader: R,
        size: u64,
        extension: &str,
        stream: &mut S,
    ) -> Result<UploadReceipt, RpcError>
    where
        R: AsyncRead + Unpin + Send,
        S: ClientStream + ?Sized,
    {
        self.check_size(size)?;

        let metadata = UploadMetadata {
            extension: extension.to_string(),
            declared_size: size,
        };
        stream.send(UploadFileRequest::info(&metadata)).await?;
        debug!("Sent file info: {:?}", metadata);

        let mut buffer = vec![0u8; self.options.chunk_size.max(1)];
        let mut sent_size = 0u64;
        let mut progress = ProgressReporter::new(size, "Upload", self.progress.clone());

        loop {
            let n = reader
                .read(&mut buffer)
                .await
                .map_err(|err| RpcError::local_io("failed to read chunk to buffer", err))?;
            if n == 0 {
                break;
            }

            sent_size += n as u64;
            // The source grew while being read.
            self.check_size(sent_size)?;

            stream.send(UploadFileRequest::chunk(buffer[..n].to_vec())).await?;
            progress.record(sent_size);
        }

        let receipt = UploadReceipt::try_from(stream.close_and_recv().await?)?;
        info!(
            "Upload file with id: {}, size: {}",
            receipt.id, receipt.total_size
        );
        Ok(receipt)
    }
}

/// The upload client: a tonic channel plus an [`Uploader`].
pub struct RpcClient {
    client: UploadServiceClient<Channel>,
    uploader: Uploader,
}

impl RpcClient {
    /// Connect to `addr`, given as `host:port` or as a URI.
    pub async fn connect(addr: &str, options: UploadOptions) -> Result<Self, RpcError> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let endpoint =
            Endpoint::from_shared(uri).map_err(|err| RpcError::Transport(err.to_string()))?;

        let channel = match timeout(options.timeout.connect_timeout, endpoint.connect()).await {
            Ok(channel) => channel?,
            Err(_) => {
                return Err(RpcError::Transport(
                    "Timeout to connect to the server".to_string(),
                ))
            }
        };
        info!("Connected to server {}", addr);

        Ok(Self {
            client: UploadServiceClient::new(channel),
            uploader: Uploader::new(options),
        })
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.uploader = self.uploader.with_progress(callback);
        self
    }

    /// Upload the file at `path`.
    pub async fn upload_file(&self, path: impl AsRef<Path>) -> Result<UploadReceipt, RpcError> {
        self.uploader
            .upload_file(path.as_ref(), || self.open_stream())
            .await
    }

    /// Upload `size` bytes from `reader` under `extension`.
    pub async fn upload_reader<R>(
        &self,
        reader: R,
        size: u64,
        extension: &str,
    ) -> Result<UploadReceipt, RpcError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.uploader
            .upload_reader(reader, size, extension, || self.open_stream())
            .await
    }

    async fn open_stream(&self) -> Result<GrpcClientStream, RpcError> {
        Ok(GrpcClientStream::open(
            &self.client,
            self.uploader.options().timeout.upload_deadline,
            OUTBOUND_BUFFER,
        ))
    }
}
