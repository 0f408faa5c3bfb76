use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use tokio::{fs, io::AsyncWriteExt, net::TcpListener, task, time::timeout};
use tokio_util::sync::CancellationToken;
use tonic::{transport::Server, Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    common::UploadOptions,
    error::RpcError,
    message::{destination_path, validate_extension, Inbound, UploadMetadata, UploadReceipt},
    pb::{
        upload_service_server::{UploadService, UploadServiceServer},
        UploadFileRequest, UploadFileResponse,
    },
    progress::{ProgressCallback, ProgressReporter},
    transport::{GrpcServerStream, MemoryServerStream, ServerStream},
};

/// How long `stop` waits for in-flight calls before aborting the server task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Where a receiving stream is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    AwaitingMetadata,
    ReceivingChunks,
    Completed,
}

/// State of one stream being received.
///
/// Owned by the task handling the stream; dropping it closes the destination
/// file, whichever way the stream ended.
pub struct TransferState {
    id: String,
    path: PathBuf,
    file: fs::File,
    accumulated_size: u64,
    max_file_size: u64,
    progress: ProgressReporter,
}

impl TransferState {
    async fn create(
        options: &UploadOptions,
        metadata: &UploadMetadata,
        progress: Option<ProgressCallback>,
    ) -> Result<Self, RpcError> {
        validate_extension(&metadata.extension)?;

        let id = Uuid::new_v4().to_string();
        let path = destination_path(&options.storage_dir, &id, &metadata.extension);
        let file = fs::File::create(&path).await.map_err(|err| {
            RpcError::local_io(format!("failed to create file {}", path.display()), err)
        })?;
        debug!("Created destination file {}", path.display());

        Ok(Self {
            id,
            path,
            file,
            accumulated_size: 0,
            max_file_size: options.max_file_size,
            progress: ProgressReporter::new(metadata.declared_size, "Upload", progress),
        })
    }

    /// Account for a chunk and write it through to the file.
    ///
    /// The limit is checked before any byte of the chunk is written, so the
    /// file never grows past the cap.
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), RpcError> {
        if chunk.is_empty() {
            debug!("Ignoring empty chunk");
            return Ok(());
        }

        let size = self.accumulated_size + chunk.len() as u64;
        if size > self.max_file_size {
            return Err(RpcError::size_limit(size, self.max_file_size));
        }
        self.accumulated_size = size;
        self.progress.record(size);

        self.file
            .write_all(chunk)
            .await
            .map_err(|err| RpcError::local_io("failed to write chunk to file", err))?;
        self.file
            .flush()
            .await
            .map_err(|err| RpcError::local_io("failed to flush file", err))
    }

    async fn finish(mut self) -> Result<UploadReceipt, RpcError> {
        self.file
            .flush()
            .await
            .map_err(|err| RpcError::local_io("failed to flush file", err))?;
        debug!("Closing destination file {}", self.path.display());
        Ok(UploadReceipt {
            id: self.id,
            total_size: self.accumulated_size,
        })
    }
}

/// Receives upload streams into files under the storage directory.
///
/// Cheap to clone; every stream gets its own [`TransferState`], nothing is
/// shared between concurrent uploads except the read-only options.
#[derive(Clone)]
pub struct UploadReceiver {
    options: Arc<UploadOptions>,
    progress: Option<ProgressCallback>,
}

impl UploadReceiver {
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

    /// Create the storage directory if it does not exist yet.
    pub async fn prepare_storage(&self) -> Result<(), RpcError> {
        fs::create_dir_all(&self.options.storage_dir)
            .await
            .map_err(|err| {
                RpcError::local_io(
                    format!(
                        "failed to create storage directory {}",
                        self.options.storage_dir.display()
                    ),
                    err,
                )
            })
    }

    /// Receive one upload from `stream` and answer it.
    ///
    /// On error nothing is sent and whatever was already written stays on
    /// disk.
    pub async fn receive<S>(&self, stream: &mut S) -> Result<UploadReceipt, RpcError>
    where
        S: ServerStream + ?Sized,
    {
        let mut state = ReceiverState::AwaitingMetadata;
        let result = self.drive(stream, &mut state).await;
        if let Err(err) = &result {
            error!(?state, "Upload failed: {}", err);
        }
        result
    }

    /// Serve an in-process stream, turning a failure into a rejection the
    /// client end can observe.
    pub async fn serve_pipe(&self, mut stream: MemoryServerStream) -> Result<UploadReceipt, RpcError> {
        let result = self.receive(&mut stream).await;
        if let Err(err) = &result {
            stream.reject(err.to_status());
        }
        result
    }

    async fn drive<S>(&self, stream: &mut S, state: &mut ReceiverState) -> Result<UploadReceipt, RpcError>
    where
        S: ServerStream + ?Sized,
    {
        let metadata = Self::await_metadata(stream).await?;
        info!(
            extension = %metadata.extension,
            declared_size = metadata.declared_size,
            "Receiving upload"
        );
        let mut transfer = TransferState::create(&self.options, &metadata, self.progress.clone()).await?;
        *state = ReceiverState::ReceivingChunks;

        loop {
            if let Some(err) = stream.context().interrupted() {
                return Err(err);
            }

            let req = match stream.recv().await? {
                Some(req) => req,
                None => break,
            };
            match req.into_inbound()? {
                Inbound::Chunk(chunk) => transfer.write_chunk(&chunk).await?,
                Inbound::Metadata(_) => {
                    return Err(RpcError::ProtocolViolation(
                        "file info received after the first message".to_string(),
                    ))
                }
            }
        }

        let receipt = transfer.finish().await?;
        *state = ReceiverState::Completed;

        if let Err(err) = stream.send_and_close(UploadFileResponse::from(&receipt)).await {
            warn!(id = %receipt.id, "Failed to send response, the file is kept");
            return Err(err);
        }
        info!("Saved file with id: {}, size: {}", receipt.id, receipt.total_size);
        Ok(receipt)
    }

    async fn await_metadata<S>(stream: &mut S) -> Result<UploadMetadata, RpcError>
    where
        S: ServerStream + ?Sized,
    {
        if let Some(err) = stream.context().interrupted() {
            return Err(err);
        }
        let req = stream
            .recv()
            .await?
            .ok_or_else(|| RpcError::ProtocolViolation("cannot receive file info".to_string()))?;
        match req.into_inbound()? {
            Inbound::Metadata(metadata) => Ok(metadata),
            Inbound::Chunk(_) => Err(RpcError::ProtocolViolation(
                "first message must carry file info".to_string(),
            )),
        }
    }
}

/// The tonic service: one [`UploadReceiver::receive`] per call.
#[derive(Clone)]
pub struct FileUploadService {
    receiver: UploadReceiver,
    shutdown: CancellationToken,
}

impl FileUploadService {
    /// Calls in flight are cancelled once `shutdown` fires.
    pub fn new(receiver: UploadReceiver, shutdown: CancellationToken) -> Self {
        Self { receiver, shutdown }
    }
}

#[tonic::async_trait]
impl UploadService for FileUploadService {
    async fn upload_file(
        &self,
        request: Request<Streaming<UploadFileRequest>>,
    ) -> Result<Response<UploadFileResponse>, Status> {
        let mut stream = GrpcServerStream::from_request(
            request,
            self.receiver.options().timeout.upload_deadline,
            self.shutdown.child_token(),
        );
        self.receiver.receive(&mut stream).await?;
        stream
            .take_response()
            .map(Response::new)
            .ok_or_else(|| Status::internal("upload finished without a response"))
    }
}

/// The upload server: a listener plus the tonic service behind it.
pub struct RpcServer {
    options: UploadOptions,
    /// Main worker for the server
    main_worker: Option<task::JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl RpcServer {
    pub fn new(options: UploadOptions) -> Self {
        Self {
            options,
            main_worker: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind `addr` and serve in the background. Returns the bound address,
    /// so port 0 may be used.
    pub async fn listen(&mut self, addr: &str) -> Result<SocketAddr, RpcError> {
        let receiver = UploadReceiver::new(self.options.clone());
        receiver.prepare_storage().await?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| RpcError::Transport(err.to_string()))?;
        info!("listening on {:?}", local_addr);

        let incoming = Box::pin(futures_util::stream::unfold(listener, |listener| async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {:?}", peer);
                        return Some((Ok::<_, std::io::Error>(stream), listener));
                    }
                    Err(err) => {
                        debug!("Failed to accept connection: {:?}", err);
                        continue;
                    }
                }
            }
        }));

        let service = FileUploadService::new(receiver, self.shutdown.clone());
        let shutdown = self.shutdown.clone();
        let handle = task::spawn(async move {
            let result = Server::builder()
                .add_service(UploadServiceServer::new(service))
                .serve_with_incoming_shutdown(incoming, shutdown.cancelled())
                .await;
            if let Err(err) = result {
                error!("Upload server stopped: {}", err);
            }
        });

        self.main_worker = Some(handle);
        Ok(local_addr)
    }

    /// Stop the server, cancelling uploads still in flight.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(mut handle) = self.main_worker.take() {
            if timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Upload server did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}
