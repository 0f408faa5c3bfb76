use std::{path::PathBuf, time::Duration};

/// Largest file a single upload may carry, inclusive (4 GiB).
pub const MAX_FILE_SIZE: u64 = 1 << 32;

/// Deadline for one upload attempt, measured from the start of the call.
pub const UPLOAD_DEADLINE: Duration = Duration::from_secs(60);

/// Read buffer used by the uploader, one chunk message per full buffer.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Directory the receiver stores uploaded files in.
pub const DEFAULT_STORAGE_DIR: &str = "destinationstore";

/// Options for the timeouts of an upload.
#[derive(Debug, Clone)]
pub struct TimeoutOptions {
    /// Upper bound for a whole upload attempt, on either side.
    pub upload_deadline: Duration,
    /// Upper bound for establishing the client connection.
    pub connect_timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            upload_deadline: UPLOAD_DEADLINE,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration shared by the uploader and the receiver.
///
/// It is built once at startup and handed to both endpoints; nothing mutates
/// it while uploads are running.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Hard cap on the bytes one upload may reach.
    pub max_file_size: u64,
    /// Size of the blocks the uploader reads and sends.
    pub chunk_size: usize,
    /// Where the receiver creates destination files.
    pub storage_dir: PathBuf,
    pub timeout: TimeoutOptions,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            max_file_size: MAX_FILE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            timeout: TimeoutOptions::default(),
        }
    }
}

impl UploadOptions {
    pub fn with_storage_dir(mut self, storage_dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = storage_dir.into();
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// A zero chunk size falls back to [`DEFAULT_CHUNK_SIZE`].
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        self
    }

    pub fn with_upload_deadline(mut self, deadline: Duration) -> Self {
        self.timeout.upload_deadline = deadline;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = UploadOptions::default();
        assert_eq!(options.max_file_size, 4_294_967_296);
        assert_eq!(options.timeout.upload_deadline, Duration::from_secs(60));
        assert_eq!(options.storage_dir, PathBuf::from("destinationstore"));
    }

    #[test]
    fn test_zero_chunk_size_uses_default() {
        let options = UploadOptions::default().with_chunk_size(0);
        assert_eq!(options.chunk_size, DEFAULT_CHUNK_SIZE);
        let options = options.with_chunk_size(1024);
        assert_eq!(options.chunk_size, 1024);
    }
}
