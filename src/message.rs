use std::path::{Path, PathBuf};

use crate::{
    error::RpcError,
    pb::{upload_file_request::Data, FileInfo, UploadFileRequest, UploadFileResponse},
};

/// The metadata message, always the first one on an upload stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    /// Extension of the source file including the leading dot, or empty.
    pub extension: String,
    /// Size the uploader claims; only used to compute progress.
    pub declared_size: u64,
}

/// The acknowledgement the receiver sends once the stream is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Identifier generated by the receiver for the stored file.
    pub id: String,
    /// Bytes the receiver actually stored.
    pub total_size: u64,
}

/// A decoded inbound request.
#[derive(Debug)]
pub enum Inbound {
    Metadata(UploadMetadata),
    Chunk(Vec<u8>),
}

impl UploadFileRequest {
    /// Build the metadata request.
    pub fn info(metadata: &UploadMetadata) -> Self {
        Self {
            data: Some(Data::Info(FileInfo {
                file_type: metadata.extension.clone(),
                size: to_wire_size(metadata.declared_size),
            })),
        }
    }

    /// Build a chunk request.
    pub fn chunk(data: Vec<u8>) -> Self {
        Self {
            data: Some(Data::ChunkData(data)),
        }
    }

    /// Decode the request into metadata or chunk bytes.
    pub fn into_inbound(self) -> Result<Inbound, RpcError> {
        match self.data {
            Some(Data::Info(info)) => {
                let declared_size = u64::try_from(info.size).map_err(|_| {
                    RpcError::ProtocolViolation(format!("negative file size: {}", info.size))
                })?;
                Ok(Inbound::Metadata(UploadMetadata {
                    extension: info.file_type,
                    declared_size,
                }))
            }
            Some(Data::ChunkData(chunk)) => Ok(Inbound::Chunk(chunk)),
            None => Err(RpcError::ProtocolViolation(
                "request carries neither file info nor chunk data".to_string(),
            )),
        }
    }
}

impl From<&UploadReceipt> for UploadFileResponse {
    fn from(receipt: &UploadReceipt) -> Self {
        Self {
            id: receipt.id.clone(),
            size: to_wire_size(receipt.total_size),
        }
    }
}

impl TryFrom<UploadFileResponse> for UploadReceipt {
    type Error = RpcError;

    fn try_from(resp: UploadFileResponse) -> Result<Self, Self::Error> {
        let total_size = u64::try_from(resp.size).map_err(|_| {
            RpcError::ProtocolViolation(format!("negative stored size: {}", resp.size))
        })?;
        Ok(Self {
            id: resp.id,
            total_size,
        })
    }
}

fn to_wire_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// Extension of the last path element: everything from its final dot on.
///
/// `archive.tar.gz` gives `.gz`, `.bashrc` gives `.bashrc` and a name without
/// a dot gives an empty string.
pub fn file_extension(path: &Path) -> String {
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy(),
        None => return String::new(),
    };
    match name.rfind('.') {
        Some(idx) => name[idx..].to_string(),
        None => String::new(),
    }
}

/// Check that a declared extension cannot move the destination file out of
/// the storage directory.
pub fn validate_extension(extension: &str) -> Result<(), RpcError> {
    if extension.is_empty() {
        return Ok(());
    }
    if !extension.starts_with('.') {
        return Err(RpcError::ProtocolViolation(format!(
            "extension must start with a dot: {:?}",
            extension
        )));
    }
    if extension.contains(['/', '\\', '\0']) {
        return Err(RpcError::ProtocolViolation(format!(
            "extension contains a path separator: {:?}",
            extension
        )));
    }
    Ok(())
}

/// `<storage_dir>/<id><extension>`
pub fn destination_path(storage_dir: &Path, id: &str, extension: &str) -> PathBuf {
    storage_dir.join(format!("{}{}", id, extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension(Path::new("sourcestore/file.txt")), ".txt");
        assert_eq!(file_extension(Path::new("archive.tar.gz")), ".gz");
        assert_eq!(file_extension(Path::new("/home/user/.bashrc")), ".bashrc");
        assert_eq!(file_extension(Path::new("Makefile")), "");
        assert_eq!(file_extension(Path::new("dir.d/noext")), "");
    }

    #[test]
    fn test_validate_extension() {
        assert!(validate_extension("").is_ok());
        assert!(validate_extension(".png").is_ok());
        assert!(validate_extension(".tar.gz").is_ok());
        assert!(validate_extension("png").is_err());
        assert!(validate_extension("./../../etc/passwd").is_err());
        assert!(validate_extension(".\\evil").is_err());
    }

    #[test]
    fn test_destination_path_encodes_extension() {
        let path = destination_path(Path::new("store"), "abc", ".jpg");
        assert_eq!(path, PathBuf::from("store/abc.jpg"));
        assert_eq!(file_extension(&path), ".jpg");
    }

    #[test]
    fn test_decode_requests() {
        let metadata = UploadMetadata {
            extension: ".bin".to_string(),
            declared_size: 42,
        };
        match UploadFileRequest::info(&metadata).into_inbound().unwrap() {
            Inbound::Metadata(decoded) => assert_eq!(decoded, metadata),
            other => panic!("unexpected {:?}", other),
        }
        match UploadFileRequest::chunk(vec![1, 2, 3]).into_inbound().unwrap() {
            Inbound::Chunk(data) => assert_eq!(data, vec![1, 2, 3]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_malformed_requests() {
        let empty = UploadFileRequest { data: None };
        assert!(matches!(
            empty.into_inbound(),
            Err(RpcError::ProtocolViolation(_))
        ));

        let negative = UploadFileRequest {
            data: Some(Data::Info(FileInfo {
                file_type: ".txt".to_string(),
                size: -1,
            })),
        };
        assert!(matches!(
            negative.into_inbound(),
            Err(RpcError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_receipt_from_response() {
        let receipt = UploadReceipt::try_from(UploadFileResponse {
            id: "id".to_string(),
            size: 7,
        })
        .unwrap();
        assert_eq!(receipt.total_size, 7);
        assert!(UploadReceipt::try_from(UploadFileResponse {
            id: "id".to_string(),
            size: -7,
        })
        .is_err());
    }
}
