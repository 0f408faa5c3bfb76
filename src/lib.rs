//! Single-file upload over a client-streaming gRPC call.
//!
//! The uploader sends one metadata message followed by the file's chunks; the
//! receiver writes them to a freshly named file and answers with the id it
//! assigned and the number of bytes it stored.

pub mod client;
pub mod common;
pub mod error;
pub mod message;
pub mod progress;
pub mod server;
pub mod transport;

pub mod pb {
    tonic::include_proto!("upload");
}
