// Chunked file upload
// begin (chunkCount -1) -> PUT chunks 0..n-1 in order -> complete (chunkCount n)

use bytes::Bytes;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::error::{ClientError, Result};
use crate::http_client::{read_json, AnaplanHttpClient};

/// Largest chunk the platform accepts
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// chunkCount announced on begin; the real count is only sent on complete
const STREAMING_CHUNK_COUNT: i64 = -1;

/// Number of chunk calls needed for `size` bytes
pub fn expected_chunk_count(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadMarker<'a> {
    id: &'a str,
    chunk_count: i64,
}

/// Summary of a finished upload
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub file_id: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub chunk_count: u64,
    /// Body of the completion call
    pub response: Value,
}

/// Uploads local files into model file slots
#[derive(Clone)]
pub struct ChunkUploader {
    http: Arc<AnaplanHttpClient>,
    chunk_size: u64,
}

impl ChunkUploader {
    pub fn new(http: Arc<AnaplanHttpClient>, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ClientError::Config("chunk size must be positive".to_string()));
        }
        Ok(Self { http, chunk_size })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Upload `path` into file slot `file_id`.
    ///
    /// Nothing is sent unless the file can be opened. If the begin call is
    /// rejected no chunk is sent; if a chunk fails the completion call is
    /// skipped and `UploadIncomplete` reports how far the transfer got.
    /// A token failure surfaces as `Authentication` at any stage.
    pub async fn upload(&self, file_id: &str, path: &Path) -> Result<UploadReport> {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let expected = expected_chunk_count(size, self.chunk_size);
        let file_path = format!("files/{}", file_id);

        tracing::info!(
            file_id = file_id,
            path = %path.display(),
            bytes = size,
            chunks = expected,
            "Starting upload"
        );

        self.begin(file_id, &file_path).await?;

        let mut chunk_index: u64 = 0;
        let mut sent_bytes: u64 = 0;
        loop {
            let chunk = match read_chunk(&mut file, self.chunk_size).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    return Err(incomplete(file_id, chunk_index, format!("read failed: {}", e)))
                }
            };
            if chunk.is_empty() {
                break;
            }

            let len = chunk.len() as u64;
            match self.put_chunk(&file_path, chunk_index, chunk).await {
                Ok(()) => {}
                Err(e @ ClientError::Authentication(_)) => {
                    tracing::error!(
                        file_id = file_id,
                        chunk = chunk_index,
                        "No token for chunk, not completing: {}",
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(
                        file_id = file_id,
                        chunk = chunk_index,
                        "Chunk upload failed, not completing: {}",
                        e
                    );
                    return Err(incomplete(file_id, chunk_index, e.to_string()));
                }
            }

            sent_bytes += len;
            tracing::debug!(file_id = file_id, chunk = chunk_index, bytes = len, "Chunk uploaded");
            chunk_index += 1;
        }

        if chunk_index != expected {
            tracing::warn!(
                file_id = file_id,
                expected = expected,
                sent = chunk_index,
                "File size changed during upload"
            );
        }

        let response = self.complete(file_id, &file_path, chunk_index).await?;
        tracing::info!(
            file_id = file_id,
            chunks = chunk_index,
            bytes = sent_bytes,
            "Upload complete"
        );

        Ok(UploadReport {
            file_id: file_id.to_string(),
            path: path.to_path_buf(),
            bytes: sent_bytes,
            chunk_count: chunk_index,
            response,
        })
    }

    async fn begin(&self, file_id: &str, file_path: &str) -> Result<()> {
        let builder = self
            .http
            .request(Method::POST, file_path)
            .await?
            .header("Content-Type", "application/json")
            .json(&UploadMarker {
                id: file_id,
                chunk_count: STREAMING_CHUNK_COUNT,
            });

        match self.http.request_no_retry(builder).await {
            Ok(_) => Ok(()),
            Err(ClientError::Api { status, message }) => {
                tracing::error!(file_id = file_id, status = status, "Upload begin rejected");
                Err(ClientError::UploadRejected {
                    file_id: file_id.to_string(),
                    status,
                    message,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn put_chunk(&self, file_path: &str, index: u64, chunk: Vec<u8>) -> Result<()> {
        let builder = self
            .http
            .request(Method::PUT, &format!("{}/chunks/{}", file_path, index))
            .await?
            .header("Content-Type", "application/octet-stream")
            .body(Bytes::from(chunk));

        self.http.request_no_retry(builder).await?;
        Ok(())
    }

    async fn complete(&self, file_id: &str, file_path: &str, chunk_count: u64) -> Result<Value> {
        let builder = self
            .http
            .request(Method::POST, &format!("{}/complete", file_path))
            .await?
            .header("Content-Type", "application/json")
            .json(&UploadMarker {
                id: file_id,
                chunk_count: chunk_count as i64,
            });

        let response = self.http.request_no_retry(builder).await?;
        read_json(response).await
    }
}

/// Read up to `limit` bytes; an empty buffer means end of file
async fn read_chunk(file: &mut tokio::fs::File, limit: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(limit.min(8 * 1024 * 1024) as usize);
    (&mut *file).take(limit).read_to_end(&mut buf).await?;
    Ok(buf)
}

fn incomplete(file_id: &str, chunk_index: u64, reason: String) -> ClientError {
    ClientError::UploadIncomplete {
        file_id: file_id.to_string(),
        chunk_index,
        chunks_sent: chunk_index,
        reason,
    }
}
