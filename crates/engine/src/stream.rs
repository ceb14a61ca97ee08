//! Hash-while-staging: stream a payload into the staging area.
//!
//! The first `sniff_len` bytes are read before anything touches storage so a
//! declared media type can be checked up front. The rest of the body flows
//! through a fixed-size buffer; the whole payload is never held in memory.

use crate::error::{EngineError, EngineResult};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};
use vault_core::config::EngineConfig;
use vault_core::{ContentHash, ContentHasher, MediaType, sniff};
use vault_storage::{BlobStore, StagingUpload, StorageError, TempLocation};

/// A payload fully written to the staging area.
#[derive(Debug)]
pub struct StagedBlob {
    /// Staging file holding the bytes.
    pub temp: TempLocation,
    pub hash: ContentHash,
    pub size: u64,
    /// Media type sniffed from the payload prefix.
    pub media_type: MediaType,
    /// Final location once committed to the blob store.
    pub location: Option<String>,
}

/// Stream `body` into a new staging file, hashing and counting as it goes.
///
/// Fails with `MediaTypeMismatch` before any staging file exists when
/// `declared` disagrees with the sniffed type. Any read or write failure
/// removes the staging file and surfaces as `StreamIo`. A zero-sized stream
/// buffer is rejected as `InvalidInput`.
pub async fn stage_stream<R>(
    blobs: &dyn BlobStore,
    config: &EngineConfig,
    declared: Option<&MediaType>,
    mut body: R,
) -> EngineResult<StagedBlob>
where
    R: AsyncRead + Unpin + Send,
{
    // An empty buffer reads as end of stream
    if config.stream_buffer_size == 0 {
        return Err(EngineError::InvalidInput(
            "stream buffer size must be positive".into(),
        ));
    }

    let prefix = read_prefix(&mut body, config.sniff_len).await?;
    let media_type = sniff(&prefix);

    if let Some(declared) = declared
        && !declared.same_essence(&media_type)
    {
        return Err(EngineError::MediaTypeMismatch {
            declared: declared.to_string(),
            sniffed: media_type.to_string(),
        });
    }

    let mut upload = blobs.stage().await.map_err(EngineError::StreamIo)?;
    let mut hasher = ContentHash::hasher();

    match pump(&mut *upload, &mut hasher, prefix, &mut body, config).await {
        Ok(size) => {
            let pending = upload.temp().clone();
            let temp = match upload.finish().await {
                Ok(temp) => temp,
                Err(err) => {
                    if let Err(cleanup) = blobs.discard(&pending).await {
                        warn!(temp = %pending, error = %cleanup, "Failed to discard staging file");
                    }
                    return Err(EngineError::StreamIo(err));
                }
            };
            let hash = hasher.finalize();
            debug!(content_hash = %hash, size, temp = %temp, "Payload staged");
            Ok(StagedBlob {
                temp,
                hash,
                size,
                media_type,
                location: None,
            })
        }
        Err(err) => {
            if let Err(cleanup) = upload.abort().await {
                warn!(error = %cleanup, "Failed to abort staging upload");
            }
            Err(err)
        }
    }
}

async fn read_prefix<R>(body: &mut R, sniff_len: usize) -> EngineResult<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut prefix = vec![0u8; sniff_len];
    let mut filled = 0;
    // A single read may return fewer bytes than are available
    while filled < sniff_len {
        let n = body
            .read(&mut prefix[filled..])
            .await
            .map_err(|e| EngineError::StreamIo(StorageError::Io(e)))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    prefix.truncate(filled);
    Ok(prefix)
}

async fn pump<R>(
    upload: &mut dyn StagingUpload,
    hasher: &mut ContentHasher,
    prefix: Vec<u8>,
    body: &mut R,
    config: &EngineConfig,
) -> EngineResult<u64>
where
    R: AsyncRead + Unpin + Send,
{
    let check_limit = |size: u64| match config.max_payload_bytes {
        Some(limit) if size > limit => Err(EngineError::PayloadTooLarge { limit }),
        _ => Ok(()),
    };

    let mut size = prefix.len() as u64;
    check_limit(size)?;
    hasher.update(&prefix);
    upload
        .write(Bytes::from(prefix))
        .await
        .map_err(EngineError::StreamIo)?;

    let mut buf = vec![0u8; config.stream_buffer_size];
    loop {
        let n = body
            .read(&mut buf)
            .await
            .map_err(|e| EngineError::StreamIo(StorageError::Io(e)))?;
        if n == 0 {
            break;
        }
        size += n as u64;
        check_limit(size)?;
        hasher.update(&buf[..n]);
        upload
            .write(Bytes::copy_from_slice(&buf[..n]))
            .await
            .map_err(EngineError::StreamIo)?;
    }

    Ok(size)
}
