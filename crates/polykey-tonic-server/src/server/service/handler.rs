//! In-memory implementation of `polykey.v2.PolykeyService`.
//!
//! This is a stand-in for the real key backend: keys are kept in a map for
//! the lifetime of the process and nothing is persisted. It exists so the
//! host has a business service to route, introspect and health-report.

use parking_lot::RwLock;
use polykey_tonic_core::{
    Error, KeyId,
    proto::{
        CreateKeyRequest, CreateKeyResponse, GetKeyRequest, GetKeyResponse,
        polykey_service_server::{PolykeyService, PolykeyServiceServer},
    },
};
use portable_atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tonic::codec::CompressionEncoding;
use tonic::{Request, Response, Status};

/// Maximum accepted length of a key description, in bytes.
pub const MAX_DESCRIPTION_LEN: usize = 1024;

#[derive(Clone, Debug)]
struct StoredKey {
    description: String,
    created_at_ms: u64,
}

#[derive(Default)]
struct KeyStore {
    next_seq: AtomicU64,
    keys: RwLock<HashMap<KeyId, StoredKey>>,
}

/// Mock key service.
///
/// Cloning shares the underlying store.
#[derive(Clone, Default)]
pub struct MockKeyService {
    store: Arc<KeyStore>,
}

impl MockKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps the service in its generated server with zstd, gzip and deflate
    /// enabled in both directions.
    pub fn into_server(self) -> PolykeyServiceServer<Self> {
        PolykeyServiceServer::new(self)
            .send_compressed(CompressionEncoding::Zstd)
            .send_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Deflate)
            .accept_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Deflate)
    }

    fn create(&self, description: String) -> Result<KeyId, Error> {
        if description.trim().is_empty() {
            return Err(Error::InvalidRequest {
                reason: "description must not be empty".to_string(),
            });
        }

        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "description is {} bytes, maximum is {MAX_DESCRIPTION_LEN}",
                    description.len()
                ),
            });
        }

        let key_id = KeyId::new(self.store.next_seq.fetch_add(1, Ordering::Relaxed) + 1);
        let created_at_ms = unix_millis(SystemTime::now());

        self.store.keys.write().insert(
            key_id,
            StoredKey {
                description,
                created_at_ms,
            },
        );

        Ok(key_id)
    }

    fn get(&self, raw_id: &str) -> Result<(KeyId, StoredKey), Error> {
        let not_found = || Error::KeyNotFound {
            key_id: raw_id.to_string(),
        };

        let key_id = KeyId::parse(raw_id).ok_or_else(not_found)?;
        let stored = self
            .store
            .keys
            .read()
            .get(&key_id)
            .cloned()
            .ok_or_else(not_found)?;

        Ok((key_id, stored))
    }
}

/// Milliseconds since the epoch; `0` before it, saturating far after it.
fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[tonic::async_trait]
impl PolykeyService for MockKeyService {
    async fn create_key(
        &self,
        req: Request<CreateKeyRequest>,
    ) -> Result<Response<CreateKeyResponse>, Status> {
        let key_id = self.create(req.into_inner().description)?;
        Ok(Response::new(CreateKeyResponse {
            key_id: key_id.to_string(),
        }))
    }

    async fn get_key(
        &self,
        req: Request<GetKeyRequest>,
    ) -> Result<Response<GetKeyResponse>, Status> {
        let (key_id, stored) = self.get(&req.get_ref().key_id)?;
        Ok(Response::new(GetKeyResponse {
            key_id: key_id.to_string(),
            description: stored.description,
            created_at_ms: stored.created_at_ms,
        }))
    }
}
