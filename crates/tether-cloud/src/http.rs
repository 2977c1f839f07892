use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use tether_core::errors::SyncError;
use tether_core::ids::{ConversationId, DeltaId, SnapshotId};

use crate::store::{BlobStore, CloudMetadata, DeltaRef};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct CloudConfig {
    pub base_url: String,
    pub auth_token: SecretString,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl CloudConfig {
    pub fn new(base_url: impl Into<String>, auth_token: SecretString) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token,
            connect_timeout: CONNECT_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadSnapshotRequest {
    message_count: u64,
    blob: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadDeltaRequest {
    base_index: u64,
    message_count: u64,
    blob: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotResponse {
    message_count: u64,
    blob: String,
}

#[derive(Deserialize)]
struct DeltaBlobResponse {
    blob: String,
}

/// Blob store backed by a JSON-over-HTTP sync service. Blobs travel
/// base64-encoded inside JSON bodies; the bearer token never leaves the
/// `SecretString` except at header construction.
pub struct HttpBlobStore {
    client: Client,
    config: CloudConfig,
}

impl HttpBlobStore {
    pub fn new(config: CloudConfig) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(config.connect_timeout)
                .timeout(config.request_timeout)
                .build()
                .expect("failed to build HTTP client"),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.post(self.url(path)))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header(
            "authorization",
            format!("Bearer {}", self.config.auth_token.expose_secret()),
        )
        .header("accept", "application/json")
    }

    async fn send(req: reqwest::RequestBuilder) -> Result<reqwest::Response, SyncError> {
        let resp = req.send().await.map_err(map_send_error)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status, body));
        }
        Ok(resp)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, SyncError> {
        resp.json()
            .await
            .map_err(|e| SyncError::InvalidRequest(format!("malformed response body: {e}")))
    }
}

fn map_send_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() || e.is_connect() {
        SyncError::NetworkTimeout(e.to_string())
    } else {
        SyncError::NetworkError(e.to_string())
    }
}

fn encode_blob(blob: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, blob)
}

fn decode_blob(encoded: &str) -> Result<Vec<u8>, SyncError> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
        .map_err(|e| SyncError::InvalidRequest(format!("malformed blob encoding: {e}")))
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    #[instrument(skip(self, blob), fields(conversation_id = %conversation_id, bytes = blob.len()))]
    async fn upload_snapshot(
        &self,
        conversation_id: &ConversationId,
        blob: Vec<u8>,
        message_count: u64,
    ) -> Result<SnapshotId, SyncError> {
        let body = UploadSnapshotRequest {
            message_count,
            blob: encode_blob(&blob),
        };
        let resp = Self::send(
            self.post(&format!("conversations/{conversation_id}/snapshots"))
                .json(&body),
        )
        .await?;
        let parsed: UploadResponse = Self::read_json(resp).await?;
        Ok(SnapshotId::from_raw(parsed.id))
    }

    #[instrument(skip(self, blob), fields(conversation_id = %conversation_id, base_index, bytes = blob.len()))]
    async fn upload_delta(
        &self,
        conversation_id: &ConversationId,
        base_index: u64,
        blob: Vec<u8>,
        message_count: u64,
    ) -> Result<DeltaId, SyncError> {
        let body = UploadDeltaRequest {
            base_index,
            message_count,
            blob: encode_blob(&blob),
        };
        let resp = Self::send(
            self.post(&format!("conversations/{conversation_id}/deltas"))
                .json(&body),
        )
        .await?;
        let parsed: UploadResponse = Self::read_json(resp).await?;
        Ok(DeltaId::from_raw(parsed.id))
    }

    async fn list_deltas(
        &self,
        conversation_id: &ConversationId,
        after_index: u64,
    ) -> Result<Vec<DeltaRef>, SyncError> {
        let resp = Self::send(self.get(&format!(
            "conversations/{conversation_id}/deltas?after={after_index}"
        )))
        .await?;
        Self::read_json(resp).await
    }

    async fn fetch_snapshot(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(Vec<u8>, u64), SyncError> {
        let resp = Self::send(self.get(&format!(
            "conversations/{conversation_id}/snapshots/latest"
        )))
        .await?;
        let parsed: SnapshotResponse = Self::read_json(resp).await?;
        Ok((decode_blob(&parsed.blob)?, parsed.message_count))
    }

    async fn fetch_delta(
        &self,
        conversation_id: &ConversationId,
        delta: &DeltaRef,
    ) -> Result<Vec<u8>, SyncError> {
        let resp = Self::send(self.get(&format!(
            "conversations/{conversation_id}/deltas/{}",
            delta.id
        )))
        .await?;
        let parsed: DeltaBlobResponse = Self::read_json(resp).await?;
        decode_blob(&parsed.blob)
    }

    async fn get_metadata(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<CloudMetadata, SyncError> {
        let resp = Self::send(self.get(&format!("conversations/{conversation_id}/metadata")))
            .await?;
        Self::read_json(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let store = HttpBlobStore::new(CloudConfig::new(
            "https://sync.example.com/",
            SecretString::from("token"),
        ));
        assert_eq!(
            store.url("conversations/conv_1/metadata"),
            "https://sync.example.com/conversations/conv_1/metadata"
        );
    }

    #[test]
    fn blob_encoding_roundtrip() {
        let blob = vec![0u8, 1, 2, 255, 254];
        let encoded = encode_blob(&blob);
        assert_eq!(decode_blob(&encoded).unwrap(), blob);
    }

    #[test]
    fn malformed_blob_encoding_rejected() {
        assert!(matches!(
            decode_blob("not base64 !!!"),
            Err(SyncError::InvalidRequest(_))
        ));
    }

    #[test]
    fn delta_ref_wire_format() {
        let json = r#"{"id": "delta_01", "baseIndex": 800, "messageCount": 50}"#;
        let parsed: DeltaRef = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.base_index, 800);
        assert_eq!(parsed.message_count, 50);
    }

    #[test]
    fn metadata_wire_format() {
        let json = r#"{"totalMessages": 850, "latestSnapshotIndex": 800, "compressionRatio": 4.2}"#;
        let parsed: CloudMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.total_messages, 850);
        assert_eq!(parsed.latest_snapshot_index, 800);
    }

    #[test]
    fn default_timeouts() {
        let config = CloudConfig::new("https://sync.example.com", SecretString::from("t"));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
    }
}
