use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use peersync_core::{
    CoordinationBackend, LeaderClaim, RemoteSnapshotMetadata, SyncError, SyncIntent,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

/// Fixed logical name of the shared snapshot object.
const SHARED_DB: &str = "shared.db";
/// Key segment under which coordination markers live.
const COORD_SEGMENT: &str = "coordination";
/// Zero-padded millisecond width so marker keys sort chronologically.
const MILLIS_WIDTH: usize = 20;

/// Coordination backend over an S3-compatible object store.
///
/// There is no lock primitive, so leadership is resolved through marker
/// objects: upload a candidate marker, wait a settle interval, re-list, and
/// win iff our marker is the earliest of all live markers by
/// (timestamp, instance id). Markers older than the staleness bound are
/// deleted by any observer, which is how crashed leaders are recovered.
///
/// Key layout under `{prefix}/`:
/// `shared.db`, `shared.db.tmp-{instance}` (abandoned stages, cleaned up),
/// `coordination/intent-{instance}.json`,
/// `coordination/leader-{millis}-{instance}.json`.
pub struct CloudObjectBackend {
    client: S3Client,
    bucket: String,
    prefix: String,
    instance_id: String,
    settle: Duration,
    staleness: Duration,
    /// Key of our live leader marker, if we currently hold leadership
    marker_key: Mutex<Option<String>>,
}

impl std::fmt::Debug for CloudObjectBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudObjectBackend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl CloudObjectBackend {
    /// Create a backend over an already-configured client.
    pub fn new(
        client: S3Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        settle: Duration,
        staleness: Duration,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            settle,
            staleness,
            marker_key: Mutex::new(None),
        }
    }

    /// Build a client from the ambient AWS credential chain, with an
    /// optional endpoint override for R2/minio-style stores.
    pub async fn connect(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        endpoint: Option<String>,
        region: Option<String>,
        settle: Duration,
        staleness: Duration,
    ) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(region) = region {
            builder = builder.region(aws_sdk_s3::config::Region::new(region));
        }
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());
        Self::new(client, bucket, prefix, settle, staleness)
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), name)
        }
    }

    fn db_key(&self) -> String {
        self.key(SHARED_DB)
    }

    fn stage_prefix(&self) -> String {
        self.key(&format!("{}.tmp-", SHARED_DB))
    }

    fn coord_prefix(&self) -> String {
        self.key(&format!("{}/", COORD_SEGMENT))
    }

    fn intent_key(&self) -> String {
        self.key(&format!(
            "{}/intent-{}.json",
            COORD_SEGMENT, self.instance_id
        ))
    }

    fn leader_marker_prefix(&self) -> String {
        self.key(&format!("{}/leader-", COORD_SEGMENT))
    }

    fn leader_marker_key(&self, millis: i64) -> String {
        self.key(&format!(
            "{}/leader-{:0width$}-{}.json",
            COORD_SEGMENT,
            millis,
            self.instance_id,
            width = MILLIS_WIDTH
        ))
    }

    /// Millisecond timestamp embedded in a leader marker key, if well-formed.
    fn marker_millis(key: &str) -> Option<i64> {
        let name = key.rsplit('/').next()?;
        let rest = name.strip_prefix("leader-")?;
        rest.get(..MILLIS_WIDTH)?.parse().ok()
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| SyncError::Io(format!("Failed to read object body: {}", e)))?
                    .into_bytes();
                Ok(Some(bytes.to_vec()))
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(SyncError::Io(format!("get_object error: {}", service_error)))
                }
            }
        }
    }

    async fn put_object(&self, key: &str, data: Vec<u8>) -> Result<(), SyncError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| SyncError::Io(format!("put_object error: {}", e)))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), SyncError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| SyncError::Io(format!("delete_object error: {}", e)))?;
        Ok(())
    }

    /// List keys under a prefix, paginated.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|e| SyncError::Io(format!("list_objects error: {}", e)))?;

            if let Some(contents) = output.contents {
                for obj in contents {
                    if let Some(key) = obj.key {
                        keys.push(key);
                    }
                }
            }

            if output.is_truncated.unwrap_or(false) {
                continuation_token = output.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }

    /// List leader markers, deleting any past the staleness bound, and
    /// return the survivors sorted by (timestamp, instance id).
    async fn live_markers(&self) -> Result<Vec<String>, SyncError> {
        let now = chrono::Utc::now().timestamp_millis();
        let stale_before = now - self.staleness.as_millis() as i64;
        let mut live = Vec::new();

        for key in self.list_keys(&self.leader_marker_prefix()).await? {
            match Self::marker_millis(&key) {
                Some(millis) if millis >= stale_before => live.push(key),
                _ => {
                    // Stale or malformed marker from a crashed peer.
                    debug!("Removing stale leader marker {}", key);
                    if let Err(e) = self.delete_object(&key).await {
                        warn!("Failed to remove stale marker {}: {}", key, e);
                    }
                }
            }
        }

        live.sort();
        Ok(live)
    }

    /// One upload-then-relist election round.
    async fn attempt_election(&self) -> Result<bool, SyncError> {
        let existing = self.live_markers().await?;
        if !existing.is_empty() {
            debug!("Leader markers present, another instance is syncing");
            return Ok(false);
        }

        let now = chrono::Utc::now();
        let candidate = self.leader_marker_key(now.timestamp_millis());
        let claim = LeaderClaim {
            instance_id: self.instance_id.clone(),
            elected_at: now,
            process_id: std::process::id(),
        };
        let body = serde_json::to_vec_pretty(&claim)
            .map_err(|e| SyncError::Serialization(format!("Failed to serialize claim: {}", e)))?;
        self.put_object(&candidate, body).await?;

        // Let concurrent candidates land before deciding.
        sleep(self.settle).await;

        let live = self.live_markers().await?;
        if live.first().map(String::as_str) == Some(candidate.as_str()) {
            *self.marker_key.lock().unwrap() = Some(candidate);
            debug!("Instance {} won marker election", self.instance_id);
            return Ok(true);
        }

        // Lost the race: withdraw our candidate.
        debug!("Lost marker election to {:?}", live.first());
        if let Err(e) = self.delete_object(&candidate).await {
            warn!("Failed to withdraw losing marker: {}", e);
        }
        Ok(false)
    }
}

#[async_trait]
impl CoordinationBackend for CloudObjectBackend {
    fn backend_name(&self) -> &'static str {
        "cloud_object"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[instrument(skip(self), level = "debug")]
    async fn is_available(&self) -> bool {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
    }

    #[instrument(skip(self), level = "debug")]
    async fn register_intent(&self, operation_type: &str) -> Result<bool, SyncError> {
        let intent = SyncIntent {
            instance_id: self.instance_id.clone(),
            operation_type: operation_type.to_string(),
            timestamp: chrono::Utc::now(),
            process_id: std::process::id(),
        };
        let body = serde_json::to_vec_pretty(&intent)
            .map_err(|e| SyncError::Serialization(format!("Failed to serialize intent: {}", e)))?;
        self.put_object(&self.intent_key(), body)
            .await
            .map_err(|e| SyncError::Unavailable(e.to_string()))?;
        debug!("Registered sync intent for {}", self.instance_id);
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn elect_leader(&self, timeout: Duration) -> Result<bool, SyncError> {
        if self.marker_key.lock().unwrap().is_some() {
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.attempt_election().await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(self.settle.min(remaining)).await;
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn download_database(&self, dest: &Path) -> Result<bool, SyncError> {
        let data = match self.get_object(&self.db_key()).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!("No shared snapshot object yet, nothing to download");
                return Ok(false);
            }
            Err(e) => return Err(SyncError::Download(e.to_string())),
        };

        let tmp = dest.with_extension("download.tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| SyncError::Download(format!("Failed to write snapshot: {}", e)))?;
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| SyncError::Download(format!("Failed to finalize download: {}", e)))?;
        debug!("Downloaded {} bytes to {}", data.len(), dest.display());
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn upload_database(&self, src: &Path) -> Result<(), SyncError> {
        let data = tokio::fs::read(src)
            .await
            .map_err(|e| SyncError::Upload(format!("Failed to read snapshot: {}", e)))?;
        let len = data.len();

        // PUT is atomic at the key level: readers see the old or the new
        // object, never a partial one.
        self.put_object(&self.db_key(), data)
            .await
            .map_err(|e| SyncError::Upload(e.to_string()))?;

        // Clear out staged duplicates abandoned by crashed peers.
        match self.list_keys(&self.stage_prefix()).await {
            Ok(stages) => {
                for key in stages {
                    if let Err(e) = self.delete_object(&key).await {
                        warn!("Failed to remove abandoned stage {}: {}", key, e);
                    }
                }
            }
            Err(e) => warn!("Failed to list abandoned stages: {}", e),
        }

        debug!("Published shared snapshot ({} bytes)", len);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn release_leadership(&self) {
        let marker = self.marker_key.lock().unwrap().take();
        if let Some(marker) = marker {
            if let Err(e) = self.delete_object(&marker).await {
                warn!("Failed to remove leader marker {}: {}", marker, e);
            }
            debug!("Instance {} released leadership", self.instance_id);
        }
        if let Err(e) = self.delete_object(&self.intent_key()).await {
            warn!("Failed to remove intent marker: {}", e);
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn cleanup_stale(&self, max_age: Duration) {
        // No liveness primitive here: age alone decides.
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age.as_millis() as i64;

        let markers = match self.list_keys(&self.coord_prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list coordination artifacts: {}", e);
                return;
            }
        };
        for key in markers {
            if key.contains(&self.instance_id) {
                continue;
            }
            let expired = match Self::marker_millis(&key) {
                Some(millis) => millis < cutoff,
                // Intent markers carry their timestamp in the body.
                None => match self.get_object(&key).await {
                    Ok(Some(body)) => serde_json::from_slice::<SyncIntent>(&body)
                        .map(|i| i.timestamp.timestamp_millis() < cutoff)
                        .unwrap_or(true),
                    Ok(None) => false,
                    Err(_) => false,
                },
            };
            if expired {
                debug!("Removing stale coordination artifact {}", key);
                if let Err(e) = self.delete_object(&key).await {
                    warn!("Failed to remove stale artifact {}: {}", key, e);
                }
            }
        }
    }

    #[instrument(skip(self, last), level = "debug")]
    async fn has_changed(
        &self,
        last: Option<&RemoteSnapshotMetadata>,
    ) -> (bool, Option<RemoteSnapshotMetadata>) {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.db_key())
            .send()
            .await;

        let current = match result {
            Ok(output) => Some(RemoteSnapshotMetadata {
                version_token: output.e_tag,
                modified_at: output.last_modified.map(|dt| dt.secs()),
                size: output.content_length.unwrap_or(0) as u64,
            }),
            Err(e) => {
                let service_error = e.into_service_error();
                if !service_error.is_not_found() {
                    // Probe failed: report changed rather than risk missing
                    // a remote update.
                    warn!("head_object failed, assuming changed: {}", service_error);
                    return (true, None);
                }
                None
            }
        };

        match (last, &current) {
            (Some(last), Some(current)) => (last.differs_from(current), Some(current.clone())),
            _ => (true, current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};

    fn test_backend(prefix: &str) -> CloudObjectBackend {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(Credentials::new("test", "test", None, None, "test"))
            .region(Region::new("auto"))
            .build();
        CloudObjectBackend::new(
            S3Client::from_conf(config),
            "bucket",
            prefix,
            Duration::from_millis(100),
            Duration::from_secs(600),
        )
    }

    #[test]
    fn key_layout_respects_prefix() {
        let backend = test_backend("team/app");
        assert_eq!(backend.db_key(), "team/app/shared.db");
        assert_eq!(backend.coord_prefix(), "team/app/coordination/");
        assert!(backend
            .intent_key()
            .starts_with("team/app/coordination/intent-"));

        let bare = test_backend("");
        assert_eq!(bare.db_key(), "shared.db");
    }

    #[test]
    fn marker_keys_sort_by_timestamp_then_instance() {
        let backend = test_backend("p");
        let early = backend.leader_marker_key(1_000);
        let late = backend.leader_marker_key(2_000);
        assert!(early < late);
        assert_eq!(CloudObjectBackend::marker_millis(&early), Some(1_000));

        // Same timestamp: instance id breaks the tie lexicographically.
        let a = "p/coordination/leader-00000000000000001000-aaaa.json";
        let b = "p/coordination/leader-00000000000000001000-bbbb.json";
        assert!(a < b);
        assert_eq!(CloudObjectBackend::marker_millis(a), Some(1_000));
    }

    #[test]
    fn malformed_marker_keys_are_rejected() {
        assert_eq!(CloudObjectBackend::marker_millis("p/coordination/leader-abc.json"), None);
        assert_eq!(CloudObjectBackend::marker_millis("p/coordination/intent-x.json"), None);
        assert_eq!(
            CloudObjectBackend::marker_millis("p/coordination/leader-00000000000000001000"),
            Some(1_000)
        );
    }
}
