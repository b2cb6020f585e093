//! Shared collection snapshot
//!
//! Both reserved keys are filtered views over the same upstream collection.
//! `SnapshotSource` lets them share one `fetch_all_items` per warm-up or
//! refresh cycle: the first caller fetches while holding the lock, later
//! callers within `max_age` reuse its result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::notion::{NotionClient, UpstreamError, UpstreamItem};

struct Snapshot {
    taken_at: Instant,
    items: Arc<Vec<UpstreamItem>>,
}

pub struct SnapshotSource {
    client: NotionClient,
    max_age: Duration,
    latest: Mutex<Option<Snapshot>>,
}

impl SnapshotSource {
    pub fn new(client: NotionClient, max_age: Duration) -> Self {
        Self {
            client,
            max_age,
            latest: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &NotionClient {
        &self.client
    }

    /// The full collection, fetched at most once per `max_age`.
    ///
    /// Failures are not remembered; the next caller fetches again.
    pub async fn items(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<Vec<UpstreamItem>>, UpstreamError> {
        let mut latest = tokio::select! {
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
            guard = self.latest.lock() => guard,
        };

        if let Some(snapshot) = latest.as_ref() {
            if snapshot.taken_at.elapsed() < self.max_age {
                debug!(items = snapshot.items.len(), "Reusing collection snapshot");
                return Ok(snapshot.items.clone());
            }
        }

        let items = Arc::new(self.client.fetch_all_items(cancel).await?);
        debug!(items = items.len(), "Stored new collection snapshot");
        *latest = Some(Snapshot {
            taken_at: Instant::now(),
            items: items.clone(),
        });
        Ok(items)
    }

    /// Forget the cached snapshot so the next call goes upstream
    pub async fn invalidate(&self) {
        *self.latest.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notion::client::RetryPolicy;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page(id: &str) -> serde_json::Value {
        json!({
            "object": "page",
            "id": id,
            "last_edited_time": "2024-03-05T10:20:00.000Z",
            "properties": {}
        })
    }

    async fn source(server: &MockServer, max_age: Duration) -> SnapshotSource {
        let client = NotionClient::new("secret", "db1", Duration::from_secs(5))
            .unwrap()
            .with_base_url(&server.uri())
            .with_retry_policy(RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(10),
            });
        SnapshotSource::new(client, max_age)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/databases/db1/query"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": [page("p1"), page("p2")], "has_more": false}))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = source(&server, Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(source.items(&cancel), source.items(&cancel));

        assert_eq!(a.unwrap().len(), 2);
        assert_eq!(b.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/databases/db1/query"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": [page("p1")], "has_more": false})),
            )
            .expect(3)
            .mount(&server)
            .await;

        let source = source(&server, Duration::from_millis(20)).await;
        let cancel = CancellationToken::new();
        source.items(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        source.items(&cancel).await.unwrap();

        source.invalidate().await;
        source.items(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_is_not_memoized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/databases/db1/query"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "code": "internal_server_error",
                "message": "boom"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/databases/db1/query"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": [page("p1")], "has_more": false})),
            )
            .mount(&server)
            .await;

        let source = source(&server, Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        assert!(source.items(&cancel).await.is_err());
        assert_eq!(source.items(&cancel).await.unwrap().len(), 1);
    }
}
