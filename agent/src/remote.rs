//! HTTP client for the remote store.
//!
//! A thin JSON mapping of the [`RemoteStore`] contract:
//!
//! | Call                 | Request                              |
//! |----------------------|--------------------------------------|
//! | `is_available`       | `GET /health`                        |
//! | `fetch_all_owned_by` | `GET /owners/{owner}/entities`       |
//! | `save`               | `PUT /entities/{handle}`             |
//! | `delete`             | `DELETE /entities/{handle}`          |
//! | `respond_to_share`   | `POST /shares/{id}/{accept,reject}`  |

use crate::error::{SyncError, SyncResult};
use crate::store::{RemoteRecord, RemoteStore};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use std::time::Duration;

/// [`RemoteStore`] backed by an HTTP service.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: Client,
    base_url: Url,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveRequest<'a> {
    owner_id: &'a str,
    document: &'a serde_json::Value,
}

impl HttpRemoteStore {
    /// Create a client for `base_url`. `timeout` bounds every request.
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::Local(format!("invalid remote URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Local(format!("remote URL {base_url} cannot be a base")));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// Build an endpoint URL, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Local("remote URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Map non-success statuses onto the sync error taxonomy.
async fn check(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(SyncError::Unavailable(format!("not signed in ({status})")));
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Remote(format!("{status}: {body}")))
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn is_available(&self) -> bool {
        let Ok(url) = self.endpoint(&["health"]) else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Remote health check failed");
                false
            }
        }
    }

    async fn fetch_all_owned_by(&self, owner: &str) -> SyncResult<Vec<RemoteRecord>> {
        let url = self.endpoint(&["owners", owner, "entities"])?;
        let response = check(self.client.get(url).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn save(&self, record: &RemoteRecord, owner: &str) -> SyncResult<()> {
        let url = self.endpoint(&["entities", &record.handle])?;
        let body = SaveRequest {
            owner_id: owner,
            document: &record.document,
        };
        check(self.client.put(url).json(&body).send().await?).await?;
        Ok(())
    }

    async fn delete(&self, handle: &str) -> SyncResult<()> {
        let url = self.endpoint(&["entities", handle])?;
        let response = self.client.delete(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    async fn respond_to_share(&self, entity_id: &str, accepted: bool) -> SyncResult<()> {
        let action = if accepted { "accept" } else { "reject" };
        let url = self.endpoint(&["shares", entity_id, action])?;
        check(self.client.post(url).send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_joined_and_encoded() {
        let store = HttpRemoteStore::new("https://sync.example.com/api/", Duration::from_secs(5))
            .unwrap();
        let url = store.endpoint(&["entities", "rec 1/a"]).unwrap();
        assert_eq!(url.as_str(), "https://sync.example.com/api/entities/rec%201%2Fa");

        let url = store.endpoint(&["owners", "alice", "entities"]).unwrap();
        assert_eq!(url.path(), "/api/owners/alice/entities");
    }

    #[test]
    fn rejects_invalid_urls() {
        assert!(HttpRemoteStore::new("not a url", Duration::from_secs(5)).is_err());
        assert!(HttpRemoteStore::new("mailto:sync@example.com", Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn unreachable_remote_is_unavailable() {
        // port 9 (discard) on localhost is not expected to be listening
        let store = HttpRemoteStore::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(!store.is_available().await);
    }
}
