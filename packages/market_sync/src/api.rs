//! Request/response collaborators consumed outside the live channel.
//!
//! Only the success/failure outcome of these calls matters to the sync core,
//! so they sit behind small traits; [`HttpApi`] is the production
//! implementation.

use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use crate::error::SyncError;
use crate::models::{ConversationSummary, Credential, EntityId};

pub trait FavoritesApi: Send + Sync + 'static {
    fn fetch_favorite_ids(&self) -> BoxFuture<'_, Result<Vec<EntityId>, SyncError>>;

    /// Ask the server to flip membership of `entity_id`, given the membership
    /// the client saw before the toggle.
    fn confirm_toggle<'a>(
        &'a self,
        entity_id: &'a EntityId,
        previously_member: bool,
    ) -> BoxFuture<'a, Result<(), SyncError>>;
}

pub trait ConversationsApi: Send + Sync + 'static {
    fn fetch_conversations(&self) -> BoxFuture<'_, Result<Vec<ConversationSummary>, SyncError>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToggleBody {
    previous_state: bool,
}

/// HTTP client for the marketplace REST API.
#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    credential: Credential,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        let url = self.url(path);
        debug!(%url, "GET");
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, self.credential.bearer())
            .send()
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        check_status(response.status())?;
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid response from {url}: {e}")))
    }

    async fn post_toggle(
        &self,
        entity_id: &EntityId,
        previously_member: bool,
    ) -> Result<(), SyncError> {
        let url = self.url(&format!("favorites/{entity_id}/toggle"));
        debug!(%url, previously_member, "POST");
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, self.credential.bearer())
            .json(&ToggleBody {
                previous_state: previously_member,
            })
            .send()
            .await
            .map_err(|e| SyncError::Confirmation(e.to_string()))?;
        match check_status(response.status()) {
            Err(SyncError::Connection(msg)) => Err(SyncError::Confirmation(msg)),
            other => other,
        }
    }
}

fn check_status(status: StatusCode) -> Result<(), SyncError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(SyncError::Auth(format!("server returned {status}")))
        }
        _ => Err(SyncError::Connection(format!("server returned {status}"))),
    }
}

impl FavoritesApi for HttpApi {
    fn fetch_favorite_ids(&self) -> BoxFuture<'_, Result<Vec<EntityId>, SyncError>> {
        Box::pin(self.get_json::<Vec<EntityId>>("favorites/ids"))
    }

    fn confirm_toggle<'a>(
        &'a self,
        entity_id: &'a EntityId,
        previously_member: bool,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(self.post_toggle(entity_id, previously_member))
    }
}

impl ConversationsApi for HttpApi {
    fn fetch_conversations(&self) -> BoxFuture<'_, Result<Vec<ConversationSummary>, SyncError>> {
        Box::pin(self.get_json::<Vec<ConversationSummary>>("conversations"))
    }
}
