//! REST endpoints backing the pull-based notification queries.

use crate::error::FetchError;
use crate::query::Fetcher;
use async_trait::async_trait;
use livecore::net::{HttpClient, HttpRequest, HttpResponse};
use livecore::types::{MessagesNotification, NotificationPage, ReadNotification};
use livecore::{CachedValue, QueryKey};
use log::debug;
use serde::de::DeserializeOwned;
use std::sync::{Arc, PoisonError, RwLock};

pub struct NotificationsApi {
    http: Arc<dyn HttpClient>,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl NotificationsApi {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    fn token(&self) -> Result<String, FetchError> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or(FetchError::MissingCredential)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let request = request.with_bearer(&self.token()?);
        debug!(target: "Sync/Http", "{} {}", request.method, request.url);
        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?;
        if !response.is_success() {
            return Err(FetchError::Status(response.status_code));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let response = self.send(HttpRequest::get(self.url(path))).await?;
        let body = response
            .body_into_vec()
            .map_err(|e| FetchError::Http(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// `GET /notifications?limit=&offset=`
    pub async fn user_notifications(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<NotificationPage, FetchError> {
        self.get_json(&format!("/notifications?limit={limit}&offset={offset}"))
            .await
    }

    /// `GET /notifications/messages`
    pub async fn message_notifications(&self) -> Result<Vec<MessagesNotification>, FetchError> {
        self.get_json("/notifications/messages").await
    }

    /// `PATCH /notifications/read`. Callers invalidate the
    /// `User Notifications` tag afterwards.
    pub async fn read_notifications(&self, ids: &[i64]) -> Result<(), FetchError> {
        let body = serde_json::to_vec(&ReadNotification {
            notification_ids: ids.to_vec(),
        })
        .map_err(|e| FetchError::Decode(e.to_string()))?;
        let request = HttpRequest::patch(self.url("/notifications/read"))
            .with_header("Content-Type", "application/json")
            .with_body(body);
        self.send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl Fetcher for NotificationsApi {
    async fn fetch(&self, key: &QueryKey) -> Result<CachedValue, FetchError> {
        match key {
            QueryKey::UserNotifications { limit, offset } => self
                .user_notifications(*limit, *offset)
                .await
                .map(CachedValue::Notifications),
            QueryKey::MessageNotifications => self
                .message_notifications()
                .await
                .map(CachedValue::MessageNotifications),
            _ => Err(FetchError::NotFetchable(*key)),
        }
    }
}
