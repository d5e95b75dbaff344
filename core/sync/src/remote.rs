//! Client for the remote authority holding the canonical record copies.
//!
//! The engine talks to the authority through the [`RemoteAuthority`]
//! trait; [`HttpAuthority`] is the production implementation over the
//! per-collection REST endpoints. Tests substitute an in-memory
//! implementation.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use fieldsync_common::{AuthToken, Collection, Error, Result, UserInfo};

/// Response to a successful login.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user: UserInfo,
    pub token: String,
}

/// Request/response surface of the remote authority.
///
/// Every record operation carries the session's bearer credential. Non-2xx
/// responses surface as [`Error::RemoteRejected`]; transport failures as
/// [`Error::Http`] or [`Error::Unreachable`].
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse>;

    async fn logout(&self, token: &AuthToken) -> Result<()>;

    /// Create a record; the returned payload carries the server-assigned
    /// `id`.
    async fn create(&self, collection: Collection, payload: &Value, token: &AuthToken)
        -> Result<Value>;

    async fn update(
        &self,
        collection: Collection,
        id: i64,
        payload: &Value,
        token: &AuthToken,
    ) -> Result<Value>;

    async fn delete(&self, collection: Collection, id: i64, token: &AuthToken) -> Result<()>;

    /// List a collection, optionally filtered by a `{entity}Id=value`
    /// query pair.
    async fn list(
        &self,
        collection: Collection,
        filter: Option<(&str, i64)>,
        token: &AuthToken,
    ) -> Result<Vec<Value>>;
}

/// HTTP implementation of [`RemoteAuthority`].
#[derive(Clone)]
pub struct HttpAuthority {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAuthority {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        Ok(Self {
            endpoint,
            client: reqwest::Client::builder().build()?,
        })
    }

    fn collection_url(&self, collection: Collection) -> String {
        format!("{}/{}", self.endpoint, collection.as_str())
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::RemoteRejected {
                status: status.as_u16(),
                message: parse_api_error(status, &body),
            })
        }
    }
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        let response = self
            .client
            .post(format!("{}/api/auth/login", self.endpoint))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;
        let response = Self::expect_success(response).await?;
        Ok(response.json::<LoginResponse>().await?)
    }

    async fn logout(&self, token: &AuthToken) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/auth/logout", self.endpoint))
            .bearer_auth(token.expose())
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn create(
        &self,
        collection: Collection,
        payload: &Value,
        token: &AuthToken,
    ) -> Result<Value> {
        let response = self
            .client
            .post(self.collection_url(collection))
            .bearer_auth(token.expose())
            .json(payload)
            .send()
            .await?;
        let response = Self::expect_success(response).await?;
        Ok(response.json().await?)
    }

    async fn update(
        &self,
        collection: Collection,
        id: i64,
        payload: &Value,
        token: &AuthToken,
    ) -> Result<Value> {
        let response = self
            .client
            .put(format!("{}/{id}", self.collection_url(collection)))
            .bearer_auth(token.expose())
            .json(payload)
            .send()
            .await?;
        let response = Self::expect_success(response).await?;
        Ok(response.json().await?)
    }

    async fn delete(&self, collection: Collection, id: i64, token: &AuthToken) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/{id}", self.collection_url(collection)))
            .bearer_auth(token.expose())
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn list(
        &self,
        collection: Collection,
        filter: Option<(&str, i64)>,
        token: &AuthToken,
    ) -> Result<Vec<Value>> {
        let mut request = self
            .client
            .get(self.collection_url(collection))
            .bearer_auth(token.expose());
        if let Some((field, value)) = filter {
            request = request.query(&[(field, value)]);
        }
        let response = Self::expect_success(request.send().await?).await?;
        Ok(response.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return message.trim().to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed.to_string()
    }
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(Error::InvalidInput("endpoint must not be empty".into()));
    }
    let parsed = url::Url::parse(endpoint)
        .map_err(|e| Error::InvalidInput(format!("invalid endpoint: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(Error::InvalidInput(
            "endpoint must use http:// or https://".into(),
        ));
    }
    Ok(endpoint.trim_end_matches('/').to_string())
}
