// reqwest-based client for the space REST API.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde_json::json;
use tracing::debug;
use url::Url;

use deskspace_common::types::{SpaceMember, SpaceRecord, SpaceSnapshot};

use super::{BackendError, SpaceBackend};
use crate::config::BackendConfig;

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, BackendError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| BackendError::Config(format!("bad base url `{base_url}`: {e}")))?;
        // Url::join drops the last segment unless the base ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { client, base_url, token })
    }

    /// Build from the `[backend]` config section. `None` when no URL is configured.
    pub fn from_config(config: &BackendConfig) -> Option<Result<Self, BackendError>> {
        let url = config.url.as_deref()?;
        Some(Self::new(url, config.token.clone(), config.request_timeout()))
    }

    pub fn space_url(&self, space_id: &str, tail: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.join("spaces/").map_err(|e| BackendError::Config(e.to_string()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BackendError::Config("base url cannot be a base".into()))?;
            segments.pop_if_empty().push(space_id);
            segments.extend(tail);
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, space_id: &str, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = self.authorize(request).send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(BackendError::from_status(space_id, status.as_u16(), message))
    }
}

impl SpaceBackend for HttpBackend {
    async fn get_space(&self, space_id: &str) -> Result<SpaceRecord, BackendError> {
        let url = self.space_url(space_id, &[])?;
        debug!(%url, "GET space");
        let response = self.send(space_id, self.client.get(url)).await?;
        response.json::<SpaceRecord>().await.map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn put_space(&self, space_id: &str, snapshot: &SpaceSnapshot) -> Result<(), BackendError> {
        let url = self.space_url(space_id, &[])?;
        debug!(%url, windows = snapshot.windows.len(), "PUT space");
        self.send(space_id, self.client.put(url).json(snapshot)).await?;
        Ok(())
    }

    async fn rename_space(&self, space_id: &str, name: &str) -> Result<(), BackendError> {
        let url = self.space_url(space_id, &[])?;
        self.send(space_id, self.client.patch(url).json(&json!({ "name": name }))).await?;
        Ok(())
    }

    async fn grant_permission(&self, space_id: &str, member: &SpaceMember) -> Result<(), BackendError> {
        let url = self.space_url(space_id, &["permissions"])?;
        self.send(space_id, self.client.post(url).json(member)).await?;
        Ok(())
    }

    async fn revoke_permission(&self, space_id: &str, user_id: &str) -> Result<(), BackendError> {
        let url = self.space_url(space_id, &["permissions", user_id])?;
        self.send(space_id, self.client.delete(url)).await?;
        Ok(())
    }
}

fn transport_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        BackendError::Transient(error.to_string())
    } else if error.is_decode() {
        BackendError::Decode(error.to_string())
    } else {
        BackendError::Transient(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base: &str) -> HttpBackend {
        HttpBackend::new(base, Some("t".into()), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn builds_space_urls() {
        let api = backend("https://api.example.com/v1");
        assert_eq!(api.space_url("s1", &[]).unwrap().as_str(), "https://api.example.com/v1/spaces/s1");
        assert_eq!(
            api.space_url("s1", &["permissions", "u2"]).unwrap().as_str(),
            "https://api.example.com/v1/spaces/s1/permissions/u2"
        );
    }

    #[test]
    fn space_ids_are_percent_encoded() {
        let api = backend("http://localhost:8080/");
        assert_eq!(
            api.space_url("a/b c", &[]).unwrap().as_str(),
            "http://localhost:8080/spaces/a%2Fb%20c"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        let result = HttpBackend::new("not a url", None, Duration::from_secs(1));
        assert!(matches!(result, Err(BackendError::Config(_))));
    }

    #[test]
    fn from_config_without_url_is_none() {
        assert!(HttpBackend::from_config(&BackendConfig::default()).is_none());
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let api = backend("http://127.0.0.1:9/");
        let error = api.get_space("s1").await.unwrap_err();
        assert!(error.is_retryable(), "{error:?}");
    }
}
