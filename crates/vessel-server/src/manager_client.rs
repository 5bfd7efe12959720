use serde::Deserialize;
use serde::de::DeserializeOwned;
use vessel_core::{BoxFuture, ComponentLookup, ContainerError, Credentials, Handle, ManagerClient};

/// [`ManagerClient`] speaking JSON over HTTP to the Manager at `base_url`.
///
/// Endpoints:
/// - `GET  /health`
/// - `POST /containers/challenge`            `{name}` -> `{challenge}`
/// - `POST /containers/login`                credentials -> `{handle}`
/// - `POST /containers/{handle}/logout`
/// - `POST /containers/{handle}/components`  `{curl, activate}` -> lookup
/// - `POST /containers/{handle}/services`    `{curl, activate}` -> lookup
/// - `POST /containers/{handle}/release`     `{curl}`
pub struct HttpManagerClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ChallengeReply {
    challenge: String,
}

#[derive(Deserialize)]
struct LoginReply {
    handle: Handle,
}

impl HttpManagerClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response, ContainerError> {
        let url = self.url(path);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ContainerError::ManagerUnreachable(format!("{url}: {e}")))?;
        check_status(&url, resp).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ContainerError> {
        let resp = self.post(path, body).await?;
        resp.json()
            .await
            .map_err(|e| ContainerError::System(format!("invalid Manager reply to {path}: {e}")))
    }
}

async fn check_status(url: &str, resp: reqwest::Response) -> Result<reqwest::Response, ContainerError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status.as_u16() {
        401 | 403 => Err(ContainerError::Authentication(format!("{url} returned {status}: {body}"))),
        502..=504 => Err(ContainerError::ManagerUnreachable(format!("{url} returned {status}"))),
        _ => Err(ContainerError::System(format!("{url} returned {status}: {body}"))),
    }
}

impl ManagerClient for HttpManagerClient {
    fn resolve(&self) -> BoxFuture<'_, Result<(), ContainerError>> {
        Box::pin(async move {
            let url = self.url("/health");
            let resp = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| ContainerError::ManagerUnreachable(format!("{url}: {e}")))?;
            check_status(&url, resp).await.map(|_| ())
        })
    }

    fn challenge<'a>(&'a self, container_name: &'a str) -> BoxFuture<'a, Result<String, ContainerError>> {
        Box::pin(async move {
            let reply: ChallengeReply = self
                .post_json("/containers/challenge", serde_json::json!({ "name": container_name }))
                .await?;
            Ok(reply.challenge)
        })
    }

    fn login<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<Handle, ContainerError>> {
        Box::pin(async move {
            let body = serde_json::to_value(credentials)?;
            let reply: LoginReply = self.post_json("/containers/login", body).await?;
            Ok(reply.handle)
        })
    }

    fn logout(&self, handle: Handle) -> BoxFuture<'_, Result<(), ContainerError>> {
        Box::pin(async move {
            self.post(&format!("/containers/{handle}/logout"), serde_json::Value::Null)
                .await
                .map(|_| ())
        })
    }

    fn get_component<'a>(
        &'a self,
        handle: Handle,
        curl: &'a str,
        activate: bool,
    ) -> BoxFuture<'a, Result<ComponentLookup, ContainerError>> {
        Box::pin(async move {
            self.post_json(
                &format!("/containers/{handle}/components"),
                serde_json::json!({ "curl": curl, "activate": activate }),
            )
            .await
        })
    }

    fn get_service<'a>(
        &'a self,
        handle: Handle,
        curl: &'a str,
        activate: bool,
    ) -> BoxFuture<'a, Result<ComponentLookup, ContainerError>> {
        Box::pin(async move {
            self.post_json(
                &format!("/containers/{handle}/services"),
                serde_json::json!({ "curl": curl, "activate": activate }),
            )
            .await
        })
    }

    fn release_component<'a>(&'a self, handle: Handle, curl: &'a str) -> BoxFuture<'a, Result<(), ContainerError>> {
        Box::pin(async move {
            self.post(
                &format!("/containers/{handle}/release"),
                serde_json::json!({ "curl": curl }),
            )
            .await
            .map(|_| ())
        })
    }
}
