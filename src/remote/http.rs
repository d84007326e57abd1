use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::entity::EntityType;

use super::{RemoteApi, RemoteError};

/// JSON-over-HTTPS binding for the remote service.
pub struct HttpRemote {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(&self, response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        debug!(
            target: "ledgerline",
            event = "remote_http_error",
            status = %status,
            message = %message
        );
        match status {
            StatusCode::NOT_FOUND => Err(RemoteError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::Unauthorized),
            _ => Err(RemoteError::Status {
                code: status.as_u16(),
                message,
            }),
        }
    }

    async fn json(&self, response: Response) -> Result<Value, RemoteError> {
        response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::Payload(e.to_string()))
    }
}

fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Transport(err.to_string())
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn resolve_current_identity(&self) -> Result<Option<String>, RemoteError> {
        let response = self
            .request(self.client.get(self.url("identity/me")))
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = self.json(self.check(response).await?).await?;
        Ok(body
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn fetch_all(&self, entity: EntityType, owner: &str) -> Result<Vec<Value>, RemoteError> {
        let response = self
            .request(
                self.client
                    .get(self.url(entity.collection()))
                    .query(&[("owner", owner)]),
            )
            .send()
            .await
            .map_err(transport)?;
        let body = self.json(self.check(response).await?).await?;
        match body {
            Value::Array(items) => Ok(items),
            other => Err(RemoteError::Payload(format!(
                "expected an array of records, got {other}"
            ))),
        }
    }

    async fn create(&self, entity: EntityType, payload: &Value) -> Result<Value, RemoteError> {
        let response = self
            .request(self.client.post(self.url(entity.collection())).json(payload))
            .send()
            .await
            .map_err(transport)?;
        self.json(self.check(response).await?).await
    }

    async fn update(
        &self,
        entity: EntityType,
        id: &str,
        payload: &Value,
    ) -> Result<Value, RemoteError> {
        let path = format!("{}/{id}", entity.collection());
        let response = self
            .request(self.client.put(self.url(&path)).json(payload))
            .send()
            .await
            .map_err(transport)?;
        self.json(self.check(response).await?).await
    }

    async fn delete(&self, entity: EntityType, id: &str) -> Result<(), RemoteError> {
        let path = format!("{}/{id}", entity.collection());
        let response = self
            .request(self.client.delete(self.url(&path)))
            .send()
            .await
            .map_err(transport)?;
        self.check(response).await.map(|_| ())
    }

    async fn send(&self, entity: EntityType, id: &str) -> Result<Value, RemoteError> {
        let path = format!("{}/{id}/send", entity.collection());
        let response = self
            .request(self.client.post(self.url(&path)))
            .send()
            .await
            .map_err(transport)?;
        self.json(self.check(response).await?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let remote = HttpRemote::new("https://api.example.test/", None).unwrap();
        assert_eq!(
            remote.url("invoices"),
            "https://api.example.test/v1/invoices"
        );
    }
}
