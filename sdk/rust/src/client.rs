use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A todo item as returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewTodo {
    pub text: String,
    pub done: bool,
}

/// Fields to change; `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TodoUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl SdkError {
    /// HTTP status when the gateway answered with an error.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            SdkError::Status { status, .. } => Some(*status),
            SdkError::Http(err) => err.status(),
        }
    }
}

pub struct TodoClient {
    client: Client,
    gateway_url: String,
}

impl TodoClient {
    pub fn new(gateway_url: &str) -> Self {
        Self {
            client: Client::new(),
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn list(&self) -> Result<Vec<Todo>, SdkError> {
        let resp = self.client.get(self.url("/todo")).send().await?;
        json_body(resp).await
    }

    pub async fn get(&self, id: &str) -> Result<Todo, SdkError> {
        let resp = self.client.get(self.url(&format!("/todo/{id}"))).send().await?;
        json_body(resp).await
    }

    /// Create an item; returns it together with the `Location` header.
    pub async fn create(&self, todo: &NewTodo) -> Result<(Todo, Option<String>), SdkError> {
        let resp = self.client.post(self.url("/todo")).json(todo).send().await?;
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok((json_body(resp).await?, location))
    }

    pub async fn update(&self, id: &str, update: &TodoUpdate) -> Result<Todo, SdkError> {
        let resp = self
            .client
            .patch(self.url(&format!("/todo/{id}")))
            .json(update)
            .send()
            .await?;
        json_body(resp).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), SdkError> {
        let resp = self.client.delete(self.url(&format!("/todo/{id}"))).send().await?;
        check(resp).await.map(|_| ())
    }

    /// Hit `/todo/{operation}/health` and return the body text.
    pub async fn health(&self, operation: &str) -> Result<String, SdkError> {
        let resp = self
            .client
            .get(self.url(&format!("/todo/{operation}/health")))
            .send()
            .await?;
        Ok(check(resp).await?.text().await?)
    }

    /// Send a raw body, for exercising malformed input.
    pub async fn send_raw(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &str,
    ) -> Result<Response, SdkError> {
        Ok(self
            .client
            .request(method, self.url(path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.gateway_url, path)
    }
}

async fn check(resp: Response) -> Result<Response, SdkError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SdkError::Status { status, body })
}

async fn json_body<T: DeserializeOwned>(resp: Response) -> Result<T, SdkError> {
    Ok(check(resp).await?.json().await?)
}
