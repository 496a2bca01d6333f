use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::StatusResponse;
use crate::error::{CrosspostError, Result};

/// Written by `start` once the API is listening, removed on clean exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub pid: u32,
    pub bind: String,
    pub started_at: DateTime<Utc>,
}

impl RunState {
    pub fn current(bind: SocketAddr) -> Self {
        Self {
            pid: std::process::id(),
            bind: bind.to_string(),
            started_at: Utc::now(),
        }
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }

    /// `None` when no relay has recorded itself.
    pub async fn read(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Talks to a running relay over its HTTP API.
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl RelayClient {
    pub fn new(bind: &str, api_token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base_url: format!("http://{bind}"),
            api_token,
        })
    }

    pub async fn is_healthy(&self) -> bool {
        match self.http.get(format!("{}/health", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        let request = self.http.get(format!("{}/api/v1/status", self.base_url));
        let resp = check(self.authorized(request).send().await?).await?;
        Ok(resp.json().await?)
    }

    /// Ask the relay to stop accepting requests and drain.
    pub async fn shutdown(&self) -> Result<()> {
        let request = self.http.post(format!("{}/api/v1/shutdown", self.base_url));
        check(self.authorized(request).send().await?).await?;
        Ok(())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(CrosspostError::Auth(
            "relay API rejected gateway.api_token".into(),
        ));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(CrosspostError::Api(format!("{status}: {body}")));
    }
    Ok(resp)
}
