//! HTTP transport behind a trait so the fetcher can be exercised offline

use crate::config::ApiConfig;
use crate::{Error, Result};
use async_trait::async_trait;

/// One outgoing call: `GET url?query`, or `POST url` with a form body
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub form: Option<Vec<(String, String)>>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            form: None,
        }
    }

    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            form: Some(form),
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_param(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    /// Value of a query parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Sends a request and returns the response body as text
///
/// The body is returned whatever the HTTP status; providers report failures
/// in the body and the caller decides what to make of it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<String>;
}

/// [`Transport`] over a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<String> {
        let builder = match &request.form {
            Some(form) => self.client.post(&request.url).form(form),
            None => self.client.get(&request.url),
        };
        let builder = if request.query.is_empty() {
            builder
        } else {
            builder.query(&request.query)
        };

        let response = builder
            .send()
            .await
            .map_err(|e| classify(e, &request.url))?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!("{} answered with status {}", request.url, status);
        }
        response.text().await.map_err(|e| classify(e, &request.url))
    }
}

fn classify(error: reqwest::Error, url: &str) -> Error {
    if error.is_timeout() {
        Error::Timeout {
            url: url.to_string(),
        }
    } else {
        Error::Transport(error)
    }
}
