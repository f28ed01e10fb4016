//! Environment reachability over HTTP

use async_trait::async_trait;
use plan_coordination::validation::EnvironmentProbe;
use std::time::Duration;

/// GETs a health URL; any 2xx/3xx answer means the environment is up
pub struct HttpEnvironmentProbe {
    http: reqwest::Client,
    url: String,
}

impl HttpEnvironmentProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EnvironmentProbe for HttpEnvironmentProbe {
    fn target(&self) -> &str {
        &self.url
    }

    async fn probe(&self) -> Result<(), String> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(format!("answered HTTP {}", status.as_u16()))
        }
    }
}
