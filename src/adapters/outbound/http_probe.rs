use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;

use crate::core::{
    error::{Error, Result},
    ports::{HttpProbe, ProbeSample},
};

/// Load-probe requests over a shared connection pool.
#[derive(Clone)]
pub struct ReqwestProbe {
    client: Client,
}

impl ReqwestProbe {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::System(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn get(&self, url: &str) -> Result<ProbeSample> {
        let start = Instant::now();
        let ok = match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        };
        Ok(ProbeSample {
            ok,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}
