//! OpenAI-compatible embedding provider.
//!
//! Posts to `{base_url}/embeddings` and returns the vectors L2-normalized.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{normalize, EmbeddingProvider};
use crate::config::EmbeddingConfig;

pub struct OpenAiEmbeddingProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "no API key for embedding provider, sending unauthenticated requests"
            );
        }
        Ok(Self {
            client: Client::builder()
                .build()
                .context("failed to build HTTP client")?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .context("embedding endpoint returned no vector")
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.context("embedding request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("embedding endpoint returned {status}: {body}");
        }
        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .context("failed to decode embedding response")?;
        parsed.data.sort_by_key(|d| d.index);

        let mut vectors = Vec::with_capacity(parsed.data.len());
        for data in parsed.data {
            let mut vector = data.embedding;
            if vector.len() != self.dimensions {
                bail!(
                    "embedding has {} dimensions, expected {}",
                    vector.len(),
                    self.dimensions
                );
            }
            normalize(&mut vector);
            vectors.push(vector);
        }
        tracing::debug!(count = vectors.len(), model = %self.model, "texts embedded");
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
