//! Model discovery against a Kamiwaza deployment server.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::GenerationError;

/// One deployment as reported by `GET {api_uri}/api/serving/deployments`.
#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub m_name: String,
    pub status: String,
    pub lb_port: u16,
    #[serde(default)]
    pub instances: Vec<DeploymentInstance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentInstance {
    #[serde(default)]
    pub host_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KamiwazaModel {
    pub model_name: String,
    pub status: String,
    pub instances: Vec<ModelInstance>,
    pub capabilities: ModelCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInstance {
    pub host_name: String,
    pub port: u16,
    /// OpenAI-compatible base URL of this instance.
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCapabilities {
    pub chat_completion: bool,
    pub text_completion: bool,
    pub embeddings: bool,
}

/// Keep deployments in the `DEPLOYED` state and describe how to reach them.
pub fn deployed_models(deployments: Vec<Deployment>) -> Vec<KamiwazaModel> {
    deployments
        .into_iter()
        .filter(|d| d.status == "DEPLOYED")
        .map(|d| {
            let port = d.lb_port;
            let instances = d
                .instances
                .into_iter()
                .map(|instance| {
                    let host_name = instance
                        .host_name
                        .filter(|h| !h.is_empty())
                        .unwrap_or_else(|| "localhost".to_string());
                    ModelInstance {
                        url: format!("http://{}:{}/v1", host_name, port),
                        host_name,
                        port,
                    }
                })
                .collect();
            KamiwazaModel {
                model_name: d.m_name,
                status: d.status,
                instances,
                capabilities: ModelCapabilities {
                    chat_completion: true,
                    text_completion: true,
                    embeddings: false,
                },
            }
        })
        .collect()
}

pub struct KamiwazaClient {
    http: reqwest::Client,
    api_uri: String,
}

impl KamiwazaClient {
    pub fn new(api_uri: &str, timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            api_uri: api_uri.trim_end_matches('/').to_string(),
        })
    }

    pub async fn available_models(&self) -> Result<Vec<KamiwazaModel>, GenerationError> {
        let url = format!("{}/api/serving/deployments", self.api_uri);
        debug!(%url, "listing kamiwaza deployments");
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Backend {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.text().await?;
        let deployments: Vec<Deployment> =
            serde_json::from_str(&body).map_err(|e| GenerationError::Decode(e.to_string()))?;
        Ok(deployed_models(deployments))
    }
}
