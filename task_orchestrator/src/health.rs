//! Periodic HTTP probing of registered workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::{HealthStatus, ListFilter};
use crate::settings::HealthConfig;
use crate::store::PersistentRegistry;

pub struct HealthMonitor {
    registry: Arc<PersistentRegistry>,
    client: Client,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<PersistentRegistry>, config: &HealthConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            registry,
            client,
            interval: Duration::from_secs(config.interval_seconds.max(1)),
        })
    }

    async fn probe(&self, url: &str) -> HealthStatus {
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => HealthStatus::Healthy,
            Ok(response) => {
                debug!("Probe of {} returned {}", url, response.status());
                HealthStatus::Unhealthy
            }
            Err(e) => {
                debug!("Probe of {} failed: {}", url, e);
                HealthStatus::Unhealthy
            }
        }
    }

    /// Probe every card once, record the results and persist them.
    /// Returns the number of healthy workers.
    pub async fn check_all(&self) -> Result<usize> {
        let cards = self.registry.list_agents(&ListFilter::default());
        let statuses = join_all(cards.iter().map(|card| self.probe(&card.url))).await;

        let mut healthy = 0;
        for (card, status) in cards.iter().zip(statuses) {
            if status == HealthStatus::Healthy {
                healthy += 1;
            } else {
                warn!("Agent {} is unhealthy", card.name);
            }
            self.registry.update_health(&card.name, status);
        }

        self.registry.save().await?;
        info!("Health check: {}/{} agents healthy", healthy, cards.len());
        Ok(healthy)
    }

    /// Run [`check_all`](Self::check_all) on the configured interval until the
    /// handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.check_all().await {
                    error!("Health check round failed: {}", e);
                }
            }
        })
    }
}
