use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::config::Config;
use crate::entrypoint::{router::Router, TcpEntrypoint};
use crate::lb::Balancer;
use crate::middleware::SanitizePath;
use crate::proxy::forwarder::{build_upstream_client, UpstreamClient};
use crate::proxy::Forwarder;

/// Connections kept idle per upstream host in the shared client pool.
const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Wires the static configuration into a running data plane: one balancer
/// per service, one forwarder per backend, and one entrypoint per listener,
/// all sharing a single upstream HTTP client.
pub struct Core {
    pub config: Arc<Config>,
    balancers: HashMap<String, Arc<Balancer>>,
    entrypoints: Vec<Arc<TcpEntrypoint>>,
    upstream_client: UpstreamClient,
}

impl Core {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let upstream_client = build_upstream_client(POOL_MAX_IDLE_PER_HOST);

        let mut balancers = HashMap::new();
        for (name, service) in &config.services {
            let sticky = service
                .sticky
                .as_ref()
                .map(|s| s.cookie.to_sticky_cookie());
            let balancer = Arc::new(Balancer::new(sticky, service.health_check));

            for backend in &service.backends {
                let target = Url::parse(&backend.url).with_context(|| {
                    format!("invalid backend url '{}' in service '{}'", backend.url, name)
                })?;
                let forwarder = Arc::new(Forwarder::new(
                    upstream_client.clone(),
                    target,
                    service.pass_host_header,
                ));
                balancer.add(&backend.name, forwarder, backend.weight, backend.fenced);
            }

            info!(
                service = name.as_str(),
                backends = balancer.len(),
                sticky = service.sticky.is_some(),
                "service assembled"
            );
            balancers.insert(name.clone(), balancer);
        }

        let http_handler = config.default_service().and_then(|(name, _)| {
            balancers
                .get(name)
                .map(|balancer| SanitizePath::wrap(balancer.clone()))
        });

        let mut entrypoints = Vec::new();
        for (name, ep_config) in &config.entrypoints {
            let entrypoint =
                TcpEntrypoint::new(name, &ep_config.address, ep_config.transport.to_transport())
                    .await?;

            let mut router = Router::new();
            if let Some(handler) = &http_handler {
                router.set_http_handler(handler.clone());
            }
            entrypoint.switch_router(router);

            entrypoints.push(entrypoint);
        }

        Ok(Self {
            config,
            balancers,
            entrypoints,
            upstream_client,
        })
    }

    /// Spawn every entrypoint's accept loop.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.entrypoints
            .iter()
            .map(|entrypoint| {
                let entrypoint = entrypoint.clone();
                tokio::spawn(entrypoint.start())
            })
            .collect()
    }

    /// Drain every entrypoint; returns once all are terminated.
    pub async fn shutdown(&self) {
        let mut tasks = Vec::new();
        for entrypoint in &self.entrypoints {
            let entrypoint = entrypoint.clone();
            tasks.push(tokio::spawn(async move { entrypoint.shutdown().await }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn entrypoints(&self) -> &[Arc<TcpEntrypoint>] {
        &self.entrypoints
    }

    pub fn balancer(&self, service: &str) -> Option<&Arc<Balancer>> {
        self.balancers.get(service)
    }

    /// The shared upstream client (one pool across all backends).
    pub fn upstream_client(&self) -> &UpstreamClient {
        &self.upstream_client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_core_assembles_services_and_entrypoints() {
        let yaml = r#"
entrypoints:
  web:
    address: "127.0.0.1:0"

services:
  app:
    backends:
      - name: app-1
        url: http://127.0.0.1:9001
      - name: app-2
        url: http://127.0.0.1:9002
        weight: 2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let core = Core::new(config).await.unwrap();

        assert_eq!(core.entrypoints().len(), 1);
        assert_eq!(core.balancer("app").unwrap().len(), 2);
        assert!(core.balancer("missing").is_none());
    }

    #[tokio::test]
    async fn test_core_rejects_invalid_backend_url() {
        let yaml = r#"
services:
  app:
    backends:
      - name: bad
        url: "not a url"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(Core::new(config).await.is_err());
    }
}
