//! Reduced view over the static configuration tree.
//!
//! The admin overview only needs to know which provider sub-configs are
//! populated and which tracing/metrics backend is active. A hand-written
//! visitor over the known fields keeps this free of runtime introspection.

use serde::{Deserialize, Serialize};

use super::Config;

/// Configuration provider sub-configs. A provider is "enabled" when its
/// sub-config is present, whatever its contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileProviderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerProviderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_ingress: Option<KubernetesIngressProviderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpProviderConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    #[serde(default)]
    pub watch: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerProviderConfig {
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesIngressProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub poll_interval_secs: u64,
}

/// Tracing backends; at most one is expected to be populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp: Option<OtlpConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jaeger: Option<JaegerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub zipkin: Option<ZipkinConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtlpConfig {
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JaegerConfig {
    #[serde(default)]
    pub agent_address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZipkinConfig {
    #[serde(default)]
    pub endpoint: String,
}

/// Metrics backends; at most one is expected to be populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub statsd: Option<StatsdConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub datadog: Option<DatadogConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub buckets: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsdConfig {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatadogConfig {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessLogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    #[serde(default)]
    pub format: String,
}

/// Flat feature flags derived from the static configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Features {
    /// Name of the active tracing backend, or empty.
    pub tracing: String,
    /// Name of the active metrics backend, or empty.
    pub metrics: String,
    pub access_log: bool,
}

impl Config {
    /// Names of the populated provider sub-configs, in declaration order.
    pub fn providers(&self) -> Vec<&'static str> {
        let Some(providers) = &self.providers else {
            return Vec::new();
        };

        let mut names = Vec::new();
        if providers.file.is_some() {
            names.push("file");
        }
        if providers.docker.is_some() {
            names.push("docker");
        }
        if providers.kubernetes_ingress.is_some() {
            names.push("kubernetesIngress");
        }
        if providers.http.is_some() {
            names.push("http");
        }
        names
    }

    /// The reduced feature view consumed by the overview API.
    pub fn features(&self) -> Features {
        Features {
            tracing: self.tracing_backend().unwrap_or_default().to_string(),
            metrics: self.metrics_backend().unwrap_or_default().to_string(),
            access_log: self.access_log.is_some(),
        }
    }

    fn tracing_backend(&self) -> Option<&'static str> {
        let tracing = self.tracing.as_ref()?;
        if tracing.otlp.is_some() {
            return Some("otlp");
        }
        if tracing.jaeger.is_some() {
            return Some("jaeger");
        }
        if tracing.zipkin.is_some() {
            return Some("zipkin");
        }
        None
    }

    fn metrics_backend(&self) -> Option<&'static str> {
        let metrics = self.metrics.as_ref()?;
        if metrics.prometheus.is_some() {
            return Some("prometheus");
        }
        if metrics.statsd.is_some() {
            return Some("statsd");
        }
        if metrics.datadog.is_some() {
            return Some("datadog");
        }
        None
    }
}
