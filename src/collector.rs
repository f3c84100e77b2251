//! Collection pass: per-host orchestration and multi-host aggregation.
//!
//! Each scrape polls every configured Nakivo host with its own session.
//! Failures are contained to the host (or the call) they happen on, so the
//! scrape always produces a document, possibly made only of error gauges.

use crate::client::{is_truthy, NakivoClient};
use crate::config::{CollectorConfig, HostEntry};
use crate::error::{NakivoError, Result};
use crate::metrics::NakivoMetrics;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Exporter self-metrics, created fresh for every scrape.
#[derive(Clone)]
pub struct ScrapeStats {
    registry: Registry,
    scrape_duration_seconds: Gauge,
    host_collect_duration_seconds: GaugeVec,
}

impl ScrapeStats {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let scrape_duration_seconds = Gauge::with_opts(Opts::new(
            "nakivo_exporter_scrape_duration_seconds",
            "Time spent polling all Nakivo hosts for this scrape",
        ))
        .map_err(|e| NakivoError::Metrics(e.to_string()))?;
        registry
            .register(Box::new(scrape_duration_seconds.clone()))
            .map_err(|e| NakivoError::Metrics(e.to_string()))?;

        let host_collect_duration_seconds = GaugeVec::new(
            Opts::new(
                "nakivo_exporter_host_collect_duration_seconds",
                "Time spent polling one Nakivo host",
            ),
            &["host"],
        )
        .map_err(|e| NakivoError::Metrics(e.to_string()))?;
        registry
            .register(Box::new(host_collect_duration_seconds.clone()))
            .map_err(|e| NakivoError::Metrics(e.to_string()))?;

        Ok(Self {
            registry,
            scrape_duration_seconds,
            host_collect_duration_seconds,
        })
    }

    fn observe_host(&self, host: &str, elapsed: Duration) {
        self.host_collect_duration_seconds
            .with_label_values(&[host])
            .set(elapsed.as_secs_f64());
    }

    fn observe_scrape(&self, elapsed: Duration) {
        self.scrape_duration_seconds.set(elapsed.as_secs_f64());
    }

    /// Encode the self-metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::with_capacity(512);

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| NakivoError::Metrics(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| NakivoError::Metrics(e.to_string()))
    }
}

/// Poll one host: connect, authenticate, then license and jobs.
///
/// License and jobs are independent steps; a failure in one does not stop
/// the other. An invalid entry records nothing, a host that cannot be
/// reached or refuses the credentials records only
/// `nakivo_api_authentication_error 1`.
pub async fn collect_host(entry: &HostEntry, options: &CollectorConfig, metrics: &NakivoMetrics) {
    let config = match entry.validate() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };
    let host = config.host.as_str();

    let mut client = match NakivoClient::connect(&config, options.timeout_seconds).await {
        Ok(client) => client,
        Err(e) => {
            error!("{}", e);
            metrics.record_authentication(host, true);
            return;
        }
    };

    if !client.authenticate().await {
        error!("Authentication failure for {} as {}", host, config.username);
        metrics.record_authentication(host, true);
        return;
    }
    metrics.record_authentication(host, false);

    match client.get_license_info().await {
        Ok(license) if is_truthy(&license) => metrics.update_license(&license, host),
        Ok(_) => {
            error!("Cannot get license data for {}", host);
            metrics.record_license_unavailable(host);
        }
        Err(e) => {
            error!("Cannot retrieve license data for {}: {}", host, e);
            metrics.record_license_unavailable(host);
        }
    }

    match client.get_jobs().await {
        Ok(jobs) if is_truthy(&jobs) => {
            metrics.update_jobs(&jobs, host, options.filter_active_only)
        }
        Ok(_) => error!("Cannot get job info for {}", host),
        Err(e) => error!("Cannot retrieve job data for {}: {}", host, e),
    }

    debug!("Finished collecting from {}", host);
}

/// Poll every host into `metrics`.
///
/// At most `options.max_concurrency` hosts are polled at once. A host task
/// that panics is logged; samples it recorded before panicking are kept.
pub async fn collect_all(
    hosts: &[HostEntry],
    options: &CollectorConfig,
    metrics: &NakivoMetrics,
    stats: Option<&ScrapeStats>,
) {
    let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
    let mut handles = Vec::with_capacity(hosts.len());

    for entry in hosts.iter().cloned() {
        let semaphore = semaphore.clone();
        let options = options.clone();
        let metrics = metrics.clone();
        let stats = stats.cloned();

        handles.push(tokio::spawn(async move {
            // The semaphore is never closed.
            let _permit = semaphore.acquire_owned().await.ok();
            let started = Instant::now();
            collect_host(&entry, &options, &metrics).await;

            if let (Some(stats), Some(host)) = (&stats, entry.host.as_deref()) {
                stats.observe_host(host, started.elapsed());
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Host collection task failed: {}", e);
        }
    }
}

/// Runs a full collection pass on demand.
#[derive(Clone)]
pub struct MetricsCollector {
    hosts: Arc<Vec<HostEntry>>,
    options: CollectorConfig,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new(hosts: Vec<HostEntry>, options: CollectorConfig) -> Self {
        if hosts.is_empty() {
            warn!("No nakivo_hosts configured, scrapes will be empty");
        }
        Self {
            hosts: Arc::new(hosts),
            options,
        }
    }

    /// Poll all hosts and return the Nakivo metrics only.
    pub async fn collect(&self) -> Result<NakivoMetrics> {
        let metrics = NakivoMetrics::new()?;
        collect_all(&self.hosts, &self.options, &metrics, None).await;
        Ok(metrics)
    }

    /// Poll all hosts and encode the full exposition document, self-metrics included.
    pub async fn scrape(&self) -> Result<String> {
        info!("Collecting metrics from {} Nakivo hosts", self.hosts.len());
        let started = Instant::now();

        let metrics = NakivoMetrics::new()?;
        let stats = ScrapeStats::new()?;
        collect_all(&self.hosts, &self.options, &metrics, Some(&stats)).await;
        stats.observe_scrape(started.elapsed());

        let mut body = metrics.encode()?;
        body.push_str(&stats.encode()?);

        info!(
            "Collected {} samples in {:.3}s",
            metrics.sample_count(),
            started.elapsed().as_secs_f64()
        );
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_entry_is_skipped() {
        let entry = HostEntry {
            host: Some("nakivo".to_string()),
            ..Default::default()
        };
        let metrics = NakivoMetrics::new().unwrap();
        collect_host(&entry, &CollectorConfig::default(), &metrics).await;
        assert_eq!(metrics.sample_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_host_list_yields_empty_document() {
        let collector = MetricsCollector::new(Vec::new(), CollectorConfig::default());
        let metrics = collector.collect().await.unwrap();
        assert_eq!(metrics.sample_count(), 0);
        assert_eq!(metrics.encode().unwrap(), "");
    }

    #[test]
    fn test_scrape_stats_encode() {
        let stats = ScrapeStats::new().unwrap();
        stats.observe_host("h", Duration::from_millis(1500));
        stats.observe_scrape(Duration::from_secs(2));

        let text = stats.encode().unwrap();
        assert!(text.contains("# TYPE nakivo_exporter_scrape_duration_seconds gauge"));
        assert!(text.contains("nakivo_exporter_host_collect_duration_seconds{host=\"h\"} 1.5"));
    }
}
