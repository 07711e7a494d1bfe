//! Publisher pool: drains the executor's dispatch channel and delivers each
//! job's payload to its route's sink.
//!
//! Delivery is at-least-once from a single leader: a failed webhook POST or
//! bus produce is logged and counted, never retried here. Sinks must be
//! idempotent. Bus producers are long-lived and pooled per host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::job::Job;
use crate::metrics::JOBS_PUBLISHED_TOTAL;
use crate::route::{Route, RouteKind};
use crate::route_table::RouteTable;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("no route '{0}' in the route table")]
    RouteNotFound(String),

    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    NonSuccess(u16),

    #[error("bus producer for {host} unavailable: {message}")]
    Producer { host: String, message: String },

    #[error("bus publish to {topic} failed: {message}")]
    Bus { topic: String, message: String },
}

/// Shared sink clients: one HTTP client for every webhook, one bus producer
/// per distinct host.
struct Sinks {
    routes: Arc<RouteTable>,
    http: reqwest::Client,
    request_timeout: Duration,
    producers: Mutex<HashMap<String, FutureProducer>>,
}

impl Sinks {
    fn new(routes: Arc<RouteTable>, request_timeout: Duration) -> Sinks {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(32)
            .build()
            .unwrap_or_default();
        Sinks {
            routes,
            http,
            request_timeout,
            producers: Mutex::new(HashMap::new()),
        }
    }

    async fn publish(&self, job: &Job) -> Result<(), PublishError> {
        let route = self
            .routes
            .get(&job.route)
            .ok_or_else(|| PublishError::RouteNotFound(job.route.clone()))?;

        match route.kind {
            RouteKind::Http => self.publish_http(&route, job).await,
            RouteKind::Bus => self.publish_bus(&route, job).await,
        }
    }

    async fn publish_http(&self, route: &Route, job: &Job) -> Result<(), PublishError> {
        let url = route.webhook_url.as_deref().unwrap_or_default();
        let resp = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .body(job.meta_bytes())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PublishError::NonSuccess(status.as_u16()));
        }
        Ok(())
    }

    async fn publish_bus(&self, route: &Route, job: &Job) -> Result<(), PublishError> {
        let host = route.host.as_deref().unwrap_or_default().to_string();
        let topic = route.topic.as_deref().unwrap_or_default().to_string();

        let producer = self.producer_for(&host)?;
        let payload = job.meta_bytes();
        let record = FutureRecord::to(&topic).key(&job.id).payload(&payload);

        producer
            .send(record, Timeout::After(self.request_timeout))
            .await
            .map_err(|(e, _)| PublishError::Bus {
                topic: topic.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    fn producer_for(&self, host: &str) -> Result<FutureProducer, PublishError> {
        let mut producers = self.producers.lock().unwrap();
        if let Some(producer) = producers.get(host) {
            return Ok(producer.clone());
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", host)
            .set("message.timeout.ms", self.request_timeout.as_millis().to_string())
            .create()
            .map_err(|e| PublishError::Producer {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        info!(host, "created bus producer");
        producers.insert(host.to_string(), producer.clone());
        Ok(producer)
    }
}

/// A pool of workers draining the dispatch channel.
pub struct Publisher {
    handles: Vec<JoinHandle<()>>,
}

impl Publisher {
    /// Starts `worker_count` workers over the receive side of the dispatch
    /// channel. The pool drains until the channel closes (executor
    /// shutdown).
    pub fn start(
        routes: Arc<RouteTable>,
        rx: mpsc::Receiver<Job>,
        worker_count: usize,
        request_timeout: Duration,
    ) -> Publisher {
        let sinks = Arc::new(Sinks::new(routes, request_timeout));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..worker_count.max(1))
            .map(|worker_id| {
                let sinks = sinks.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else {
                            debug!(worker_id, "dispatch channel closed; publisher worker exiting");
                            return;
                        };

                        let route_type = route_type_label(&sinks.routes, &job.route);
                        match sinks.publish(&job).await {
                            Ok(()) => {
                                JOBS_PUBLISHED_TOTAL
                                    .with_label_values(&[route_type, "success"])
                                    .inc();
                                debug!(worker_id, job_id = %job.id, route = %job.route, "published job");
                            }
                            Err(e) => {
                                JOBS_PUBLISHED_TOTAL
                                    .with_label_values(&[route_type, "failed"])
                                    .inc();
                                error!(
                                    worker_id,
                                    job_id = %job.id,
                                    route = %job.route,
                                    error = %e,
                                    "failed to publish job"
                                );
                            }
                        }
                    }
                })
            })
            .collect();

        Publisher { handles }
    }

    /// Waits for every worker to drain and exit.
    pub async fn wait(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

fn route_type_label(routes: &RouteTable, route_id: &str) -> &'static str {
    match routes.get(route_id).map(|r| r.kind) {
        Some(RouteKind::Http) => "http",
        Some(RouteKind::Bus) => "bus",
        None => "unknown",
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
