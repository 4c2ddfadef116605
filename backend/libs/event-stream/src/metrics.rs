use prometheus::{Encoder, IntCounter, Opts, TextEncoder};
use tracing::warn;

/// Counters shared by the publisher and subscriber loops.
///
/// Counters live in the process-wide default registry; `render` dumps it in
/// the Prometheus text format.
#[derive(Clone)]
pub struct StreamMetrics {
    pub published: IntCounter,
    pub publish_retries: IntCounter,
    pub publish_failures: IntCounter,
    pub consumed: IntCounter,
    pub handler_failures: IntCounter,
    pub dead_lettered: IntCounter,
    pub commits: IntCounter,
}

impl StreamMetrics {
    pub fn new(service: &str) -> prometheus::Result<Self> {
        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
        };

        let published = counter(
            "stream_published_total",
            "Messages acknowledged by the broker",
        )?;
        let publish_retries = counter(
            "stream_publish_retries_total",
            "Publish attempts retried after a transient failure",
        )?;
        let publish_failures = counter(
            "stream_publish_failures_total",
            "Publishes that ended in a fatal error",
        )?;
        let consumed = counter(
            "stream_consumed_total",
            "Messages delivered to a handler",
        )?;
        let handler_failures = counter(
            "stream_handler_failures_total",
            "Handler invocations that returned an error",
        )?;
        let dead_lettered = counter(
            "stream_dead_lettered_total",
            "Messages routed to the dead-letter topic",
        )?;
        let commits = counter(
            "stream_commits_total",
            "Successful offset commits",
        )?;

        let registry = prometheus::default_registry();
        for metric in [
            Box::new(published.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(publish_retries.clone()),
            Box::new(publish_failures.clone()),
            Box::new(consumed.clone()),
            Box::new(handler_failures.clone()),
            Box::new(dead_lettered.clone()),
            Box::new(commits.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register stream metric: {}", e);
            }
        }

        Ok(Self {
            published,
            publish_retries,
            publish_failures,
            consumed,
            handler_failures,
            dead_lettered,
            commits,
        })
    }

    /// Everything in the default registry, in the Prometheus text format.
    pub fn render() -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
