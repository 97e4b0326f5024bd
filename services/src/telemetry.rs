use crate::config::Config;
use anyhow::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::env;
use tracing_stackdriver::CloudTraceConfiguration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,conduit_services=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Every deployed environment, `test` included, ships JSON logs to Cloud
/// Logging. Only local runs print to the terminal.
fn uses_cloud_logging(config: &Config) -> bool {
    !config.is_local()
}

pub fn init_tracing(config: &Config) -> anyhow::Result<()> {
    if !uses_cloud_logging(config) {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
        return Ok(());
    }

    // Deployed: JSON logging with Stackdriver & Cloud Trace
    let project_id = env::var("GOOGLE_CLOUD_PROJECT")
        .context("GOOGLE_CLOUD_PROJECT environment variable is required outside local")?;

    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let stackdriver_layer =
        tracing_stackdriver::layer().with_cloud_trace(CloudTraceConfiguration { project_id });

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_opentelemetry::layer())
        .with(stackdriver_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_local_prints_to_terminal() {
        assert!(uses_cloud_logging(&Config::new_for_test()));
        assert!(!uses_cloud_logging(&Config::new_for_local()));
    }
}
