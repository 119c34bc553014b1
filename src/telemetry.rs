use std::env;
use std::time::Duration;

use opentelemetry::global;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_NAME: &str = "modforge";
const COLLECTOR_TIMEOUT: Duration = Duration::from_secs(2);
const PROXY_VARS: [&str; 4] = ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"];

/// Install the global subscriber: `RUST_LOG` filtering and stdout logging,
/// plus span export when a Jaeger collector endpoint is given.
pub fn init(jaeger_endpoint: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let jaeger_layer = match jaeger_endpoint {
        Some(endpoint) => {
            // Collector traffic goes straight to Jaeger
            for var in PROXY_VARS {
                env::remove_var(var);
            }
            global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

            let tracer = opentelemetry_jaeger::new_collector_pipeline()
                .with_endpoint(endpoint)
                .with_service_name(SERVICE_NAME)
                .with_isahc()
                .with_timeout(COLLECTOR_TIMEOUT)
                .install_batch(opentelemetry::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(jaeger_layer)
        .with(filter_layer)
        .with(fmt::Layer::default())
        .try_init()?;

    Ok(())
}

/// Flush spans still buffered for export.
pub fn shutdown() {
    global::shutdown_tracer_provider();
}
