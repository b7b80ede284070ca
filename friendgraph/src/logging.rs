//! Process-wide tracing setup.

use friendgraph_core::config::{Config, LogFormat};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{Span, info_span};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .boxed(),
        LogFormat::Text => fmt::layer().with_ansi(ansi).with_writer(writer).boxed(),
    }
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Installs the server subscriber: stdout plus an optional log file, both in
/// the configured format. Returns the service span every request and job
/// span hangs off.
pub fn init_service(config: &Config) -> anyhow::Result<Span> {
    let mut layers = vec![fmt_layer(config.log_format, std::io::stdout, true)];
    if let Some(ref path) = config.log_path {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        layers.push(fmt_layer(config.log_format, Mutex::new(file), false));
    }

    Registry::default()
        .with(layers)
        .with(env_filter("info"))
        .try_init()?;

    Ok(service_span(config))
}

/// Installs a stderr subscriber for one-shot CLI commands so reports on
/// stdout stay clean.
pub fn init_cli(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "warn" };
    Registry::default()
        .with(vec![fmt_layer(LogFormat::Text, std::io::stderr, true)])
        .with(env_filter(default))
        .try_init()?;
    Ok(())
}

pub fn service_span(config: &Config) -> Span {
    info_span!(
        "service",
        node_name = %config.node_name,
        node_dc = %config.node_dc,
        service = %config.service,
    )
}
