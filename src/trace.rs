use std::sync::{Mutex, Once};

use tracing_subscriber::{EnvFilter, filter::LevelFilter, prelude::*};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing once. Logs go to stdout as compact text or JSON,
/// filtered by `RUST_LOG`. If `METARESTORE_PERFETTO` names a file, a
/// Perfetto trace of DEBUG-and-above spans is written there as well.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let mut init_result: Option<anyhow::Result<()>> = None;
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        let result = match log_format {
            LogFormat::Text => init_with_fmt_layer(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .compact()
                    .with_filter(env_filter),
            ),
            LogFormat::Json => init_with_fmt_layer(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .json()
                    .with_filter(env_filter),
            ),
        };
        init_result = Some(result);
    });
    init_result.unwrap_or(Ok(()))
}

fn init_with_fmt_layer<L>(fmt_layer: L) -> anyhow::Result<()>
where
    L: tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync + 'static,
{
    let base = tracing_subscriber::registry().with(fmt_layer);
    match std::env::var_os("METARESTORE_PERFETTO") {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let perfetto_layer = tracing_perfetto::PerfettoLayer::new(Mutex::new(file))
                .with_filter(LevelFilter::DEBUG);
            base.with(perfetto_layer).try_init()?;
        }
        // Another subscriber (e.g. from a test harness) may already be set.
        None => {
            let _ = base.try_init();
        }
    }
    Ok(())
}

/// Run an async test body with tracing installed.
pub async fn with_test_tracing<F, Fut, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let _ = init(LogFormat::Text);
    f().await
}

/// Run a sync test body with tracing installed.
pub fn with_test_tracing_sync<F, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let _ = init(LogFormat::Text);
    f()
}
