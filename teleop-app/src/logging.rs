use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Verbosity count from the command line to a default level
pub fn level_from_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber. `RUST_LOG` directives take precedence over `verbose`.
pub fn setup_tracing(verbose: u8, json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbose).into())
        .from_env_lossy();

    if json {
        Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
