use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "faq_chat=info";
const VERBOSE_FILTER: &str = "faq_chat=debug";

fn make_env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            VERBOSE_FILTER
        } else {
            DEFAULT_FILTER
        })
    })
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
///
/// Logs go to stderr so answers streamed to stdout stay clean.
pub fn init(verbose: bool) {
    tracing_subscriber::registry()
        .with(make_env_filter(verbose))
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .try_init()
        .ok();
}
