use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Instant;

use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

static RUN_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

static STEP_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {span_name} {msg} [{elapsed}]")
        .expect("Error setting spinner template")
});

/// Style of the root progress bar of a run.
pub(crate) fn run_style() -> &'static ProgressStyle {
    &RUN_STYLE
}

/// Style of a single producer or recipe step.
pub(crate) fn step_style() -> &'static ProgressStyle {
    &STEP_STYLE
}

/// Elapsed time since `s`, formatted for log lines.
pub fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Installs the global subscriber: an env filter read from `BAKERY_LOG`
/// (falling back to a level derived from `verbosity`), a formatter and the
/// progress bar layer.
#[cfg(feature = "logging")]
pub fn init_logging(verbosity: u8) -> Result<(), crate::BakeryError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_env("BAKERY_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()
        .map_err(|err| crate::BakeryError::Logging(err.to_string()))
}
