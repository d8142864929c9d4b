use std::sync::LazyLock;

use indicatif::ProgressStyle;

static STYLE_RUN: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

// regular task style with no progress
static STYLE_TASK: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} [{elapsed}] {msg}")
        .expect("Error setting progress bar template")
});

pub(crate) fn style_run() -> ProgressStyle {
    STYLE_RUN.clone()
}

pub(crate) fn style_task() -> ProgressStyle {
    STYLE_TASK.clone()
}

/// Install a global `tracing` subscriber printing to stderr, with progress
/// bars for running tasks.
///
/// The filter is read from `PIPEWRIGHT_LOG` (e.g. `debug` or
/// `pipewright=trace`) and defaults to `info`. Stdout stays free for task
/// output.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_env("PIPEWRIGHT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}
