use indicatif::ProgressStyle;

use crate::error::{ReproError, Result};

/// Style of the overall bar shown while a generation plan is executed.
pub(crate) fn style_plan() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map_err(|e| ReproError::engine(format!("Invalid progress template: {e}")))?
        .progress_chars("=>-"))
}

/// Style of the spinner shown for a single edge.
pub(crate) fn style_edge() -> Result<ProgressStyle> {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .map_err(|e| ReproError::engine(format!("Invalid progress template: {e}")))
}

/// Install a global subscriber that prints log lines through the progress
/// bars. The filter is taken from `RUST_LOG`, defaulting to `info`.
///
/// Calling this more than once is harmless; later calls are ignored.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif_layer = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let res = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .try_init();

    if res.is_err() {
        tracing::debug!("global subscriber already installed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn styles_parse() {
        style_plan().unwrap();
        style_edge().unwrap();
    }
}
