use std::time::Instant;

use crate::routines::output::OutputFile;
use crate::routines::settings::Settings;
use eyre::Result;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Setup logging for the library
///
/// Log messages always go to stdout. The file layer writing `[log].file` inside the output
/// folder is only added when `[io].write` is set, so a run with `write = false` creates no
/// file or folder at all. The level comes from `[log].level` and accepts any `EnvFilter`
/// directive, e.g. `info` or `tmaxopt=debug,warn`.
///
/// Only the coordinating worker should call this; other ranks stay silent.
pub fn setup_log(settings: &Settings) -> Result<()> {
    let env_filter = EnvFilter::new(settings.log.level.as_str());

    let timestamper = CompactTimestamp {
        start: Instant::now(),
    };

    let subscriber = Registry::default().with(env_filter);

    let file_layer = if settings.io.write {
        let outputfile = OutputFile::new(&settings.io.output_folder, &settings.log.file)?;
        Some(
            fmt::layer()
                .with_writer(outputfile.file_owned())
                .with_ansi(false)
                .with_timer(timestamper.clone()),
        )
    } else {
        None
    };

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_target(false)
        .with_timer(timestamper);

    // A global subscriber may already be installed, e.g. by a previous run in the same process
    if subscriber.with(file_layer).with(stdout_layer).try_init().is_err() {
        tracing::debug!("Logging was already initialized");
    }

    Ok(())
}

#[derive(Clone)]
struct CompactTimestamp {
    start: Instant,
}

impl FormatTime for CompactTimestamp {
    fn format_time(
        &self,
        w: &mut tracing_subscriber::fmt::format::Writer<'_>,
    ) -> Result<(), std::fmt::Error> {
        let elapsed = self.start.elapsed();
        let hours = elapsed.as_secs() / 3600;
        let minutes = (elapsed.as_secs() % 3600) / 60;
        let seconds = elapsed.as_secs() % 60;

        write!(w, "{:02}h {:02}m {:02}s", hours, minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_log_file_without_write() {
        let folder = std::env::temp_dir().join(format!("tmaxopt-nolog-{}", std::process::id()));
        let mut settings = Settings::default();
        settings.io.write = false;
        settings.io.output_folder = folder.to_string_lossy().to_string();

        setup_log(&settings).unwrap();
        assert!(!folder.exists());
    }
}
