use chrono::Local;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

const TIMESTAMP_FORMAT: &str = "%H:%M:%S";

/// Local wall-clock timestamps, `HH:MM:SS`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalClock;

impl FormatTime for LocalClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "[{}]", format_timestamp())
    }
}

pub fn format_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalClock)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        let ts = format_timestamp();
        assert_eq!(ts.len(), 8);
        assert_eq!(ts.matches(':').count(), 2);
    }

    #[test]
    fn test_local_clock_brackets_timestamp() {
        let mut out = String::new();
        LocalClock.format_time(&mut Writer::new(&mut out)).unwrap();
        assert!(out.starts_with('['));
        assert!(out.ends_with(']'));
    }
}
