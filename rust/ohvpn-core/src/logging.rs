use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::platform::PlatformSupport;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::{Arc, Once};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Initialize logging system
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_logging(level: LogLevel, platform: Option<Arc<dyn PlatformSupport>>) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level, platform);
    });

    result
}

fn tracing_level(level: LogLevel) -> Option<Level> {
    match level {
        LogLevel::Silent => None,
        LogLevel::Error => Some(Level::ERROR),
        LogLevel::Warning => Some(Level::WARN),
        LogLevel::Info => Some(Level::INFO),
        LogLevel::Debug => Some(Level::DEBUG),
        LogLevel::Trace => Some(Level::TRACE),
    }
}

fn build_filter(level: Level) -> Result<EnvFilter> {
    let directive = |d: String| {
        d.parse()
            .map_err(|e| Error::config(format!("Invalid log directive: {}", e)))
    };

    Ok(EnvFilter::from_default_env()
        .add_directive(directive(format!("ohvpn_core={}", level))?)
        .add_directive(directive(format!("ohvpn_netstack={}", level))?)
        .add_directive(directive(format!("ohvpn={}", level))?)
        .add_directive(directive("tokio=warn".to_string())?))
}

fn init_logging_inner(level: LogLevel, platform: Option<Arc<dyn PlatformSupport>>) -> Result<()> {
    let Some(tracing_level) = tracing_level(level) else {
        return Ok(());
    };

    // Use try_init so an embedding host that already installed a
    // subscriber keeps it
    let result = build_subscriber(tracing_level, platform, std::io::stdout)?.try_init();

    if result.is_ok() {
        tracing::info!("Logging initialized at level: {}", level);
    }
    Ok(())
}

/// Events go to the platform sink when there is one, to `console` otherwise.
fn build_subscriber<W>(
    level: Level,
    platform: Option<Arc<dyn PlatformSupport>>,
    console: W,
) -> Result<impl tracing::Subscriber + Send + Sync + 'static>
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let fmt_layer = if platform.is_none() {
        Some(
            fmt::layer()
                .with_writer(console)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .compact()
                .with_filter(build_filter(level)?),
        )
    } else {
        None
    };

    let platform_layer = match platform {
        Some(platform) => Some(
            PlatformLayer {
                platform,
                lock: Mutex::new(()),
            }
            .with_filter(build_filter(level)?),
        ),
        None => None,
    };

    Ok(tracing_subscriber::registry()
        .with(fmt_layer)
        .with(platform_layer))
}

/// Forwards each event to the platform's log sink as one line.
struct PlatformLayer {
    platform: Arc<dyn PlatformSupport>,
    // the sink is not required to be reentrant
    lock: Mutex<()>,
}

impl<S> Layer<S> for PlatformLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let line = format_event(event);
        let _guard = self.lock.lock();
        self.platform.log(&line);
    }
}

fn format_event(event: &tracing::Event<'_>) -> String {
    let mut visitor = LogVisitor::default();
    event.record(&mut visitor);
    format!("[{}] {}", event.metadata().level(), visitor.message)
}

#[derive(Default)]
struct LogVisitor {
    message: String,
}

impl LogVisitor {
    fn push_field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        if name == "message" {
            if self.message.is_empty() {
                let _ = self.message.write_fmt(value);
            } else {
                // fields may be recorded before the message
                self.message = format!("{}{}", value, self.message);
            }
        } else {
            let _ = write!(self.message, " {}={}", name, value);
        }
    }
}

impl tracing::field::Visit for LogVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.push_field(field.name(), format_args!("{}", value));
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.push_field(field.name(), format_args!("{:?}", value));
    }
}

/// Log an error with context, at a severity matching its category
pub fn log_error(error: &Error, context: &str) {
    if error.is_recoverable() {
        tracing::warn!("{}: {}", context, error);
    } else {
        tracing::error!("{}: {}", context, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Default)]
    struct CapturePlatform {
        lines: Mutex<Vec<String>>,
    }

    impl PlatformSupport for CapturePlatform {
        fn log(&self, message: &str) {
            self.lines.lock().push(message.to_string());
        }

        fn default_interface_name(&self) -> Result<String> {
            Ok("lo".to_string())
        }
    }

    #[test]
    fn test_platform_layer_formats_one_line_per_event() {
        let platform = Arc::new(CapturePlatform::default());
        let layer = PlatformLayer {
            platform: platform.clone(),
            lock: Mutex::new(()),
        };
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(flow = "tcp:1.2.3.4:80", "dispatch failed");
            tracing::info!("tun started");
        });

        let lines = platform.lines.lock();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "[WARN] dispatch failed flow=tcp:1.2.3.4:80");
        assert_eq!(lines[1], "[INFO] tun started");
    }

    #[derive(Clone, Default)]
    struct Console(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Console {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_platform_sink_is_the_only_writer() {
        let console = Console::default();
        let platform = Arc::new(CapturePlatform::default());
        let writer = console.clone();
        let subscriber =
            build_subscriber(Level::INFO, Some(platform.clone()), move || writer.clone()).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("tun started");
        });

        assert_eq!(*platform.lines.lock(), vec!["[INFO] tun started".to_string()]);
        assert!(console.0.lock().is_empty());
    }

    #[test]
    fn test_console_without_platform() {
        let console = Console::default();
        let writer = console.clone();
        let subscriber = build_subscriber(Level::INFO, None, move || writer.clone()).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("tun started");
        });

        let output = String::from_utf8(console.0.lock().clone()).unwrap();
        assert_eq!(output.matches("tun started").count(), 1);
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(tracing_level(LogLevel::Silent), None);
        assert_eq!(tracing_level(LogLevel::Warning), Some(Level::WARN));
        assert!(build_filter(Level::DEBUG).is_ok());
    }
}
