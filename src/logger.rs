use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt::Write as _;

/// Sink installed by the embedder; receives every line that passes the level
/// and breadcrumb filters.
pub type LogSink = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

pub fn install_sink(sink: Option<LogSink>, level: Option<&str>) {
    LOGGER.install_sink(sink, level);
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const CCB   = 0b0000_0001;
        const BIND  = 0b0000_0010;
        const SINK  = 0b0000_0100;
        const EMIT  = 0b0000_1000;
        const STEAL = 0b0001_0000;
        const ROUTE = 0b0010_0000;
        const IPI   = 0b0100_0000;
        const ALL   = u32::MAX;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone)]
struct LogSinkInner {
    sink: std::sync::Arc<dyn Fn(LogLevel, &str) + Send + Sync>,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<LogSinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[ep-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: Option<LogSink>, level: Option<&str>) {
        let mut guard = self.sink.lock();
        *guard = sink.map(|sink| LogSinkInner {
            sink: std::sync::Arc::from(sink),
            breadcrumbs: BreadcrumbFlags::empty(),
            min_level: level.map(LogLevel::from_str).unwrap_or(LogLevel::Info),
        });
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let inner = {
            let guard = self.sink.lock();
            guard.clone()
        };
        let Some(inner) = inner else { return };
        if level > inner.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let mut formatted = String::new();
        if breadcrumbs.is_empty() {
            let _ = write!(formatted, "{} {}", self.prefix, message);
        } else {
            let _ = write!(
                formatted,
                "{} [{}] {}",
                self.prefix,
                label_for(breadcrumbs),
                message
            );
        }
        (*inner.sink)(level, &formatted);
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::CCB) {
        "CCB"
    } else if flags.contains(BreadcrumbFlags::BIND) {
        "BIND"
    } else if flags.contains(BreadcrumbFlags::SINK) {
        "SINK"
    } else if flags.contains(BreadcrumbFlags::EMIT) {
        "EMIT"
    } else if flags.contains(BreadcrumbFlags::STEAL) {
        "STEAL"
    } else if flags.contains(BreadcrumbFlags::ROUTE) {
        "ROUTE"
    } else if flags.contains(BreadcrumbFlags::IPI) {
        "IPI"
    } else {
        "LOG"
    }
}
