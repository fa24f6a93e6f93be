//! Routing of the kernel's `tracing` output to a user callback.
//!
//! Every kernel event is emitted with a category target (`validation`,
//! `blockstorage`, ...). A [`LoggingConnection`] formats the enabled ones
//! and hands each line to the callback it was built with.
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::dispatcher::{self, DefaultGuard, Dispatch};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::{self, format::Writer, time::FormatTime, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{Layer, Registry};

use crate::error::{KernelError, KernelResult};

/// Log categories, each a `tracing` target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogCategory {
    /// Every category below.
    All,
    /// Timing of block connection.
    Bench,
    /// Flat block and undo files.
    BlockStorage,
    /// Coins database.
    CoinDb,
    /// Key-value store backends.
    KvStore,
    /// Reindex and import.
    Reindex,
    /// Header and block validation.
    Validation,
    /// Lifecycle of the kernel itself.
    Kernel,
}

impl LogCategory {
    const CONCRETE: [LogCategory; 7] = [
        LogCategory::Bench,
        LogCategory::BlockStorage,
        LogCategory::CoinDb,
        LogCategory::KvStore,
        LogCategory::Reindex,
        LogCategory::Validation,
        LogCategory::Kernel,
    ];

    /// The `tracing` target, `None` for [`All`](Self::All).
    pub fn target(self) -> Option<&'static str> {
        Some(match self {
            LogCategory::All => return None,
            LogCategory::Bench => "bench",
            LogCategory::BlockStorage => "blockstorage",
            LogCategory::CoinDb => "coindb",
            LogCategory::KvStore => "kvstore",
            LogCategory::Reindex => "reindex",
            LogCategory::Validation => "validation",
            LogCategory::Kernel => "kernel",
        })
    }
}

/// Most verbose level a category prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    /// Everything.
    Trace,
    /// Debug and above.
    Debug,
    /// Info and above.
    Info,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
        }
    }
}

/// Line format and per-category levels.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Prefix lines with a unix timestamp.
    pub log_timestamps: bool,
    /// Include microseconds in the timestamp.
    pub log_time_micros: bool,
    /// Include the emitting thread's name.
    pub log_threadnames: bool,
    /// Include file and line.
    pub log_sourcelocations: bool,
    /// Prefix lines with category and level.
    pub always_print_category_levels: bool,
    levels: BTreeMap<LogCategory, LevelFilter>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        let levels = LogCategory::CONCRETE
            .iter()
            .map(|c| (*c, LevelFilter::INFO))
            .collect();
        Self {
            log_timestamps: true,
            log_time_micros: false,
            log_threadnames: false,
            log_sourcelocations: false,
            always_print_category_levels: true,
            levels,
        }
    }
}

impl LoggingOptions {
    /// Every category at info, timestamps on.
    pub fn new() -> Self {
        Self::default()
    }

    /// Print `category` up to `level`.
    pub fn with_category_level(mut self, category: LogCategory, level: LogLevel) -> Self {
        self.set(category, level.into());
        self
    }

    /// Silence `category`.
    pub fn without_category(mut self, category: LogCategory) -> Self {
        self.set(category, LevelFilter::OFF);
        self
    }

    fn set(&mut self, category: LogCategory, filter: LevelFilter) {
        match category {
            LogCategory::All => {
                for c in LogCategory::CONCRETE {
                    self.levels.insert(c, filter);
                }
            }
            c => {
                self.levels.insert(c, filter);
            }
        }
    }

    fn targets(&self) -> Targets {
        self.levels
            .iter()
            .filter_map(|(c, f)| c.target().map(|t| (t, *f)))
            .fold(Targets::new(), |acc, (t, f)| acc.with_target(t, f))
    }
}

type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
struct CallbackMakeWriter {
    callback: LogCallback,
}

impl<'a> MakeWriter<'a> for CallbackMakeWriter {
    type Writer = CallbackWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CallbackWriter {
            callback: self.callback.clone(),
            buf: Vec::new(),
        }
    }
}

/// Buffers one formatted event and hands it over on drop.
struct CallbackWriter {
    callback: LogCallback,
    buf: Vec<u8>,
}

impl io::Write for CallbackWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for CallbackWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf);
        (self.callback)(line.trim_end_matches('\n'));
    }
}

struct UnixTime {
    micros: bool,
}

impl FormatTime for UnixTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        if self.micros {
            write!(w, "{}.{:06}", now.as_secs(), now.subsec_micros())
        } else {
            write!(w, "{}", now.as_secs())
        }
    }
}

/// A configured log sink. Nothing is delivered until it is installed with
/// [`set_default`](Self::set_default) or [`init_global`](Self::init_global).
pub struct LoggingConnection {
    dispatch: Dispatch,
}

impl LoggingConnection {
    /// Deliver enabled kernel log lines to `callback`.
    pub fn new<F>(callback: F, options: LoggingOptions) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let writer = CallbackMakeWriter {
            callback: Arc::new(callback),
        };
        let base = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_names(options.log_threadnames)
            .with_file(options.log_sourcelocations)
            .with_line_number(options.log_sourcelocations)
            .with_target(options.always_print_category_levels)
            .with_level(options.always_print_category_levels);

        let layer: Box<dyn Layer<Registry> + Send + Sync> = if options.log_timestamps {
            base.with_timer(UnixTime {
                micros: options.log_time_micros,
            })
            .boxed()
        } else {
            base.without_time().boxed()
        };

        let subscriber = Registry::default().with(layer.with_filter(options.targets()));
        Self {
            dispatch: Dispatch::new(subscriber),
        }
    }

    /// Route events from the current thread here until the guard drops.
    pub fn set_default(&self) -> DefaultGuard {
        dispatcher::set_default(&self.dispatch)
    }

    /// Route events from every thread here for the rest of the process.
    pub fn init_global(self) -> KernelResult<()> {
        dispatcher::set_global_default(self.dispatch)
            .map_err(|e| KernelError::InvalidOptions(format!("global logger: {e}")))
    }
}
