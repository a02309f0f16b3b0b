//! Console and rotating-file logging driven by [`LoggingConfig`] sections.
//!
//! Each section key is a tracing target prefix (`modwire`, `modwire_server::modules`);
//! the `"default"` section catches every target no other section claims.

use crate::config::{LoggingConfig, Section};
use file_rotate::{
    compression::Compression,
    suffix::AppendCount,
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io::{IsTerminal, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{level_filters::LevelFilter, Level};
use tracing_subscriber::{
    filter::Targets,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    Layer, Registry,
};

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;
const DEFAULT_MAX_BACKUPS: usize = 3;

fn parse_tracing_level(s: &str) -> Option<Level> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        "off" | "none" | "" => None,
        _ => Some(Level::INFO),
    }
}

/// Returns true if target == prefix or target starts with "prefix::"
fn matches_target_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// -------- rotating writer --------

#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendCount>>>);

impl Write for RotWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().flush()
    }
}

/// Writer that silently swallows records no file is configured for.
struct MaybeWriter(Option<RotWriter>);

impl Write for MaybeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.0 {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.0 {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// Picks the file of the longest matching section prefix, falling back to the default file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<RotWriter>,
    by_prefix: Vec<(String, RotWriter)>,
}

impl FileRouter {
    fn resolve_for(&self, target: &str) -> Option<RotWriter> {
        self.by_prefix
            .iter()
            .filter(|(prefix, _)| matches_target_prefix(target, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, w)| w.clone())
            .or_else(|| self.default.clone())
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = MaybeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MaybeWriter(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        MaybeWriter(self.resolve_for(meta.target()))
    }
}

/// Resolve a log file path against `base_dir`; absolute paths are kept as-is.
fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn create_rotating_writer(log_path: &Path, section: &Section) -> std::io::Result<RotWriter> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) * 1024 * 1024;
    let backups = section.max_backups.unwrap_or(DEFAULT_MAX_BACKUPS);
    let rot = FileRotate::new(
        log_path,
        AppendCount::new(backups),
        ContentLimit::BytesSurpassed(usize::try_from(max_bytes).unwrap_or(usize::MAX)),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    Ok(RotWriter(Arc::new(Mutex::new(rot))))
}

// -------- filters --------

/// Per-section levels plus a default level for every other target.
///
/// `Targets` resolves the most specific prefix, so a section set to `off`
/// still silences its targets even when the default level is permissive.
fn build_targets(cfg: &LoggingConfig, level_of: impl Fn(&Section) -> Option<Level>) -> Targets {
    let default = cfg
        .get(DEFAULT_SECTION)
        .and_then(&level_of)
        .map(LevelFilter::from_level)
        .unwrap_or(LevelFilter::OFF);

    cfg.iter()
        .filter(|(name, _)| name.as_str() != DEFAULT_SECTION)
        .fold(Targets::new().with_default(default), |targets, (name, section)| {
            let level = level_of(section)
                .map(LevelFilter::from_level)
                .unwrap_or(LevelFilter::OFF);
            targets.with_target(name.clone(), level)
        })
}

fn console_targets(cfg: &LoggingConfig) -> Targets {
    build_targets(cfg, |s| parse_tracing_level(&s.console_level))
}

/// File levels only apply to sections that actually route somewhere.
fn file_targets(cfg: &LoggingConfig, router: &FileRouter) -> Targets {
    let has_default_file = router.default.is_some();
    build_targets(cfg, |s| {
        if s.file.trim().is_empty() && !has_default_file {
            None
        } else {
            parse_tracing_level(&s.file_level)
        }
    })
}

fn build_file_router(cfg: &LoggingConfig, base_dir: &Path) -> FileRouter {
    let mut router = FileRouter::default();
    // sections naming the same file share one writer
    let mut opened: HashMap<PathBuf, RotWriter> = HashMap::new();

    for (name, section) in cfg {
        if section.file.trim().is_empty() {
            continue;
        }
        let log_path = resolve_log_path(&section.file, base_dir);
        let writer = match opened.get(&log_path) {
            Some(w) => w.clone(),
            None => match create_rotating_writer(&log_path, section) {
                Ok(w) => {
                    opened.insert(log_path, w.clone());
                    w
                }
                Err(e) => {
                    // the subscriber is not up yet
                    eprintln!(
                        "Failed to open log file for '{}' at {}: {}",
                        name,
                        log_path.display(),
                        e
                    );
                    continue;
                }
            },
        };

        if name == DEFAULT_SECTION {
            router.default = Some(writer);
        } else {
            router.by_prefix.push((name.clone(), writer));
        }
    }
    router
}

// -------- public init --------

/// Install the global subscriber.
///
/// `base_dir` resolves relative `file` entries. Calling this twice is harmless:
/// the second subscriber is ignored.
pub fn init_logging_from_config(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` before installing the subscriber
    let _ = tracing_log::LogTracer::init();

    if cfg.is_empty() {
        init_default_logging();
        return;
    }

    let console = fmt::layer()
        .with_ansi(std::io::stdout().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_filter(console_targets(cfg));

    let router = build_file_router(cfg, base_dir);
    let file = (!router.is_empty()).then(|| {
        let targets = file_targets(cfg, &router);
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_writer(router)
            .with_filter(targets)
    });

    let _ = Registry::default().with(console).with(file).try_init();
}

/// Console-only logging at `info`, used when no sections are configured.
pub fn init_default_logging() {
    let _ = tracing_log::LogTracer::init();
    let _ = fmt()
        .with_target(true)
        .with_max_level(Level::INFO)
        .try_init();
}
