//! JSON-lines logging for the engine.
//!
//! Every record is one JSON object carrying a run id, a process-wide sequence
//! number, a severity and the engine stage that produced it. Records are
//! written to stderr, or under `FRACTURE_LOG_DIR/<run_id>/` when that is set
//! (`events.jsonl` for info and above, `trace.jsonl` for the rest).
//!
//! Filtering is read once per process:
//! - `FRACTURE_LOG_LEVEL`: minimum severity, default `info`
//! - `FRACTURE_LOG_DOMAINS`: comma-separated stages, or `all`

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

// =============================================================================
// Severity and stage
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

const LEVELS: [Level; 6] = [
    Level::Trace,
    Level::Debug,
    Level::Info,
    Level::Warn,
    Level::Error,
    Level::Fatal,
];

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }

    /// Case-insensitive name lookup.
    pub fn parse(name: &str) -> Option<Level> {
        let name = name.trim();
        LEVELS.into_iter().find(|l| l.as_str().eq_ignore_ascii_case(name))
    }
}

/// Engine stage a record comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Ingest,
    Features,
    Score,
    Classify,
    Crisis,
    Dispatch,
    Learning,
    Clock,
    Config,
    System,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Ingest => "ingest",
            Domain::Features => "features",
            Domain::Score => "score",
            Domain::Classify => "classify",
            Domain::Crisis => "crisis",
            Domain::Dispatch => "dispatch",
            Domain::Learning => "learning",
            Domain::Clock => "clock",
            Domain::Config => "config",
            Domain::System => "system",
        }
    }
}

/// Which records get written.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFilter {
    pub min_level: Level,
    /// `None` admits every stage.
    pub domains: Option<HashSet<String>>,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            min_level: Level::Info,
            domains: None,
        }
    }
}

impl LogFilter {
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var("FRACTURE_LOG_LEVEL").ok().as_deref(),
            std::env::var("FRACTURE_LOG_DOMAINS").ok().as_deref(),
        )
    }

    fn from_values(level: Option<&str>, domains: Option<&str>) -> Self {
        let min_level = level.and_then(Level::parse).unwrap_or(Level::Info);
        let domains = domains
            .map(str::trim)
            .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("all"))
            .map(|d| d.split(',').map(|x| x.trim().to_lowercase()).collect());
        Self { min_level, domains }
    }

    pub fn admits(&self, level: Level, domain: Domain) -> bool {
        level >= self.min_level
            && self
                .domains
                .as_ref()
                .map_or(true, |set| set.contains(domain.as_str()))
    }
}

// =============================================================================
// Sinks
// =============================================================================

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);
static SINKS: OnceLock<Sinks> = OnceLock::new();

fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Append-only JSON-lines file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write errors are swallowed; logging never fails the caller.
    pub fn write_line(&self, line: &str) {
        let mut w = self.writer.lock();
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

#[derive(Debug)]
struct Sinks {
    run_id: String,
    filter: LogFilter,
    events: Option<JsonlSink>,
    trace: Option<JsonlSink>,
}

impl Sinks {
    fn from_env() -> Self {
        let run_id = std::env::var("FRACTURE_RUN_ID")
            .unwrap_or_else(|_| format!("fe-{}-{}", ts_epoch_ms(), std::process::id()));
        let dir = std::env::var("FRACTURE_LOG_DIR").ok().map(|base| Path::new(&base).join(&run_id));
        let open = |name: &str| {
            let path = dir.as_ref()?.join(name);
            JsonlSink::open(&path)
                .map_err(|err| eprintln!("fracture-engine: cannot open {}: {}", path.display(), err))
                .ok()
        };
        Self {
            events: open("events.jsonl"),
            trace: open("trace.jsonl"),
            filter: LogFilter::from_env(),
            run_id,
        }
    }

    fn sink_for(&self, level: Level) -> Option<&JsonlSink> {
        if level <= Level::Debug {
            self.trace.as_ref()
        } else {
            self.events.as_ref()
        }
    }
}

// =============================================================================
// Emission
// =============================================================================

pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Write one record if the process filter admits it.
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let sinks = SINKS.get_or_init(Sinks::from_env);
    if !sinks.filter.admits(level, domain) {
        return;
    }
    let line = format_record(&sinks.run_id, next_seq(), level, domain.as_str(), event, fields);
    match sinks.sink_for(level) {
        Some(sink) => sink.write_line(&line),
        None => eprintln!("{}", line),
    }
}

/// Identifiers are lifted to the top level; everything else goes under `data`.
fn format_record(
    run_id: &str,
    seq: u64,
    level: Level,
    domain: &str,
    event: &str,
    mut fields: Map<String, Value>,
) -> String {
    let mut record = Map::new();
    record.insert("ts".into(), json!(ts_now()));
    record.insert("run_id".into(), json!(run_id));
    record.insert("seq".into(), json!(seq));
    record.insert("lvl".into(), json!(level.as_str().to_ascii_uppercase()));
    record.insert("domain".into(), json!(domain));
    record.insert("event".into(), json!(event));
    for key in ["subject_id", "source_id", "intervention_id"] {
        if let Some(value) = fields.remove(key) {
            record.insert(key.into(), value);
        }
    }
    record.insert("data".into(), Value::Object(fields));
    Value::Object(record).to_string()
}

// =============================================================================
// Engine-specific helpers
// =============================================================================

pub fn log_rejected_sample(subject_id: &str, source_id: &str, value: f64) {
    log(
        Level::Warn,
        Domain::Ingest,
        "sample_rejected",
        obj(&[
            ("subject_id", v_str(subject_id)),
            ("source_id", v_str(source_id)),
            ("value", v_str(&value.to_string())),
        ]),
    );
}

pub fn log_ignored_sample(subject_id: &str, source_id: &str, reason: &str) {
    log(
        Level::Warn,
        Domain::Ingest,
        "sample_ignored",
        obj(&[
            ("subject_id", v_str(subject_id)),
            ("source_id", v_str(source_id)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_score(subject_id: &str, index: f64, confidence: f64, trend: &str, level: &str) {
    log(
        Level::Debug,
        Domain::Score,
        "score",
        obj(&[
            ("subject_id", v_str(subject_id)),
            ("index", v_num(index)),
            ("confidence", v_num(confidence)),
            ("trend", v_str(trend)),
            ("level", v_str(level)),
        ]),
    );
}

pub fn log_crisis(subject_id: &str, transition: &str, index: f64, confirmations: u32) {
    log(
        Level::Warn,
        Domain::Crisis,
        transition,
        obj(&[
            ("subject_id", v_str(subject_id)),
            ("index", v_num(index)),
            ("confirmations", json!(confirmations)),
        ]),
    );
}

pub fn log_intervention(subject_id: &str, intervention_id: &str, event: &str, level: &str) {
    log(
        Level::Info,
        Domain::Dispatch,
        event,
        obj(&[
            ("subject_id", v_str(subject_id)),
            ("intervention_id", v_str(intervention_id)),
            ("level", v_str(level)),
        ]),
    );
}

pub fn log_adjustment(subject_id: &str, event: &str, boundary: &str, from: f64, to: f64) {
    log(
        Level::Info,
        Domain::Learning,
        event,
        obj(&[
            ("subject_id", v_str(subject_id)),
            ("boundary", v_str(boundary)),
            ("from", v_num(from)),
            ("to", v_num(to)),
        ]),
    );
}

// =============================================================================
// Value helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

/// Numbers that JSON cannot carry (NaN, ±inf) become strings.
pub fn v_num(n: f64) -> Value {
    if n.is_finite() {
        json!(n)
    } else {
        Value::String(n.to_string())
    }
}
