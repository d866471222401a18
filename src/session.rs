//! Per-call execution state and statistics.
//!
//! A [`Session`] belongs to one top-level evaluation. It may be shared by several evaluations
//! running concurrently within the same logical request, so every accessor goes through an
//! internal lock.
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use derive_more::From;
use serde::Serialize;

use crate::sync::lock;

/// A structured error: an ordered list of human-readable details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, From)]
#[serde(transparent)]
pub struct ErrorDetails(Vec<String>);

impl ErrorDetails {
    /// Append a detail.
    pub fn push(&mut self, detail: impl Into<String>) {
        self.0.push(detail.into());
    }

    /// Returns `true` if there are no details.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of details.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The details, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join("; "))
    }
}

/// Statistics of one factor execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FactorStats {
    /// Wall time of the execution, middlewares included.
    pub duration: Duration,
    /// Result of the leaf.
    pub result: bool,
    /// Faults recorded during the execution.
    pub error: ErrorDetails,
}

impl fmt::Display for FactorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "duration: [{}], result: [{}], error: ",
            format_duration(self.duration),
            self.result
        )?;
        if self.error.is_empty() {
            f.write_str("[nil]")
        } else {
            write!(f, "{}", self.error)
        }
    }
}

/// Live handle to the statistics entry of a factor that is being executed.
///
/// Middlewares receive it through [`Invocation::stats`](crate::Invocation) and use it to record
/// errors. The evaluator fills in the result and duration once the leaf completes.
#[derive(Debug, Default)]
pub struct FactorRecorder {
    stats: Mutex<FactorStats>,
}

impl FactorRecorder {
    /// Append an error detail to this factor's record.
    pub fn add_error(&self, detail: impl Into<String>) {
        lock(&self.stats).error.push(detail);
    }

    pub(crate) fn finish(&self, result: bool, duration: Duration) {
        let mut stats = lock(&self.stats);
        stats.result = result;
        stats.duration = duration;
    }

    /// Copy of the statistics recorded so far.
    pub fn snapshot(&self) -> FactorStats {
        lock(&self.stats).clone()
    }
}

/// One entry of the session's factor execution log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorExecutionRecord {
    /// Factor name.
    pub name: String,
    /// What happened.
    pub stats: FactorStats,
}

/// Execution state of a top-level switch evaluation.
///
/// ```
/// # use switch_sdk::Session;
/// let session = Session::with_request_id("req-42");
/// assert_eq!(session.request_id(), "req-42");
/// assert!(session.records().is_empty());
/// ```
#[derive(Debug)]
pub struct Session {
    state: Mutex<SessionState>,
}

#[derive(Debug)]
struct SessionState {
    request_id: String,
    started_at: DateTime<Utc>,
    // A switch may contain the same factor several times, so this is a list and not a map.
    records: Vec<(String, Arc<FactorRecorder>)>,
    result: bool,
    duration: Option<Duration>,
    error: ErrorDetails,
    statistics_enabled: bool,
}

impl Default for Session {
    fn default() -> Session {
        Session::with_request_id(String::new())
    }
}

impl Session {
    /// Create a session without a request id.
    pub fn new() -> Session {
        Session::default()
    }

    /// Create a session carrying the caller's request id.
    pub fn with_request_id(request_id: impl Into<String>) -> Session {
        Session {
            state: Mutex::new(SessionState {
                request_id: request_id.into(),
                started_at: Utc::now(),
                records: Vec::new(),
                result: false,
                duration: None,
                error: ErrorDetails::default(),
                statistics_enabled: false,
            }),
        }
    }

    /// The request id. Empty if none was given.
    pub fn request_id(&self) -> String {
        lock(&self.state).request_id.clone()
    }

    /// Replace the request id.
    pub fn set_request_id(&self, request_id: impl Into<String>) {
        lock(&self.state).request_id = request_id.into();
    }

    /// When the session was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        lock(&self.state).started_at
    }

    /// Open a fresh statistics entry for `factor`. Called once per leaf execution.
    pub(crate) fn begin_factor(&self, factor: &str) -> Arc<FactorRecorder> {
        let recorder = Arc::new(FactorRecorder::default());
        lock(&self.state)
            .records
            .push((factor.to_owned(), Arc::clone(&recorder)));
        recorder
    }

    /// Snapshot of every factor execution recorded so far, in execution order.
    pub fn records(&self) -> Vec<FactorExecutionRecord> {
        let records = lock(&self.state).records.clone();
        records
            .into_iter()
            .map(|(name, recorder)| FactorExecutionRecord {
                name,
                stats: recorder.snapshot(),
            })
            .collect()
    }

    /// Record a session-level error (one not tied to a factor execution).
    pub fn add_error(&self, detail: impl Into<String>) {
        lock(&self.state).error.push(detail);
    }

    /// Session-level errors followed by the errors of every factor record.
    pub fn errors(&self) -> ErrorDetails {
        let (mut errors, records) = {
            let state = lock(&self.state);
            (state.error.clone(), state.records.clone())
        };
        for (name, recorder) in records {
            for detail in recorder.snapshot().error.iter() {
                errors.push(format!("{name}: {detail}"));
            }
        }
        errors
    }

    pub(crate) fn set_outcome(&self, result: bool, duration: Duration) {
        let mut state = lock(&self.state);
        state.result = result;
        state.duration = Some(duration);
    }

    /// Overall result of the last completed top-level evaluation.
    pub fn result(&self) -> bool {
        lock(&self.state).result
    }

    /// Duration of the last completed top-level evaluation.
    pub fn duration(&self) -> Option<Duration> {
        lock(&self.state).duration
    }

    pub(crate) fn set_statistics_enabled(&self, enabled: bool) {
        lock(&self.state).statistics_enabled = enabled;
    }

    /// Whether the last evaluation logged a statistics line.
    pub fn statistics_enabled(&self) -> bool {
        lock(&self.state).statistics_enabled
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Timer(Instant);

impl Timer {
    pub fn start() -> Timer {
        Timer(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

pub(crate) fn format_duration(duration: Duration) -> String {
    format!("{:.3}ms", duration.as_secs_f64() * 1000.0)
}

/// `[name(duration,result); ...]`
pub(crate) fn format_factor_records(records: &[FactorExecutionRecord]) -> String {
    let records = records
        .iter()
        .map(|record| {
            format!(
                "{}({},{})",
                record.name,
                format_duration(record.stats.duration),
                record.stats.result
            )
        })
        .collect::<Vec<_>>();
    format!("[{}]", records.join("; "))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{format_duration, format_factor_records, ErrorDetails, Session};

    #[test]
    fn records_factor_executions_in_order() {
        let session = Session::new();

        let first = session.begin_factor("user_id");
        first.finish(true, Duration::from_millis(2));
        let second = session.begin_factor("time_range");
        second.add_error("window not started");
        second.finish(false, Duration::from_micros(1500));

        let records = session.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "user_id");
        assert!(records[0].stats.result);
        assert_eq!(records[1].name, "time_range");
        assert!(!records[1].stats.result);
        assert_eq!(
            records[1].stats.error,
            ErrorDetails::from(vec!["window not started".to_owned()])
        );

        assert_eq!(
            format_factor_records(&records),
            "[user_id(2.000ms,true); time_range(1.500ms,false)]"
        );
    }

    #[test]
    fn errors_include_factor_errors() {
        let session = Session::new();
        session.add_error("switch has no rules");
        session.begin_factor("ip").add_error("bad config");

        let errors = session.errors();
        assert_eq!(errors.to_string(), "[switch has no rules; ip: bad config]");
        assert!(ErrorDetails::default().to_string() == "[]");
    }

    #[test]
    fn factor_stats_display() {
        let session = Session::new();
        let recorder = session.begin_factor("single");
        recorder.finish(true, Duration::from_millis(1));
        assert_eq!(
            recorder.snapshot().to_string(),
            "duration: [1.000ms], result: [true], error: [nil]"
        );
    }

    #[test]
    fn can_be_shared_between_threads() {
        let session = Arc::new(Session::with_request_id("req"));

        std::thread::scope(|s| {
            for i in 0..8 {
                let session = &session;
                s.spawn(move || {
                    let recorder = session.begin_factor(&format!("factor-{i}"));
                    recorder.finish(i % 2 == 0, Duration::ZERO);
                });
            }
        });

        assert_eq!(session.records().len(), 8);
        assert_eq!(session.request_id(), "req");
    }

    #[test]
    fn formats_milliseconds() {
        assert_eq!(format_duration(Duration::from_micros(1234)), "1.234ms");
        assert_eq!(format_duration(Duration::ZERO), "0.000ms");
    }
}
