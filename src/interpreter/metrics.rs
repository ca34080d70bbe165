use crate::interpreter::activation::ExecutionWindow;
use crate::interpreter::events::{EventClass, TraceEvent};
use crate::interpreter::identifiers::IdentifierMaps;
use crate::interpreter::normalize::{estimated_bytes, estimated_rows, normalize_query_text};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

/// Aggregated performance of one query run, all durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerfMetrics {
    #[serde(rename = "Total")]
    pub total: i64,
    /// Formula engine: everything that is not covered by storage engine scans
    #[serde(rename = "FE")]
    pub formula_engine: i64,
    /// Storage engine, net-parallel (wall clock covered by scans)
    #[serde(rename = "SE")]
    pub storage_engine: i64,
    #[serde(rename = "SE_CPU")]
    pub storage_engine_cpu: i64,
    /// SE_CPU / SE
    #[serde(rename = "SE_Par")]
    pub storage_engine_parallelism: f64,
    #[serde(rename = "SE_Queries")]
    pub storage_engine_queries: usize,
    #[serde(rename = "SE_Cache")]
    pub storage_engine_cache_hits: usize,
    #[serde(rename = "QueryEnd")]
    pub query_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineData {
    #[serde(rename = "Start")]
    pub start: DateTime<Utc>,
    #[serde(rename = "End")]
    pub end: DateTime<Utc>,
    /// Offset from the query start
    #[serde(rename = "Offset")]
    pub offset: i64,
    #[serde(rename = "OffsetPercent")]
    pub offset_percent: f64,
    #[serde(rename = "Duration")]
    pub duration: i64,
}

/// One row of the waterfall (either real scan or synthetic formula engine segment).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDetail {
    #[serde(rename = "Line")]
    pub line: usize,
    #[serde(rename = "Class")]
    pub class: String,
    #[serde(rename = "Subclass")]
    pub subclass: String,
    #[serde(rename = "Duration")]
    pub duration: i64,
    #[serde(rename = "CPU")]
    pub cpu: i64,
    #[serde(rename = "Par")]
    pub parallelism: f64,
    #[serde(rename = "Rows")]
    pub rows: u64,
    #[serde(rename = "Bytes")]
    pub bytes: u64,
    #[serde(rename = "Query")]
    pub query: String,
    #[serde(rename = "Timeline")]
    pub timeline: Option<TimelineData>,
}

impl EventDetail {
    pub fn is_formula_engine(&self) -> bool {
        return self.class == FORMULA_ENGINE;
    }
}

const FORMULA_ENGINE: &str = "FE";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub performance: PerfMetrics,
    pub event_details: Vec<EventDetail>,
}

/// Half-open [start, end) interval, milliseconds from the query start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

/// Sweep line over the intervals: for each of them returns the part of its span that was not
/// covered by the intervals that started before it (in input order).
pub fn net_parallel_durations(intervals: &[Interval]) -> Vec<i64> {
    let mut order = (0..intervals.len()).collect::<Vec<_>>();
    order.sort_by_key(|&i| (intervals[i].start, intervals[i].end));

    let mut durations = vec![0; intervals.len()];
    let mut watermark: Option<i64> = None;
    for i in order {
        let interval = intervals[i];
        let from = watermark.map_or(interval.start, |w| w.max(interval.start));
        if interval.end > from {
            durations[i] = interval.end - from;
        }
        watermark = Some(watermark.map_or(interval.end, |w| w.max(interval.end)));
    }
    return durations;
}

/// Wall clock time covered by possibly overlapping intervals.
pub fn merge_intervals(intervals: &[Interval]) -> i64 {
    return net_parallel_durations(intervals).iter().sum();
}

fn round2(value: f64) -> f64 {
    return (value * 100.).round() / 100.;
}

fn ratio(numerator: i64, denominator: i64) -> f64 {
    if denominator <= 0 {
        return 0.;
    }
    return round2(numerator as f64 / denominator as f64);
}

// None when the result does not fit into the date range (i.e. bogus durations from the server).
fn shift(time: DateTime<Utc>, ms: i64) -> Option<DateTime<Utc>> {
    return TimeDelta::try_milliseconds(ms).and_then(|delta| time.checked_add_signed(delta));
}

// Query span, as observed by the trace (or by the client as a last resort).
struct Span {
    // Origin of all offsets, None if nothing in the trace has a timestamp
    origin: Option<DateTime<Utc>>,
    // Whether origin/total came from QueryBegin/QueryEnd, only then offsets are clamped to it
    bracketed: bool,
    total: i64,
    query_end: Option<DateTime<Utc>>,
}

impl Span {
    fn new(events: &[TraceEvent], window: Option<&ExecutionWindow>) -> Self {
        let query_begin = events.iter().find(|e| e.class == EventClass::QueryBegin);
        let query_end = events.iter().rev().find(|e| e.class == EventClass::QueryEnd);

        let begin_time = query_begin.and_then(|e| e.start_time);
        let end_time = query_end.and_then(|e| e.end_time);

        let total = match (begin_time, end_time) {
            (Some(begin), Some(end)) if end >= begin => (end - begin).num_milliseconds(),
            _ => query_end
                .and_then(|e| e.duration)
                .or_else(|| window.map(|w| w.elapsed_ms))
                .unwrap_or(0),
        }
        .max(0);

        let traced_origin = begin_time.or_else(|| query_end.and_then(|e| e.start_time));
        let origin = traced_origin.or_else(|| events.iter().find_map(|e| e.start_time));
        let query_end = end_time
            .or_else(|| traced_origin.and_then(|origin| shift(origin, total)))
            .or_else(|| window.map(|w| w.finished_at));

        return Span {
            origin,
            bracketed: traced_origin.is_some(),
            total,
            query_end,
        };
    }

    fn interval(&self, event: &TraceEvent) -> Option<Interval> {
        let origin = self.origin?;
        let (start, end) = match (event.start_time, event.end_time, event.duration) {
            (Some(start), Some(end), _) => (start, end.max(start)),
            (Some(start), None, Some(duration)) => (start, shift(start, duration.max(0))?),
            (None, Some(end), Some(duration)) => (shift(end, -duration.max(0))?, end),
            // Point in time markers (i.e. execution metrics)
            (Some(start), None, None) => (start, start),
            _ => return None,
        };
        let mut interval = Interval {
            start: (start - origin).num_milliseconds(),
            end: (end - origin).num_milliseconds(),
        };
        if self.bracketed {
            interval.start = interval.start.clamp(0, self.total);
            interval.end = interval.end.clamp(0, self.total);
        }
        return Some(interval);
    }

    fn timeline(&self, interval: Interval) -> Option<TimelineData> {
        let origin = self.origin?;
        let offset_percent = if self.total > 0 {
            round2(interval.start as f64 * 100. / self.total as f64)
        } else {
            0.
        };
        return Some(TimelineData {
            start: shift(origin, interval.start)?,
            end: shift(origin, interval.end)?,
            offset: interval.start,
            offset_percent,
            duration: interval.end - interval.start,
        });
    }
}

fn is_storage_engine(event: &TraceEvent) -> bool {
    return event.class.is_storage_engine() && !event.is_internal();
}

fn formula_engine_segment(span: &Span, line: usize, from: i64, to: i64) -> EventDetail {
    return EventDetail {
        line,
        class: FORMULA_ENGINE.to_string(),
        subclass: String::new(),
        duration: to - from,
        cpu: 0,
        parallelism: 0.,
        rows: 0,
        bytes: 0,
        query: String::new(),
        timeline: span.timeline(Interval { start: from, end: to }),
    };
}

fn event_detail(
    event: &TraceEvent,
    line: usize,
    interval: Option<Interval>,
    span: &Span,
    identifiers: &IdentifierMaps,
) -> EventDetail {
    let duration = event
        .duration
        .or_else(|| interval.map(|i| i.end - i.start))
        .unwrap_or(0);
    let cpu = event.cpu_time.unwrap_or(0);
    let query = if event.class.is_storage_engine() {
        normalize_query_text(&event.text, identifiers)
    } else {
        event.text.clone()
    };
    let subclass = match (event.subclass_name(), event.subclass) {
        (Some(name), _) => name.to_string(),
        (None, Some(id)) => id.to_string(),
        (None, None) => String::new(),
    };

    return EventDetail {
        line,
        class: event.class.display_name().to_string(),
        subclass,
        duration,
        cpu,
        parallelism: ratio(cpu, duration),
        rows: estimated_rows(&event.text),
        bytes: estimated_bytes(&event.text),
        query,
        timeline: interval.and_then(|interval| span.timeline(interval)),
    };
}

/// Turn the collected trace into metrics and the waterfall.
///
/// Never fails: whatever is missing in the trace degrades the result to partial/zero values.
pub fn analyze(
    mut events: Vec<TraceEvent>,
    identifiers: &IdentifierMaps,
    window: Option<&ExecutionWindow>,
) -> Analysis {
    events.retain(|event| !event.is_probe());
    // Stable, events without start time go first
    events.sort_by_key(|event| event.start_time);

    let span = Span::new(&events, window);

    let storage_engine = (0..events.len())
        .filter(|&i| is_storage_engine(&events[i]))
        .collect::<Vec<_>>();
    let placed = storage_engine
        .iter()
        .filter_map(|&i| span.interval(&events[i]).map(|interval| (i, interval)))
        .collect::<Vec<_>>();
    let intervals = placed.iter().map(|(_, interval)| *interval).collect::<Vec<_>>();
    // Scans that cannot be placed on the timeline do not cover any of it, they are still counted
    // as queries and for CPU.
    for &i in &storage_engine {
        events[i].net_parallel_duration = Some(0);
    }
    for ((i, _), net) in placed.iter().zip(net_parallel_durations(&intervals)) {
        events[*i].net_parallel_duration = Some(net);
    }
    let storage_engine_time = storage_engine
        .iter()
        .map(|&i| events[i].net_parallel_duration.unwrap_or(0).max(0))
        .fold(0i64, i64::saturating_add);
    let storage_engine_cpu = storage_engine
        .iter()
        .map(|&i| events[i].cpu_time.unwrap_or(0).max(0))
        .fold(0i64, i64::saturating_add);
    let cache_hits = events
        .iter()
        .filter(|e| e.class == EventClass::StorageEngineCacheMatch)
        .count();

    let performance = PerfMetrics {
        total: span.total,
        formula_engine: (span.total - storage_engine_time).max(0),
        storage_engine: storage_engine_time,
        storage_engine_cpu,
        storage_engine_parallelism: ratio(storage_engine_cpu, storage_engine_time),
        storage_engine_queries: storage_engine.len(),
        storage_engine_cache_hits: cache_hits,
        query_end: span.query_end,
    };

    // Waterfall: scans and execution metrics, with formula engine segments in the gaps.
    let mut event_details = Vec::new();
    let mut cursor: i64 = 0;
    for event in events
        .iter()
        .filter(|e| is_storage_engine(e) || e.class == EventClass::ExecutionMetrics)
    {
        let interval = span.interval(event);
        if let Some(interval) = interval {
            if span.bracketed && interval.start - cursor >= 1 {
                event_details.push(formula_engine_segment(
                    &span,
                    event_details.len() + 1,
                    cursor,
                    interval.start,
                ));
            }
            // Execution metrics are markers, they do not cover anything
            let covered_until = if is_storage_engine(event) {
                interval.end
            } else {
                interval.start
            };
            cursor = cursor.max(covered_until);
        }
        event_details.push(event_detail(
            event,
            event_details.len() + 1,
            interval,
            &span,
            identifiers,
        ));
    }
    if span.bracketed && span.total - cursor >= 1 {
        event_details.push(formula_engine_segment(
            &span,
            event_details.len() + 1,
            cursor,
            span.total,
        ));
    }

    log::debug!(
        "Analyzed {} events: total={}ms, FE={}ms, SE={}ms ({} scans, {} cache hits)",
        events.len(),
        performance.total,
        performance.formula_engine,
        performance.storage_engine,
        performance.storage_engine_queries,
        performance.storage_engine_cache_hits,
    );

    return Analysis {
        performance,
        event_details,
    };
}
