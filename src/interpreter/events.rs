use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Marker embedded into every priming probe, events carrying it are never collected.
pub const PROBE_SIGNATURE: &str = "tracedig:probe";

/// Trace event classes (ids from the tabular engine trace catalog).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventClass {
    QueryBegin = 9,
    QueryEnd = 10,
    CommandBegin = 15,
    DiscoverBegin = 36,
    StorageEngineScanEnd = 83,
    StorageEngineCacheMatch = 85,
    DirectQueryEnd = 99,
    AggregateRewrite = 131,
    ExecutionMetrics = 136,
}

impl EventClass {
    pub const ALL: [EventClass; 9] = [
        EventClass::QueryBegin,
        EventClass::QueryEnd,
        EventClass::CommandBegin,
        EventClass::DiscoverBegin,
        EventClass::StorageEngineScanEnd,
        EventClass::StorageEngineCacheMatch,
        EventClass::DirectQueryEnd,
        EventClass::AggregateRewrite,
        EventClass::ExecutionMetrics,
    ];

    pub fn id(self) -> u32 {
        return self as u32;
    }

    pub fn from_id(id: u32) -> Option<Self> {
        return Self::ALL.iter().copied().find(|class| class.id() == id);
    }

    /// Scan completions that contribute to the storage engine time.
    pub fn is_storage_engine(self) -> bool {
        return matches!(
            self,
            EventClass::StorageEngineScanEnd | EventClass::DirectQueryEnd
        );
    }

    pub fn display_name(self) -> &'static str {
        match self {
            EventClass::QueryBegin => "QueryBegin",
            EventClass::QueryEnd => "QueryEnd",
            EventClass::CommandBegin => "CommandBegin",
            EventClass::DiscoverBegin => "DiscoverBegin",
            EventClass::StorageEngineScanEnd => "Scan",
            EventClass::StorageEngineCacheMatch => "Cache",
            EventClass::DirectQueryEnd => "DirectQuery",
            EventClass::AggregateRewrite => "AggregateRewrite",
            EventClass::ExecutionMetrics => "ExecutionMetrics",
        }
    }
}

/// Trace columns, the name is the element name used in the trace rowset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TraceColumn {
    EventClass = 0,
    EventSubclass = 1,
    CurrentTime = 2,
    StartTime = 3,
    EndTime = 4,
    Duration = 5,
    CpuTime = 6,
    ObjectName = 13,
    DatabaseName = 28,
    ApplicationName = 37,
    SessionId = 39,
    TextData = 42,
    ActivityId = 46,
    RequestId = 47,
}

impl TraceColumn {
    pub const ALL: [TraceColumn; 14] = [
        TraceColumn::EventClass,
        TraceColumn::EventSubclass,
        TraceColumn::CurrentTime,
        TraceColumn::StartTime,
        TraceColumn::EndTime,
        TraceColumn::Duration,
        TraceColumn::CpuTime,
        TraceColumn::ObjectName,
        TraceColumn::DatabaseName,
        TraceColumn::ApplicationName,
        TraceColumn::SessionId,
        TraceColumn::TextData,
        TraceColumn::ActivityId,
        TraceColumn::RequestId,
    ];

    pub fn id(self) -> u32 {
        return self as u32;
    }

    pub fn from_id(id: u32) -> Option<Self> {
        return Self::ALL.iter().copied().find(|column| column.id() == id);
    }

    pub fn name(self) -> &'static str {
        match self {
            TraceColumn::EventClass => "EventClass",
            TraceColumn::EventSubclass => "EventSubclass",
            TraceColumn::CurrentTime => "CurrentTime",
            TraceColumn::StartTime => "StartTime",
            TraceColumn::EndTime => "EndTime",
            TraceColumn::Duration => "Duration",
            TraceColumn::CpuTime => "CPUTime",
            TraceColumn::ObjectName => "ObjectName",
            TraceColumn::DatabaseName => "DatabaseName",
            TraceColumn::ApplicationName => "ApplicationName",
            TraceColumn::SessionId => "SessionID",
            TraceColumn::TextData => "TextData",
            TraceColumn::ActivityId => "ActivityID",
            TraceColumn::RequestId => "RequestID",
        }
    }
}

// Subclasses of the storage engine events (scan end and cache match share them).
const SE_SUBCLASSES: [(u32, &str); 8] = [
    (0, "VertiPaqScan"),
    (1, "TabularQuery"),
    (2, "UserHierarchyProcessingQuery"),
    (10, "VertiPaqScanInternal"),
    (11, "TabularQueryInternal"),
    (12, "UserHierarchyProcessingQueryInternal"),
    (20, "BatchVertiPaqScan"),
    (21, "BatchTabularQuery"),
];

const QUERY_SUBCLASSES: [(u32, &str); 4] = [
    (0, "MDXQuery"),
    (1, "DMXQuery"),
    (2, "SQLQuery"),
    (3, "DAXQuery"),
];

pub fn subclass_name(class: EventClass, subclass: u32) -> Option<&'static str> {
    let table: &[(u32, &str)] = match class {
        EventClass::StorageEngineScanEnd | EventClass::StorageEngineCacheMatch => &SE_SUBCLASSES,
        EventClass::QueryBegin | EventClass::QueryEnd => &QUERY_SUBCLASSES,
        _ => return None,
    };
    return table
        .iter()
        .find(|(id, _)| *id == subclass)
        .map(|(_, name)| *name);
}

/// One row of the trace rowset, as delivered by the server: column name -> raw text.
///
/// Not every event class populates every column, hence all getters are fallible.
#[derive(Debug, Clone, Default)]
pub struct RawEvent {
    columns: HashMap<String, String>,
}

impl RawEvent {
    pub fn new(columns: HashMap<String, String>) -> Self {
        return Self { columns };
    }

    pub fn with(mut self, column: TraceColumn, value: impl Into<String>) -> Self {
        self.columns.insert(column.name().to_string(), value.into());
        return self;
    }

    pub fn get(&self, column: TraceColumn) -> Result<&str> {
        return self
            .columns
            .get(column.name())
            .map(|value| value.as_str())
            .ok_or_else(|| anyhow!("Column {} is not populated", column.name()));
    }

    pub fn get_i64(&self, column: TraceColumn) -> Result<i64> {
        let value = self.get(column)?;
        return value
            .trim()
            .parse::<i64>()
            .with_context(|| format!("Cannot parse {} ({:?})", column.name(), value));
    }

    pub fn get_datetime(&self, column: TraceColumn) -> Result<DateTime<Utc>> {
        let value = self.get(column)?;
        return parse_trace_datetime(value)
            .with_context(|| format!("Cannot parse {} ({:?})", column.name(), value));
    }
}

/// Trace timestamps are ISO 8601, usually without offset (UTC), sometimes with one.
pub fn parse_trace_datetime(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Ok(datetime.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(datetime.and_utc());
        }
    }
    return Err(anyhow!("Unsupported datetime format"));
}

// Fetch one optional field, a failure is logged and turns into None.
fn extract<T>(raw: &RawEvent, column: TraceColumn, getter: fn(&RawEvent, TraceColumn) -> Result<T>) -> Option<T> {
    match getter(raw, column) {
        Ok(value) => return Some(value),
        Err(err) => {
            log::trace!("Skipping field {}: {:#}", column.name(), err);
            return None;
        }
    }
}

fn extract_text(raw: &RawEvent, column: TraceColumn) -> String {
    return raw.get(column).map(|s| s.to_string()).unwrap_or_default();
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub class: EventClass,
    pub subclass: Option<u32>,
    /// Time the server emitted the event (or the time it was collected)
    pub current_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub cpu_time: Option<i64>,
    pub text: String,
    pub database_name: String,
    pub session_id: String,
    pub application_name: String,
    pub object_name: String,
    pub activity_id: String,
    pub internal_batch: bool,
    pub net_parallel_duration: Option<i64>,
}

impl TraceEvent {
    /// Build an event from a raw row, every optional field is extracted independently.
    ///
    /// Returns None only for rows without a (known) event class.
    pub fn from_raw(raw: &RawEvent) -> Option<Self> {
        let class_id = extract(raw, TraceColumn::EventClass, RawEvent::get_i64)?;
        let class = match u32::try_from(class_id).ok().and_then(EventClass::from_id) {
            Some(class) => class,
            None => {
                log::trace!("Ignoring unknown event class {}", class_id);
                return None;
            }
        };

        let subclass = extract(raw, TraceColumn::EventSubclass, RawEvent::get_i64)
            .and_then(|value| u32::try_from(value).ok());
        let duration = extract(raw, TraceColumn::Duration, RawEvent::get_i64);
        let internal_batch = subclass
            .and_then(|subclass| subclass_name(class, subclass))
            .map(|name| name.starts_with("Batch"))
            .unwrap_or(false);

        return Some(TraceEvent {
            class,
            subclass,
            current_time: extract(raw, TraceColumn::CurrentTime, RawEvent::get_datetime)
                .unwrap_or_else(Utc::now),
            start_time: extract(raw, TraceColumn::StartTime, RawEvent::get_datetime),
            end_time: extract(raw, TraceColumn::EndTime, RawEvent::get_datetime),
            duration,
            cpu_time: extract(raw, TraceColumn::CpuTime, RawEvent::get_i64),
            text: extract_text(raw, TraceColumn::TextData),
            database_name: extract_text(raw, TraceColumn::DatabaseName),
            session_id: extract_text(raw, TraceColumn::SessionId),
            application_name: extract_text(raw, TraceColumn::ApplicationName),
            object_name: extract_text(raw, TraceColumn::ObjectName),
            activity_id: extract_text(raw, TraceColumn::ActivityId),
            internal_batch,
            net_parallel_duration: duration,
        });
    }

    pub fn is_probe(&self) -> bool {
        return self.text.contains(PROBE_SIGNATURE);
    }

    pub fn subclass_name(&self) -> Option<&'static str> {
        return self
            .subclass
            .and_then(|subclass| subclass_name(self.class, subclass));
    }

    /// Internal scans are engine bookkeeping, not attributable query cost.
    pub fn is_internal(&self) -> bool {
        return self
            .subclass_name()
            .map(|name| name.contains("Internal"))
            .unwrap_or(false);
    }
}

/// Callback invoked by the connection for every trace row, possibly from a foreign thread.
pub type EventCallback = Arc<dyn Fn(RawEvent) + Send + Sync>;

/// Append-only store shared between the trace subscription and the run.
///
/// The lock is held only for a push or for the final take, never across I/O.
#[derive(Clone, Default)]
pub struct EventStore {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl EventStore {
    pub fn new() -> Self {
        return Self::default();
    }

    pub fn collector(&self) -> EventCallback {
        let store = self.clone();
        return Arc::new(move |raw: RawEvent| {
            store.collect(&raw);
        });
    }

    /// Returns true if the event had been appended.
    pub fn collect(&self, raw: &RawEvent) -> bool {
        let event = match TraceEvent::from_raw(raw) {
            Some(event) => event,
            None => return false,
        };
        if event.is_probe() {
            log::trace!("Skipping probe event {:?}", event.class);
            return false;
        }
        self.lock().push(event);
        return true;
    }

    pub fn len(&self) -> usize {
        return self.lock().len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    pub fn take(&self) -> Vec<TraceEvent> {
        return std::mem::take(&mut *self.lock());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TraceEvent>> {
        // A panic in another collector call cannot leave a half-pushed Vec behind.
        return self.events.lock().unwrap_or_else(|err| err.into_inner());
    }
}
