use crate::interpreter::connection::{
    Connection, Rowset, Subscription, TraceDefinition, TraceFilter,
};
use crate::interpreter::events::{EventCallback, EventClass as Class, TraceColumn};
use crate::interpreter::options::TraceOptions;
use anyhow::{Context, Result, anyhow};
use chrono::{TimeDelta, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::{BTreeSet, HashMap};

/// Legal (event class id -> column ids) combinations reported by the server.
pub type SupportedEvents = HashMap<u32, BTreeSet<u32>>;

use TraceColumn::*;

const COMMON_COLUMNS: [TraceColumn; 6] = [
    EventClass,
    CurrentTime,
    TextData,
    SessionId,
    ApplicationName,
    ActivityId,
];

// Events needed for the metrics (on top of COMMON_COLUMNS).
const METRIC_EVENTS: [(Class, &[TraceColumn]); 7] = [
    (
        Class::QueryBegin,
        &[EventSubclass, StartTime, DatabaseName, RequestId],
    ),
    (
        Class::QueryEnd,
        &[EventSubclass, StartTime, EndTime, Duration, CpuTime, DatabaseName, RequestId],
    ),
    (
        Class::StorageEngineScanEnd,
        &[EventSubclass, StartTime, EndTime, Duration, CpuTime, ObjectName, DatabaseName, RequestId],
    ),
    (
        Class::StorageEngineCacheMatch,
        &[EventSubclass, StartTime, ObjectName, DatabaseName, RequestId],
    ),
    (
        Class::DirectQueryEnd,
        &[StartTime, EndTime, Duration, CpuTime, DatabaseName, RequestId],
    ),
    (
        Class::AggregateRewrite,
        &[EventSubclass, StartTime, EndTime, Duration, CpuTime, DatabaseName],
    ),
    (
        Class::ExecutionMetrics,
        &[StartTime, DatabaseName, RequestId],
    ),
];

// Lightweight classes, some servers do not deliver anything on an idle trace until they see
// one of them.
const HEARTBEAT_EVENTS: [Class; 3] = [
    Class::DiscoverBegin,
    Class::CommandBegin,
    Class::QueryEnd,
];

// Used when the server cannot tell what it supports.
const FALLBACK_EVENTS: [Class; 3] = [
    Class::QueryBegin,
    Class::QueryEnd,
    Class::StorageEngineScanEnd,
];
const FALLBACK_COLUMNS: [TraceColumn; 4] = [EventClass, StartTime, Duration, TextData];

/// Parse DISCOVER_TRACE_EVENT_CATEGORIES: one row per category, the "Data" column contains
/// the XML description of the events of the category and of their columns.
pub fn parse_event_categories(rowset: &Rowset) -> Result<SupportedEvents> {
    let mut supported = SupportedEvents::new();
    for row in 0..rowset.rows.len() {
        let data = rowset
            .get(row, "Data")
            .ok_or_else(|| anyhow!("No Data column in the event categories"))?;
        parse_event_category(data, &mut supported)?;
    }
    if supported.is_empty() {
        return Err(anyhow!("Server did not report any trace event"));
    }
    return Ok(supported);
}

fn parse_event_category(xml: &str, supported: &mut SupportedEvents) -> Result<()> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // Path of the elements, enough to tell EVENT/ID from EVENTCOLUMN/ID
    let mut path: Vec<String> = Vec::new();
    let mut event_id: Option<u32> = None;
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).to_uppercase());
            }
            Event::End(_) => {
                if path.pop().as_deref() == Some("EVENT") {
                    event_id = None;
                }
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                let parent = path.len().checked_sub(2).and_then(|i| path.get(i));
                match (path.last().map(|s| s.as_str()), parent.map(|s| s.as_str())) {
                    (Some("ID"), Some("EVENT")) => {
                        let id = text.trim().parse::<u32>()?;
                        supported.entry(id).or_default();
                        event_id = Some(id);
                    }
                    (Some("ID"), Some("EVENTCOLUMN")) => {
                        let column = text.trim().parse::<u32>()?;
                        let id = event_id.ok_or_else(|| anyhow!("Column {} outside of event", column))?;
                        supported.entry(id).or_default().insert(column);
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    return Ok(());
}

/// Events and columns to subscribe to, limited to what the server supports (if known).
pub fn trace_events(
    supported: Option<&SupportedEvents>,
) -> Vec<(Class, Vec<TraceColumn>)> {
    let mut events: Vec<(Class, Vec<TraceColumn>)> = Vec::new();

    match supported {
        Some(supported) => {
            for (class, columns) in METRIC_EVENTS {
                let legal = match supported.get(&class.id()) {
                    Some(legal) => legal,
                    None => {
                        log::debug!("Event {:?} is not supported by the server", class);
                        continue;
                    }
                };
                let mut columns = COMMON_COLUMNS
                    .iter()
                    .chain(columns.iter())
                    .copied()
                    .filter(|column| legal.contains(&column.id()))
                    .collect::<Vec<_>>();
                columns.sort();
                events.push((class, columns));
            }
        }
        None => {
            for class in FALLBACK_EVENTS {
                events.push((class, FALLBACK_COLUMNS.to_vec()));
            }
        }
    }

    for class in HEARTBEAT_EVENTS {
        if events.iter().any(|(existing, _)| *existing == class) {
            continue;
        }
        let mut columns = match supported.and_then(|s| s.get(&class.id())) {
            Some(legal) => COMMON_COLUMNS
                .iter()
                .copied()
                .filter(|column| legal.contains(&column.id()))
                .collect::<Vec<_>>(),
            None => vec![EventClass, TextData],
        };
        if !columns.contains(&EventClass) {
            columns.insert(0, EventClass);
        }
        columns.sort();
        events.push((class, columns));
    }

    return events;
}

pub fn trace_definition(
    session_id: &str,
    application_name: &str,
    supported: Option<&SupportedEvents>,
    options: &TraceOptions,
) -> Result<TraceDefinition> {
    let expiry = TimeDelta::from_std(options.trace_expiry).context("Invalid trace expiry")?;
    let id = format!("tracedig_{}", session_id);
    return Ok(TraceDefinition {
        name: id.clone(),
        id,
        events: trace_events(supported),
        filter: TraceFilter {
            session_id: session_id.to_string(),
            application_name: application_name.to_string(),
        },
        stop_time: Utc::now() + expiry,
    });
}

/// Server side trace scoped to one session.
///
/// Cleanup (stop and drop) must be requested explicitly with finish(), it is attempted even if
/// the run itself failed, and never fails.
pub struct TraceSession<'a> {
    connection: &'a dyn Connection,
    definition: TraceDefinition,
    subscription: Option<Box<dyn Subscription>>,
}

impl<'a> TraceSession<'a> {
    pub async fn create(connection: &'a dyn Connection, options: &TraceOptions) -> Result<Self> {
        let supported = match discover_supported_events(connection).await {
            Ok(supported) => Some(supported),
            Err(err) => {
                log::warn!(
                    "Cannot discover supported trace events, using minimal set: {:#}",
                    err
                );
                None
            }
        };

        let definition = trace_definition(
            connection.session_id(),
            connection.application_name(),
            supported.as_ref(),
            options,
        )?;
        connection
            .create_trace(&definition)
            .await
            .with_context(|| format!("Cannot create trace {}", definition.id))?;
        log::debug!(
            "Trace {} created ({} event classes, expires at {})",
            definition.id,
            definition.events.len(),
            definition.stop_time
        );

        return Ok(TraceSession {
            connection,
            definition,
            subscription: None,
        });
    }

    pub fn id(&self) -> &str {
        return &self.definition.id;
    }

    pub fn definition(&self) -> &TraceDefinition {
        return &self.definition;
    }

    pub async fn start(&mut self, on_event: EventCallback) -> Result<()> {
        let subscription = self
            .connection
            .subscribe(&self.definition.id, on_event)
            .await
            .with_context(|| format!("Cannot start trace {}", self.definition.id))?;
        self.subscription = Some(subscription);
        log::debug!("Trace {} started", self.definition.id);
        return Ok(());
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(subscription) = self.subscription.take() {
            subscription.stop().await?;
            log::debug!("Trace {} stopped", self.definition.id);
        }
        return Ok(());
    }

    async fn drop_trace(&self) -> Result<()> {
        self.connection.delete_trace(&self.definition.id).await?;
        log::debug!("Trace {} dropped", self.definition.id);
        return Ok(());
    }

    /// Stop and drop, each step independently, failures are only logged.
    pub async fn finish(mut self) {
        if let Err(err) = self.stop().await {
            log::warn!("Cannot stop trace {}: {:#}", self.definition.id, err);
        }
        if let Err(err) = self.drop_trace().await {
            log::warn!("Cannot drop trace {}: {:#}", self.definition.id, err);
        }
    }
}

async fn discover_supported_events(connection: &dyn Connection) -> Result<SupportedEvents> {
    let rowset = connection
        .discover("DISCOVER_TRACE_EVENT_CATEGORIES", &[])
        .await?;
    return parse_event_categories(&rowset);
}
