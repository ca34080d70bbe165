// In-memory tabular server for the tests: records every call, can be told to fail any step,
// and delivers trace rows to the subscriber the way a real server would (filtered by the trace
// filter, some of them only after the query had returned).
use crate::interpreter::connection::{
    Connection, Connector, Rowset, RowsetColumn, Subscription, TraceDefinition, ValueKind,
};
use crate::interpreter::events::{
    EventCallback, EventClass, PROBE_SIGNATURE, RawEvent, TraceColumn,
};
use crate::interpreter::xmla::XmlaFault;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const APPLICATION_NAME: &str = "tracedig-test";
pub const CATALOG: &str = "Sales";
const LATE_EVENTS_DELAY: Duration = Duration::from_millis(20);

struct Subscriber {
    trace_id: String,
    callback: EventCallback,
}

#[derive(Default)]
struct State {
    calls: Vec<String>,
    sessions: usize,

    fail_connect: Option<String>,
    fail_query: Option<String>,
    query_fault: Option<XmlaFault>,
    fail_discover: HashSet<String>,
    failing_probes: usize,
    fail_create: bool,
    fail_subscribe: bool,
    fail_stop: bool,
    fail_delete: bool,

    query_result: Rowset,
    query_events: Vec<RawEvent>,
    late_events: Vec<RawEvent>,
    discover: HashMap<String, Rowset>,

    traces: HashMap<String, TraceDefinition>,
    subscriber: Option<Subscriber>,
}

#[derive(Clone)]
pub struct SimulatedServer {
    state: Arc<Mutex<State>>,
}

pub fn rowset(columns: &[&str], rows: &[&[&str]]) -> Rowset {
    return Rowset {
        columns: columns
            .iter()
            .map(|name| RowsetColumn {
                element: name.to_string(),
                name: name.to_string(),
                kind: ValueKind::Text,
            })
            .collect(),
        rows: rows
            .iter()
            .map(|row| row.iter().map(|v| Some(v.to_string())).collect())
            .collect(),
    };
}

/// DISCOVER_TRACE_EVENT_CATEGORIES rowset out of the per category XML.
pub fn event_categories(categories: &[&str]) -> Rowset {
    let rows = categories.iter().map(|xml| vec![Some(xml.to_string())]).collect();
    return Rowset {
        columns: vec![RowsetColumn {
            element: "Data".to_string(),
            name: "Data".to_string(),
            kind: ValueKind::Text,
        }],
        rows,
    };
}

// Every known event with every known column.
fn all_event_categories() -> Rowset {
    let columns = TraceColumn::ALL
        .iter()
        .map(|column| format!("<EVENTCOLUMN><ID>{}</ID></EVENTCOLUMN>", column.id()))
        .collect::<String>();
    let events = EventClass::ALL
        .iter()
        .map(|class| {
            format!(
                "<EVENT><ID>{}</ID><EVENTCOLUMNLIST>{}</EVENTCOLUMNLIST></EVENT>",
                class.id(),
                columns
            )
        })
        .collect::<String>();
    let xml = format!("<EVENTCATEGORY><EVENTLIST>{}</EVENTLIST></EVENTCATEGORY>", events);
    return event_categories(&[&xml]);
}

impl SimulatedServer {
    pub fn new() -> Self {
        let mut state = State {
            query_result: Rowset {
                columns: vec![
                    RowsetColumn {
                        element: "Product_x005B_Name_x005D_".to_string(),
                        name: "Product[Name]".to_string(),
                        kind: ValueKind::Text,
                    },
                    RowsetColumn {
                        element: "_x005B_Qty_x005D_".to_string(),
                        name: "[Qty]".to_string(),
                        kind: ValueKind::Integer,
                    },
                ],
                rows: vec![
                    vec![Some("Bike".to_string()), Some("7".to_string())],
                    vec![Some("Apple".to_string()), None],
                ],
            },
            ..Default::default()
        };
        state.discover.insert(
            "DISCOVER_TRACE_EVENT_CATEGORIES".to_string(),
            all_event_categories(),
        );
        state.discover.insert(
            "DISCOVER_STORAGE_TABLES".to_string(),
            rowset(&["DIMENSION_NAME", "TABLE_ID"], &[&["Sales", "Sales (12)"]]),
        );
        state.discover.insert(
            "DISCOVER_STORAGE_TABLE_COLUMNS".to_string(),
            rowset(&["ATTRIBUTE_NAME", "COLUMN_ID"], &[&["Amount", "Amount (34)"]]),
        );
        return SimulatedServer {
            state: Arc::new(Mutex::new(state)),
        };
    }

    fn state(&self) -> MutexGuard<'_, State> {
        return self.state.lock().unwrap();
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }

    pub fn connection(&self, session_id: &str) -> Arc<dyn Connection> {
        return Arc::new(SimulatedConnection {
            server: self.clone(),
            session_id: session_id.to_string(),
            application_name: APPLICATION_NAME.to_string(),
            catalog: CATALOG.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<String> {
        return self.state().calls.clone();
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        return self
            .state()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count();
    }

    /// Traces that were created and not dropped.
    pub fn live_traces(&self) -> Vec<String> {
        return self.state().traces.keys().cloned().collect();
    }

    pub fn is_subscribed(&self) -> bool {
        return self.state().subscriber.is_some();
    }

    pub fn fail_connect(&self, message: &str) {
        self.state().fail_connect = Some(message.to_string());
    }

    pub fn fail_query(&self, message: &str) {
        self.state().fail_query = Some(message.to_string());
    }

    /// The query fails with an error returned by the server.
    pub fn fault_query(&self, code: &str, message: &str) {
        self.state().query_fault = Some(XmlaFault {
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    pub fn fail_discover(&self, request_type: &str) {
        self.state().fail_discover.insert(request_type.to_string());
    }

    /// The first N probes fail.
    pub fn fail_probes(&self, count: usize) {
        self.state().failing_probes = count;
    }

    pub fn fail_create(&self) {
        self.state().fail_create = true;
    }

    pub fn fail_subscribe(&self) {
        self.state().fail_subscribe = true;
    }

    pub fn fail_stop(&self) {
        self.state().fail_stop = true;
    }

    pub fn fail_delete(&self) {
        self.state().fail_delete = true;
    }

    /// Trace rows produced by the query, delivered before the query returns.
    pub fn set_query_events(&self, events: Vec<RawEvent>) {
        self.state().query_events = events;
    }

    /// Trace rows produced by the query, delivered shortly after it returned.
    pub fn set_late_events(&self, events: Vec<RawEvent>) {
        self.state().late_events = events;
    }

    // Deliver to the subscriber, if its trace filter matches the session.
    fn deliver(&self, connection: &SimulatedConnection, events: Vec<RawEvent>) {
        let callback = {
            let state = self.state();
            let subscriber = match &state.subscriber {
                Some(subscriber) => subscriber,
                None => return,
            };
            let matches = state
                .traces
                .get(&subscriber.trace_id)
                .map(|trace| {
                    trace.filter.session_id == connection.session_id
                        || trace.filter.application_name == connection.application_name
                })
                .unwrap_or(false);
            if !matches {
                return;
            }
            subscriber.callback.clone()
        };
        for event in events {
            callback(
                event
                    .with(TraceColumn::SessionId, connection.session_id.clone())
                    .with(TraceColumn::ApplicationName, connection.application_name.clone()),
            );
        }
    }

    fn probe_events(statement: &str) -> Vec<RawEvent> {
        return vec![
            RawEvent::default()
                .with(TraceColumn::EventClass, EventClass::QueryBegin.id().to_string())
                .with(TraceColumn::TextData, statement),
            RawEvent::default()
                .with(TraceColumn::EventClass, EventClass::QueryEnd.id().to_string())
                .with(TraceColumn::Duration, "1")
                .with(TraceColumn::TextData, statement),
        ];
    }
}

struct SimulatedConnection {
    server: SimulatedServer,
    session_id: String,
    application_name: String,
    catalog: String,
}

#[async_trait]
impl Connection for SimulatedConnection {
    fn session_id(&self) -> &str {
        return &self.session_id;
    }

    fn application_name(&self) -> &str {
        return &self.application_name;
    }

    fn catalog(&self) -> &str {
        return &self.catalog;
    }

    async fn execute(&self, statement: &str, _timeout: Duration) -> Result<Rowset> {
        if statement.contains(PROBE_SIGNATURE) {
            self.server.record("execute:probe".to_string());
            let failing = {
                let mut state = self.server.state();
                let failing = state.failing_probes > 0;
                state.failing_probes = state.failing_probes.saturating_sub(1);
                failing
            };
            if failing {
                return Err(anyhow!("Probe rejected"));
            }
            self.server.deliver(self, SimulatedServer::probe_events(statement));
            return Ok(rowset(&["[Value]"], &[&["1"]]));
        }

        self.server.record("execute:query".to_string());
        let (events, late_events, failure, fault, result) = {
            let mut state = self.server.state();
            (
                std::mem::take(&mut state.query_events),
                std::mem::take(&mut state.late_events),
                state.fail_query.clone(),
                state.query_fault.clone(),
                state.query_result.clone(),
            )
        };
        self.server.deliver(self, events);
        if !late_events.is_empty() {
            let server = self.server.clone();
            let connection = SimulatedConnection {
                server: self.server.clone(),
                session_id: self.session_id.clone(),
                application_name: self.application_name.clone(),
                catalog: self.catalog.clone(),
            };
            std::thread::spawn(move || {
                std::thread::sleep(LATE_EVENTS_DELAY);
                server.deliver(&connection, late_events);
            });
        }
        if let Some(fault) = fault {
            return Err(fault.into());
        }
        if let Some(message) = failure {
            return Err(anyhow!(message));
        }
        return Ok(result);
    }

    async fn discover(&self, request_type: &str, _restrictions: &[(&str, &str)]) -> Result<Rowset> {
        self.server.record(format!("discover:{}", request_type));
        let state = self.server.state();
        if state.fail_discover.contains(request_type) {
            return Err(anyhow!("Discover {} is not supported", request_type));
        }
        return state
            .discover
            .get(request_type)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown request type {}", request_type));
    }

    async fn clear_cache(&self) -> Result<()> {
        self.server.record("clear_cache".to_string());
        return Ok(());
    }

    async fn create_trace(&self, definition: &TraceDefinition) -> Result<()> {
        self.server.record(format!("create_trace:{}", definition.id));
        let mut state = self.server.state();
        if state.fail_create {
            return Err(anyhow!("Permission denied"));
        }
        state
            .traces
            .insert(definition.id.clone(), definition.clone());
        return Ok(());
    }

    async fn delete_trace(&self, trace_id: &str) -> Result<()> {
        self.server.record(format!("delete_trace:{}", trace_id));
        let mut state = self.server.state();
        if state.fail_delete {
            return Err(anyhow!("Cannot delete {}", trace_id));
        }
        state
            .traces
            .remove(trace_id)
            .ok_or_else(|| anyhow!("Unknown trace {}", trace_id))?;
        return Ok(());
    }

    async fn subscribe(
        &self,
        trace_id: &str,
        on_event: EventCallback,
    ) -> Result<Box<dyn Subscription>> {
        self.server.record(format!("subscribe:{}", trace_id));
        let mut state = self.server.state();
        if state.fail_subscribe {
            return Err(anyhow!("Subscribe failed"));
        }
        if !state.traces.contains_key(trace_id) {
            return Err(anyhow!("Unknown trace {}", trace_id));
        }
        state.subscriber = Some(Subscriber {
            trace_id: trace_id.to_string(),
            callback: on_event,
        });
        return Ok(Box::new(SimulatedSubscription {
            server: self.server.clone(),
            trace_id: trace_id.to_string(),
        }));
    }

    async fn close(&self) -> Result<()> {
        self.server.record("close".to_string());
        return Ok(());
    }
}

struct SimulatedSubscription {
    server: SimulatedServer,
    trace_id: String,
}

#[async_trait]
impl Subscription for SimulatedSubscription {
    async fn stop(self: Box<Self>) -> Result<()> {
        self.server.record(format!("stop:{}", self.trace_id));
        let mut state = self.server.state();
        state.subscriber = None;
        if state.fail_stop {
            return Err(anyhow!("Cannot stop {}", self.trace_id));
        }
        return Ok(());
    }
}

#[async_trait]
impl Connector for SimulatedServer {
    async fn connect(
        &self,
        _connection_string: &str,
        catalog: &str,
        application_name: &str,
    ) -> Result<Arc<dyn Connection>> {
        self.record(format!("connect:{}", catalog));
        let session_id = {
            let mut state = self.state();
            if let Some(message) = &state.fail_connect {
                return Err(anyhow!(message.clone()));
            }
            state.sessions += 1;
            format!("session-{}", state.sessions)
        };
        return Ok(Arc::new(SimulatedConnection {
            server: self.clone(),
            session_id,
            application_name: application_name.to_string(),
            catalog: catalog.to_string(),
        }));
    }
}
