use crate::interpreter::activation::Controller;
use crate::interpreter::connection::{Connection, Connector};
use crate::interpreter::events::EventStore;
use crate::interpreter::identifiers::IdentifierMaps;
use crate::interpreter::metrics::analyze;
use crate::interpreter::options::TraceOptions;
use crate::interpreter::report::{ErrorType, QueryResult, QueryRunResult};
use crate::interpreter::trace::TraceSession;
use crate::interpreter::xmla::XmlaFault;
use anyhow::anyhow;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Opaque for the engine, interpreted by the Connector
    pub connection_string: String,
    pub catalog: String,
    pub query: String,
}

fn classify(error: &anyhow::Error, default: ErrorType) -> ErrorType {
    if error.chain().any(|cause| cause.is::<XmlaFault>()) {
        return ErrorType::XmlaFault;
    }
    return default;
}

/// Runs the query under a session scoped trace and measures it.
///
/// Never fails, errors are reported in the result. The trace and the session are released
/// before returning, whatever happened.
pub async fn run(
    connector: &dyn Connector,
    request: &RunRequest,
    options: &TraceOptions,
) -> QueryRunResult {
    let application_name = format!("tracedig-{}", uuid::Uuid::new_v4().simple());

    let connect = connector.connect(&request.connection_string, &request.catalog, &application_name);
    let connection = match tokio::time::timeout(options.connect_timeout, connect).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(err)) => {
            log::error!("Cannot connect: {:#}", err);
            return QueryRunResult::failed(&err, classify(&err, ErrorType::ConnectionError));
        }
        Err(_) => {
            let err = anyhow!(
                "Connection was not established in {}",
                humantime::format_duration(options.connect_timeout)
            );
            log::error!("{}", err);
            return QueryRunResult::failed(&err, ErrorType::ConnectionError);
        }
    };

    let result = run_on(connection.as_ref(), &request.query, options).await;

    if let Err(err) = connection.close().await {
        log::warn!("Cannot close session {}: {:#}", connection.session_id(), err);
    }
    return result;
}

async fn run_on(connection: &dyn Connection, query: &str, options: &TraceOptions) -> QueryRunResult {
    let identifiers = IdentifierMaps::load(connection).await.unwrap_or_else(|err| {
        log::warn!("Storage engine queries will not be resolved: {:#}", err);
        IdentifierMaps::default()
    });

    let store = EventStore::new();
    let trace = start_trace(connection, options, &store).await;

    let controller = Controller::new(connection, options);
    controller.clear_cache().await;
    if trace.is_some() {
        controller.prime().await;
    }
    let (outcome, window) = controller.execute(query).await;
    if let Some(trace) = trace {
        controller.drain().await;
        trace.finish().await;
    }

    let events = store.take();
    log::debug!("Collected {} trace events", events.len());
    let analysis = analyze(events, &identifiers, Some(&window));

    let result = match outcome {
        Ok(outcome) => QueryResult::success(outcome, connection.session_id()),
        Err(err) => {
            log::error!("{:#}", err);
            QueryResult::error(&err, classify(&err, ErrorType::QueryError))
        }
    };
    return QueryRunResult::new(result, analysis);
}

// Without the trace the query still runs, only the performance will be empty.
async fn start_trace<'a>(
    connection: &'a dyn Connection,
    options: &TraceOptions,
    store: &EventStore,
) -> Option<TraceSession<'a>> {
    let mut trace = match TraceSession::create(connection, options).await {
        Ok(trace) => trace,
        Err(err) => {
            log::warn!("Running without trace: {:#}", err);
            return None;
        }
    };
    if let Err(err) = trace.start(store.collector()).await {
        log::warn!("Running without trace: {:#}", err);
        trace.finish().await;
        return None;
    }
    return Some(trace);
}
