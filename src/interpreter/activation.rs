use crate::common::Stopwatch;
use crate::interpreter::connection::{Connection, Rowset};
use crate::interpreter::events::PROBE_SIGNATURE;
use crate::interpreter::options::TraceOptions;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};

/// Client side (wall clock) boundaries of the query execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionWindow {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: i64,
}

/// Shape of the query result, and a small sorted sample of it (the rest is dropped).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryOutcome {
    pub row_count: usize,
    pub column_count: usize,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryOutcome {
    pub fn from_rowset(rowset: Rowset, sample_rows: usize) -> Self {
        let row_count = rowset.rows.len();
        let mut rows = rowset.rows.iter().collect::<Vec<_>>();
        rows.sort_by(|a, b| rowset.compare_rows(a, b));

        let sample = rows
            .into_iter()
            .take(sample_rows)
            .map(|row| {
                (0..rowset.columns.len())
                    .map(|index| rowset.value(row, index))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        return QueryOutcome {
            row_count,
            column_count: rowset.columns.len(),
            columns: rowset.column_names(),
            rows: sample,
        };
    }
}

/// No-op statement used to make the server flush trace events.
pub fn probe_statement() -> String {
    return format!("EVALUATE {{ 1 }} // {}", PROBE_SIGNATURE);
}

/// Prepares the session (cold cache, primed trace) and runs the query on it.
pub struct Controller<'a> {
    connection: &'a dyn Connection,
    options: &'a TraceOptions,
}

impl<'a> Controller<'a> {
    pub fn new(connection: &'a dyn Connection, options: &'a TraceOptions) -> Self {
        return Controller {
            connection,
            options,
        };
    }

    /// Drop the cached results, so that the timings are for a cold run.
    pub async fn clear_cache(&self) {
        match self.connection.clear_cache().await {
            Ok(()) => log::debug!("Cache cleared for {}", self.connection.catalog()),
            Err(err) => log::warn!(
                "Cannot clear cache for {} (timings may reflect a warm run): {:#}",
                self.connection.catalog(),
                err
            ),
        }
    }

    /// Issue the probes, some servers do not deliver any trace event until they see activity
    /// on the pipe. Returns the number of successful probes.
    pub async fn prime(&self) -> usize {
        let statement = probe_statement();
        let mut succeeded = 0;
        for probe in 0..self.options.probe_count {
            if probe > 0 {
                tokio::time::sleep(self.options.probe_interval).await;
            }
            match self
                .connection
                .execute(&statement, self.options.command_timeout)
                .await
            {
                Ok(_) => succeeded += 1,
                Err(err) => log::warn!("Probe {} failed: {:#}", probe + 1, err),
            }
        }
        log::debug!(
            "Trace primed with {}/{} probes",
            succeeded,
            self.options.probe_count
        );
        return succeeded;
    }

    pub async fn execute(&self, query: &str) -> (Result<QueryOutcome>, ExecutionWindow) {
        let stopwatch = Stopwatch::start_new();
        let timeout = self.options.command_timeout;

        let result = match tokio::time::timeout(timeout, self.connection.execute(query, timeout)).await {
            Ok(result) => result.context("Query failed"),
            Err(_) => Err(anyhow!(
                "Query did not finish in {}",
                humantime::format_duration(timeout)
            )),
        };

        let window = ExecutionWindow {
            started_at: stopwatch.started_at(),
            finished_at: stopwatch.now(),
            elapsed_ms: stopwatch.elapsed_ms(),
        };
        log::info!("Query executed in {}ms", window.elapsed_ms);

        let outcome = result.map(|rowset| QueryOutcome::from_rowset(rowset, self.options.sample_rows));
        return (outcome, window);
    }

    /// Storage engine and QueryEnd events may arrive after the query returned to the client.
    pub async fn drain(&self) {
        log::debug!(
            "Waiting {} for the trace to drain",
            humantime::format_duration(self.options.drain_delay)
        );
        tokio::time::sleep(self.options.drain_delay).await;
    }
}
