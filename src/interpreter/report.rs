use crate::interpreter::activation::QueryOutcome;
use crate::interpreter::metrics::{Analysis, EventDetail, PerfMetrics};
use serde::Serialize;
use size::{Base, SizeFormatter, Style};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ErrorType {
    ConnectionError,
    QueryError,
    XmlaFault,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "Status")]
pub enum QueryResult {
    Success {
        #[serde(rename = "RowCount")]
        row_count: usize,
        #[serde(rename = "ColumnCount")]
        column_count: usize,
        #[serde(rename = "Columns")]
        columns: Vec<String>,
        #[serde(rename = "Rows")]
        rows: Vec<Vec<serde_json::Value>>,
        #[serde(rename = "SessionId")]
        session_id: String,
    },
    Error {
        #[serde(rename = "ErrorMessage")]
        error_message: String,
        #[serde(rename = "ErrorType")]
        error_type: ErrorType,
    },
}

impl QueryResult {
    pub fn success(outcome: QueryOutcome, session_id: &str) -> Self {
        return QueryResult::Success {
            row_count: outcome.row_count,
            column_count: outcome.column_count,
            columns: outcome.columns,
            rows: outcome.rows,
            session_id: session_id.to_string(),
        };
    }

    pub fn error(error: &anyhow::Error, error_type: ErrorType) -> Self {
        return QueryResult::Error {
            error_message: format!("{:#}", error),
            error_type,
        };
    }

    pub fn is_success(&self) -> bool {
        return matches!(self, QueryResult::Success { .. });
    }
}

/// Everything a run produces, this is what is serialized to JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRunResult {
    #[serde(rename = "Result")]
    pub result: QueryResult,
    #[serde(rename = "Performance")]
    pub performance: PerfMetrics,
    #[serde(rename = "EventDetails")]
    pub event_details: Vec<EventDetail>,
}

impl QueryRunResult {
    pub fn new(result: QueryResult, analysis: Analysis) -> Self {
        return QueryRunResult {
            result,
            performance: analysis.performance,
            event_details: analysis.event_details,
        };
    }

    /// Connection failure, there is nothing to measure.
    pub fn failed(error: &anyhow::Error, error_type: ErrorType) -> Self {
        return Self::new(QueryResult::error(error, error_type), Analysis::default());
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        return serde_json::to_string_pretty(self);
    }
}

fn first_line(text: &str, width: usize) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() <= width {
        return line.to_string();
    }
    return format!("{}...", line.chars().take(width).collect::<String>());
}

impl fmt::Display for QueryRunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatter = SizeFormatter::new()
            .with_base(Base::Base10)
            .with_style(Style::Abbreviated);

        match &self.result {
            QueryResult::Success {
                row_count,
                column_count,
                session_id,
                ..
            } => writeln!(
                f,
                "Success: {} rows, {} columns (session {})",
                row_count, column_count, session_id
            )?,
            QueryResult::Error {
                error_message,
                error_type,
            } => writeln!(f, "{:?}: {}", error_type, error_message)?,
        }

        let p = &self.performance;
        writeln!(
            f,
            "Total: {}ms FE: {}ms SE: {}ms SE CPU: {}ms Par: x{:.2} SE queries: {} SE cache: {}",
            p.total,
            p.formula_engine,
            p.storage_engine,
            p.storage_engine_cpu,
            p.storage_engine_parallelism,
            p.storage_engine_queries,
            p.storage_engine_cache_hits
        )?;
        if self.event_details.is_empty() {
            return Ok(());
        }

        writeln!(f)?;
        writeln!(
            f,
            "{:>4} {:<16} {:<14} {:>8} {:>8} {:>6} {:>10} {:>10} {:>8}  Query",
            "#", "Class", "Subclass", "Duration", "CPU", "Par", "Rows", "Bytes", "Offset"
        )?;
        for detail in &self.event_details {
            let offset = detail
                .timeline
                .as_ref()
                .map(|t| format!("{}ms", t.offset))
                .unwrap_or_default();
            writeln!(
                f,
                "{:>4} {:<16} {:<14} {:>6}ms {:>6}ms {:>6.2} {:>10} {:>10} {:>8}  {}",
                detail.line,
                detail.class,
                detail.subclass,
                detail.duration,
                detail.cpu,
                detail.parallelism,
                detail.rows,
                formatter.format(i64::try_from(detail.bytes).unwrap_or(i64::MAX)),
                offset,
                first_line(&detail.query, 80)
            )?;
        }
        return Ok(());
    }
}
