use anyhow::{Context, Result, anyhow};
use flexi_logger::Logger;
use std::ffi::OsString;
use tokio::io::AsyncReadExt;

use crate::interpreter::{
    RunRequest, XmlaConnector,
    options::{self, OutputFormat, TraceDigOptions},
    run,
    xmla::ConnectionString,
};

async fn read_query(options: &TraceDigOptions) -> Result<String> {
    let query = match (&options.query, &options.query_file) {
        (Some(query), _) => query.clone(),
        (None, Some(path)) if path.as_os_str() == "-" => {
            let mut query = String::new();
            tokio::io::stdin()
                .read_to_string(&mut query)
                .await
                .context("Cannot read query from stdin")?;
            query
        }
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read query from {}", path.display()))?,
        (None, None) => return Err(anyhow!("Either --query or --query-file is required")),
    };
    if query.trim().is_empty() {
        return Err(anyhow!("Query is empty"));
    }
    return Ok(query);
}

pub async fn tracedig_main_async<I, T>(itr: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let options = options::parse_from(itr)?;

    // Override with RUST_LOG
    //
    // stdout is for the result only.
    let _logger = Logger::try_with_env_or_str("info,hyper=info,reqwest=info,rustls=info")?
        .log_to_stderr()
        .format(flexi_logger::with_thread)
        .start()?;

    let query = read_query(&options).await?;
    let connection_string = ConnectionString {
        data_source: options.server.url_safe.clone(),
        catalog: Some(options.server.catalog.clone()),
        password: options.server.token.clone(),
    };
    let request = RunRequest {
        connection_string: connection_string.to_string(),
        catalog: options.server.catalog.clone(),
        query,
    };

    log::info!(
        "Tracing query on {} (catalog {})",
        options.server.url_safe,
        options.server.catalog
    );
    let connector = XmlaConnector::new(&options.trace_options)?;
    let result = run(&connector, &request, &options.trace_options).await;

    match options.format {
        OutputFormat::Json => println!("{}", result.to_json()?),
        OutputFormat::Text => print!("{}", result),
    }

    return Ok(());
}
