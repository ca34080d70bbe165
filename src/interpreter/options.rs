use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, ValueEnum};
use serde::{Deserialize, Deserializer};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "tracedig")]
#[command(bin_name = "tracedig")]
#[command(author, version, about, long_about = None)]
pub struct TraceDigOptions {
    #[command(flatten)]
    pub server: ServerOptions,
    #[command(flatten)]
    pub trace: TraceArgs,

    /// Query to profile (DAX)
    #[arg(short('q'), long, conflicts_with = "query_file")]
    pub query: Option<String>,
    /// Read the query from file ("-" for stdin)
    #[arg(short('f'), long, value_name = "PATH")]
    pub query_file: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
    /// YAML file with the defaults for the tracing options
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    // Config file + overrides from the command line
    #[clap(skip)]
    pub trace_options: TraceOptions,
}

#[derive(Args, Clone)]
pub struct ServerOptions {
    /// XMLA endpoint (i.e. http://host/olap/msmdpump.dll)
    #[arg(short('u'), long, value_name = "URL", env = "TRACEDIG_URL")]
    pub url: String,
    // Safe version for "url" (to show in logs)
    #[clap(skip)]
    pub url_safe: String,
    #[arg(short('c'), long, env = "TRACEDIG_CATALOG")]
    pub catalog: String,
    /// Bearer token
    #[arg(long, env = "TRACEDIG_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

/// Command line overrides for TraceOptions.
#[derive(Args, Clone, Default)]
pub struct TraceArgs {
    #[arg(long)]
    pub probe_count: Option<usize>,
    #[arg(long, value_parser = humantime::parse_duration)]
    pub probe_interval: Option<Duration>,
    #[arg(long, value_parser = humantime::parse_duration)]
    pub drain_delay: Option<Duration>,
    #[arg(long, value_parser = humantime::parse_duration)]
    pub command_timeout: Option<Duration>,
    #[arg(long, value_parser = humantime::parse_duration)]
    pub connect_timeout: Option<Duration>,
    #[arg(long, value_parser = humantime::parse_duration)]
    pub trace_expiry: Option<Duration>,
    /// Rows of the result to include (sorted)
    #[arg(long)]
    pub sample_rows: Option<usize>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum OutputFormat {
    Json,
    Text,
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    return humantime::parse_duration(&value).map_err(serde::de::Error::custom);
}

/// Tunables of a run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceOptions {
    /// Number of no-op statements issued to warm up the trace
    pub probe_count: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub probe_interval: Duration,
    /// Wait after the query for the late events
    #[serde(deserialize_with = "deserialize_duration")]
    pub drain_delay: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub command_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    /// The server removes the trace after this, even if the client had died
    #[serde(deserialize_with = "deserialize_duration")]
    pub trace_expiry: Duration,
    pub sample_rows: usize,
}

impl Default for TraceOptions {
    fn default() -> Self {
        return TraceOptions {
            probe_count: 5,
            probe_interval: Duration::from_millis(500),
            drain_delay: Duration::from_secs(3),
            command_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            trace_expiry: Duration::from_secs(3600),
            sample_rows: 10,
        };
    }
}

impl TraceOptions {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        return Ok(serde_yaml::from_str(yaml)?);
    }

    pub fn apply(&mut self, args: &TraceArgs) {
        if let Some(v) = args.probe_count {
            self.probe_count = v;
        }
        if let Some(v) = args.probe_interval {
            self.probe_interval = v;
        }
        if let Some(v) = args.drain_delay {
            self.drain_delay = v;
        }
        if let Some(v) = args.command_timeout {
            self.command_timeout = v;
        }
        if let Some(v) = args.connect_timeout {
            self.connect_timeout = v;
        }
        if let Some(v) = args.trace_expiry {
            self.trace_expiry = v;
        }
        if let Some(v) = args.sample_rows {
            self.sample_rows = v;
        }
    }
}

fn adjust_defaults(options: &mut TraceDigOptions) -> Result<()> {
    let url = url::Url::parse(options.server.url.as_ref())
        .with_context(|| format!("Invalid URL {:?}", options.server.url))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow!("Unsupported scheme {} (http/https expected)", url.scheme()));
    }

    // url_safe
    let mut url_safe = url.clone();
    if url_safe.password().is_some() {
        url_safe
            .set_password(None)
            .map_err(|_| anyhow!("Cannot strip password from the URL"))?;
    }
    options.server.url_safe = url_safe.to_string();

    // Password from the URL is the token, unless it is passed explicitly
    if options.server.token.is_none() {
        options.server.token = url.password().map(|password| password.to_string());
    }

    let mut trace_options = match &options.config {
        Some(path) => {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read {}", path.display()))?;
            TraceOptions::from_yaml(&yaml)
                .with_context(|| format!("Cannot parse {}", path.display()))?
        }
        None => TraceOptions::default(),
    };
    trace_options.apply(&options.trace);
    options.trace_options = trace_options;

    return Ok(());
}

pub fn parse_from<I, T>(itr: I) -> Result<TraceDigOptions>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut options = TraceDigOptions::parse_from(itr);

    adjust_defaults(&mut options)?;

    return Ok(options);
}
