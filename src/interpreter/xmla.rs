use crate::interpreter::connection::{
    Connection, Connector, Rowset, RowsetColumn, Subscription, TraceDefinition, ValueKind,
};
use crate::interpreter::events::{EventCallback, RawEvent, TraceColumn};
use crate::interpreter::options::TraceOptions;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

const XMLA_NS: &str = "urn:schemas-microsoft-com:xml-analysis";
const ENGINE_NS: &str = "http://schemas.microsoft.com/analysisservices/2003/engine";
// How long subscribe() waits for the response head of the (never ending) Subscribe request.
const SUBSCRIBE_READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Error (SOAP fault or XMLA error message) returned by the server.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} ({code})")]
pub struct XmlaFault {
    pub code: String,
    pub message: String,
}

/// "Data Source=...;Initial Catalog=...;Password=..."
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionString {
    pub data_source: String,
    pub catalog: Option<String>,
    /// Sent as a bearer token
    pub password: Option<String>,
}

impl ConnectionString {
    pub fn parse(connection_string: &str) -> Result<Self> {
        let mut parsed = ConnectionString::default();
        for part in connection_string.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| anyhow!("Invalid connection string part {:?}", part))?;
            let value = value.trim().to_string();
            match key.trim().to_lowercase().as_str() {
                "data source" | "datasource" | "provider location" => parsed.data_source = value,
                "initial catalog" | "catalog" => parsed.catalog = Some(value),
                "password" | "pwd" => parsed.password = Some(value),
                other => log::debug!("Ignoring connection string property {}", other),
            }
        }
        if parsed.data_source.is_empty() {
            return Err(anyhow!("Connection string does not have Data Source"));
        }
        return Ok(parsed);
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Data Source={}", self.data_source)?;
        if let Some(catalog) = &self.catalog {
            write!(f, ";Initial Catalog={}", catalog)?;
        }
        if let Some(password) = &self.password {
            write!(f, ";Password={}", password)?;
        }
        return Ok(());
    }
}

static ENCODED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_x([0-9A-Fa-f]{4})_").expect("valid regex"));

/// Rowset element names have non NCName characters encoded: Product_x005B_Name_x005D_
pub fn decode_name(name: &str) -> String {
    return ENCODED_NAME
        .replace_all(name, |captures: &Captures<'_>| {
            u32::from_str_radix(&captures[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(|c| c.to_string())
                .unwrap_or_else(|| captures[0].to_string())
        })
        .into_owned();
}

fn envelope(header: &str, body: &str) -> String {
    return format!(
        r#"<Envelope xmlns="http://schemas.xmlsoap.org/soap/envelope/"><Header>{}</Header><Body>{}</Body></Envelope>"#,
        header, body
    );
}

fn session_header(session_id: &str) -> String {
    return format!(
        r#"<Session xmlns="{}" SessionId="{}"/>"#,
        XMLA_NS,
        escape(session_id)
    );
}

fn property_list(properties: &[(&str, String)]) -> String {
    return properties
        .iter()
        .map(|(name, value)| format!("<{name}>{}</{name}>", escape(value.as_str())))
        .collect::<String>();
}

fn execute_body(command: &str, properties: &[(&str, String)]) -> String {
    return format!(
        r#"<Execute xmlns="{}"><Command>{}</Command><Properties><PropertyList>{}</PropertyList></Properties></Execute>"#,
        XMLA_NS,
        command,
        property_list(properties)
    );
}

fn statement(text: &str) -> String {
    return format!("<Statement>{}</Statement>", escape(text));
}

fn discover_body(
    request_type: &str,
    restrictions: &[(&str, &str)],
    properties: &[(&str, String)],
) -> String {
    let restrictions = restrictions
        .iter()
        .map(|(name, value)| format!("<{name}>{}</{name}>", escape(*value)))
        .collect::<String>();
    return format!(
        r#"<Discover xmlns="{}"><RequestType>{}</RequestType><Restrictions><RestrictionList>{}</RestrictionList></Restrictions><Properties><PropertyList>{}</PropertyList></Properties></Discover>"#,
        XMLA_NS,
        request_type,
        restrictions,
        property_list(properties)
    );
}

pub fn create_trace_command(definition: &TraceDefinition) -> String {
    let events = definition
        .events
        .iter()
        .map(|(class, columns)| {
            let columns = columns
                .iter()
                .map(|column| format!("<ColumnID>{}</ColumnID>", column.id()))
                .collect::<String>();
            format!(
                "<Event><EventID>{}</EventID><Columns>{}</Columns></Event>",
                class.id(),
                columns
            )
        })
        .collect::<String>();
    let filter = format!(
        "<Or><Equal><ColumnID>{}</ColumnID><Value>{}</Value></Equal><Equal><ColumnID>{}</ColumnID><Value>{}</Value></Equal></Or>",
        TraceColumn::SessionId.id(),
        escape(definition.filter.session_id.as_str()),
        TraceColumn::ApplicationName.id(),
        escape(definition.filter.application_name.as_str()),
    );
    return format!(
        r#"<Create xmlns="{}"><ObjectDefinition><Trace><ID>{}</ID><Name>{}</Name><StopTime>{}</StopTime><Events>{}</Events><Filter>{}</Filter></Trace></ObjectDefinition></Create>"#,
        ENGINE_NS,
        escape(definition.id.as_str()),
        escape(definition.name.as_str()),
        definition.stop_time.format("%Y-%m-%dT%H:%M:%S"),
        events,
        filter
    );
}

fn trace_object_command(verb: &str, trace_id: &str) -> String {
    return format!(
        r#"<{verb} xmlns="{}"><Object><TraceID>{}</TraceID></Object></{verb}>"#,
        ENGINE_NS,
        escape(trace_id)
    );
}

fn clear_cache_command(catalog: &str) -> String {
    return format!(
        r#"<ClearCache xmlns="{}"><Object><DatabaseID>{}</DatabaseID></Object></ClearCache>"#,
        ENGINE_NS,
        escape(catalog)
    );
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    return Ok(None);
}

/// SessionId from the Session header of the response.
pub fn parse_session_id(xml: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Session" => {
                return attribute(&e, b"SessionId");
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

#[derive(Default)]
struct ResponseParser {
    columns: Vec<RowsetColumn>,
    rows: Vec<HashMap<String, String>>,
    fault_code: Option<String>,
    fault_message: Option<String>,

    in_row_type: bool,
    row: Option<HashMap<String, String>>,
    cell: Option<(String, String)>,
    // faultcode/faultstring
    fault_field: Option<String>,
}

impl ResponseParser {
    fn start(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<()> {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        if let Some(row) = &mut self.row {
            if !empty {
                self.cell = Some((name, String::new()));
            } else if attribute(e, b"nil")?.as_deref() != Some("true") {
                row.insert(name, String::new());
            }
            return Ok(());
        }

        match name.as_str() {
            "complexType" if attribute(e, b"name")?.as_deref() == Some("row") => {
                self.in_row_type = !empty;
            }
            "element" if self.in_row_type => {
                if let Some(element) = attribute(e, b"name")? {
                    let name = attribute(e, b"field")?.unwrap_or_else(|| decode_name(&element));
                    let kind = attribute(e, b"type")?
                        .map(|t| ValueKind::from_xsd(&t))
                        .unwrap_or_default();
                    self.columns.push(RowsetColumn {
                        element,
                        name,
                        kind,
                    });
                }
            }
            "row" if !empty => self.row = Some(HashMap::new()),
            "faultcode" | "faultstring" if !empty => self.fault_field = Some(name),
            "Error" => {
                // <Error ErrorCode="..." Description="..."/> in Messages or in the fault detail
                if let Some(description) = attribute(e, b"Description")? {
                    self.fault_message.get_or_insert(description);
                    if let Some(code) = attribute(e, b"ErrorCode")? {
                        self.fault_code.get_or_insert(code);
                    }
                }
            }
            _ => {}
        }
        return Ok(());
    }

    fn text(&mut self, text: &str) {
        if let Some((_, value)) = &mut self.cell {
            value.push_str(text);
        } else if let Some(field) = &self.fault_field {
            let target = if field == "faultcode" {
                &mut self.fault_code
            } else {
                &mut self.fault_message
            };
            target.get_or_insert_with(String::new).push_str(text);
        }
    }

    fn end(&mut self, name: &[u8]) {
        if let Some((element, value)) = self.cell.take() {
            if let Some(row) = &mut self.row {
                row.insert(element, value);
            }
            return;
        }
        match name {
            b"row" => {
                if let Some(row) = self.row.take() {
                    self.rows.push(row);
                }
            }
            b"complexType" => self.in_row_type = false,
            b"faultcode" | b"faultstring" => self.fault_field = None,
            _ => {}
        }
    }

    fn finish(mut self) -> Result<Rowset> {
        if let Some(message) = self.fault_message {
            return Err(XmlaFault {
                code: self.fault_code.unwrap_or_default(),
                message,
            }
            .into());
        }

        // Columns without schema (i.e. the trace rows), in the order of appearance
        for row in &self.rows {
            let mut missing = row
                .keys()
                .filter(|element| !self.columns.iter().any(|c| &c.element == *element))
                .cloned()
                .collect::<Vec<_>>();
            missing.sort();
            for element in missing {
                self.columns.push(RowsetColumn {
                    name: decode_name(&element),
                    element,
                    kind: ValueKind::Text,
                });
            }
        }

        let rows = self
            .rows
            .into_iter()
            .map(|mut row| {
                self.columns
                    .iter()
                    .map(|column| row.remove(&column.element))
                    .collect::<Vec<_>>()
            })
            .collect();
        return Ok(Rowset {
            columns: self.columns,
            rows,
        });
    }
}

/// Parse Execute/Discover response: the rowset (with the inline schema if any), or XmlaFault.
pub fn parse_response(xml: &str) -> Result<Rowset> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut parser = ResponseParser::default();
    loop {
        match reader.read_event()? {
            Event::Start(e) => parser.start(&e, false)?,
            Event::Empty(e) => parser.start(&e, true)?,
            Event::Text(e) => parser.text(&e.unescape()?),
            Event::CData(e) => parser.text(&String::from_utf8_lossy(&e)),
            Event::End(e) => parser.end(e.local_name().as_ref()),
            Event::Eof => break,
            _ => {}
        }
    }
    return parser.finish();
}

/// One <row> of the trace stream.
pub fn parse_trace_row(xml: &str) -> Result<RawEvent> {
    let rowset = parse_response(xml)?;
    let row = rowset
        .rows
        .first()
        .ok_or_else(|| anyhow!("No row in {:?}", xml))?;
    let columns = rowset
        .columns
        .iter()
        .zip(row.iter())
        .filter_map(|(column, value)| Some((column.element.clone(), value.clone()?)))
        .collect::<HashMap<_, _>>();
    return Ok(RawEvent::new(columns));
}

/// Cuts complete <row>...</row> fragments out of the (chunked) trace stream.
#[derive(Default)]
pub struct RowSplitter {
    buffer: Vec<u8>,
}

impl RowSplitter {
    const ROW_END: &'static [u8] = b"</row>";

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut rows = Vec::new();
        while let Some(position) = find(&self.buffer, Self::ROW_END) {
            let end = position + Self::ROW_END.len();
            let fragment = &self.buffer[..end];
            if let Some(start) = row_start(fragment) {
                rows.push(String::from_utf8_lossy(&fragment[start..]).into_owned());
            }
            self.buffer.drain(..end);
        }
        return rows;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    return haystack
        .windows(needle.len())
        .position(|window| window == needle);
}

// Last "<row>" / "<row ..." (not "<rowset" and such)
fn row_start(fragment: &[u8]) -> Option<usize> {
    return (0..fragment.len().saturating_sub(4)).rev().find(|&i| {
        fragment[i..].starts_with(b"<row")
            && matches!(fragment.get(i + 4), Some(b'>' | b' ' | b'\t' | b'\r' | b'\n' | b'/'))
    });
}

pub struct XmlaConnector {
    client: reqwest::Client,
}

impl XmlaConnector {
    pub fn new(options: &TraceOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .context("Cannot create HTTP client")?;
        return Ok(XmlaConnector { client });
    }
}

#[async_trait]
impl Connector for XmlaConnector {
    async fn connect(
        &self,
        connection_string: &str,
        catalog: &str,
        application_name: &str,
    ) -> Result<Arc<dyn Connection>> {
        let parsed = ConnectionString::parse(connection_string)?;
        let url = url::Url::parse(&parsed.data_source)
            .with_context(|| format!("Invalid Data Source {:?}", parsed.data_source))?;

        let mut connection = XmlaConnection {
            client: self.client.clone(),
            url,
            token: parsed.password,
            session_id: String::new(),
            application_name: application_name.to_string(),
            catalog: catalog.to_string(),
        };

        let begin_session = format!(r#"<BeginSession xmlns="{}"/>"#, XMLA_NS);
        let body = discover_body("DISCOVER_PROPERTIES", &[], &connection.properties(None));
        let response = connection
            .post("Discover", envelope(&begin_session, &body), None)
            .await?;
        parse_response(&response)?;
        connection.session_id = parse_session_id(&response)?
            .ok_or_else(|| anyhow!("Server did not open a session"))?;
        log::info!(
            "Connected to {} (session {})",
            connection.url_safe(),
            connection.session_id
        );

        return Ok(Arc::new(connection));
    }
}

pub struct XmlaConnection {
    client: reqwest::Client,
    url: url::Url,
    token: Option<String>,
    session_id: String,
    application_name: String,
    catalog: String,
}

impl XmlaConnection {
    fn url_safe(&self) -> String {
        let mut url = self.url.clone();
        let _ = url.set_password(None);
        return url.to_string();
    }

    fn properties(&self, timeout: Option<Duration>) -> Vec<(&'static str, String)> {
        let mut properties = vec![
            ("Catalog", self.catalog.clone()),
            ("Format", "Tabular".to_string()),
            ("SspropInitAppName", self.application_name.clone()),
        ];
        if let Some(timeout) = timeout {
            properties.push(("Timeout", timeout.as_secs().to_string()));
        }
        return properties;
    }

    fn request(&self, action: &str, envelope: String) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(self.url.clone())
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", format!("{}:{}", XMLA_NS, action))
            .body(envelope);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        return request;
    }

    async fn post(&self, action: &str, envelope: String, timeout: Option<Duration>) -> Result<String> {
        let mut request = self.request(action, envelope);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Cannot send {} to {}", action, self.url_safe()))?;
        let status = response.status();
        let body = response.text().await.context("Cannot read response")?;
        // Faults are reported with 500, parse_response() will turn them into XmlaFault
        if !status.is_success() && !body.contains("Fault") {
            return Err(anyhow!("{} failed with HTTP {}", action, status));
        }
        return Ok(body);
    }

    async fn execute_command(&self, command: String, timeout: Option<Duration>) -> Result<Rowset> {
        let body = execute_body(&command, &self.properties(timeout));
        let envelope = envelope(&session_header(&self.session_id), &body);
        let response = self.post("Execute", envelope, timeout).await?;
        return parse_response(&response);
    }
}

#[async_trait]
impl Connection for XmlaConnection {
    fn session_id(&self) -> &str {
        return &self.session_id;
    }

    fn application_name(&self) -> &str {
        return &self.application_name;
    }

    fn catalog(&self) -> &str {
        return &self.catalog;
    }

    async fn execute(&self, text: &str, timeout: Duration) -> Result<Rowset> {
        return self.execute_command(statement(text), Some(timeout)).await;
    }

    async fn discover(&self, request_type: &str, restrictions: &[(&str, &str)]) -> Result<Rowset> {
        let body = discover_body(request_type, restrictions, &self.properties(None));
        let envelope = envelope(&session_header(&self.session_id), &body);
        let response = self.post("Discover", envelope, None).await?;
        return parse_response(&response);
    }

    async fn clear_cache(&self) -> Result<()> {
        self.execute_command(clear_cache_command(&self.catalog), None)
            .await?;
        return Ok(());
    }

    async fn create_trace(&self, definition: &TraceDefinition) -> Result<()> {
        self.execute_command(create_trace_command(definition), None)
            .await?;
        return Ok(());
    }

    async fn delete_trace(&self, trace_id: &str) -> Result<()> {
        self.execute_command(trace_object_command("Delete", trace_id), None)
            .await?;
        return Ok(());
    }

    async fn subscribe(
        &self,
        trace_id: &str,
        on_event: EventCallback,
    ) -> Result<Box<dyn Subscription>> {
        // Sessionless, the response never ends (until the trace is dropped)
        let body = execute_body(
            &trace_object_command("Subscribe", trace_id),
            &self.properties(None),
        );
        let request = self.request("Execute", envelope("", &body));
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<Result<()>>();

        let trace = trace_id.to_string();
        let handle = tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    let err = parse_response(&body)
                        .err()
                        .unwrap_or_else(|| anyhow!("Subscribe failed with HTTP {}", status));
                    let _ = ready_tx.send(Err(err));
                    return;
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err.into()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            let mut splitter = RowSplitter::default();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        log::warn!("Trace {} stream failed: {}", trace, err);
                        break;
                    }
                };
                for row in splitter.push(&chunk) {
                    match parse_trace_row(&row) {
                        Ok(event) => on_event(event),
                        Err(err) => log::warn!("Skipping unparsable trace row: {:#}", err),
                    }
                }
            }
            log::debug!("Trace {} stream finished", trace);
        });

        match tokio::time::timeout(SUBSCRIBE_READY_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Err(_)) => return Err(anyhow!("Subscription of {} terminated", trace_id)),
            // Some servers hold the response head until the first row
            Err(_) => log::debug!("No response for Subscribe {} yet, assuming live", trace_id),
        }

        return Ok(Box::new(XmlaSubscription { handle }));
    }

    async fn close(&self) -> Result<()> {
        let header = format!(
            r#"<EndSession xmlns="{}" SessionId="{}"/>"#,
            XMLA_NS,
            escape(self.session_id.as_str())
        );
        let body = execute_body(&statement(""), &self.properties(None));
        let response = self.post("Execute", envelope(&header, &body), None).await?;
        parse_response(&response)?;
        log::debug!("Session {} closed", self.session_id);
        return Ok(());
    }
}

struct XmlaSubscription {
    handle: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl Subscription for XmlaSubscription {
    async fn stop(self: Box<Self>) -> Result<()> {
        self.handle.abort();
        match self.handle.await {
            Err(err) if !err.is_cancelled() => return Err(anyhow!("Trace stream task failed: {}", err)),
            _ => return Ok(()),
        }
    }
}
