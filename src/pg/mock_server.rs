//! Scripted PostgreSQL stand-in for protocol tests.
//!
//! Speaks enough of the v3 protocol to drive a [`Session`] over an
//! in-memory duplex pipe: startup with optional password auth, simple
//! queries, and Parse/Bind/Describe/Execute/Close/Sync/Flush with named
//! statements and suspendable portals. Every frontend message is recorded
//! so tests can assert on the exact exchange.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use super::codec;
use super::config::PgConfig;
use super::error::PgResult;
use super::protocol::{read_cstring, Format, PROTOCOL_VERSION};
use super::registry::{SharedRegistry, Type};
use super::session::{md5_password, Session};
use super::types::{Oid, PgValue};

/// A frontend message as the server saw it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Received {
    Startup { user: String, database: String },
    Password(String),
    Query(String),
    Parse { name: String, sql: String, types: Vec<Oid> },
    Bind { portal: String, statement: String, params: Vec<PgValue> },
    Describe { kind: u8, name: String },
    Execute { portal: String, max_rows: i32 },
    Close { kind: u8, name: String },
    Sync,
    Flush,
    Terminate,
}

/// What the server answers to one execution of a scripted statement.
#[derive(Debug, Clone, Default)]
pub(crate) struct Reply {
    rows: Vec<Vec<PgValue>>,
    tag: Option<String>,
    error: Option<(String, String)>,
    notices: Vec<String>,
    notifications: Vec<(String, String)>,
    hang: bool,
    disconnect: bool,
}

impl Reply {
    pub fn rows(rows: Vec<Vec<PgValue>>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn command(tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            ..Self::default()
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            error: Some((code.to_string(), message.to_string())),
            ..Self::default()
        }
    }

    /// Never answer; the client has to time out.
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    /// Drop the connection.
    pub fn disconnect() -> Self {
        Self {
            disconnect: true,
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub fn with_notice(mut self, message: &str) -> Self {
        self.notices.push(message.to_string());
        self
    }

    pub fn with_notification(mut self, channel: &str, payload: &str) -> Self {
        self.notifications
            .push((channel.to_string(), payload.to_string()));
        self
    }
}

type Handler = Arc<dyn Fn(&[PgValue]) -> Reply + Send + Sync>;

#[derive(Clone)]
struct Script {
    /// Matched as a substring of the statement text
    pattern: String,
    param_types: Vec<Oid>,
    columns: Vec<(String, Oid)>,
    handler: Handler,
}

/// Password check done during startup.
#[derive(Debug, Clone)]
pub(crate) enum MockAuth {
    Trust,
    Cleartext(String),
    Md5(String),
}

const MD5_SALT: [u8; 4] = [7, 1, 8, 2];

pub(crate) struct MockServer {
    scripts: Vec<Script>,
    auth: MockAuth,
    parameters: Vec<(String, String)>,
}

impl MockServer {
    pub fn new() -> Self {
        Self {
            scripts: Vec::new(),
            auth: MockAuth::Trust,
            parameters: vec![
                ("server_version".to_string(), "16.2".to_string()),
                ("client_encoding".to_string(), "UTF8".to_string()),
            ],
        }
    }

    /// Answer statements containing `pattern`. Earlier scripts win.
    pub fn on<F>(mut self, pattern: &str, param_types: &[Oid], columns: &[(&str, Oid)], handler: F) -> Self
    where
        F: Fn(&[PgValue]) -> Reply + Send + Sync + 'static,
    {
        self.scripts.push(Script {
            pattern: pattern.to_string(),
            param_types: param_types.to_vec(),
            columns: columns
                .iter()
                .map(|(name, oid)| (name.to_string(), *oid))
                .collect(),
            handler: Arc::new(handler),
        });
        self
    }

    pub fn with_auth(mut self, auth: MockAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Serve on one end of a fresh pipe and connect a session to the other.
    pub async fn start(self, config: PgConfig) -> PgResult<(Session<DuplexStream>, MockHandle)> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = self.spawn(server);
        let session = Session::connect_stream(client, config).await?;
        Ok((session, handle))
    }

    pub fn spawn(self, stream: DuplexStream) -> MockHandle {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (pushes, receiver) = mpsc::unbounded_channel();
        let backend = Backend {
            stream,
            input: BytesMut::new(),
            output: BytesMut::new(),
            scripts: self.scripts,
            auth: self.auth,
            parameters: self.parameters,
            log: Arc::clone(&log),
            registry: SharedRegistry::with_builtins(),
            statements: HashMap::new(),
            portals: HashMap::new(),
            status: b'I',
            savepoints: Vec::new(),
            skipping: false,
        };
        tokio::spawn(backend.run(receiver));
        MockHandle { log, pushes }
    }
}

/// Test-side view of a running mock server.
#[derive(Debug, Clone)]
pub(crate) struct MockHandle {
    log: Arc<Mutex<Vec<Received>>>,
    pushes: mpsc::UnboundedSender<(String, String)>,
}

impl MockHandle {
    pub fn received(&self) -> Vec<Received> {
        self.log.lock().clone()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }

    pub fn count(&self, predicate: impl Fn(&Received) -> bool) -> usize {
        self.log.lock().iter().filter(|m| predicate(m)).count()
    }

    /// Names of statements the client parsed, `""` for the unnamed one.
    pub fn parsed_names(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|m| match m {
                Received::Parse { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Statement named by each Bind, in order.
    pub fn bound_statements(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|m| match m {
                Received::Bind { statement, .. } => Some(statement.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn closed_statements(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|m| match m {
                Received::Close { kind: b'S', name } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|m| match m {
                Received::Query(sql) => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    /// Send a NotificationResponse outside of any command.
    pub fn notify(&self, channel: &str, payload: &str) {
        let _ = self.pushes.send((channel.to_string(), payload.to_string()));
    }
}

struct PreparedText {
    script: usize,
    types: Vec<Oid>,
}

struct OpenPortal {
    script: usize,
    rows: VecDeque<Vec<PgValue>>,
    sent: usize,
    tag: Option<String>,
    formats: Vec<Format>,
}

enum Flow {
    Continue,
    Hang,
    Stop,
}

struct Backend {
    stream: DuplexStream,
    input: BytesMut,
    output: BytesMut,
    scripts: Vec<Script>,
    auth: MockAuth,
    parameters: Vec<(String, String)>,
    log: Arc<Mutex<Vec<Received>>>,
    registry: SharedRegistry,
    statements: HashMap<String, PreparedText>,
    portals: HashMap<String, OpenPortal>,
    status: u8,
    /// Open savepoint names, innermost last
    savepoints: Vec<String>,
    /// After an extended-protocol error, everything up to Sync is ignored
    skipping: bool,
}

impl Backend {
    async fn run(mut self, mut pushes: mpsc::UnboundedReceiver<(String, String)>) {
        if !self.startup().await {
            return;
        }
        loop {
            let Some((tag, body)) = self.next_frame(&mut pushes).await else {
                return;
            };
            let flow = self.handle(tag, body);
            let written = self.write_out().await;
            match flow {
                Flow::Continue if written => {}
                Flow::Hang => std::future::pending::<()>().await,
                _ => return,
            }
        }
    }

    // ------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------

    async fn fill(&mut self) -> bool {
        matches!(self.stream.read_buf(&mut self.input).await, Ok(n) if n > 0)
    }

    async fn write_out(&mut self) -> bool {
        if self.output.is_empty() {
            return true;
        }
        let out = self.output.split();
        self.stream.write_all(&out).await.is_ok() && self.stream.flush().await.is_ok()
    }

    fn split_typed(&mut self) -> Option<(u8, Bytes)> {
        if self.input.len() < 5 {
            return None;
        }
        let len = i32::from_be_bytes([self.input[1], self.input[2], self.input[3], self.input[4]]) as usize;
        if self.input.len() < 1 + len {
            return None;
        }
        let mut frame = self.input.split_to(1 + len).freeze();
        let tag = frame.get_u8();
        frame.advance(4);
        Some((tag, frame))
    }

    async fn next_frame(&mut self, pushes: &mut mpsc::UnboundedReceiver<(String, String)>) -> Option<(u8, Bytes)> {
        loop {
            if let Some(frame) = self.split_typed() {
                return Some(frame);
            }
            tokio::select! {
                read = self.stream.read_buf(&mut self.input) => {
                    if !matches!(read, Ok(n) if n > 0) {
                        return None;
                    }
                }
                Some((channel, payload)) = pushes.recv() => {
                    self.notification(&channel, &payload);
                    if !self.write_out().await {
                        return None;
                    }
                }
            }
        }
    }

    async fn startup(&mut self) -> bool {
        loop {
            if self.input.len() >= 4 {
                let len = i32::from_be_bytes([self.input[0], self.input[1], self.input[2], self.input[3]]) as usize;
                if self.input.len() >= len {
                    break;
                }
            }
            if !self.fill().await {
                return false;
            }
        }
        let len = i32::from_be_bytes([self.input[0], self.input[1], self.input[2], self.input[3]]) as usize;
        let mut body = self.input.split_to(len).freeze();
        body.advance(4);
        if body.get_i32() != PROTOCOL_VERSION {
            return false;
        }
        let mut options = HashMap::new();
        while body.remaining() > 1 {
            let key = cstr(&mut body);
            let value = cstr(&mut body);
            options.insert(key, value);
        }
        let user = options.get("user").cloned().unwrap_or_default();
        self.record(Received::Startup {
            user: user.clone(),
            database: options.get("database").cloned().unwrap_or_default(),
        });

        let expected = match self.auth.clone() {
            MockAuth::Trust => None,
            MockAuth::Cleartext(password) => {
                self.message(b'R', |b| b.put_i32(3));
                Some(password)
            }
            MockAuth::Md5(password) => {
                self.message(b'R', |b| {
                    b.put_i32(5);
                    b.put_slice(&MD5_SALT);
                });
                Some(md5_password(&user, &password, &MD5_SALT))
            }
        };
        if let Some(expected) = expected {
            if !self.write_out().await {
                return false;
            }
            let (tag, mut body) = loop {
                if let Some(frame) = self.split_typed() {
                    break frame;
                }
                if !self.fill().await {
                    return false;
                }
            };
            let given = if tag == b'p' { cstr(&mut body) } else { String::new() };
            self.record(Received::Password(given.clone()));
            if given != expected {
                self.error_response("28P01", "password authentication failed");
                let _ = self.write_out().await;
                return false;
            }
        }

        self.message(b'R', |b| b.put_i32(0));
        for (name, value) in self.parameters.clone() {
            self.message(b'S', |b| {
                put_cstr(b, &name);
                put_cstr(b, &value);
            });
        }
        self.ready();
        self.write_out().await
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    fn record(&self, message: Received) {
        self.log.lock().push(message);
    }

    fn handle(&mut self, tag: u8, mut body: Bytes) -> Flow {
        match tag {
            b'Q' => {
                let sql = cstr(&mut body);
                self.record(Received::Query(sql.clone()));
                self.simple_query(&sql)
            }
            b'P' => {
                let name = cstr(&mut body);
                let sql = cstr(&mut body);
                let count = body.get_i16().max(0) as usize;
                let types = (0..count).map(|_| Oid(body.get_i32())).collect::<Vec<_>>();
                self.record(Received::Parse {
                    name: name.clone(),
                    sql: sql.clone(),
                    types: types.clone(),
                });
                if !self.skipping {
                    self.parse(name, &sql, types);
                }
                Flow::Continue
            }
            b'B' => self.bind(body),
            b'D' => {
                let kind = body.get_u8();
                let name = cstr(&mut body);
                self.record(Received::Describe {
                    kind,
                    name: name.clone(),
                });
                if !self.skipping {
                    self.describe(kind, &name);
                }
                Flow::Continue
            }
            b'E' => {
                let portal = cstr(&mut body);
                let max_rows = body.get_i32();
                self.record(Received::Execute {
                    portal: portal.clone(),
                    max_rows,
                });
                if !self.skipping {
                    self.execute(&portal, max_rows);
                }
                Flow::Continue
            }
            b'C' => {
                let kind = body.get_u8();
                let name = cstr(&mut body);
                self.record(Received::Close {
                    kind,
                    name: name.clone(),
                });
                if !self.skipping {
                    if kind == b'S' {
                        self.statements.remove(&name);
                    } else {
                        self.portals.remove(&name);
                    }
                    self.message(b'3', |_| {});
                }
                Flow::Continue
            }
            b'S' => {
                self.record(Received::Sync);
                self.skipping = false;
                if self.status == b'I' {
                    self.portals.clear();
                }
                self.ready();
                Flow::Continue
            }
            b'H' => {
                self.record(Received::Flush);
                Flow::Continue
            }
            b'X' => {
                self.record(Received::Terminate);
                Flow::Stop
            }
            other => {
                self.error_response("08P01", &format!("unexpected message {}", other as char));
                Flow::Stop
            }
        }
    }

    fn parse(&mut self, name: String, sql: &str, given: Vec<Oid>) {
        if !name.is_empty() && self.statements.contains_key(&name) {
            self.fail("42P05", &format!("prepared statement \"{}\" already exists", name));
            return;
        }
        let Some(script) = self.find(sql) else {
            self.fail("42601", &format!("no script for: {}", sql));
            return;
        };
        let declared = &self.scripts[script].param_types;
        let count = declared.len().max(given.len());
        let types = (0..count)
            .map(|i| match given.get(i) {
                Some(oid) if !oid.is_unspecified() => *oid,
                _ => declared.get(i).copied().unwrap_or(Oid::TEXT),
            })
            .collect();
        self.statements.insert(name, PreparedText { script, types });
        self.message(b'1', |_| {});
    }

    fn describe(&mut self, kind: u8, name: &str) {
        let script = if kind == b'S' {
            let Some(statement) = self.statements.get(name) else {
                self.fail("26000", &format!("prepared statement \"{}\" does not exist", name));
                return;
            };
            let types = statement.types.clone();
            let script = statement.script;
            self.message(b't', |b| {
                b.put_i16(types.len() as i16);
                for oid in &types {
                    b.put_i32(oid.0);
                }
            });
            script
        } else {
            match self.portals.get(name) {
                Some(portal) => portal.script,
                None => {
                    self.fail("34000", &format!("portal \"{}\" does not exist", name));
                    return;
                }
            }
        };
        self.row_description(script, Format::Binary);
    }

    fn bind(&mut self, mut body: Bytes) -> Flow {
        let portal = cstr(&mut body);
        let statement = cstr(&mut body);
        let format_count = body.get_i16().max(0) as usize;
        let formats = (0..format_count)
            .map(|_| Format::from_i16(body.get_i16()))
            .collect::<Vec<_>>();
        let value_count = body.get_i16().max(0) as usize;
        let mut raw = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            let len = body.get_i32();
            raw.push((len >= 0).then(|| body.split_to(len as usize)));
        }
        let result_count = body.get_i16().max(0) as usize;
        let result_formats = (0..result_count)
            .map(|_| Format::from_i16(body.get_i16()))
            .collect::<Vec<_>>();

        let prepared = self
            .statements
            .get(&statement)
            .map(|s| (s.script, s.types.clone()));
        let params = match &prepared {
            Some((_, types)) => raw
                .iter()
                .enumerate()
                .map(|(i, value)| {
                    let oid = types.get(i).copied().unwrap_or(Oid::TEXT);
                    self.decode_param(oid, format_at(&formats, i), value.as_deref())
                })
                .collect(),
            None => Vec::new(),
        };
        self.record(Received::Bind {
            portal: portal.clone(),
            statement: statement.clone(),
            params: params.clone(),
        });
        if self.skipping {
            return Flow::Continue;
        }
        let Some((script, _)) = prepared else {
            self.fail("26000", &format!("prepared statement \"{}\" does not exist", statement));
            return Flow::Continue;
        };

        let reply = (self.scripts[script].handler)(&params);
        if let Some(flow) = self.apply_side_effects(&reply) {
            return flow;
        }
        if let Some((code, message)) = &reply.error {
            self.fail(code, message);
            return Flow::Continue;
        }
        self.message(b'2', |_| {});
        self.portals.insert(
            portal,
            OpenPortal {
                script,
                rows: reply.rows.into(),
                sent: 0,
                tag: reply.tag,
                formats: result_formats,
            },
        );
        Flow::Continue
    }

    fn execute(&mut self, name: &str, max_rows: i32) {
        let Some(mut portal) = self.portals.remove(name) else {
            self.fail("34000", &format!("portal \"{}\" does not exist", name));
            return;
        };
        let limit = if max_rows > 0 { max_rows as usize } else { usize::MAX };
        let columns = self.scripts[portal.script].columns.clone();
        let mut sent_now = 0;
        while sent_now < limit {
            let Some(row) = portal.rows.pop_front() else {
                break;
            };
            if let Err(message) = self.data_row(&columns, &row, &portal.formats) {
                self.fail("XX000", &message);
                return;
            }
            sent_now += 1;
        }
        portal.sent += sent_now;
        if portal.rows.is_empty() {
            let tag = portal
                .tag
                .clone()
                .unwrap_or_else(|| format!("SELECT {}", portal.sent));
            self.message(b'C', |b| put_cstr(b, &tag));
        } else {
            self.message(b's', |_| {});
        }
        self.portals.insert(name.to_string(), portal);
    }

    fn simple_query(&mut self, sql: &str) -> Flow {
        let statements: Vec<&str> = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if statements.is_empty() {
            self.message(b'I', |_| {});
        }
        for statement in statements {
            let keyword = statement
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();
            if self.status == b'E' && keyword != "ROLLBACK" && keyword != "COMMIT" {
                self.error_response(
                    "25P02",
                    "current transaction is aborted, commands ignored until end of transaction block",
                );
                break;
            }
            let rollback_to = keyword == "ROLLBACK"
                && statement
                    .split_whitespace()
                    .nth(1)
                    .is_some_and(|word| word.eq_ignore_ascii_case("TO"));
            match keyword.as_str() {
                "SAVEPOINT" | "RELEASE" | "ROLLBACK" if keyword != "ROLLBACK" || rollback_to => {
                    match self.savepoint_command(&keyword, statement) {
                        Ok(tag) => {
                            self.message(b'C', |b| put_cstr(b, tag));
                            continue;
                        }
                        Err((code, message)) => {
                            self.error_response(code, &message);
                            break;
                        }
                    }
                }
                "BEGIN" => {
                    self.status = b'T';
                    self.message(b'C', |b| put_cstr(b, "BEGIN"));
                    continue;
                }
                "COMMIT" | "ROLLBACK" => {
                    let tag = if self.status == b'E' { "ROLLBACK" } else { keyword.as_str() };
                    let tag = tag.to_string();
                    self.status = b'I';
                    self.portals.clear();
                    self.savepoints.clear();
                    self.message(b'C', |b| put_cstr(b, &tag));
                    continue;
                }
                _ => {}
            }
            let Some(script) = self.find(statement) else {
                self.message(b'C', |b| put_cstr(b, &keyword));
                continue;
            };
            let reply = (self.scripts[script].handler)(&[]);
            if let Some(flow) = self.apply_side_effects(&reply) {
                return flow;
            }
            if let Some((code, message)) = &reply.error {
                self.error_response(code, message);
                break;
            }
            let columns = self.scripts[script].columns.clone();
            if !columns.is_empty() {
                self.row_description(script, Format::Text);
            }
            let mut failed = None;
            for row in &reply.rows {
                if let Err(message) = self.data_row(&columns, row, &[Format::Text]) {
                    failed = Some(message);
                    break;
                }
            }
            if let Some(message) = failed {
                self.error_response("XX000", &message);
                break;
            }
            let tag = reply
                .tag
                .clone()
                .unwrap_or_else(|| format!("SELECT {}", reply.rows.len()));
            self.message(b'C', |b| put_cstr(b, &tag));
        }
        self.ready();
        Flow::Continue
    }

    /// SAVEPOINT, RELEASE and ROLLBACK TO; the savepoint name is the last word.
    fn savepoint_command(&mut self, keyword: &str, statement: &str) -> Result<&'static str, (&'static str, String)> {
        let name = statement.split_whitespace().last().unwrap_or_default().to_string();
        if self.status == b'I' {
            return Err(("25P01", format!("{} can only be used in transaction blocks", keyword)));
        }
        if keyword == "SAVEPOINT" {
            self.savepoints.push(name);
            return Ok("SAVEPOINT");
        }
        let Some(position) = self.savepoints.iter().rposition(|open| *open == name) else {
            return Err(("3B001", format!("savepoint {} does not exist", name)));
        };
        if keyword == "RELEASE" {
            self.savepoints.truncate(position);
            Ok("RELEASE")
        } else {
            self.savepoints.truncate(position + 1);
            self.status = b'T';
            Ok("ROLLBACK")
        }
    }

    /// Notices and notifications of a reply; `Some` when the reply ends
    /// the conversation instead.
    fn apply_side_effects(&mut self, reply: &Reply) -> Option<Flow> {
        for notice in &reply.notices {
            self.message(b'N', |b| {
                for (field, value) in [(b'S', "WARNING"), (b'C', "01000"), (b'M', notice.as_str())] {
                    b.put_u8(field);
                    put_cstr(b, value);
                }
                b.put_u8(0);
            });
        }
        for (channel, payload) in &reply.notifications {
            self.notification(channel, payload);
        }
        if reply.disconnect {
            return Some(Flow::Stop);
        }
        if reply.hang {
            return Some(Flow::Hang);
        }
        None
    }

    // ------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------

    fn find(&self, sql: &str) -> Option<usize> {
        self.scripts.iter().position(|s| sql.contains(&s.pattern))
    }

    fn type_of(&self, oid: Oid) -> Arc<Type> {
        self.registry
            .get(oid)
            .or_else(|| self.registry.get(Oid::TEXT))
            .expect("text type is built in")
    }

    fn decode_param(&self, oid: Oid, format: Format, data: Option<&[u8]>) -> PgValue {
        match data {
            None => PgValue::Null,
            Some(data) => {
                let ty = self.type_of(oid);
                codec::decode_value(&ty, format, data, &self.registry)
                    .unwrap_or_else(|_| PgValue::Text(String::from_utf8_lossy(data).into_owned()))
            }
        }
    }

    fn row_description(&mut self, script: usize, format: Format) {
        let columns = self.scripts[script].columns.clone();
        if columns.is_empty() {
            self.message(b'n', |_| {});
            return;
        }
        self.message(b'T', |b| {
            b.put_i16(columns.len() as i16);
            for (name, oid) in &columns {
                put_cstr(b, name);
                b.put_i32(0);
                b.put_i16(0);
                b.put_i32(oid.0);
                b.put_i16(-1);
                b.put_i32(-1);
                b.put_i16(format as i16);
            }
        });
    }

    fn data_row(&mut self, columns: &[(String, Oid)], row: &[PgValue], formats: &[Format]) -> Result<(), String> {
        let mut encoded = Vec::with_capacity(row.len());
        for (i, value) in row.iter().enumerate() {
            let oid = columns.get(i).map(|(_, oid)| *oid).unwrap_or(Oid::TEXT);
            let ty = self.type_of(oid);
            let value = codec::encode_param(value, &ty, format_at(formats, i)).map_err(|e| e.to_string())?;
            encoded.push(value);
        }
        self.message(b'D', |b| {
            b.put_i16(encoded.len() as i16);
            for value in &encoded {
                match value {
                    Some(data) => {
                        b.put_i32(data.len() as i32);
                        b.put_slice(data);
                    }
                    None => b.put_i32(-1),
                }
            }
        });
        Ok(())
    }

    fn notification(&mut self, channel: &str, payload: &str) {
        self.message(b'A', |b| {
            b.put_i32(4242);
            put_cstr(b, channel);
            put_cstr(b, payload);
        });
    }

    /// Extended-protocol error: skip to the next Sync.
    fn fail(&mut self, code: &str, message: &str) {
        self.error_response(code, message);
        self.skipping = true;
    }

    fn error_response(&mut self, code: &str, message: &str) {
        if self.status == b'T' {
            self.status = b'E';
        }
        self.message(b'E', |b| {
            for (field, value) in [(b'S', "ERROR"), (b'C', code), (b'M', message)] {
                b.put_u8(field);
                put_cstr(b, value);
            }
            b.put_u8(0);
        });
    }

    fn ready(&mut self) {
        let status = self.status;
        self.message(b'Z', |b| b.put_u8(status));
    }

    fn message(&mut self, tag: u8, body: impl FnOnce(&mut BytesMut)) {
        let mut payload = BytesMut::new();
        body(&mut payload);
        self.output.put_u8(tag);
        self.output.put_i32(payload.len() as i32 + 4);
        self.output.put_slice(&payload);
    }
}

fn format_at(formats: &[Format], index: usize) -> Format {
    match formats.len() {
        0 => Format::Text,
        1 => formats[0],
        _ => formats.get(index).copied().unwrap_or(Format::Text),
    }
}

fn cstr(buf: &mut Bytes) -> String {
    read_cstring(buf).unwrap_or_default()
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}
