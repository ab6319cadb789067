//! Wire session.
//!
//! This module provides the session type that handles:
//! - Startup and password authentication
//! - Framing of backend messages, with a deadline on every read
//! - Transaction status tracking and implicit BEGIN
//! - Asynchronous notifications, notices and parameter updates
//! - Idempotent close and forced close after timeouts or disconnects
//!
//! The statement/portal protocol lives in `engine.rs` as further
//! `impl Session` blocks.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::cache::{ParsedSqlCache, StatementCaches};
use super::codec;
use super::coerce::CompositeMappings;
use super::config::PgConfig;
use super::error::{PgError, PgResult};
use super::notify::{ListenerError, Notification, NotificationListeners};
use super::portal::{Portal, ResultBatch, Row};
use super::protocol::*;
use super::registry::{Category, Registry, SharedRegistry, Type};
use super::sql_text::quote_identifier;
use super::statement::{ColumnDesc, StatementRegistry};
use super::types::{Kind, Oid, PgValue};

/// Byte stream a session runs over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Process id and secret used to cancel a running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelKey {
    pub process_id: i32,
    pub secret_key: i32,
}

/// Parsed `server_version` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FromStr for ServerVersion {
    type Err = PgError;

    /// Accepts forms like `16.2`, `9.6.24`, `17beta1` and `15.4 (Debian 15.4-1)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let numeric: String = s
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = numeric.split('.').filter(|p| !p.is_empty());
        let bad = || PgError::Protocol(format!("Invalid server version: {}", s));
        let major = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let minor = parts.next().map(str::parse).transpose().map_err(|_| bad())?;
        let patch = parts.next().map(str::parse).transpose().map_err(|_| bad())?;
        Ok(Self {
            major,
            minor: minor.unwrap_or(0),
            patch: patch.unwrap_or(0),
        })
    }
}

/// Raw outcome of one statement of a simple query.
#[derive(Debug, Default)]
pub(crate) struct SimpleResult {
    pub fields: Vec<FieldDescription>,
    pub rows: Vec<Vec<Option<Bytes>>>,
    pub tag: Option<String>,
}

// ============================================================================
// Session
// ============================================================================

/// A PostgreSQL session over one transport.
///
/// Commands are serialized by `&mut self`; at most one is in flight.
pub struct Session<S: Transport = TcpStream> {
    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
    read_buffer: BytesMut,
    pub(crate) config: PgConfig,
    transaction_status: TransactionStatus,
    cancel_key: Option<CancelKey>,
    parameters: HashMap<String, String>,
    closed: bool,
    name_counter: u64,
    pub(crate) registry: Registry,
    pub(crate) statements: StatementRegistry,
    pub(crate) portals: HashMap<String, Portal>,
    pub(crate) caches: StatementCaches,
    pub(crate) parsed: Arc<ParsedSqlCache>,
    pub(crate) composites: CompositeMappings,
    /// A named portal is open without a Sync, waiting for fetches
    pub(crate) sync_pending: bool,
    listeners: NotificationListeners,
    notifications: VecDeque<Notification>,
    warnings: Vec<Notice>,
}

impl Session<TcpStream> {
    /// Connect to the server named by a connection URL.
    pub async fn connect(url: &str) -> PgResult<Self> {
        let config = PgConfig::from_url(url)?;
        Self::connect_with_config(config).await
    }

    /// Connect with explicit configuration.
    pub async fn connect_with_config(config: PgConfig) -> PgResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = match within(config.network_timeout, TcpStream::connect(&addr)).await {
            Some(stream) => stream?,
            None => return Err(PgError::Timeout),
        };
        stream.set_nodelay(true)?;
        Self::connect_stream(stream, config).await
    }
}

impl<S: Transport> Session<S> {
    /// Run startup over an already established transport.
    pub async fn connect_stream(stream: S, config: PgConfig) -> PgResult<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let registry = Registry::new(SharedRegistry::for_server(&config.server_key()));
        let mut session = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            read_buffer: BytesMut::with_capacity(32768),
            caches: StatementCaches::from_config(&config),
            parsed: ParsedSqlCache::shared(config.parsed_sql_cache_size),
            config,
            transaction_status: TransactionStatus::Idle,
            cancel_key: None,
            parameters: HashMap::new(),
            closed: false,
            name_counter: 0,
            registry,
            statements: StatementRegistry::new(),
            portals: HashMap::new(),
            composites: CompositeMappings::new(),
            sync_pending: false,
            listeners: NotificationListeners::new(),
            notifications: VecDeque::new(),
            warnings: Vec::new(),
        };

        session.startup().await?;
        info!(
            host = %session.config.host,
            database = %session.config.database,
            user = %session.config.user,
            "session established"
        );
        Ok(session)
    }

    async fn startup(&mut self) -> PgResult<()> {
        let startup = StartupMessage {
            user: self.config.user.clone(),
            database: Some(self.config.database.clone()),
            options: self
                .config
                .application_name
                .as_ref()
                .map(|name| vec![("application_name".to_string(), name.clone())])
                .unwrap_or_default(),
        };
        self.send_message(&startup).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = self.password()?.to_string();
                    self.send_message(&PasswordMessage { password }).await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let hash = md5_password(&self.config.user, self.password()?, &salt);
                    self.send_message(&PasswordMessage { password: hash }).await?;
                }
                BackendMessage::AuthenticationUnsupported { code } => {
                    return Err(PgError::Auth(format!(
                        "Unsupported authentication method (code {})",
                        code
                    )));
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.cancel_key = Some(CancelKey {
                        process_id,
                        secret_key,
                    });
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(PgError::from_fields(&fields));
                }
                BackendMessage::NoticeResponse { fields } => {
                    let notice = Notice::from_fields(&fields);
                    warn!(code = %notice.code, message = %notice.message, "server notice during startup");
                }
                other => debug!(?other, "ignoring message during startup"),
            }
        }
    }

    fn password(&self) -> PgResult<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("Password required".to_string()))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn cancel_key(&self) -> Option<CancelKey> {
        self.cancel_key
    }

    /// Get a server parameter reported through ParameterStatus.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        self.parameter("server_version").and_then(|v| v.parse().ok())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn composite_mappings(&self) -> &CompositeMappings {
        &self.composites
    }

    pub fn composite_mappings_mut(&mut self) -> &mut CompositeMappings {
        &mut self.composites
    }

    /// Column `index` of `row` mapped through this session's composite mappings.
    pub fn get_mapped<T: 'static>(&self, row: &Row, index: usize) -> PgResult<T> {
        row.get_mapped(index, &self.composites)
    }

    pub fn statement_caches(&self) -> &StatementCaches {
        &self.caches
    }

    pub(crate) fn ensure_open(&self) -> PgResult<()> {
        if self.closed {
            return Err(PgError::Closed);
        }
        Ok(())
    }

    /// Unique name for a prepared statement or portal.
    pub(crate) fn next_name(&mut self) -> String {
        self.name_counter += 1;
        format!("{:x}", self.name_counter)
    }

    /// Notices collected since the last call.
    pub fn take_warnings(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.warnings)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub async fn begin(&mut self) -> PgResult<()> {
        self.ensure_open()?;
        self.simple_exchange("BEGIN").await.map(|_| ())
    }

    pub async fn commit(&mut self) -> PgResult<()> {
        self.ensure_open()?;
        self.simple_exchange("COMMIT").await.map(|_| ())
    }

    pub async fn rollback(&mut self) -> PgResult<()> {
        self.ensure_open()?;
        self.simple_exchange("ROLLBACK").await.map(|_| ())
    }

    /// Mark a savepoint in the current transaction.
    pub async fn savepoint(&mut self, name: &str) -> PgResult<()> {
        let sql = format!("SAVEPOINT {}", quote_identifier(name));
        self.execute_command(&sql).await.map(|_| ())
    }

    /// Forget a savepoint and every savepoint set after it.
    pub async fn release_savepoint(&mut self, name: &str) -> PgResult<()> {
        let sql = format!("RELEASE SAVEPOINT {}", quote_identifier(name));
        self.execute_command(&sql).await.map(|_| ())
    }

    /// Undo work since the savepoint; also clears a failed transaction state.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> PgResult<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", quote_identifier(name));
        self.execute_command(&sql).await.map(|_| ())
    }

    pub fn autocommit(&self) -> bool {
        self.config.autocommit
    }

    /// Switch autocommit. Turning it on commits an open transaction.
    pub async fn set_autocommit(&mut self, autocommit: bool) -> PgResult<()> {
        self.ensure_open()?;
        if autocommit && !self.config.autocommit && self.transaction_status != TransactionStatus::Idle {
            self.commit().await?;
        }
        self.config.autocommit = autocommit;
        Ok(())
    }

    /// Open a transaction before the first statement of a manual-commit unit.
    pub(crate) async fn begin_if_needed(&mut self) -> PgResult<()> {
        if !self.config.autocommit && self.transaction_status == TransactionStatus::Idle {
            debug!("implicit BEGIN");
            self.simple_exchange("BEGIN").await?;
        }
        Ok(())
    }

    // ========================================================================
    // Simple query protocol
    // ========================================================================

    /// Run one command and return the notices it raised.
    pub async fn execute_command(&mut self, sql: &str) -> PgResult<Vec<Notice>> {
        self.ensure_open()?;
        self.warnings.clear();
        self.begin_if_needed().await?;
        self.simple_exchange(sql).await?;
        Ok(self.take_warnings())
    }

    /// Execute a simple query (text protocol), one batch per statement.
    pub async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<ResultBatch>> {
        self.ensure_open()?;
        self.warnings.clear();
        self.begin_if_needed().await?;
        let results = self.simple_exchange(sql).await?;

        let mut batches = Vec::with_capacity(results.len());
        for result in results {
            batches.push(self.decode_simple(result).await?);
        }
        if let Some(last) = batches.last_mut() {
            last.warnings = self.take_warnings();
        }
        Ok(batches)
    }

    /// Send a Query message and collect raw results up to ReadyForQuery.
    pub(crate) async fn simple_exchange(&mut self, sql: &str) -> PgResult<Vec<SimpleResult>> {
        self.ensure_open()?;
        self.settle_pending_sync().await?;
        debug!(sql, "simple query");
        self.send_message(&QueryMessage {
            query: sql.to_string(),
        })
        .await?;

        let mut results = Vec::new();
        let mut current = SimpleResult::default();
        let mut failure = None;
        loop {
            match self.next_message().await? {
                BackendMessage::RowDescription { fields } => current.fields = fields,
                BackendMessage::DataRow { values } => current.rows.push(values),
                BackendMessage::CommandComplete { tag } => {
                    current.tag = Some(tag);
                    results.push(std::mem::take(&mut current));
                }
                BackendMessage::EmptyQueryResponse => results.push(std::mem::take(&mut current)),
                BackendMessage::ErrorResponse { fields } => {
                    failure = Some(PgError::from_fields(&fields));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.on_ready(status);
                    break;
                }
                other => debug!(?other, "ignoring message in simple query"),
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    async fn decode_simple(&mut self, result: SimpleResult) -> PgResult<ResultBatch> {
        let mut columns = Vec::with_capacity(result.fields.len());
        for field in &result.fields {
            let ty = match self.resolve_type(field.type_oid).await {
                Ok(ty) => ty,
                Err(PgError::UnknownType(_)) => Arc::new(unknown_type(field.type_oid)),
                Err(e) => return Err(e),
            };
            let mut column = ColumnDesc::new(field, ty);
            column.format = Format::Text;
            columns.push(column);
        }
        let columns = Arc::new(columns);

        let mut batch = ResultBatch::new(Arc::clone(&columns));
        for values in result.rows {
            let row = self.decode_row(&columns, &values)?;
            batch.rows.push(row);
        }
        match result.tag {
            Some(tag) => batch.finish(tag),
            None => batch.complete = true,
        }
        Ok(batch)
    }

    /// Decode a DataRow against its column metadata.
    pub(crate) fn decode_row(&self, columns: &Arc<Vec<ColumnDesc>>, values: &[Option<Bytes>]) -> PgResult<Row> {
        if values.len() != columns.len() {
            return Err(PgError::Protocol(format!(
                "DataRow has {} values for {} columns",
                values.len(),
                columns.len()
            )));
        }
        let mut decoded = smallvec::SmallVec::with_capacity(values.len());
        for (column, value) in columns.iter().zip(values) {
            decoded.push(match value {
                Some(data) => codec::decode_value(&column.type_, column.format, data, &self.registry)?,
                None => PgValue::Null,
            });
        }
        Ok(Row::new(Arc::clone(columns), decoded))
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Register a listener for channels fully matching `channel_pattern`.
    pub fn add_listener<F>(&mut self, name: &str, channel_pattern: &str, callback: F) -> PgResult<()>
    where
        F: FnMut(&Notification) -> Result<(), ListenerError> + Send + 'static,
    {
        self.listeners.add(name, channel_pattern, callback)
    }

    pub fn remove_listener(&mut self, name: &str) -> bool {
        self.listeners.remove(name)
    }

    pub async fn listen(&mut self, channel: &str) -> PgResult<()> {
        self.execute_command(&format!("LISTEN {}", quote_identifier(channel)))
            .await
            .map(|_| ())
    }

    pub async fn unlisten(&mut self, channel: &str) -> PgResult<()> {
        self.execute_command(&format!("UNLISTEN {}", quote_identifier(channel)))
            .await
            .map(|_| ())
    }

    /// Notifications received so far and not yet taken.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    /// Wait up to `timeout` for notifications while no command is running.
    ///
    /// An elapsed wait is not an error and leaves the session open.
    pub async fn wait_for_notifications(&mut self, timeout: Duration) -> PgResult<Vec<Notification>> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        while self.notifications.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.read_frame(Some(remaining)).await? {
                Some(message) => {
                    if let Some(other) = self.absorb_async(message) {
                        debug!(?other, "ignoring unsolicited message");
                    }
                }
                None => break,
            }
        }
        Ok(self.take_notifications())
    }

    // ========================================================================
    // Cancel and close
    // ========================================================================

    /// Ask the server, over a separate connection, to cancel the running command.
    pub async fn cancel(&self) -> PgResult<()> {
        let key = self
            .cancel_key
            .ok_or_else(|| PgError::Unsupported("Server sent no cancel key".to_string()))?;
        send_cancel(format!("{}:{}", self.config.host, self.config.port), key).await
    }

    fn spawn_cancel(&self) {
        let Some(key) = self.cancel_key else {
            return;
        };
        let addr = format!("{}:{}", self.config.host, self.config.port);
        tokio::spawn(async move {
            match send_cancel(addr, key).await {
                Ok(()) => debug!(pid = key.process_id, "cancel request sent"),
                Err(e) => warn!(pid = key.process_id, error = %e, "cancel request failed"),
            }
        });
    }

    /// Close the session: release portals and prepared statements, then
    /// terminate. Calling it again does nothing.
    pub async fn close(&mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }

        let portals: Vec<String> = self.portals.keys().cloned().collect();
        let prepared: Vec<String> = self
            .caches
            .drain_prepared()
            .into_iter()
            .map(|p| p.name.clone())
            .collect();
        if !portals.is_empty() || !prepared.is_empty() || self.sync_pending {
            if let Err(e) = self.release_server_resources(&portals, &prepared).await {
                warn!(error = %e, "failed to release server resources on close");
            }
        }

        if !self.closed {
            if self.send_message(&TerminateMessage).await.is_ok() {
                let _ = within(self.config.network_timeout, self.writer.shutdown()).await;
            }
            self.closed = true;
        }
        self.release_local_state();
        info!(host = %self.config.host, database = %self.config.database, "session closed");
        Ok(())
    }

    async fn release_server_resources(&mut self, portals: &[String], prepared: &[String]) -> PgResult<()> {
        for name in portals {
            self.buffer_message(&CloseMessage {
                kind: b'P',
                name: name.clone(),
            })
            .await?;
        }
        for name in prepared {
            self.buffer_message(&CloseMessage {
                kind: b'S',
                name: name.clone(),
            })
            .await?;
        }
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;
        self.sync_pending = false;
        debug!(portals = portals.len(), statements = prepared.len(), "releasing server resources");
        self.drain_until_ready().await
    }

    fn release_local_state(&mut self) {
        for id in self.statements.ids() {
            self.statements.unregister(id);
        }
        self.portals.clear();
        self.caches.drain_prepared();
        self.registry.clear_local();
        self.notifications.clear();
        self.sync_pending = false;
    }

    /// Close after a fatal error and hand the error back.
    async fn abort(&mut self, err: PgError) -> PgError {
        if self.closed {
            return err;
        }
        error!(error = %err, "session failed, closing");
        self.closed = true;
        if matches!(err, PgError::Timeout) {
            self.spawn_cancel();
        }
        let _ = within(self.config.network_timeout, self.writer.shutdown()).await;
        self.release_local_state();
        err
    }

    // ========================================================================
    // Message I/O
    // ========================================================================

    /// Send a frontend message (with flush).
    pub(crate) async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.buffer_message(msg).await?;
        self.flush().await
    }

    /// Buffer a frontend message without flushing.
    pub(crate) async fn buffer_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        let encoded = msg.encode();
        let result = within(self.config.network_timeout, self.writer.write_all(&encoded)).await;
        self.settle(result).await
    }

    pub(crate) async fn flush(&mut self) -> PgResult<()> {
        let result = within(self.config.network_timeout, self.writer.flush()).await;
        self.settle(result).await
    }

    async fn settle<T>(&mut self, result: Option<io::Result<T>>) -> PgResult<T> {
        match result {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(self.abort(PgError::Io(e)).await),
            None => Err(self.abort(PgError::Timeout).await),
        }
    }

    /// Receive a backend message within the network timeout.
    async fn receive_message(&mut self) -> PgResult<BackendMessage> {
        match self.read_frame(self.config.network_timeout).await? {
            Some(message) => Ok(message),
            None => Err(self.abort(PgError::Timeout).await),
        }
    }

    /// Read one message, or `None` when `limit` elapses first.
    async fn read_frame(&mut self, limit: Option<Duration>) -> PgResult<Option<BackendMessage>> {
        let deadline = limit.map(|l| Instant::now() + l);
        loop {
            if self.read_buffer.len() >= 5 {
                let length = i32::from_be_bytes([
                    self.read_buffer[1],
                    self.read_buffer[2],
                    self.read_buffer[3],
                    self.read_buffer[4],
                ]);
                if length < 4 || length as usize > self.config.max_message_size {
                    let err = PgError::Protocol(format!(
                        "Invalid message length {} for message '{}'",
                        length, self.read_buffer[0] as char
                    ));
                    return Err(self.abort(err).await);
                }
                let total_len = 1 + length as usize;
                if self.read_buffer.len() >= total_len {
                    let mut frame = self.read_buffer.split_to(total_len).freeze();
                    return match BackendMessage::decode(&mut frame) {
                        Ok(message) => Ok(Some(message)),
                        Err(err) => Err(self.abort(err).await),
                    };
                }
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let mut chunk = [0u8; 4096];
            let result = within(remaining, self.reader.read(&mut chunk)).await;
            match result {
                None => return Ok(None),
                Some(Ok(0)) => return Err(self.abort(PgError::Disconnected).await),
                Some(Ok(n)) => self.read_buffer.extend_from_slice(&chunk[..n]),
                Some(Err(e)) => return Err(self.abort(PgError::Io(e)).await),
            }
        }
    }

    /// Next message that answers the pending command.
    ///
    /// Notifications, notices and parameter updates are handled here and
    /// never returned.
    pub(crate) async fn next_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            let message = self.receive_message().await?;
            if let Some(message) = self.absorb_async(message) {
                return Ok(message);
            }
        }
    }

    fn absorb_async(&mut self, message: BackendMessage) -> Option<BackendMessage> {
        match message {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                let notification = Notification {
                    process_id,
                    channel,
                    payload,
                };
                let delivered = self.listeners.dispatch(&notification);
                debug!(channel = %notification.channel, delivered, "notification");
                self.notifications.push_back(notification);
                None
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
                None
            }
            BackendMessage::NoticeResponse { fields } => {
                let notice = Notice::from_fields(&fields);
                warn!(
                    severity = %notice.severity,
                    code = %notice.code,
                    message = %notice.message,
                    "server notice"
                );
                self.warnings.push(notice);
                None
            }
            other => Some(other),
        }
    }

    /// Read up to ReadyForQuery, remembering the first server error.
    pub(crate) async fn drain_until_ready(&mut self) -> PgResult<()> {
        let mut failure = None;
        loop {
            match self.next_message().await? {
                BackendMessage::ReadyForQuery { status } => {
                    self.on_ready(status);
                    return match failure {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
                BackendMessage::ErrorResponse { fields } => {
                    if failure.is_none() {
                        failure = Some(PgError::from_fields(&fields));
                    }
                }
                _ => {}
            }
        }
    }

    /// After an ErrorResponse: sync if the exchange had none, then skip to ReadyForQuery.
    pub(crate) async fn recover(&mut self, err: PgError, synced: bool) -> PgError {
        if !synced {
            if let Err(fatal) = self.send_message(&SyncMessage).await {
                return fatal;
            }
            self.sync_pending = false;
        }
        match self.drain_until_ready().await {
            Err(e) if e.is_fatal() => e,
            _ => err,
        }
    }

    /// Record the status of a ReadyForQuery. Portals do not outlive the
    /// transaction they were opened in.
    pub(crate) fn on_ready(&mut self, status: TransactionStatus) {
        self.transaction_status = status;
        if status == TransactionStatus::Idle && !self.portals.is_empty() {
            let names: Vec<String> = self.portals.keys().cloned().collect();
            for name in names {
                self.forget_portal(&name);
            }
        }
    }

    pub(crate) fn forget_portal(&mut self, name: &str) {
        if let Some(portal) = self.portals.remove(name) {
            if let Some(statement) = self.statements.get_mut(portal.statement) {
                statement.portals.retain(|p| p != name);
            }
        }
    }

    /// Close portals left waiting without a Sync and sync, so the next
    /// command starts from ReadyForQuery.
    pub(crate) async fn settle_pending_sync(&mut self) -> PgResult<()> {
        if !self.sync_pending {
            return Ok(());
        }
        let names: Vec<String> = self.portals.keys().cloned().collect();
        debug!(portals = names.len(), "closing unsynced portals");
        for name in &names {
            self.buffer_message(&CloseMessage {
                kind: b'P',
                name: name.clone(),
            })
            .await?;
        }
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;
        self.sync_pending = false;
        for name in &names {
            self.forget_portal(name);
        }
        self.drain_until_ready().await
    }
}

impl<S: Transport> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.config.host)
            .field("database", &self.config.database)
            .field("transaction_status", &self.transaction_status)
            .field("closed", &self.closed)
            .field("statements", &self.statements.len())
            .field("portals", &self.portals.len())
            .finish()
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Await `fut`, giving up after `limit` when one is set.
async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn send_cancel(addr: String, key: CancelKey) -> PgResult<()> {
    let mut stream = TcpStream::connect(&addr).await?;
    let request = CancelRequestMessage {
        process_id: key.process_id,
        secret_key: key.secret_key,
    };
    stream.write_all(&request.encode()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Placeholder for a column whose type the catalog does not know.
fn unknown_type(oid: Oid) -> Type {
    Type::scalar(oid, "unknown", Kind::Unknown, Category::Unknown, -1)
}

/// Compute MD5 password hash: "md5" + md5(md5(password + user) + salt).
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner_hex = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut outer = inner_hex.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer))
}
