//! Statement/portal protocol engine.
//!
//! A statement moves `Unprepared -> Described -> Prepared`; each execution
//! binds a portal that runs to `Completed` or stops `Suspended` at its row
//! limit. Descriptions and prepared statements are cached per session, and
//! a statement is only prepared once it has been used often enough.

use std::sync::Arc;

use tracing::{debug, warn};

use super::codec;
use super::error::{PgError, PgResult};
use super::escapes::apply_escapes;
use super::portal::{CursorOptions, Portal, PortalState, ResultBatch, ResultCursor};
use super::protocol::*;
use super::session::{Session, Transport};
use super::statement::{
    ColumnDesc, PreparedStatementDescription, SharedColumns, Statement, StatementCacheKey,
    StatementDescription, StatementId, StatementState,
};
use super::types::{Oid, PgValue};

/// SQLSTATE for a prepared statement the server no longer has.
const INVALID_STATEMENT_NAME: &str = "26000";

/// A cursor declared with `DECLARE ... CURSOR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCursor {
    pub name: String,
    pub scrollable: bool,
    pub holdable: bool,
}

/// Direction of a FETCH on a declared cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    Forward(i64),
    Backward(i64),
    Absolute(i64),
    Relative(i64),
    All,
}

impl FetchDirection {
    fn to_sql(self) -> String {
        match self {
            FetchDirection::Forward(n) => format!("FORWARD {}", n),
            FetchDirection::Backward(n) => format!("BACKWARD {}", n),
            FetchDirection::Absolute(n) => format!("ABSOLUTE {}", n),
            FetchDirection::Relative(n) => format!("RELATIVE {}", n),
            FetchDirection::All => "ALL".to_string(),
        }
    }
}

/// Rows read by one Execute.
struct Execution {
    batch: ResultBatch,
    suspended: bool,
}

impl<S: Transport> Session<S> {
    // ========================================================================
    // Statements
    // ========================================================================

    /// Parse `sql`, apply escape processing and register the statement.
    pub fn create_statement(&mut self, sql: &str) -> PgResult<StatementId> {
        self.ensure_open()?;
        let mut text = self.parsed.parse(sql)?;
        let has_assign = apply_escapes(&mut text)?;
        let id = self.statements.register(text, has_assign);
        debug!(id = id.0, "statement created");
        Ok(id)
    }

    pub fn statement(&self, id: StatementId) -> Option<&Statement> {
        self.statements.get(id)
    }

    /// Close the statement's portals and release it. Its prepared
    /// statement, if any, stays cached for reuse.
    pub async fn close_statement(&mut self, id: StatementId) -> PgResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let portals = self
            .statements
            .get(id)
            .map(|s| s.portals.clone())
            .unwrap_or_default();
        for portal in portals {
            self.close_portal(&portal).await?;
        }
        if self.statements.unregister(id).is_some() {
            debug!(id = id.0, "statement closed");
        }
        Ok(())
    }

    // ========================================================================
    // Describe and prepare
    // ========================================================================

    /// Parameter and result types of `key`, from the description cache or
    /// a parse/describe of the unnamed statement.
    pub async fn describe(&mut self, key: &StatementCacheKey) -> PgResult<Arc<StatementDescription>> {
        self.ensure_open()?;
        if let Some(description) = self.caches.description(key) {
            debug!(sql = %key.sql, "description cache hit");
            return Ok(description);
        }
        self.settle_pending_sync().await?;

        let (param_oids, fields) = self.parse_and_describe("", key).await?;
        let description = Arc::new(self.build_description(&param_oids, &fields).await?);
        self.caches
            .put_description(key.clone(), Arc::clone(&description));
        Ok(description)
    }

    /// Prepare `key` under a generated name and cache it. A prepared
    /// statement pushed out of the cache is closed on the server.
    pub async fn prepare(&mut self, key: &StatementCacheKey) -> PgResult<Arc<PreparedStatementDescription>> {
        self.ensure_open()?;
        if let Some(prepared) = self.caches.prepared(key) {
            return Ok(prepared);
        }
        if !self.caches.prepared_enabled() {
            return Err(PgError::Unsupported(
                "Prepared statement cache is disabled".to_string(),
            ));
        }
        self.settle_pending_sync().await?;

        let name = self.next_name();
        let (param_oids, fields) = self.parse_and_describe(&name, key).await?;
        let description = match self.caches.description(key) {
            Some(description) => description,
            None => {
                let description = Arc::new(self.build_description(&param_oids, &fields).await?);
                self.caches
                    .put_description(key.clone(), Arc::clone(&description));
                description
            }
        };
        let prepared = Arc::new(PreparedStatementDescription {
            name: name.clone(),
            description,
        });
        debug!(name = %name, sql = %key.sql, "statement prepared");

        if let Some(evicted) = self.caches.put_prepared(key.clone(), Arc::clone(&prepared)) {
            self.unlink_prepared(&evicted.name);
            match self.close_server_statement(&evicted.name).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(name = %evicted.name, error = %e, "failed to dispose evicted prepared statement"),
            }
        }
        Ok(prepared)
    }

    /// Remove `key` from the prepared cache and close it on the server.
    /// Returns false when it was not prepared.
    pub async fn dispose_prepared(&mut self, key: &StatementCacheKey) -> PgResult<bool> {
        self.ensure_open()?;
        let Some(prepared) = self.caches.remove_prepared(key) else {
            return Ok(false);
        };
        self.unlink_prepared(&prepared.name);
        self.settle_pending_sync().await?;
        match self.close_server_statement(&prepared.name).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Err(PgError::Disposal {
                name: prepared.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn parse_and_describe(
        &mut self,
        name: &str,
        key: &StatementCacheKey,
    ) -> PgResult<(Vec<Oid>, Vec<FieldDescription>)> {
        debug!(statement = name, sql = %key.sql, "parse/describe");
        self.buffer_message(&ParseMessage {
            name: name.to_string(),
            query: key.sql.clone(),
            param_types: key.param_types.clone(),
        })
        .await?;
        self.buffer_message(&DescribeMessage {
            kind: b'S',
            name: name.to_string(),
        })
        .await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;

        let mut param_oids = Vec::new();
        let mut fields = Vec::new();
        loop {
            match self.next_message().await? {
                BackendMessage::ParseComplete | BackendMessage::NoData => {}
                BackendMessage::ParameterDescription { type_oids } => param_oids = type_oids,
                BackendMessage::RowDescription { fields: described } => fields = described,
                BackendMessage::ReadyForQuery { status } => {
                    self.on_ready(status);
                    return Ok((param_oids, fields));
                }
                BackendMessage::ErrorResponse { fields } => {
                    let err = PgError::from_fields(&fields);
                    return Err(self.recover(err, true).await);
                }
                other => debug!(?other, "ignoring message in describe"),
            }
        }
    }

    async fn build_description(
        &mut self,
        param_oids: &[Oid],
        fields: &[FieldDescription],
    ) -> PgResult<StatementDescription> {
        let mut param_types = Vec::with_capacity(param_oids.len());
        for oid in param_oids {
            param_types.push(self.resolve_type(*oid).await?);
        }
        let mut columns = Vec::with_capacity(fields.len());
        for field in fields {
            let ty = self.resolve_type(field.type_oid).await?;
            columns.push(ColumnDesc::new(field, ty));
        }
        Ok(StatementDescription {
            param_types,
            columns: Arc::new(columns),
        })
    }

    async fn close_server_statement(&mut self, name: &str) -> PgResult<()> {
        debug!(name, "closing prepared statement");
        self.buffer_message(&CloseMessage {
            kind: b'S',
            name: name.to_string(),
        })
        .await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;
        self.drain_until_ready().await
    }

    /// Statements that used `name` fall back to described.
    fn unlink_prepared(&mut self, name: &str) {
        for id in self.statements.ids() {
            if let Some(statement) = self.statements.get_mut(id) {
                if statement.prepared_name.as_deref() == Some(name) {
                    statement.prepared_name = None;
                    statement.state = StatementState::Described;
                }
            }
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Execute with the session's default fetch size.
    pub async fn execute(&mut self, id: StatementId, params: &[PgValue]) -> PgResult<ResultBatch> {
        let options = CursorOptions::with_fetch_size(self.config.default_fetch_size);
        self.execute_with(id, params, options).await
    }

    /// Bind `params` and execute. A fetch size, scrollability or
    /// holdability runs the statement in a named portal; a batch cut short
    /// by the fetch size comes back suspended and resumes with [`fetch`].
    ///
    /// [`fetch`]: Session::fetch
    pub async fn execute_with(
        &mut self,
        id: StatementId,
        params: &[PgValue],
        options: CursorOptions,
    ) -> PgResult<ResultBatch> {
        self.ensure_open()?;
        let (sql, expected, statement_count) = {
            let statement = self
                .statements
                .get(id)
                .ok_or_else(|| PgError::Structural(format!("Unknown statement {}", id.0)))?;
            (
                statement.sql.clone(),
                statement.parameter_count(),
                statement.text.statement_count(),
            )
        };

        if statement_count > 1 {
            if !params.is_empty() {
                return Err(PgError::Structural(
                    "Parameters cannot be bound to multiple statements".to_string(),
                ));
            }
            let mut batches = self.simple_query(&sql).await?;
            return Ok(batches.pop().unwrap_or_else(|| {
                let mut empty = ResultBatch::new(Arc::new(Vec::new()));
                empty.complete = true;
                empty
            }));
        }
        if params.len() != expected {
            return Err(PgError::Structural(format!(
                "Statement takes {} parameters, {} given",
                expected,
                params.len()
            )));
        }

        self.settle_pending_sync().await?;
        self.take_warnings();
        self.begin_if_needed().await?;

        let key = StatementCacheKey::new(sql.clone(), params.iter().map(PgValue::type_oid).collect());
        let cached = self.caches.prepared(&key);
        let (statement_name, description) = if let Some(prepared) = cached {
            debug!(name = %prepared.name, "prepared statement cache hit");
            (prepared.name.clone(), Arc::clone(&prepared.description))
        } else if self.caches.should_prepare(&key) {
            let prepared = self.prepare(&key).await?;
            (prepared.name.clone(), Arc::clone(&prepared.description))
        } else {
            (String::new(), self.describe(&key).await?)
        };
        let prepared = !statement_name.is_empty();

        if let Some(statement) = self.statements.get_mut(id) {
            statement.description = Some(Arc::clone(&description));
            if prepared {
                statement.state = StatementState::Prepared;
                statement.prepared_name = Some(statement_name.clone());
            } else if statement.state == StatementState::Unprepared {
                statement.state = StatementState::Described;
            }
        }

        if description.param_types.len() != params.len() {
            return Err(PgError::Structural(format!(
                "Server expects {} parameters, {} given",
                description.param_types.len(),
                params.len()
            )));
        }
        let mut param_formats = Vec::with_capacity(params.len());
        let mut values = Vec::with_capacity(params.len());
        for (value, ty) in params.iter().zip(&description.param_types) {
            let format = codec::param_format(ty);
            values.push(codec::encode_param(value, ty, format)?);
            param_formats.push(format);
        }

        let portal = if options.needs_named_portal() {
            self.next_name()
        } else {
            String::new()
        };
        let suspendable = options.fetch_size > 0;
        // outside a transaction block a Sync would close the portal
        let flush_mode = suspendable && self.transaction_status() == TransactionStatus::Idle;

        if !prepared {
            self.buffer_message(&ParseMessage {
                name: String::new(),
                query: sql.clone(),
                param_types: description.param_oids(),
            })
            .await?;
        }
        self.buffer_message(&BindMessage {
            portal: portal.clone(),
            statement: statement_name.clone(),
            param_formats,
            params: values,
            result_formats: description.result_formats(),
        })
        .await?;
        self.buffer_message(&ExecuteMessage {
            portal: portal.clone(),
            max_rows: options.fetch_size.max(0),
        })
        .await?;
        if !portal.is_empty() && !suspendable {
            self.buffer_message(&CloseMessage {
                kind: b'P',
                name: portal.clone(),
            })
            .await?;
        }
        if flush_mode {
            self.buffer_message(&FlushMessage).await?;
        } else {
            self.buffer_message(&SyncMessage).await?;
        }
        self.flush().await?;
        debug!(
            statement = %statement_name,
            portal = %portal,
            fetch_size = options.fetch_size,
            "bind/execute"
        );

        let columns = Arc::clone(&description.columns);
        let execution = match self.read_execution(&columns, !flush_mode).await {
            Ok(execution) => execution,
            Err(e) => {
                if prepared && e.code() == Some(INVALID_STATEMENT_NAME) {
                    self.caches.remove_prepared(&key);
                    self.unlink_prepared(&statement_name);
                }
                return Err(e);
            }
        };

        let mut batch = execution.batch;
        if execution.suspended {
            self.portals.insert(
                portal.clone(),
                Portal {
                    name: portal.clone(),
                    statement: id,
                    columns,
                    fetch_size: options.fetch_size,
                    state: PortalState::Suspended,
                },
            );
            if let Some(statement) = self.statements.get_mut(id) {
                statement.portals.push(portal.clone());
            }
            self.sync_pending |= flush_mode;
            batch.portal = Some(portal);
        } else if flush_mode {
            self.finish_portal(&portal).await?;
        }
        batch.warnings = self.take_warnings();
        Ok(batch)
    }

    /// Resume a suspended portal for up to `max_rows` rows (0 = all).
    pub async fn fetch(&mut self, portal: &str, max_rows: i32) -> PgResult<ResultBatch> {
        self.ensure_open()?;
        let columns = match self.portals.get(portal) {
            Some(p) if p.state == PortalState::Suspended => Arc::clone(&p.columns),
            _ => {
                return Err(PgError::Structural(format!(
                    "No suspended portal named {}",
                    portal
                )))
            }
        };
        let synced = !self.sync_pending;

        self.take_warnings();
        self.buffer_message(&ExecuteMessage {
            portal: portal.to_string(),
            max_rows: max_rows.max(0),
        })
        .await?;
        if synced {
            self.buffer_message(&SyncMessage).await?;
        } else {
            self.buffer_message(&FlushMessage).await?;
        }
        self.flush().await?;
        debug!(portal, max_rows, "fetch");

        let execution = self.read_execution(&columns, synced).await?;
        let mut batch = execution.batch;
        if execution.suspended {
            batch.portal = Some(portal.to_string());
        } else {
            self.finish_portal(portal).await?;
        }
        batch.warnings = self.take_warnings();
        Ok(batch)
    }

    /// Close a named portal. Unknown names are ignored.
    pub async fn close_portal(&mut self, name: &str) -> PgResult<()> {
        if self.is_closed() || !self.portals.contains_key(name) {
            return Ok(());
        }
        self.finish_portal(name).await
    }

    /// Close a portal on the server and forget it. While other portals
    /// still wait without a Sync, only a Flush is sent.
    async fn finish_portal(&mut self, name: &str) -> PgResult<()> {
        let others_pending = self.sync_pending && self.portals.keys().any(|n| n != name);
        debug!(portal = name, "closing portal");
        self.buffer_message(&CloseMessage {
            kind: b'P',
            name: name.to_string(),
        })
        .await?;
        if others_pending {
            self.buffer_message(&FlushMessage).await?;
        } else {
            self.buffer_message(&SyncMessage).await?;
        }
        self.flush().await?;
        self.forget_portal(name);

        if !others_pending {
            self.sync_pending = false;
            return self.drain_until_ready().await;
        }
        loop {
            match self.next_message().await? {
                BackendMessage::CloseComplete => return Ok(()),
                BackendMessage::ErrorResponse { fields } => {
                    let err = PgError::from_fields(&fields);
                    self.sync_pending = false;
                    return Err(self.recover(err, false).await);
                }
                other => debug!(?other, "ignoring message while closing portal"),
            }
        }
    }

    /// Read the response to Bind/Execute up to completion, suspension or
    /// ReadyForQuery. Rows that fail to decode are reported once the
    /// response has been consumed.
    async fn read_execution(&mut self, columns: &SharedColumns, synced: bool) -> PgResult<Execution> {
        let mut batch = ResultBatch::new(Arc::clone(columns));
        let mut suspended = false;
        let mut decode_failure = None;
        loop {
            match self.next_message().await? {
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::CloseComplete
                | BackendMessage::NoData => {}
                BackendMessage::DataRow { values } => match self.decode_row(columns, &values) {
                    Ok(row) => batch.rows.push(row),
                    Err(e) => {
                        decode_failure.get_or_insert(e);
                    }
                },
                BackendMessage::CommandComplete { tag } => {
                    batch.finish(tag);
                    if !synced {
                        break;
                    }
                }
                BackendMessage::EmptyQueryResponse => {
                    batch.complete = true;
                    if !synced {
                        break;
                    }
                }
                BackendMessage::PortalSuspended => {
                    suspended = true;
                    if !synced {
                        break;
                    }
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.on_ready(status);
                    break;
                }
                BackendMessage::ErrorResponse { fields } => {
                    let err = PgError::from_fields(&fields);
                    if !synced {
                        self.sync_pending = false;
                    }
                    return Err(self.recover(err, synced).await);
                }
                other => debug!(?other, "ignoring message in execute"),
            }
        }

        if let Some(err) = decode_failure {
            return Err(err);
        }
        Ok(Execution { batch, suspended })
    }

    // ========================================================================
    // Conveniences
    // ========================================================================

    /// One-off statement: create, execute fully, release.
    pub async fn query(&mut self, sql: &str, params: &[PgValue]) -> PgResult<ResultBatch> {
        let id = self.create_statement(sql)?;
        let result = self.execute_with(id, params, CursorOptions::default()).await;
        self.statements.unregister(id);
        result
    }

    /// Run `sql` once per parameter row and return each row's affected count.
    ///
    /// With more than one row the statement is prepared up front and the
    /// prepared statement reused; a row whose parameter types differ from
    /// the previous row's is prepared again under its own cache key.
    pub async fn execute_batch(&mut self, sql: &str, rows: &[Vec<PgValue>]) -> PgResult<Vec<u64>> {
        let id = self.create_statement(sql)?;
        let result = self.run_batch(id, rows).await;
        self.statements.unregister(id);
        result
    }

    async fn run_batch(&mut self, id: StatementId, rows: &[Vec<PgValue>]) -> PgResult<Vec<u64>> {
        let (sql, expected, single) = {
            let statement = self
                .statements
                .get(id)
                .ok_or_else(|| PgError::Structural(format!("Unknown statement {}", id.0)))?;
            (
                statement.sql.clone(),
                statement.parameter_count(),
                statement.text.statement_count() == 1,
            )
        };
        if let Some(bad) = rows.iter().position(|params| params.len() != expected) {
            return Err(PgError::Structural(format!(
                "Batch row {} has {} parameters, statement takes {}",
                bad,
                rows[bad].len(),
                expected
            )));
        }

        let reuse = single && rows.len() > 1 && self.caches.prepared_enabled();
        let mut previous: Option<StatementCacheKey> = None;
        let mut counts = Vec::with_capacity(rows.len());
        for params in rows {
            if reuse {
                let key = StatementCacheKey::new(sql.clone(), params.iter().map(PgValue::type_oid).collect());
                if previous.as_ref() != Some(&key) {
                    self.prepare(&key).await?;
                    previous = Some(key);
                }
            }
            let batch = self.execute_with(id, params, CursorOptions::default()).await?;
            counts.push(batch.rows_affected.unwrap_or(0));
        }
        debug!(sql = %sql, rows = rows.len(), "batch executed");
        Ok(counts)
    }

    /// Execute and iterate rows, fetching further batches on demand.
    pub async fn open_cursor(
        &mut self,
        id: StatementId,
        params: &[PgValue],
        options: CursorOptions,
    ) -> PgResult<ResultCursor<'_, S>> {
        let batch = self.execute_with(id, params, options).await?;
        Ok(ResultCursor::new(self, batch, options.fetch_size))
    }

    /// Run an INSERT, UPDATE or DELETE with `RETURNING columns` appended
    /// (all columns when empty). Other statements run unchanged.
    pub async fn execute_returning(
        &mut self,
        sql: &str,
        params: &[PgValue],
        columns: &[&str],
    ) -> PgResult<ResultBatch> {
        self.ensure_open()?;
        let mut text = self.parsed.parse(sql)?;
        let has_assign = apply_escapes(&mut text)?;
        if !text.append_returning_clause(columns) {
            debug!("statement takes no RETURNING clause, running it unchanged");
        }
        let id = self.statements.register(text, has_assign);
        let result = self.execute_with(id, params, CursorOptions::default()).await;
        self.statements.unregister(id);
        result
    }

    /// Declare a server-side cursor over a single SELECT. Cursors that are
    /// not holdable only live inside a transaction block.
    pub async fn declare_cursor(
        &mut self,
        sql: &str,
        params: &[PgValue],
        scrollable: bool,
        holdable: bool,
    ) -> PgResult<ServerCursor> {
        self.ensure_open()?;
        let name = format!("cursor_{}", self.next_name());
        let mut text = self.parsed.parse(sql)?;
        let has_assign = apply_escapes(&mut text)?;
        if !text.prepend_cursor_declaration(&name, scrollable, holdable) {
            return Err(PgError::Structural(
                "Only a single SELECT can be declared as a cursor".to_string(),
            ));
        }
        let id = self.statements.register(text, has_assign);
        let result = self.execute_with(id, params, CursorOptions::default()).await;
        self.statements.unregister(id);
        result?;
        debug!(cursor = %name, scrollable, holdable, "cursor declared");
        Ok(ServerCursor {
            name,
            scrollable,
            holdable,
        })
    }

    pub async fn fetch_cursor(
        &mut self,
        cursor: &ServerCursor,
        direction: FetchDirection,
    ) -> PgResult<ResultBatch> {
        let moves_back = match direction {
            FetchDirection::Backward(_) => true,
            FetchDirection::Absolute(n) | FetchDirection::Relative(n) => n < 0,
            FetchDirection::Forward(_) | FetchDirection::All => false,
        };
        if moves_back && !cursor.scrollable {
            return Err(PgError::Structural(format!(
                "Cursor {} is not scrollable",
                cursor.name
            )));
        }
        let sql = format!("FETCH {} FROM {}", direction.to_sql(), cursor.name);
        self.query(&sql, &[]).await
    }

    pub async fn close_cursor(&mut self, cursor: &ServerCursor) -> PgResult<()> {
        self.execute_command(&format!("CLOSE {}", cursor.name))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_direction_sql() {
        assert_eq!(FetchDirection::Forward(10).to_sql(), "FORWARD 10");
        assert_eq!(FetchDirection::Absolute(-1).to_sql(), "ABSOLUTE -1");
        assert_eq!(FetchDirection::All.to_sql(), "ALL");
    }
}
