//! Portals, result batches, rows and the result cursor.

use std::collections::VecDeque;

use smallvec::SmallVec;

use super::coerce::{CompositeMappings, FromValue};
use super::error::{PgError, PgResult};
use super::protocol::Notice;
use super::session::{Session, Transport};
use super::statement::{SharedColumns, StatementId};
use super::types::PgValue;

/// Execution state of a portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    Bound,
    /// Row limit reached with rows left; resumable by fetch
    Suspended,
    Completed,
    Closed,
}

/// Options that decide whether an execution needs a named portal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorOptions {
    /// Rows per execute; 0 fetches everything
    pub fetch_size: i32,
    pub scrollable: bool,
    pub holdable: bool,
}

impl CursorOptions {
    pub fn with_fetch_size(fetch_size: i32) -> Self {
        Self {
            fetch_size,
            ..Self::default()
        }
    }

    /// The unnamed portal is closed by the next Bind, so anything that must
    /// outlive one round trip needs a name.
    pub fn needs_named_portal(&self) -> bool {
        self.fetch_size > 0 || self.scrollable || self.holdable
    }
}

/// Named server-side portal owned by a session.
#[derive(Debug, Clone)]
pub struct Portal {
    pub name: String,
    pub statement: StatementId,
    pub columns: SharedColumns,
    pub fetch_size: i32,
    pub state: PortalState,
}

/// A decoded row.
///
/// Uses SmallVec so rows of up to 16 columns avoid a heap allocation.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: SmallVec<[PgValue; 16]>,
}

impl Row {
    pub fn new(columns: SharedColumns, values: SmallVec<[PgValue; 16]>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    pub fn values(&self) -> &[PgValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<PgValue> {
        self.values.into_vec()
    }

    pub fn value(&self, index: usize) -> Option<&PgValue> {
        self.values.get(index)
    }

    fn column(&self, index: usize) -> PgResult<&PgValue> {
        self.values.get(index).ok_or_else(|| {
            PgError::Structural(format!(
                "Column index {} out of range ({} columns)",
                index,
                self.values.len()
            ))
        })
    }

    /// Column value converted to a host type.
    pub fn get<T: FromValue>(&self, index: usize) -> PgResult<T> {
        T::from_value(self.column(index)?)
    }

    /// Composite column converted by the mapping registered for its type name.
    pub fn get_mapped<T: 'static>(&self, index: usize, mappings: &CompositeMappings) -> PgResult<T> {
        let target = std::any::type_name::<T>();
        let record = match self.column(index)? {
            PgValue::Record(record) => record,
            other => return Err(PgError::coercion(other.kind_name(), target)),
        };
        let source = record.type_name.as_deref().unwrap_or("record");
        mappings
            .map_as::<T>(record)?
            .ok_or_else(|| PgError::coercion(source, format!("{} (no mapping for {})", target, source)))
    }

    /// Column value by name; the first column with that name wins.
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> PgResult<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| PgError::Structural(format!("No column named {}", name)))?;
        self.get(index)
    }
}

/// Rows from one execute or fetch.
#[derive(Debug, Clone)]
pub struct ResultBatch {
    pub columns: SharedColumns,
    pub rows: Vec<Row>,
    /// CommandComplete tag, absent while suspended
    pub command_tag: Option<String>,
    /// Only reported once the portal completed
    pub rows_affected: Option<u64>,
    /// False when the portal was suspended with rows left
    pub complete: bool,
    /// Named portal to resume a suspended batch from
    pub portal: Option<String>,
    pub warnings: Vec<Notice>,
}

impl ResultBatch {
    pub fn new(columns: SharedColumns) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            command_tag: None,
            rows_affected: None,
            complete: false,
            portal: None,
            warnings: Vec::new(),
        }
    }

    /// Mark complete with the server's command tag.
    pub fn finish(&mut self, tag: String) {
        self.rows_affected = rows_affected(&tag);
        self.command_tag = Some(tag);
        self.complete = true;
    }

    pub fn is_suspended(&self) -> bool {
        !self.complete && self.portal.is_some()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Row iterator over an execution that fetches the next batch from its
/// portal when the rows at hand run out.
pub struct ResultCursor<'a, S: Transport> {
    session: &'a mut Session<S>,
    columns: SharedColumns,
    rows: VecDeque<Row>,
    /// Open while the portal is suspended
    portal: Option<String>,
    fetch_size: i32,
    command_tag: Option<String>,
    rows_affected: Option<u64>,
}

impl<'a, S: Transport> ResultCursor<'a, S> {
    pub(crate) fn new(session: &'a mut Session<S>, batch: ResultBatch, fetch_size: i32) -> Self {
        let mut cursor = Self {
            session,
            columns: std::sync::Arc::clone(&batch.columns),
            rows: VecDeque::new(),
            portal: None,
            fetch_size,
            command_tag: None,
            rows_affected: None,
        };
        cursor.absorb(batch);
        cursor
    }

    fn absorb(&mut self, batch: ResultBatch) {
        self.rows.extend(batch.rows);
        if batch.complete {
            self.portal = None;
            self.command_tag = batch.command_tag;
            self.rows_affected = batch.rows_affected;
        } else if batch.portal.is_some() {
            self.portal = batch.portal;
        }
    }

    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    /// True once the portal has no rows left to fetch.
    pub fn is_exhausted(&self) -> bool {
        self.portal.is_none()
    }

    /// Known once the portal completed.
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// Next row, fetching from the suspended portal when needed.
    pub async fn next(&mut self) -> PgResult<Option<Row>> {
        loop {
            if let Some(row) = self.rows.pop_front() {
                return Ok(Some(row));
            }
            let Some(portal) = self.portal.clone() else {
                return Ok(None);
            };
            let batch = self.session.fetch(&portal, self.fetch_size).await?;
            if batch.complete {
                self.portal = None;
            }
            self.absorb(batch);
        }
    }

    /// Drain the remaining rows.
    pub async fn collect(mut self) -> PgResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Close the portal without reading the rest.
    pub async fn close(mut self) -> PgResult<()> {
        if let Some(portal) = self.portal.take() {
            self.session.close_portal(&portal).await?;
        }
        Ok(())
    }
}

impl<S: Transport> std::fmt::Debug for ResultCursor<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCursor")
            .field("buffered", &self.rows.len())
            .field("portal", &self.portal)
            .field("fetch_size", &self.fetch_size)
            .finish()
    }
}

/// Row count from a command tag such as `INSERT 0 3` or `SELECT 5`.
pub fn rows_affected(tag: &str) -> Option<u64> {
    let mut words = tag.split_whitespace();
    let command = words.next()?;
    match command {
        "INSERT" | "UPDATE" | "DELETE" | "SELECT" | "MOVE" | "FETCH" | "COPY" | "MERGE" => {
            words.last().and_then(|n| n.parse().ok())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::pg::protocol::{FieldDescription, Format};
    use crate::pg::registry::SharedRegistry;
    use crate::pg::statement::ColumnDesc;
    use crate::pg::types::Oid;

    fn columns(names: &[&str]) -> SharedColumns {
        let registry = SharedRegistry::with_builtins();
        Arc::new(
            names
                .iter()
                .map(|name| {
                    let field = FieldDescription {
                        name: name.to_string(),
                        table_oid: 0,
                        column_attr: 0,
                        type_oid: Oid::INT4,
                        type_size: 4,
                        type_modifier: -1,
                        format: Format::Binary,
                    };
                    ColumnDesc::new(&field, registry.get(Oid::INT4).unwrap())
                })
                .collect(),
        )
    }

    #[test]
    fn test_rows_affected_from_tag() {
        assert_eq!(rows_affected("INSERT 0 3"), Some(3));
        assert_eq!(rows_affected("UPDATE 7"), Some(7));
        assert_eq!(rows_affected("SELECT 1"), Some(1));
        assert_eq!(rows_affected("CREATE TABLE"), None);
        assert_eq!(rows_affected("BEGIN"), None);
    }

    #[test]
    fn test_batch_finish() {
        let mut batch = ResultBatch::new(columns(&["n"]));
        assert!(!batch.complete);
        assert!(batch.rows_affected.is_none());
        batch.finish("DELETE 2".to_string());
        assert!(batch.complete);
        assert_eq!(batch.rows_affected, Some(2));
        assert_eq!(batch.command_tag.as_deref(), Some("DELETE 2"));
    }

    #[test]
    fn test_row_access() {
        let row = Row::new(
            columns(&["a", "b"]),
            SmallVec::from_vec(vec![PgValue::Int4(5), PgValue::Null]),
        );
        assert_eq!(row.get::<i32>(0).unwrap(), 5);
        assert_eq!(row.get_by_name::<i64>("a").unwrap(), 5);
        assert_eq!(row.get::<Option<i32>>(1).unwrap(), None);
        assert!(matches!(row.get::<i32>(2), Err(PgError::Structural(_))));
        assert!(matches!(row.get_by_name::<i32>("zz"), Err(PgError::Structural(_))));
    }

    #[test]
    fn test_named_portal_rule() {
        assert!(!CursorOptions::default().needs_named_portal());
        assert!(CursorOptions::with_fetch_size(10).needs_named_portal());
        assert!(CursorOptions {
            scrollable: true,
            ..Default::default()
        }
        .needs_named_portal());
    }
}
