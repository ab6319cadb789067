//! Statement descriptions and the session's statement arena.
//!
//! This module provides:
//! - `StatementCacheKey`: SQL text plus parameter types, the key of every statement cache
//! - `StatementDescription` / `PreparedStatementDescription`: results of describe and prepare
//! - `StatementRegistry`: arena of open statements owned by a session

use std::collections::HashMap;
use std::sync::Arc;

use super::protocol::{FieldDescription, Format};
use super::registry::Type;
use super::sql_text::SqlText;
use super::types::Oid;

/// Column metadata shared by every batch of a statement.
pub type SharedColumns = Arc<Vec<ColumnDesc>>;

/// One result column with its resolved type and the format it is fetched in.
#[derive(Debug, Clone)]
pub struct ColumnDesc {
    pub name: String,
    pub type_: Arc<Type>,
    pub format: Format,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_modifier: i32,
}

impl ColumnDesc {
    /// Column from a RowDescription field; binary when the type allows it.
    pub fn new(field: &FieldDescription, type_: Arc<Type>) -> Self {
        let format = if type_.supports_binary() {
            Format::Binary
        } else {
            Format::Text
        };
        Self {
            name: field.name.clone(),
            type_,
            format,
            table_oid: field.table_oid,
            column_attr: field.column_attr,
            type_modifier: field.type_modifier,
        }
    }

    pub fn type_oid(&self) -> Oid {
        self.type_.oid
    }
}

// ============================================================================
// Cache key and descriptions
// ============================================================================

/// Statement text plus the parameter types it is bound with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementCacheKey {
    pub sql: String,
    pub param_types: Vec<Oid>,
}

impl StatementCacheKey {
    pub fn new(sql: impl Into<String>, param_types: Vec<Oid>) -> Self {
        Self {
            sql: sql.into(),
            param_types,
        }
    }
}

/// Result of a describe step: parameter and result types.
///
/// Says nothing about whether the statement exists server-side.
#[derive(Debug, Clone)]
pub struct StatementDescription {
    pub param_types: Vec<Arc<Type>>,
    pub columns: SharedColumns,
}

impl StatementDescription {
    pub fn param_oids(&self) -> Vec<Oid> {
        self.param_types.iter().map(|t| t.oid).collect()
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn result_formats(&self) -> Vec<Format> {
        self.columns.iter().map(|c| c.format).collect()
    }
}

/// A description whose statement lives on the server under `name`.
#[derive(Debug, Clone)]
pub struct PreparedStatementDescription {
    pub name: String,
    pub description: Arc<StatementDescription>,
}

// ============================================================================
// Statement arena
// ============================================================================

/// Handle of a statement registered with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId(pub u64);

/// Progress of a statement towards server-side preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    Unprepared,
    Described,
    Prepared,
    Closed,
}

/// A statement owned by a session.
#[derive(Debug, Clone)]
pub struct Statement {
    pub id: StatementId,
    /// Text after escape processing
    pub text: SqlText,
    /// Rendered `text`, as sent to the server
    pub sql: String,
    /// True for `{? = call ...}` statements
    pub has_assign: bool,
    pub state: StatementState,
    pub description: Option<Arc<StatementDescription>>,
    pub prepared_name: Option<String>,
    /// Named portals opened by this statement and not yet closed
    pub portals: Vec<String>,
}

impl Statement {
    pub fn parameter_count(&self) -> usize {
        self.text.count_parameters()
    }
}

/// Open statements of one session, released explicitly.
#[derive(Debug, Default)]
pub struct StatementRegistry {
    statements: HashMap<StatementId, Statement>,
    next_id: u64,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, text: SqlText, has_assign: bool) -> StatementId {
        self.next_id += 1;
        let id = StatementId(self.next_id);
        let sql = text.render();
        self.statements.insert(
            id,
            Statement {
                id,
                text,
                sql,
                has_assign,
                state: StatementState::Unprepared,
                description: None,
                prepared_name: None,
                portals: Vec::new(),
            },
        );
        id
    }

    pub fn get(&self, id: StatementId) -> Option<&Statement> {
        self.statements.get(&id)
    }

    pub fn get_mut(&mut self, id: StatementId) -> Option<&mut Statement> {
        self.statements.get_mut(&id)
    }

    pub fn unregister(&mut self, id: StatementId) -> Option<Statement> {
        self.statements.remove(&id).map(|mut s| {
            s.state = StatementState::Closed;
            s
        })
    }

    /// Registered ids in creation order.
    pub fn ids(&self) -> Vec<StatementId> {
        let mut ids: Vec<_> = self.statements.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::registry::SharedRegistry;

    #[test]
    fn test_cache_key_equality() {
        let a = StatementCacheKey::new("SELECT $1", vec![Oid::INT4]);
        let b = StatementCacheKey::new("SELECT $1", vec![Oid::INT4]);
        let other_type = StatementCacheKey::new("SELECT $1", vec![Oid::INT8]);
        let other_text = StatementCacheKey::new("SELECT $1 ", vec![Oid::INT4]);
        assert_eq!(a, b);
        assert_ne!(a, other_type);
        assert_ne!(a, other_text);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
        assert_eq!(map.get(&other_type), None);
    }

    #[test]
    fn test_column_format_follows_type() {
        let registry = SharedRegistry::with_builtins();
        let field = FieldDescription {
            name: "n".to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: Oid::INT4,
            type_size: 4,
            type_modifier: -1,
            format: Format::Text,
        };
        let int4 = ColumnDesc::new(&field, registry.get(Oid::INT4).unwrap());
        assert_eq!(int4.format, Format::Binary);

        let inet = ColumnDesc::new(&field, registry.get(Oid::INET).unwrap());
        assert_eq!(inet.format, Format::Text);
        assert_eq!(inet.type_oid(), Oid::INET);
    }

    #[test]
    fn test_registry_lifecycle() {
        let mut registry = StatementRegistry::new();
        let first = registry.register(SqlText::parse("SELECT ?").unwrap(), false);
        let second = registry.register(SqlText::parse("SELECT 2").unwrap(), false);
        assert_ne!(first, second);
        assert_eq!(registry.ids(), vec![first, second]);

        let stmt = registry.get(first).unwrap();
        assert_eq!(stmt.sql, "SELECT $1");
        assert_eq!(stmt.parameter_count(), 1);
        assert_eq!(stmt.state, StatementState::Unprepared);

        let closed = registry.unregister(first).unwrap();
        assert_eq!(closed.state, StatementState::Closed);
        assert!(registry.get(first).is_none());
        assert!(registry.unregister(first).is_none());
        assert_eq!(registry.len(), 1);
    }
}
