//! Lazy type loading from the system catalogs.
//!
//! Types the registry does not know are read from `pg_type` and
//! `pg_attribute` over the simple query protocol. Element, base and
//! attribute types are discovered first and built bottom-up, so a type is
//! only registered once everything it references is.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use super::error::{PgError, PgResult};
use super::registry::{Attribute, Category, Registry, Type};
use super::session::{Session, SimpleResult, Transport};
use super::sql_text::quote_literal;
use super::types::{Kind, Oid};

const TYPE_QUERY: &str = "SELECT t.oid, t.typname, n.nspname, t.typlen, t.typtype, t.typcategory, \
     t.typdelim, t.typrelid, t.typelem, t.typarray, t.typbasetype \
     FROM pg_catalog.pg_type t \
     LEFT JOIN pg_catalog.pg_namespace n ON n.oid = t.typnamespace \
     WHERE t.oid = ";

const ATTRIBUTE_QUERY: &str = "SELECT a.attname, a.atttypid \
     FROM pg_catalog.pg_attribute a \
     WHERE a.attnum > 0 AND NOT a.attisdropped AND a.attrelid = ";

/// One `pg_type` row.
#[derive(Debug, Clone)]
struct TypeRow {
    oid: Oid,
    name: String,
    namespace: String,
    length: i16,
    typtype: char,
    category: char,
    delimiter: char,
    relation: Oid,
    element: Oid,
    array: Oid,
    base: Oid,
}

impl TypeRow {
    fn from_text(values: &[Option<String>]) -> PgResult<Self> {
        if values.len() < 11 {
            return Err(PgError::Protocol(format!(
                "pg_type row has {} columns",
                values.len()
            )));
        }
        Ok(Self {
            oid: parse_oid(&values[0])?,
            name: values[1].clone().unwrap_or_default(),
            namespace: values[2].clone().unwrap_or_default(),
            length: parse_number(&values[3])?,
            typtype: first_char(&values[4]),
            category: first_char(&values[5]),
            delimiter: values[6]
                .as_deref()
                .and_then(|d| d.chars().next())
                .unwrap_or(','),
            relation: parse_oid(&values[7])?,
            element: parse_oid(&values[8])?,
            array: parse_oid(&values[9])?,
            base: parse_oid(&values[10])?,
        })
    }

    fn kind(&self) -> Kind {
        match self.typtype {
            'c' => Kind::Composite,
            'd' => Kind::Domain,
            'e' => Kind::Enum,
            _ if self.category == 'A' && self.element != Oid::UNSPECIFIED => Kind::Array,
            _ => Kind::of_builtin(self.oid),
        }
    }

    fn is_composite(&self) -> bool {
        self.kind() == Kind::Composite && self.relation != Oid::UNSPECIFIED
    }

    /// Types that must be registered before this one can be built.
    fn dependencies(&self, attributes: &[(String, Oid)]) -> Vec<Oid> {
        match self.kind() {
            Kind::Array => vec![self.element],
            Kind::Domain => vec![self.base],
            Kind::Composite => attributes.iter().map(|(_, oid)| *oid).collect(),
            _ => Vec::new(),
        }
    }

    fn build(&self, attributes: &[(String, Oid)], registry: &Registry) -> PgResult<Type> {
        let resolve = |oid: Oid| {
            registry.get(oid).ok_or_else(|| {
                PgError::Protocol(format!(
                    "Type {} references unresolved type {}",
                    self.name, oid.0 as u32
                ))
            })
        };

        let kind = self.kind();
        let element = match kind {
            Kind::Array => Some(resolve(self.element)?),
            _ => None,
        };
        let base = match kind {
            Kind::Domain => Some(resolve(self.base)?),
            _ => None,
        };
        let attributes = match kind {
            Kind::Composite => attributes
                .iter()
                .map(|(name, oid)| {
                    Ok(Attribute {
                        name: name.clone(),
                        type_: resolve(*oid)?,
                    })
                })
                .collect::<PgResult<Vec<_>>>()?,
            _ => Vec::new(),
        };

        Ok(Type {
            oid: self.oid,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            kind,
            category: Category::from(self.category),
            length: self.length,
            delimiter: self.delimiter,
            array_oid: self.array,
            element,
            base,
            attributes,
            relation_oid: self.relation,
        })
    }
}

impl<S: Transport> Session<S> {
    /// Registered type for `oid`, loading it from the catalog on a miss.
    pub async fn resolve_type(&mut self, oid: Oid) -> PgResult<Arc<Type>> {
        match self.registry.get(oid) {
            Some(ty) => Ok(ty),
            None => self.load_type(oid).await,
        }
    }

    /// Load a type and everything it references from the catalog.
    ///
    /// Loading the same OID again returns the registered node.
    pub async fn load_type(&mut self, oid: Oid) -> PgResult<Arc<Type>> {
        self.ensure_open()?;
        if let Some(ty) = self.registry.get(oid) {
            return Ok(ty);
        }

        let mut pending = vec![oid];
        let mut seen = HashSet::new();
        let mut loaded = Vec::new();
        while let Some(next) = pending.pop() {
            if !seen.insert(next) || self.registry.get(next).is_some() {
                continue;
            }
            let row = self
                .fetch_type_row(next)
                .await?
                .ok_or_else(|| PgError::UnknownType(format!("oid {}", next.0 as u32)))?;
            let attributes = if row.is_composite() {
                self.fetch_attributes(row.relation).await?
            } else {
                Vec::new()
            };
            pending.extend(row.dependencies(&attributes));
            loaded.push((row, attributes));
        }

        // dependencies were discovered after their dependents
        while !loaded.is_empty() {
            let before = loaded.len();
            let mut deferred = Vec::new();
            for (row, attributes) in loaded.into_iter().rev() {
                let ready = row
                    .dependencies(&attributes)
                    .iter()
                    .all(|dep| self.registry.get(*dep).is_some());
                if !ready {
                    deferred.push((row, attributes));
                    continue;
                }
                let ty = self.registry.insert(row.build(&attributes, &self.registry)?);
                info!(
                    oid = ty.oid.0 as u32,
                    name = %ty.qualified_name(),
                    kind = ?ty.kind,
                    "loaded type"
                );
            }
            if deferred.len() == before {
                return Err(PgError::Protocol(format!(
                    "Cyclic type definition involving oid {}",
                    oid.0 as u32
                )));
            }
            deferred.reverse();
            loaded = deferred;
        }

        self.registry
            .get(oid)
            .ok_or_else(|| PgError::UnknownType(format!("oid {}", oid.0 as u32)))
    }

    /// Load a type by name, optionally schema-qualified, following the search path.
    pub async fn load_type_by_name(&mut self, name: &str) -> PgResult<Arc<Type>> {
        self.ensure_open()?;
        if let Some(ty) = self.registry.get_by_name(name) {
            return Ok(ty);
        }

        let sql = format!(
            "SELECT pg_catalog.to_regtype({})::pg_catalog.oid",
            quote_literal(name)
        );
        let rows = text_rows(self.simple_exchange(&sql).await?);
        let oid = match rows.first().and_then(|row| row.first()) {
            Some(Some(text)) => parse_oid(&Some(text.clone()))?,
            _ => return Err(PgError::UnknownType(name.to_string())),
        };
        self.load_type(oid).await
    }

    async fn fetch_type_row(&mut self, oid: Oid) -> PgResult<Option<TypeRow>> {
        let sql = format!("{}{}", TYPE_QUERY, oid.0 as u32);
        let rows = text_rows(self.simple_exchange(&sql).await?);
        rows.first().map(|row| TypeRow::from_text(row)).transpose()
    }

    async fn fetch_attributes(&mut self, relation: Oid) -> PgResult<Vec<(String, Oid)>> {
        let sql = format!("{}{} ORDER BY a.attnum", ATTRIBUTE_QUERY, relation.0 as u32);
        text_rows(self.simple_exchange(&sql).await?)
            .into_iter()
            .map(|row| {
                let name = row.first().cloned().flatten().unwrap_or_default();
                let oid = parse_oid(row.get(1).unwrap_or(&None))?;
                Ok((name, oid))
            })
            .collect()
    }
}

/// Rows of the last statement as UTF-8 text.
fn text_rows(results: Vec<SimpleResult>) -> Vec<Vec<Option<String>>> {
    results
        .into_iter()
        .last()
        .map(|result| {
            result
                .rows
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|v| v.map(|b| String::from_utf8_lossy(&b).into_owned()))
                        .collect()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_oid(value: &Option<String>) -> PgResult<Oid> {
    let text = value.as_deref().unwrap_or("0");
    text.trim()
        .parse::<u32>()
        .map(|v| Oid(v as i32))
        .map_err(|_| PgError::Protocol(format!("Invalid oid in catalog row: {}", text)))
}

fn parse_number(value: &Option<String>) -> PgResult<i16> {
    let text = value.as_deref().unwrap_or("-1");
    text.trim()
        .parse()
        .map_err(|_| PgError::Protocol(format!("Invalid number in catalog row: {}", text)))
}

fn first_char(value: &Option<String>) -> char {
    value.as_deref().and_then(|v| v.chars().next()).unwrap_or('\0')
}
