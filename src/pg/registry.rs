//! Type graph and registries.
//!
//! A [`Type`] is immutable once built and shared through `Arc`, so element,
//! base and attribute references form a DAG. Resolved types live in a
//! process-wide [`SharedRegistry`] per server; types from temporary schemas
//! and anonymous records stay in the owning session's [`Registry`].

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use super::types::{builtin_array_oid, Kind, Oid};

/// `pg_type.typcategory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Array,
    Boolean,
    Composite,
    DateTime,
    Enum,
    Geometric,
    Network,
    Numeric,
    Pseudo,
    Range,
    String,
    Timespan,
    UserDefined,
    BitString,
    Unknown,
}

impl From<char> for Category {
    fn from(c: char) -> Self {
        match c {
            'A' => Category::Array,
            'B' => Category::Boolean,
            'C' => Category::Composite,
            'D' => Category::DateTime,
            'E' => Category::Enum,
            'G' => Category::Geometric,
            'I' => Category::Network,
            'N' => Category::Numeric,
            'P' => Category::Pseudo,
            'R' => Category::Range,
            'S' => Category::String,
            'T' => Category::Timespan,
            'U' => Category::UserDefined,
            'V' => Category::BitString,
            _ => Category::Unknown,
        }
    }
}

/// Named, typed attribute of a composite type.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub type_: Arc<Type>,
}

/// A node in the type graph.
#[derive(Debug, Clone)]
pub struct Type {
    pub oid: Oid,
    pub name: String,
    pub namespace: String,
    pub kind: Kind,
    pub category: Category,
    /// `typlen`, -1 for varlena
    pub length: i16,
    /// Array element delimiter
    pub delimiter: char,
    /// Array type whose elements are this type, if any
    pub array_oid: Oid,
    /// Element type of an array
    pub element: Option<Arc<Type>>,
    /// Base type of a domain
    pub base: Option<Arc<Type>>,
    /// Attributes of a composite, in `attnum` order
    pub attributes: Vec<Attribute>,
    /// `typrelid` of a composite
    pub relation_oid: Oid,
}

impl Type {
    pub fn scalar(oid: Oid, name: &str, kind: Kind, category: Category, length: i16) -> Self {
        Self {
            oid,
            name: name.to_string(),
            namespace: "pg_catalog".to_string(),
            kind,
            category,
            length,
            delimiter: ',',
            array_oid: builtin_array_oid(oid),
            element: None,
            base: None,
            attributes: Vec::new(),
            relation_oid: Oid::UNSPECIFIED,
        }
    }

    pub fn array_of(oid: Oid, element: Arc<Type>) -> Self {
        Self {
            oid,
            name: format!("_{}", element.name),
            namespace: element.namespace.clone(),
            kind: Kind::Array,
            category: Category::Array,
            length: -1,
            delimiter: ',',
            array_oid: Oid::UNSPECIFIED,
            element: Some(element),
            base: None,
            attributes: Vec::new(),
            relation_oid: Oid::UNSPECIFIED,
        }
    }

    /// `namespace.name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Domains unwrap to their base type.
    pub fn resolved(&self) -> &Type {
        let mut ty = self;
        while let (Kind::Domain, Some(base)) = (ty.kind, ty.base.as_deref()) {
            ty = base;
        }
        ty
    }

    /// Whether values of this type can travel in binary format.
    pub fn supports_binary(&self) -> bool {
        let ty = self.resolved();
        match ty.kind {
            Kind::Unknown | Kind::Domain => false,
            Kind::Array => ty
                .element
                .as_deref()
                .map(Type::supports_binary)
                .unwrap_or(false),
            Kind::Composite => ty.attributes.iter().all(|a| a.type_.supports_binary()),
            _ => true,
        }
    }

    /// Types that must not be shared across sessions.
    pub fn is_transient(&self) -> bool {
        self.namespace.starts_with("pg_temp")
    }
}

/// Lookup by OID or name.
pub trait TypeLookup {
    fn lookup(&self, oid: Oid) -> Option<Arc<Type>>;
    fn lookup_name(&self, name: &str) -> Option<Arc<Type>>;
}

// ============================================================================
// Process-wide registry
// ============================================================================

static SHARED_REGISTRIES: Lazy<Mutex<HashMap<String, Arc<SharedRegistry>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Resolved types of one server, shared by all of its sessions.
///
/// Read-mostly; the first writer of an OID wins so resolution stays
/// idempotent when two sessions load the same type concurrently.
#[derive(Debug, Default)]
pub struct SharedRegistry {
    by_oid: RwLock<HashMap<Oid, Arc<Type>>>,
    by_name: RwLock<HashMap<String, Arc<Type>>>,
}

impl SharedRegistry {
    /// Registry for the server identified by `key`, created with the built-in types.
    pub fn for_server(key: &str) -> Arc<SharedRegistry> {
        let mut registries = SHARED_REGISTRIES.lock();
        Arc::clone(
            registries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(SharedRegistry::with_builtins())),
        )
    }

    pub fn with_builtins() -> Self {
        let registry = SharedRegistry::default();
        for ty in builtin_types() {
            registry.insert(ty);
        }
        registry
    }

    pub fn get(&self, oid: Oid) -> Option<Arc<Type>> {
        self.by_oid.read().get(&oid).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Type>> {
        self.by_name.read().get(name).cloned()
    }

    /// Insert `ty`, returning the node already registered under its OID if any.
    pub fn insert(&self, ty: Type) -> Arc<Type> {
        let mut by_oid = self.by_oid.write();
        if let Some(existing) = by_oid.get(&ty.oid) {
            return Arc::clone(existing);
        }
        let ty = Arc::new(ty);
        by_oid.insert(ty.oid, Arc::clone(&ty));
        drop(by_oid);

        let mut by_name = self.by_name.write();
        by_name
            .entry(ty.qualified_name())
            .or_insert_with(|| Arc::clone(&ty));
        by_name
            .entry(ty.name.clone())
            .or_insert_with(|| Arc::clone(&ty));
        ty
    }

    pub fn len(&self) -> usize {
        self.by_oid.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_oid.read().is_empty()
    }
}

impl TypeLookup for SharedRegistry {
    fn lookup(&self, oid: Oid) -> Option<Arc<Type>> {
        self.get(oid)
    }

    fn lookup_name(&self, name: &str) -> Option<Arc<Type>> {
        self.get_by_name(name)
    }
}

// ============================================================================
// Per-session registry
// ============================================================================

/// Session view: shared types plus the session's transient ones.
#[derive(Debug)]
pub struct Registry {
    shared: Arc<SharedRegistry>,
    local_by_oid: HashMap<Oid, Arc<Type>>,
    local_by_name: HashMap<String, Arc<Type>>,
}

impl Registry {
    pub fn new(shared: Arc<SharedRegistry>) -> Self {
        Self {
            shared,
            local_by_oid: HashMap::new(),
            local_by_name: HashMap::new(),
        }
    }

    pub fn shared(&self) -> &Arc<SharedRegistry> {
        &self.shared
    }

    pub fn get(&self, oid: Oid) -> Option<Arc<Type>> {
        self.local_by_oid
            .get(&oid)
            .cloned()
            .or_else(|| self.shared.get(oid))
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Type>> {
        self.local_by_name
            .get(name)
            .cloned()
            .or_else(|| self.shared.get_by_name(name))
    }

    /// Register a resolved type; transient types stay session-local.
    pub fn insert(&mut self, ty: Type) -> Arc<Type> {
        if !ty.is_transient() {
            return self.shared.insert(ty);
        }
        if let Some(existing) = self.local_by_oid.get(&ty.oid) {
            return Arc::clone(existing);
        }
        let ty = Arc::new(ty);
        self.local_by_oid.insert(ty.oid, Arc::clone(&ty));
        self.local_by_name
            .insert(ty.qualified_name(), Arc::clone(&ty));
        self.local_by_name
            .entry(ty.name.clone())
            .or_insert_with(|| Arc::clone(&ty));
        ty
    }

    /// Drop session-local types (on close).
    pub fn clear_local(&mut self) {
        self.local_by_oid.clear();
        self.local_by_name.clear();
    }

    pub fn local_len(&self) -> usize {
        self.local_by_oid.len()
    }
}

impl TypeLookup for Registry {
    fn lookup(&self, oid: Oid) -> Option<Arc<Type>> {
        self.get(oid)
    }

    fn lookup_name(&self, name: &str) -> Option<Arc<Type>> {
        self.get_by_name(name)
    }
}

/// Built-in scalar types with their array types.
fn builtin_types() -> Vec<Type> {
    use Category as C;
    let scalars = [
        Type::scalar(Oid::BOOL, "bool", Kind::Bool, C::Boolean, 1),
        Type::scalar(Oid::BYTEA, "bytea", Kind::Bytea, C::UserDefined, -1),
        Type::scalar(Oid::CHAR, "char", Kind::Char, C::String, 1),
        Type::scalar(Oid::NAME, "name", Kind::Text, C::String, 64),
        Type::scalar(Oid::INT8, "int8", Kind::Int8, C::Numeric, 8),
        Type::scalar(Oid::INT2, "int2", Kind::Int2, C::Numeric, 2),
        Type::scalar(Oid::INT4, "int4", Kind::Int4, C::Numeric, 4),
        Type::scalar(Oid::TEXT, "text", Kind::Text, C::String, -1),
        Type::scalar(Oid::OID_TYPE, "oid", Kind::Oid, C::Numeric, 4),
        Type::scalar(Oid::JSON, "json", Kind::Json, C::UserDefined, -1),
        Type::scalar(Oid::FLOAT4, "float4", Kind::Float4, C::Numeric, 4),
        Type::scalar(Oid::FLOAT8, "float8", Kind::Float8, C::Numeric, 8),
        Type::scalar(Oid::UNKNOWN, "unknown", Kind::Unknown, C::Unknown, -2),
        Type::scalar(Oid::BPCHAR, "bpchar", Kind::Text, C::String, -1),
        Type::scalar(Oid::VARCHAR, "varchar", Kind::Text, C::String, -1),
        Type::scalar(Oid::DATE, "date", Kind::Date, C::DateTime, 4),
        Type::scalar(Oid::TIME, "time", Kind::Time, C::DateTime, 8),
        Type::scalar(Oid::TIMESTAMP, "timestamp", Kind::Timestamp, C::DateTime, 8),
        Type::scalar(Oid::TIMESTAMPTZ, "timestamptz", Kind::TimestampTz, C::DateTime, 8),
        Type::scalar(Oid::INTERVAL, "interval", Kind::Interval, C::Timespan, 16),
        Type::scalar(Oid::TIMETZ, "timetz", Kind::TimeTz, C::DateTime, 12),
        Type::scalar(Oid::NUMERIC, "numeric", Kind::Numeric, C::Numeric, -1),
        Type::scalar(Oid::REFCURSOR, "refcursor", Kind::Text, C::UserDefined, -1),
        Type::scalar(Oid::UUID, "uuid", Kind::Uuid, C::UserDefined, 16),
        Type::scalar(Oid::JSONB, "jsonb", Kind::Jsonb, C::UserDefined, -1),
        // Network types travel as text
        Type::scalar(Oid::INET, "inet", Kind::Unknown, C::Network, -1),
        Type::scalar(Oid::CIDR, "cidr", Kind::Unknown, C::Network, -1),
        Type::scalar(Oid::MACADDR, "macaddr", Kind::Unknown, C::UserDefined, 6),
        Type::scalar(Oid::MONEY, "money", Kind::Unknown, C::Numeric, 8),
        Type::scalar(Oid::VOID, "void", Kind::Void, C::Pseudo, 4),
        // Anonymous records carry field OIDs inline
        Type::scalar(Oid::RECORD, "record", Kind::Composite, C::Pseudo, -1),
    ];

    let mut types = Vec::with_capacity(scalars.len() * 2);
    for scalar in scalars {
        let array_oid = scalar.array_oid;
        let scalar = Arc::new(scalar);
        if !array_oid.is_unspecified() {
            types.push(Type::array_of(array_oid, Arc::clone(&scalar)));
        }
        types.push(Arc::unwrap_or_clone(scalar));
    }
    types
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_resolve_by_oid_and_name() {
        let registry = SharedRegistry::with_builtins();
        let int4 = registry.get(Oid::INT4).unwrap();
        assert_eq!(int4.kind, Kind::Int4);
        assert!(Arc::ptr_eq(&int4, &registry.get_by_name("int4").unwrap()));
        assert!(Arc::ptr_eq(
            &int4,
            &registry.get_by_name("pg_catalog.int4").unwrap()
        ));

        let array = registry.get(Oid::INT4_ARRAY).unwrap();
        assert_eq!(array.kind, Kind::Array);
        assert_eq!(array.name, "_int4");
        assert_eq!(array.element.as_ref().unwrap().oid, Oid::INT4);
    }

    #[test]
    fn test_first_writer_wins() {
        let registry = SharedRegistry::default();
        let first = registry.insert(Type::scalar(Oid(90001), "mood", Kind::Enum, Category::Enum, 4));
        let second = registry.insert(Type::scalar(Oid(90001), "other", Kind::Text, Category::String, -1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.name, "mood");
    }

    #[test]
    fn test_shared_registry_per_server_key() {
        let a = SharedRegistry::for_server("registry-test-a:5432/x");
        let b = SharedRegistry::for_server("registry-test-a:5432/x");
        let c = SharedRegistry::for_server("registry-test-c:5432/x");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_transient_types_stay_local() {
        let shared = Arc::new(SharedRegistry::with_builtins());
        let mut session = Registry::new(Arc::clone(&shared));

        let mut temp = Type::scalar(Oid(91000), "scratch", Kind::Composite, Category::Composite, -1);
        temp.namespace = "pg_temp_3".to_string();
        temp.relation_oid = Oid(91001);
        session.insert(temp);

        assert!(session.get(Oid(91000)).is_some());
        assert!(shared.get(Oid(91000)).is_none());
        assert_eq!(session.local_len(), 1);

        session.clear_local();
        assert!(session.get(Oid(91000)).is_none());
    }

    #[test]
    fn test_domain_resolution_and_binary_support() {
        let registry = SharedRegistry::with_builtins();
        let int4 = registry.get(Oid::INT4).unwrap();
        let mut domain = Type::scalar(Oid(92000), "positive", Kind::Domain, Category::Numeric, 4);
        domain.base = Some(int4);
        assert_eq!(domain.resolved().oid, Oid::INT4);
        assert!(domain.supports_binary());

        let inet = registry.get(Oid::INET).unwrap();
        assert!(!inet.supports_binary());
    }
}
