//! Process-wide map from [`TypeId`] to the host's type handles.
//!
//! The host builds one registry at start-up from the list of types it knows about, then
//! shares it (typically behind an `Arc`) with every codec call that encodes type references.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

use crate::config::{DEFAULT_TYPE_NAME_DENY_LIST, PersistConfig};
use crate::type_id::TypeId;

/// A host-side handle to a runtime type.
pub trait TypeHandle: Clone + PartialEq + Send + Sync + 'static {
    /// Fully-qualified name; this is what gets hashed into a [`TypeId`].
    fn full_name(&self) -> &str;

    /// Whether the type belongs to the host's own type universe.
    ///
    /// Local types are written in the compact id form. Foreign types are written by name
    /// because their ids are not guaranteed to be stable across versions.
    fn is_local(&self) -> bool {
        true
    }
}

/// A type the host knows about at start-up, plus the old names it was saved under.
#[derive(Debug, Clone)]
pub struct KnownType<T> {
    pub handle: T,
    pub name: String,
    pub aliases: Vec<String>,
}

impl<T: TypeHandle> KnownType<T> {
    pub fn new(handle: T) -> Self {
        let name = handle.full_name().to_string();
        Self {
            handle,
            name,
            aliases: Vec::new(),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }
}

/// Two names that hash to the same id but belong to different types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeCollision {
    pub id: TypeId,
    pub previous: String,
    pub replacement: String,
}

type NameResolver<T> = Box<dyn Fn(&str, bool) -> Option<T> + Send + Sync>;

/// Maps type ids and names to host type handles.
pub struct TypeRegistry<T> {
    by_id: HashMap<TypeId, T>,
    by_full_name: HashMap<String, T>,
    by_short_name: HashMap<String, T>,
    id_cache: Mutex<HashMap<String, TypeId>>,
    collisions: Vec<TypeCollision>,
    deny_list: Vec<String>,
    fallback: Option<NameResolver<T>>,
}

impl<T: TypeHandle> TypeRegistry<T> {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_full_name: HashMap::new(),
            by_short_name: HashMap::new(),
            id_cache: Mutex::new(HashMap::new()),
            collisions: Vec::new(),
            deny_list: DEFAULT_TYPE_NAME_DENY_LIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fallback: None,
        }
    }

    pub fn with_config(config: &PersistConfig) -> Self {
        Self {
            deny_list: config.type_name_deny_list.clone(),
            ..Self::new()
        }
    }

    /// Build a registry from the host's type universe in one go.
    pub fn build(config: &PersistConfig, types: impl IntoIterator<Item = KnownType<T>>) -> Self {
        let mut registry = Self::with_config(config);
        let registered = registry.register_all(types);
        tracing::debug!(
            registered,
            ids = registry.by_id.len(),
            collisions = registry.collisions.len(),
            "type registry built"
        );
        registry
    }

    /// Register a type under `name` and each of `aliases`.
    ///
    /// An id that already maps to a different type is reported as a collision and
    /// overwritten: the newest registration wins.
    pub fn register(&mut self, ty: T, name: &str, aliases: &[&str]) {
        self.insert(ty.clone(), name);
        for alias in aliases {
            self.insert(ty.clone(), alias);
        }
    }

    /// Bulk registration; names matching the deny list are skipped. Returns how many types
    /// were registered.
    pub fn register_all(&mut self, types: impl IntoIterator<Item = KnownType<T>>) -> usize {
        let mut count = 0;
        for known in types {
            if self.is_denied(&known.name) {
                tracing::trace!(name = %known.name, "skipping synthetic type name");
                continue;
            }
            let aliases: Vec<&str> = known.aliases.iter().map(String::as_str).collect();
            self.register(known.handle, &known.name, &aliases);
            count += 1;
        }
        count
    }

    pub fn is_denied(&self, name: &str) -> bool {
        self.deny_list.iter().any(|frag| name.contains(frag.as_str()))
    }

    /// Install the resolver consulted when a legacy name is not in the registry.
    pub fn set_fallback_resolver<F>(&mut self, resolver: F)
    where
        F: Fn(&str, bool) -> Option<T> + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(resolver));
    }

    pub fn resolve(&self, id: TypeId) -> Option<&T> {
        self.by_id.get(&id)
    }

    /// Look a type up by name, as the legacy wire form does. `full` selects between the
    /// fully-qualified name and the last path segment.
    pub fn resolve_name(&self, name: &str, full: bool) -> Option<T> {
        let table = if full {
            &self.by_full_name
        } else {
            &self.by_short_name
        };
        if let Some(ty) = table.get(name) {
            return Some(ty.clone());
        }
        self.fallback.as_ref().and_then(|resolve| resolve(name, full))
    }

    /// Id for `name`, computed once per distinct name.
    pub fn id_of(&self, name: &str) -> TypeId {
        let mut cache = self.id_cache.lock();
        if let Some(id) = cache.get(name) {
            return *id;
        }
        let id = TypeId::of_name(name);
        cache.insert(name.to_string(), id);
        id
    }

    pub fn collisions(&self) -> &[TypeCollision] {
        &self.collisions
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn insert(&mut self, ty: T, name: &str) {
        let id = self.id_of(name);
        if let Some(previous) = self.by_id.get(&id) {
            if *previous != ty {
                tracing::warn!(
                    %id,
                    previous = previous.full_name(),
                    replacement = ty.full_name(),
                    name,
                    "type id collision, keeping newest registration"
                );
                self.collisions.push(TypeCollision {
                    id,
                    previous: previous.full_name().to_string(),
                    replacement: ty.full_name().to_string(),
                });
            }
        }
        self.by_id.insert(id, ty.clone());
        self.by_short_name.insert(short_name(name).to_string(), ty.clone());
        self.by_full_name.insert(name.to_string(), ty);
    }
}

impl<T: TypeHandle> Default for TypeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TypeHandle> fmt::Debug for TypeRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("ids", &self.by_id.len())
            .field("collisions", &self.collisions.len())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Last path segment of a type name, accepting both `.` and `::` separators.
pub fn short_name(name: &str) -> &str {
    let after_colons = name.rsplit("::").next().unwrap_or(name);
    after_colons.rsplit('.').next().unwrap_or(after_colons)
}
