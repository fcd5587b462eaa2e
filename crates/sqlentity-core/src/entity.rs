//! Entities, shared entity handles, and lazy proxies.
//!
//! Field access goes through an explicit accessor table: every entity type
//! implements [`Entity`] with `get_field`/`set_field` (scalar columns) and
//! `get_association`/`set_association` (related entities). There is no
//! runtime reflection.
//!
//! Callers and the engine hold entities through [`EntityRef`], a shared
//! handle (`Arc` + lock) that doubles as the lazy proxy wrapper: a handle
//! created with [`EntityRef::proxy`] carries only its identifier until the
//! first real access, at which point the loader runs once and the loaded
//! state replaces the placeholder in place, so every clone of the handle sees
//! the loaded entity.

use crate::error::{EntityErrorKind, Error};
use crate::{Result, Value};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Accessor table for a mapped domain type.
pub trait Entity: Any + Send + Sync + fmt::Debug {
    /// Concrete entity type name, as registered in the metadata registry.
    fn entity_type(&self) -> &'static str;

    /// Read a mapped scalar field. `None` means the field does not exist.
    fn get_field(&self, field: &str) -> Option<Value>;

    /// Write a mapped scalar field.
    fn set_field(&mut self, field: &str, value: Value) -> Result<()>;

    /// Read an association field. `None` means the field does not exist.
    fn get_association(&self, field: &str) -> Option<Association> {
        let _ = field;
        None
    }

    /// Write an association field.
    fn set_association(&mut self, field: &str, value: Association) -> Result<()> {
        let _ = value;
        Err(unknown_field(self.entity_type(), field))
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Build the error an accessor returns for a field it does not map.
pub fn unknown_field(entity_type: &str, field: &str) -> Error {
    Error::entity(
        EntityErrorKind::UnknownField,
        entity_type,
        format!("{entity_type} has no field '{field}'"),
    )
}

/// The value of an association field.
#[derive(Debug, Clone, Default)]
pub enum Association {
    /// A to-one reference (`None` when unset).
    One(Option<EntityRef>),
    /// A to-many collection.
    Many(Vec<EntityRef>),
    /// The association has not been loaded; nothing is known about it.
    #[default]
    Unloaded,
}

impl Association {
    pub fn one(target: &EntityRef) -> Self {
        Association::One(Some(target.clone()))
    }

    pub fn many(targets: impl IntoIterator<Item = EntityRef>) -> Self {
        Association::Many(targets.into_iter().collect())
    }

    /// All referenced handles, whichever the shape.
    pub fn refs(&self) -> Vec<EntityRef> {
        match self {
            Association::One(Some(target)) => vec![target.clone()],
            Association::Many(targets) => targets.clone(),
            Association::One(None) | Association::Unloaded => Vec::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self, Association::Unloaded)
    }

    /// Append to a collection, turning an unloaded or empty slot into a
    /// one-element collection.
    pub fn push(&mut self, target: EntityRef) {
        match self {
            Association::Many(targets) => {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
            other => *other = Association::Many(vec![target]),
        }
    }
}

/// Loads the real state behind a proxy. `Ok(None)` means the row is gone.
pub type Loader = Arc<dyn Fn() -> Result<Option<LoadedEntity>> + Send + Sync>;

/// What a [`Loader`] hands back: the loaded entity plus an optional opaque
/// baseline the session layer stashes for dirty-checking.
pub struct LoadedEntity {
    pub entity: Box<dyn Entity>,
    pub baseline: Option<Box<dyn Any + Send + Sync>>,
}

impl LoadedEntity {
    pub fn new(entity: Box<dyn Entity>) -> Self {
        Self {
            entity,
            baseline: None,
        }
    }

    pub fn with_baseline(mut self, baseline: impl Any + Send + Sync) -> Self {
        self.baseline = Some(Box::new(baseline));
        self
    }
}

struct ProxyState {
    id_field: &'static str,
    loader: Loader,
}

struct EntityCell {
    entity: RwLock<Box<dyn Entity>>,
    proxy: Mutex<Option<ProxyState>>,
    baseline: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    was_proxy: bool,
}

/// Shared handle to a live entity instance.
///
/// Equality and hashing are by handle identity: two handles are equal only
/// when they point at the same instance.
#[derive(Clone)]
pub struct EntityRef(Arc<EntityCell>);

impl EntityRef {
    pub fn new(entity: impl Entity) -> Self {
        Self::from_box(Box::new(entity))
    }

    pub fn from_box(entity: Box<dyn Entity>) -> Self {
        EntityRef(Arc::new(EntityCell {
            entity: RwLock::new(entity),
            proxy: Mutex::new(None),
            baseline: Mutex::new(None),
            was_proxy: false,
        }))
    }

    /// Create an uninitialized proxy. `placeholder` must already carry the
    /// identifier in `id_field`; every other field is loaded on first access.
    pub fn proxy(placeholder: Box<dyn Entity>, id_field: &'static str, loader: Loader) -> Self {
        EntityRef(Arc::new(EntityCell {
            entity: RwLock::new(placeholder),
            proxy: Mutex::new(Some(ProxyState { id_field, loader })),
            baseline: Mutex::new(None),
            was_proxy: true,
        }))
    }

    pub fn entity_type(&self) -> &'static str {
        self.0.entity.read().entity_type()
    }

    /// Whether this handle was created as a lazy proxy.
    pub fn is_proxy(&self) -> bool {
        self.0.was_proxy
    }

    pub fn is_initialized(&self) -> bool {
        self.0.proxy.lock().is_none()
    }

    /// Run the proxy loader if it has not run yet. Idempotent; a failed load
    /// leaves the proxy uninitialized so it can be retried.
    pub fn initialize(&self) -> Result<()> {
        let (loader, id_field) = {
            let guard = self.0.proxy.lock();
            match guard.as_ref() {
                None => return Ok(()),
                Some(state) => (Arc::clone(&state.loader), state.id_field),
            }
        };

        let entity_type = self.entity_type();
        tracing::debug!(entity = entity_type, "Initializing proxy");
        let Some(loaded) = loader()? else {
            let id = self.read_untracked(|e| e.get_field(id_field));
            return Err(Error::not_found(entity_type, id.unwrap_or(Value::Null)));
        };

        let mut guard = self.0.proxy.lock();
        if guard.is_none() {
            return Ok(());
        }
        *self.0.entity.write() = loaded.entity;
        *self.0.baseline.lock() = loaded.baseline;
        *guard = None;
        tracing::trace!(entity = entity_type, "Proxy initialized");
        Ok(())
    }

    /// Initialize an uninitialized proxy from state the caller already
    /// holds, without running its loader. Returns `false` when the handle was
    /// already initialized and nothing changed.
    pub fn initialize_with(&self, loaded: LoadedEntity) -> bool {
        let mut guard = self.0.proxy.lock();
        if guard.is_none() {
            return false;
        }
        *self.0.entity.write() = loaded.entity;
        *self.0.baseline.lock() = loaded.baseline;
        *guard = None;
        true
    }

    /// Take the baseline captured when this proxy was initialized.
    pub fn take_loaded_baseline(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.0.baseline.lock().take()
    }

    fn proxy_id_field(&self) -> Option<&'static str> {
        self.0.proxy.lock().as_ref().map(|state| state.id_field)
    }

    /// Read a scalar field. Reading the identifier of an uninitialized proxy
    /// does not load it; any other field does.
    pub fn get(&self, field: &str) -> Result<Value> {
        if self.proxy_id_field() != Some(field) {
            self.initialize()?;
        }
        let guard = self.0.entity.read();
        guard
            .get_field(field)
            .ok_or_else(|| unknown_field(guard.entity_type(), field))
    }

    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        self.initialize()?;
        self.0.entity.write().set_field(field, value.into())
    }

    pub fn association(&self, field: &str) -> Result<Association> {
        self.initialize()?;
        let guard = self.0.entity.read();
        guard
            .get_association(field)
            .ok_or_else(|| unknown_field(guard.entity_type(), field))
    }

    pub fn set_association(&self, field: &str, value: Association) -> Result<()> {
        self.initialize()?;
        self.0.entity.write().set_association(field, value)
    }

    /// Borrow the concrete entity.
    pub fn with<T: Entity, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.initialize()?;
        let guard = self.0.entity.read();
        let actual = guard.entity_type();
        guard
            .as_any()
            .downcast_ref::<T>()
            .map(f)
            .ok_or_else(|| downcast_error::<T>(actual))
    }

    /// Mutably borrow the concrete entity.
    pub fn with_mut<T: Entity, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.initialize()?;
        let mut guard = self.0.entity.write();
        let actual = guard.entity_type();
        guard
            .as_any_mut()
            .downcast_mut::<T>()
            .map(f)
            .ok_or_else(|| downcast_error::<T>(actual))
    }

    /// Read the current state without triggering proxy initialization.
    pub fn read_untracked<R>(&self, f: impl FnOnce(&dyn Entity) -> R) -> R {
        let guard = self.0.entity.read();
        f(guard.as_ref())
    }

    /// Write the current state without triggering proxy initialization.
    pub fn write_untracked<R>(&self, f: impl FnOnce(&mut dyn Entity) -> R) -> R {
        let mut guard = self.0.entity.write();
        f(guard.as_mut())
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

fn downcast_error<T>(actual: &str) -> Error {
    Error::Type(crate::error::TypeError {
        expected: std::any::type_name::<T>(),
        actual: actual.to_string(),
        column: None,
    })
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // try_read: Debug may run while the entity is being written.
        let entity_type = self
            .0
            .entity
            .try_read()
            .map_or("<locked>", |guard| guard.entity_type());
        f.debug_struct("EntityRef")
            .field("entity_type", &entity_type)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
