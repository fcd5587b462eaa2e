//! Creating lazy references.
//!
//! A [`ProxyFactory`] turns `(entity type, identifier)` into a handle. When it
//! is bound to a unit of work's identity map, an already-managed instance is
//! returned as is and new proxies are registered so later lookups find them.
//! The proxy's loader hydrates the row on first access and captures a
//! snapshot baseline, so the unit of work can dirty-check the entity once it
//! has been initialized.

use crate::SessionContext;
use crate::change_tracker::ObjectSnapshot;
use crate::hydrator::{Hydrator, fetch_by_id};
use crate::identity_map::IdentityMap;
use parking_lot::Mutex;
use sqlentity_core::{EntityRef, LoadedEntity, Loader, MetadataRegistry, Result, Value};
use std::sync::{Arc, Weak};

#[derive(Clone)]
pub struct ProxyFactory {
    context: SessionContext,
    identity: Option<Weak<Mutex<IdentityMap>>>,
}

impl ProxyFactory {
    /// A factory that resolves through, and registers into, `identity`.
    pub fn bound(context: SessionContext, identity: &Arc<Mutex<IdentityMap>>) -> Self {
        Self {
            context,
            identity: Some(Arc::downgrade(identity)),
        }
    }

    /// A factory whose proxies nobody tracks.
    pub fn detached(context: SessionContext) -> Self {
        Self {
            context,
            identity: None,
        }
    }

    /// The managed instance for `(entity_type, id)`, or a new proxy for it.
    pub fn reference(&self, entity_type: &'static str, id: Value) -> Result<EntityRef> {
        let identity = self.identity.as_ref().and_then(Weak::upgrade);
        if let Some(map) = &identity {
            let found = find_in_hierarchy(&map.lock(), &self.context.metadata, entity_type, &id);
            if let Some(found) = found {
                return Ok(found);
            }
        }
        let proxy = self.proxy(entity_type, id.clone())?;
        if let Some(map) = identity {
            map.lock().register(entity_type, id, proxy.clone())?;
        }
        Ok(proxy)
    }

    /// A new, unregistered proxy.
    pub fn proxy(&self, entity_type: &'static str, id: Value) -> Result<EntityRef> {
        let meta = self.context.metadata.get(entity_type)?;
        let id_field = meta.identifier().name;
        let mut placeholder = meta.instantiate();
        placeholder.set_field(id_field, id.clone())?;

        let factory = self.clone();
        let loader: Loader = Arc::new(move || factory.load(entity_type, &id));
        tracing::trace!(entity = entity_type, "Created proxy");
        Ok(EntityRef::proxy(placeholder, id_field, loader))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn load(&self, entity_type: &'static str, id: &Value) -> Result<Option<LoadedEntity>> {
        let metadata = &self.context.metadata;
        let meta = metadata.get(entity_type)?;
        let Some(row) = fetch_by_id(&*self.context.connection, &meta, &self.context.types, id)?
        else {
            return Ok(None);
        };
        let hydrator = Hydrator::new(metadata, &self.context.types);
        let built = hydrator.build(&row, entity_type, &mut |target, target_id| {
            self.reference(target, target_id)
        })?;
        let baseline =
            ObjectSnapshot::capture_detached(built.entity.as_ref(), &built.metadata, metadata)?;
        Ok(Some(LoadedEntity::new(built.entity).with_baseline(baseline)))
    }
}

/// Look `id` up under `entity_type` and then under each of its subtypes.
pub(crate) fn find_in_hierarchy(
    map: &IdentityMap,
    metadata: &MetadataRegistry,
    entity_type: &'static str,
    id: &Value,
) -> Option<EntityRef> {
    map.find(entity_type, id).or_else(|| {
        metadata
            .subtypes_of(entity_type)
            .into_iter()
            .find_map(|subtype| map.find(subtype, id))
    })
}
