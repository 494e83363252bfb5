//! Entity handles and association fields.
//!
//! Loaded entities are shared as [`EntityRef`]s. Association members hold
//! them through links that either own their target or share it: a link owns
//! an entity only when that entity was materialized for it, and any other
//! reference (to a sibling, an ancestor or a row already in the identity
//! map) is weak with a by-id fallback. Owning links therefore always point
//! from an earlier-loaded entity to a later-loaded one, so cyclic graphs
//! such as `User.phones` / `Phone.owner` never form reference cycles.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError, Weak};

use relmodel_core::{Error, Result};

use crate::lazy::{LazyCollection, LazyProxy};
use crate::model::Model;

/// A shared, lockable handle to one loaded entity.
pub struct EntityRef<T>(Arc<RwLock<T>>);

impl<T> EntityRef<T> {
    pub fn new(entity: T) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Lock for reading. A poisoned lock is recovered.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for writing. A poisoned lock is recovered.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read without blocking; `None` while a writer holds the lock.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        match self.0.try_read() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Write without blocking; `None` while any other lock is held.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        match self.0.try_write() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// True when both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn downgrade(&self) -> Weak<RwLock<T>> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &Weak<RwLock<T>>) -> Option<Self> {
        weak.upgrade().map(Self)
    }
}

impl<T> Clone for EntityRef<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: fmt::Debug> fmt::Debug for EntityRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_read() {
            Some(guard) => f.debug_tuple("EntityRef").field(&*guard).finish(),
            None => f.write_str("EntityRef(<locked>)"),
        }
    }
}

/// One association link.
pub(crate) enum Link<T> {
    Owned(EntityRef<T>),
    Shared {
        target: Weak<RwLock<T>>,
        fallback: Option<LazyProxy<T>>,
    },
}

impl<T: Model> Link<T> {
    pub(crate) fn shared(entity: &EntityRef<T>, fallback: Option<LazyProxy<T>>) -> Self {
        Link::Shared {
            target: entity.downgrade(),
            fallback,
        }
    }

    /// The linked entity. A shared target that has since been dropped is
    /// reloaded through its fallback, if it has one.
    pub(crate) fn resolve(&self) -> Result<Option<EntityRef<T>>> {
        match self {
            Link::Owned(entity) => Ok(Some(entity.clone())),
            Link::Shared { target, fallback } => match EntityRef::upgrade(target) {
                Some(entity) => Ok(Some(entity)),
                None => match fallback {
                    Some(proxy) => proxy.get(),
                    None => Ok(None),
                },
            },
        }
    }
}

pub(crate) enum RelatedState<T> {
    Empty,
    Loaded(Link<T>),
    Deferred(LazyProxy<T>),
}

/// A to-one association member.
pub struct Related<T> {
    pub(crate) state: RelatedState<T>,
}

impl<T> Default for Related<T> {
    fn default() -> Self {
        Self {
            state: RelatedState::Empty,
        }
    }
}

impl<T: Model> Related<T> {
    pub fn new(entity: EntityRef<T>) -> Self {
        Self {
            state: RelatedState::Loaded(Link::Owned(entity)),
        }
    }

    /// The associated entity, loading it first if it is deferred.
    pub fn get(&self) -> Result<Option<EntityRef<T>>> {
        match &self.state {
            RelatedState::Empty => Ok(None),
            RelatedState::Loaded(link) => link.resolve(),
            RelatedState::Deferred(proxy) => proxy.get(),
        }
    }

    /// Point at `entity`, keeping it alive.
    pub fn set(&mut self, entity: EntityRef<T>) {
        self.state = RelatedState::Loaded(Link::Owned(entity));
    }

    /// Point at `entity` without keeping it alive, for back-references to
    /// an entity that owns this one.
    pub fn set_weak(&mut self, entity: &EntityRef<T>) {
        self.state = RelatedState::Loaded(Link::shared(entity, None));
    }

    pub fn clear(&mut self) {
        self.state = RelatedState::Empty;
    }

    /// False while the association is deferred and not yet fetched.
    pub fn is_loaded(&self) -> bool {
        match &self.state {
            RelatedState::Deferred(proxy) => proxy.is_loaded(),
            RelatedState::Empty | RelatedState::Loaded(_) => true,
        }
    }

    pub(crate) fn deferred(proxy: LazyProxy<T>) -> Self {
        Self {
            state: RelatedState::Deferred(proxy),
        }
    }

    pub(crate) fn linked(link: Link<T>) -> Self {
        Self {
            state: RelatedState::Loaded(link),
        }
    }
}

impl<T> fmt::Debug for Related<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            RelatedState::Empty => f.write_str("Related(empty)"),
            RelatedState::Loaded(Link::Owned(_)) => f.write_str("Related(owned)"),
            RelatedState::Loaded(Link::Shared { .. }) => f.write_str("Related(shared)"),
            RelatedState::Deferred(_) => f.write_str("Related(deferred)"),
        }
    }
}

pub(crate) enum ManyState<T> {
    Loaded(Vec<Link<T>>),
    Deferred(LazyCollection<T>),
}

/// A to-many association member.
///
/// A deferred collection loads on the first read. Mutating methods load it
/// first and then work on the in-memory list; the list is what `update`
/// treats as authoritative.
pub struct RelatedMany<T> {
    pub(crate) state: ManyState<T>,
}

impl<T> Default for RelatedMany<T> {
    fn default() -> Self {
        Self {
            state: ManyState::Loaded(Vec::new()),
        }
    }
}

impl<T: Model> RelatedMany<T> {
    pub fn new(entities: Vec<EntityRef<T>>) -> Self {
        Self {
            state: ManyState::Loaded(entities.into_iter().map(Link::Owned).collect()),
        }
    }

    pub fn len(&self) -> Result<usize> {
        match &self.state {
            ManyState::Loaded(links) => Ok(links.len()),
            ManyState::Deferred(lazy) => lazy.len(),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, index: usize) -> Result<Option<EntityRef<T>>> {
        match &self.state {
            ManyState::Loaded(links) => match links.get(index) {
                Some(link) => link.resolve(),
                None => Ok(None),
            },
            ManyState::Deferred(lazy) => lazy.get(index),
        }
    }

    /// Every entity in the collection, loading it if needed.
    pub fn to_vec(&self) -> Result<Vec<EntityRef<T>>> {
        match &self.state {
            ManyState::Loaded(links) => {
                let mut out = Vec::with_capacity(links.len());
                for link in links {
                    if let Some(entity) = link.resolve()? {
                        out.push(entity);
                    }
                }
                Ok(out)
            }
            ManyState::Deferred(lazy) => lazy.to_vec(),
        }
    }

    pub fn push(&mut self, entity: EntityRef<T>) -> Result<()> {
        self.links_mut()?.push(Link::Owned(entity));
        Ok(())
    }

    /// Remove `entity` (compared by identity). Returns whether it was present.
    pub fn remove(&mut self, entity: &EntityRef<T>) -> Result<bool> {
        let links = self.links_mut()?;
        let before = links.len();
        links.retain(|link| match link {
            Link::Owned(e) => !e.ptr_eq(entity),
            Link::Shared { target, .. } => !std::ptr::eq(target.as_ptr(), Arc::as_ptr(&entity.0)),
        });
        Ok(links.len() != before)
    }

    /// Keep only the entities for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> Result<()> {
        let links = self.links_mut()?;
        let mut kept = Vec::with_capacity(links.len());
        for link in links.drain(..) {
            let retain = match link.resolve()? {
                Some(entity) => keep(&entity.read()),
                None => false,
            };
            if retain {
                kept.push(link);
            }
        }
        *links = kept;
        Ok(())
    }

    /// Empty the collection. An unloaded collection is emptied without
    /// being fetched.
    pub fn clear(&mut self) {
        self.state = ManyState::Loaded(Vec::new());
    }

    /// False while the collection is deferred and not yet fetched.
    pub fn is_loaded(&self) -> bool {
        match &self.state {
            ManyState::Loaded(_) => true,
            ManyState::Deferred(lazy) => lazy.is_loaded(),
        }
    }

    /// Load a deferred collection and convert it to an in-memory list.
    pub fn materialize_mut(&mut self) -> Result<()> {
        self.links_mut().map(|_| ())
    }

    pub(crate) fn deferred(lazy: LazyCollection<T>) -> Self {
        Self {
            state: ManyState::Deferred(lazy),
        }
    }

    pub(crate) fn linked(links: Vec<Link<T>>) -> Self {
        Self {
            state: ManyState::Loaded(links),
        }
    }

    /// The entities already in memory, or `None` for an unloaded deferred
    /// collection.
    pub(crate) fn loaded(&self) -> Result<Option<Vec<EntityRef<T>>>> {
        if self.is_loaded() {
            self.to_vec().map(Some)
        } else {
            Ok(None)
        }
    }

    fn links_mut(&mut self) -> Result<&mut Vec<Link<T>>> {
        if let ManyState::Deferred(lazy) = &self.state {
            let links = lazy.to_vec()?.into_iter().map(Link::Owned).collect();
            self.state = ManyState::Loaded(links);
        }
        match &mut self.state {
            ManyState::Loaded(links) => Ok(links),
            ManyState::Deferred(_) => Err(Error::builder("collection did not materialize")),
        }
    }
}

impl<T> fmt::Debug for RelatedMany<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            ManyState::Loaded(links) => write!(f, "RelatedMany(loaded, {} items)", links.len()),
            ManyState::Deferred(_) => f.write_str("RelatedMany(deferred)"),
        }
    }
}
