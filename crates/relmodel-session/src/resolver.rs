//! Association resolution: foreign keys, cascades, stale links and loading.
//!
//! Every association member gets a handler that knows the member's
//! accessors and its declared metadata. The session drives the handlers:
//!
//! - before a row is written, owning to-one members contribute their
//!   foreign-key column
//! - after a save or update, child-bearing members cascade into their
//!   children, and an update then unlinks children no longer in memory
//! - before a delete, children are removed or unlinked and many-to-many
//!   join rows are dropped
//! - after a row is read, each member is loaded eagerly or deferred

use std::sync::Arc;

use relmodel_core::{ColumnMap, Error, Result, Row, Value};
use relmodel_query::{DeleteBuilder, Filter, InsertBuilder, Select, UpdateBuilder};

use crate::association::{AssociationDescriptor, AssociationKind, Fetch, ResolvedNames, resolve_names};
use crate::lazy::{LazyCollection, LazyProxy};
use crate::metadata::{describe, simple_name};
use crate::model::Model;
use crate::related::{EntityRef, Link, Related, RelatedMany, RelatedState};
use crate::session::{Fetched, Session, entity_select};

/// Deferred write of a loaded association onto its owner.
pub(crate) type Attach<E> = Box<dyn FnOnce(&mut E) + Send>;

pub(crate) trait AssociationHandler<E>: Send + Sync {
    fn descriptor(&self) -> &AssociationDescriptor;

    /// The foreign-key column and value this member stores in the owner's
    /// row. `None` for members that store nothing there, and for columns
    /// already present in `supplied`.
    fn owning_key(&self, entity: &E, supplied: &ColumnMap) -> Result<Option<(String, Value)>>;

    /// Save or update the children of `entity`. `false` means a child
    /// could not be written.
    fn cascade_save(&self, session: &Session, entity: &E, owner_id: &Value) -> Result<bool>;

    fn cascade_delete(&self, session: &Session, entity: &E, owner_id: &Value) -> Result<()>;

    /// Unlink (or delete) stored children missing from the in-memory member.
    fn reconcile(&self, session: &Session, entity: &E, owner_id: &Value) -> Result<()>;

    fn hydrate(&self, session: &Session, owner_id: &Value, row: &Row) -> Result<Attach<E>>;
}

fn names<E: Model, T: Model>(desc: &AssociationDescriptor) -> Result<&ResolvedNames> {
    if let Some(resolved) = desc.resolved.get() {
        return Ok(resolved);
    }
    let resolved = resolve_names(desc, describe::<E>()?.info(), describe::<T>()?.info())?;
    Ok(desc.resolved.get_or_init(|| resolved))
}

fn foreign_key<E: Model, T: Model>(desc: &AssociationDescriptor) -> Result<&str> {
    match names::<E, T>(desc)? {
        ResolvedNames::ForeignKey(column) => Ok(column),
        ResolvedNames::JoinTable { .. } => Err(Error::entity(format!(
            "{}.{} is stored in a join table, not a foreign key",
            simple_name::<E>(),
            desc.member
        ))),
    }
}

fn join_table<E: Model, T: Model>(desc: &AssociationDescriptor) -> Result<(&str, &str, &str)> {
    match names::<E, T>(desc)? {
        ResolvedNames::JoinTable {
            table,
            owner_column,
            target_column,
        } => Ok((table, owner_column, target_column)),
        ResolvedNames::ForeignKey(_) => Err(Error::entity(format!(
            "{}.{} is stored in a foreign key, not a join table",
            simple_name::<E>(),
            desc.member
        ))),
    }
}

fn locked<E, T>(desc: &AssociationDescriptor) -> Error {
    Error::entity(format!(
        "{} reached through {}.{} is locked elsewhere",
        simple_name::<T>(),
        simple_name::<E>(),
        desc.member
    ))
}

/// Write or delete `child` through `write`. An identifier the call assigns
/// or clears is put back if the enclosing transaction rolls back.
fn write_child<E, T: Model>(
    session: &Session,
    desc: &AssociationDescriptor,
    child: &EntityRef<T>,
    write: impl FnOnce(&mut T) -> Result<bool>,
) -> Result<bool> {
    let target = describe::<T>()?;
    let mut guard = child.try_write().ok_or_else(|| locked::<E, T>(desc))?;
    let before = target.id_value(&guard)?;
    let written = write(&mut *guard)?;
    if target.id_value(&guard)? != before {
        let child = child.clone();
        session.on_rollback(move || {
            let mut guard = child.write();
            let restored = if before.is_null() {
                target.clear_id(&mut guard)
            } else {
                target.set_id(&mut guard, &before)
            };
            if let Err(err) = restored {
                tracing::warn!(error = %err, "Could not restore identifier after rollback");
            }
        });
    }
    Ok(written)
}

/// Link to a fetched entity. Only an entity materialized for this link is
/// owned; one that was already live is shared, falling back to a reload by
/// id once the live instance is gone.
fn link_for<T: Model>(session: &Session, fetched: Fetched<T>) -> Result<Link<T>> {
    if fetched.fresh {
        Ok(Link::Owned(fetched.entity))
    } else {
        let fallback = LazyProxy::by_id(session.clone(), fetched.id)?;
        Ok(Link::shared(&fetched.entity, Some(fallback)))
    }
}

/// `column = owner_id`, optionally narrowed to rows whose id is not in `keep`.
fn unlinked_rows<T: Model>(column: &str, owner_id: &Value, keep: Vec<Value>) -> Result<Vec<Filter>> {
    let id_column = describe::<T>()?.id_column()?;
    let mut filters = vec![Filter::eq(column, owner_id.clone())];
    filters.extend(Filter::not_in(id_column, keep));
    Ok(filters)
}

fn ids_of<E, T: Model>(desc: &AssociationDescriptor, children: &[EntityRef<T>]) -> Result<Vec<Value>> {
    let target = describe::<T>()?;
    let mut ids = Vec::with_capacity(children.len());
    for child in children {
        let guard = child.try_read().ok_or_else(|| locked::<E, T>(desc))?;
        let id = target.id_value(&guard)?;
        if !id.is_null() {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Remove rows linked through `column`: each listed child is deleted
/// through the session (so its own cascades run) and leftovers by key.
fn delete_children<E, T: Model>(
    session: &Session,
    desc: &AssociationDescriptor,
    table: &str,
    column: &str,
    owner_id: &Value,
    children: &[EntityRef<T>],
) -> Result<()> {
    for child in children {
        write_child::<E, T>(session, desc, child, |c| session.delete(c))?;
    }
    let (sql, params) = DeleteBuilder::new(table)
        .filter(Filter::eq(column, owner_id.clone()))
        .build(session.dialect());
    session.run_execute(&sql, &params)?;
    Ok(())
}

fn null_foreign_key(session: &Session, table: &str, filters: Vec<Filter>, column: &str) -> Result<u64> {
    let mut update = UpdateBuilder::new(table).set(column, Value::Null);
    for filter in filters {
        update = update.filter(filter);
    }
    let (sql, params) = update.build(session.dialect())?;
    session.run_execute(&sql, &params)
}

fn delete_rows(session: &Session, table: &str, filters: Vec<Filter>) -> Result<u64> {
    let mut delete = DeleteBuilder::new(table);
    for filter in filters {
        delete = delete.filter(filter);
    }
    let (sql, params) = delete.build(session.dialect());
    session.run_execute(&sql, &params)
}

/// Handler for `one_to_one` and `many_to_one` members.
pub(crate) struct ToOneHandler<E, T> {
    desc: Arc<AssociationDescriptor>,
    get: fn(&E) -> &Related<T>,
    get_mut: fn(&mut E) -> &mut Related<T>,
}

impl<E, T> ToOneHandler<E, T> {
    pub(crate) fn new(
        desc: Arc<AssociationDescriptor>,
        get: fn(&E) -> &Related<T>,
        get_mut: fn(&mut E) -> &mut Related<T>,
    ) -> Self {
        Self { desc, get, get_mut }
    }
}

impl<E: Model, T: Model> ToOneHandler<E, T> {
    /// The loaded child of an inverse member, `None` when the member is
    /// empty or has not been fetched.
    fn loaded_child(&self, entity: &E) -> Result<Option<EntityRef<T>>> {
        let related = (self.get)(entity);
        if related.is_loaded() { related.get() } else { Ok(None) }
    }

    fn hydrate_parent_side(&self, session: &Session, row: &Row) -> Result<Related<T>> {
        let column = foreign_key::<E, T>(&self.desc)?;
        let Some(key) = row.get_by_name(column).filter(|v| !v.is_null()).cloned() else {
            return Ok(Related::default());
        };
        match self.desc.fetch {
            Fetch::Lazy => Ok(Related::deferred(LazyProxy::by_id(session.clone(), key)?)),
            Fetch::Eager => match session.fetch_by_id::<T>(&key)? {
                Some(fetched) => Ok(Related::linked(link_for(session, fetched)?)),
                None => Ok(Related::default()),
            },
        }
    }

    fn hydrate_child_side(&self, session: &Session, owner_id: &Value) -> Result<Related<T>> {
        let column = foreign_key::<E, T>(&self.desc)?;
        let select = entity_select::<T>()?.filter(Filter::eq(column, owner_id.clone()));
        match self.desc.fetch {
            Fetch::Lazy => Ok(Related::deferred(LazyProxy::new(session.clone(), select))),
            Fetch::Eager => match session.load_select::<T>(&select)?.into_iter().next() {
                Some(fetched) => Ok(Related::linked(link_for(session, fetched)?)),
                None => Ok(Related::default()),
            },
        }
    }
}

impl<E: Model, T: Model> AssociationHandler<E> for ToOneHandler<E, T> {
    fn descriptor(&self) -> &AssociationDescriptor {
        &self.desc
    }

    fn owning_key(&self, entity: &E, supplied: &ColumnMap) -> Result<Option<(String, Value)>> {
        if !self.desc.is_parent_side() {
            return Ok(None);
        }
        let column = foreign_key::<E, T>(&self.desc)?;
        if supplied.contains_key(column) {
            return Ok(None);
        }
        let parent = match &(self.get)(entity).state {
            RelatedState::Empty => None,
            RelatedState::Deferred(proxy) if !proxy.is_loaded() => {
                if let Some(key) = proxy.known_key() {
                    return Ok(Some((column.to_string(), key.clone())));
                }
                proxy.get()?
            }
            RelatedState::Deferred(proxy) => proxy.get()?,
            RelatedState::Loaded(link) => link.resolve()?,
        };
        let Some(parent) = parent else {
            return Ok(Some((column.to_string(), Value::Null)));
        };
        let guard = parent.try_read().ok_or_else(|| locked::<E, T>(&self.desc))?;
        let id = describe::<T>()?.id_value(&guard)?;
        if id.is_null() {
            return Err(Error::entity(format!(
                "Entity of class {target} referenced by foreign key in class {owner} is not \
                 inserted in the database; save the {target} before the {owner}",
                target = simple_name::<T>(),
                owner = simple_name::<E>(),
            )));
        }
        Ok(Some((column.to_string(), id)))
    }

    fn cascade_save(&self, session: &Session, entity: &E, owner_id: &Value) -> Result<bool> {
        if self.desc.is_parent_side() || !self.desc.cascades_persist() {
            return Ok(true);
        }
        let Some(child) = self.loaded_child(entity)? else {
            return Ok(true);
        };
        let column = foreign_key::<E, T>(&self.desc)?;
        let mut supplied = ColumnMap::new();
        supplied.insert(column.to_string(), owner_id.clone());
        tracing::debug!(member = %self.desc.member, "Cascading save to child");
        write_child::<E, T>(session, &self.desc, &child, |c| session.persist_child(c, supplied))
    }

    fn cascade_delete(&self, session: &Session, entity: &E, owner_id: &Value) -> Result<()> {
        if self.desc.is_parent_side() {
            return Ok(());
        }
        let column = foreign_key::<E, T>(&self.desc)?;
        let table = describe::<T>()?.table();
        if self.desc.cascades_remove() || self.desc.orphan_removal {
            let children: Vec<EntityRef<T>> = (self.get)(entity).get()?.into_iter().collect();
            tracing::debug!(member = %self.desc.member, "Cascading delete to child");
            delete_children::<E, T>(session, &self.desc, table, column, owner_id, &children)
        } else {
            let filters = vec![Filter::eq(column, owner_id.clone())];
            null_foreign_key(session, table, filters, column).map(|_| ())
        }
    }

    fn reconcile(&self, session: &Session, entity: &E, owner_id: &Value) -> Result<()> {
        if self.desc.is_parent_side() || !(self.get)(entity).is_loaded() {
            return Ok(());
        }
        let column = foreign_key::<E, T>(&self.desc)?;
        let table = describe::<T>()?.table();
        let current: Vec<EntityRef<T>> = self.loaded_child(entity)?.into_iter().collect();
        let filters = unlinked_rows::<T>(column, owner_id, ids_of::<E, T>(&self.desc, &current)?)?;
        let changed = if self.desc.orphan_removal {
            delete_rows(session, table, filters)?
        } else {
            null_foreign_key(session, table, filters, column)?
        };
        tracing::debug!(member = %self.desc.member, changed, "Reconciled stale links");
        Ok(())
    }

    fn hydrate(&self, session: &Session, owner_id: &Value, row: &Row) -> Result<Attach<E>> {
        let related = if self.desc.is_parent_side() {
            self.hydrate_parent_side(session, row)?
        } else {
            self.hydrate_child_side(session, owner_id)?
        };
        let get_mut = self.get_mut;
        Ok(Box::new(move |entity: &mut E| *get_mut(entity) = related))
    }
}

/// Handler for `one_to_many` and `many_to_many` members.
pub(crate) struct ToManyHandler<E, T> {
    desc: Arc<AssociationDescriptor>,
    get: fn(&E) -> &RelatedMany<T>,
    get_mut: fn(&mut E) -> &mut RelatedMany<T>,
}

impl<E, T> ToManyHandler<E, T> {
    pub(crate) fn new(
        desc: Arc<AssociationDescriptor>,
        get: fn(&E) -> &RelatedMany<T>,
        get_mut: fn(&mut E) -> &mut RelatedMany<T>,
    ) -> Self {
        Self { desc, get, get_mut }
    }
}

impl<E: Model, T: Model> ToManyHandler<E, T> {
    fn is_many_to_many(&self) -> bool {
        self.desc.kind == AssociationKind::ManyToMany
    }

    /// `SELECT target.* FROM target INNER JOIN join_table ... WHERE owner = ?`
    fn join_select(&self, owner_id: &Value) -> Result<Select> {
        let (join, owner_column, target_column) = join_table::<E, T>(&self.desc)?;
        let target = describe::<T>()?;
        let table = target.table();
        let on = format!("{join}.{target_column} = {table}.{}", target.id_column()?);
        Ok(entity_select::<T>()?
            .columns(format!("{table}.*"))
            .inner_join(join, &on)
            .filter(Filter::eq(&format!("{join}.{owner_column}"), owner_id.clone())))
    }

    /// Eager many-to-many load. Ids already live in the identity map are
    /// shared, and only the rest are queried.
    fn load_linked(&self, session: &Session, owner_id: &Value) -> Result<Vec<Link<T>>> {
        let (join, owner_column, target_column) = join_table::<E, T>(&self.desc)?;
        let (sql, params) = Select::from(join)
            .columns(target_column)
            .filter(Filter::eq(owner_column, owner_id.clone()))
            .build(session.dialect())?;
        let ids: Vec<Value> = session
            .run_query(&sql, &params)?
            .iter()
            .filter_map(|row| row.get(0).filter(|v| !v.is_null()).cloned())
            .collect();

        let mut cached = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in &ids {
            let live = session.identity_get::<T>(id);
            if live.is_none() {
                missing.push(id.clone());
            }
            cached.push(live);
        }

        let mut fetched: Vec<Fetched<T>> = Vec::new();
        if !missing.is_empty() {
            let target = describe::<T>()?;
            let markers = vec!["?"; missing.len()].join(", ");
            let filter = Filter::raw(format!("{}.{} IN ({markers})", target.table(), target.id_column()?), missing);
            fetched = session.load_select::<T>(&entity_select::<T>()?.filter(filter))?;
        }

        let mut links = Vec::with_capacity(ids.len());
        for (id, live) in ids.into_iter().zip(cached) {
            if let Some(entity) = live {
                let fallback = LazyProxy::by_id(session.clone(), id)?;
                links.push(Link::shared(&entity, Some(fallback)));
            } else if let Some(pos) = fetched.iter().position(|f| f.id.same_identity(&id)) {
                links.push(link_for(session, fetched.swap_remove(pos))?);
            }
        }
        Ok(links)
    }
}

impl<E: Model, T: Model> AssociationHandler<E> for ToManyHandler<E, T> {
    fn descriptor(&self) -> &AssociationDescriptor {
        &self.desc
    }

    fn owning_key(&self, _entity: &E, _supplied: &ColumnMap) -> Result<Option<(String, Value)>> {
        Ok(None)
    }

    fn cascade_save(&self, session: &Session, entity: &E, owner_id: &Value) -> Result<bool> {
        if !self.desc.cascades_persist() {
            return Ok(true);
        }
        let Some(children) = (self.get)(entity).loaded()? else {
            return Ok(true);
        };
        tracing::debug!(member = %self.desc.member, count = children.len(), "Cascading save to children");

        if !self.is_many_to_many() {
            let column = foreign_key::<E, T>(&self.desc)?;
            for child in &children {
                let mut supplied = ColumnMap::new();
                supplied.insert(column.to_string(), owner_id.clone());
                if !write_child::<E, T>(session, &self.desc, child, |c| session.persist_child(c, supplied))? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        let (join, owner_column, target_column) = join_table::<E, T>(&self.desc)?;
        let target = describe::<T>()?;
        for child in &children {
            let saved = write_child::<E, T>(session, &self.desc, child, |c| {
                if target.id_value(c)?.is_null() {
                    session.save_with(c, ColumnMap::new())
                } else {
                    Ok(true)
                }
            })?;
            if !saved {
                return Ok(false);
            }
            let child_id = {
                let guard = child.try_read().ok_or_else(|| locked::<E, T>(&self.desc))?;
                target.id_value(&guard)?
            };
            let (sql, params) = Select::from(join)
                .columns(owner_column)
                .filter(Filter::eq(owner_column, owner_id.clone()))
                .filter(Filter::eq(target_column, child_id.clone()))
                .build(session.dialect())?;
            if session.run_query(&sql, &params)?.is_empty() {
                let (sql, params) = InsertBuilder::new(join)
                    .value(owner_column, owner_id.clone())
                    .value(target_column, child_id)
                    .build(session.dialect());
                session.run_execute(&sql, &params)?;
            }
        }
        Ok(true)
    }

    fn cascade_delete(&self, session: &Session, entity: &E, owner_id: &Value) -> Result<()> {
        if self.is_many_to_many() {
            let (join, owner_column, _) = join_table::<E, T>(&self.desc)?;
            delete_rows(session, join, vec![Filter::eq(owner_column, owner_id.clone())])?;
            if self.desc.cascades_remove() {
                for child in (self.get)(entity).to_vec()? {
                    write_child::<E, T>(session, &self.desc, &child, |c| session.delete(c))?;
                }
            }
            return Ok(());
        }

        let column = foreign_key::<E, T>(&self.desc)?;
        let table = describe::<T>()?.table();
        if self.desc.cascades_remove() || self.desc.orphan_removal {
            let children = (self.get)(entity).to_vec()?;
            tracing::debug!(member = %self.desc.member, count = children.len(), "Cascading delete to children");
            delete_children::<E, T>(session, &self.desc, table, column, owner_id, &children)
        } else {
            let filters = vec![Filter::eq(column, owner_id.clone())];
            null_foreign_key(session, table, filters, column).map(|_| ())
        }
    }

    fn reconcile(&self, session: &Session, entity: &E, owner_id: &Value) -> Result<()> {
        let Some(children) = (self.get)(entity).loaded()? else {
            return Ok(());
        };
        let keep = ids_of::<E, T>(&self.desc, &children)?;
        let changed = if self.is_many_to_many() {
            let (join, owner_column, target_column) = join_table::<E, T>(&self.desc)?;
            let mut filters = vec![Filter::eq(owner_column, owner_id.clone())];
            filters.extend(Filter::not_in(target_column, keep));
            delete_rows(session, join, filters)?
        } else {
            let column = foreign_key::<E, T>(&self.desc)?;
            let table = describe::<T>()?.table();
            let filters = unlinked_rows::<T>(column, owner_id, keep)?;
            if self.desc.orphan_removal {
                delete_rows(session, table, filters)?
            } else {
                null_foreign_key(session, table, filters, column)?
            }
        };
        tracing::debug!(member = %self.desc.member, changed, "Reconciled stale links");
        Ok(())
    }

    fn hydrate(&self, session: &Session, owner_id: &Value, _row: &Row) -> Result<Attach<E>> {
        let related = match (self.desc.fetch, self.is_many_to_many()) {
            (Fetch::Lazy, true) => RelatedMany::deferred(LazyCollection::new(session.clone(), self.join_select(owner_id)?)),
            (Fetch::Eager, true) => RelatedMany::linked(self.load_linked(session, owner_id)?),
            (fetch, false) => {
                let column = foreign_key::<E, T>(&self.desc)?;
                let select = entity_select::<T>()?.filter(Filter::eq(column, owner_id.clone()));
                if fetch == Fetch::Lazy {
                    RelatedMany::deferred(LazyCollection::new(session.clone(), select))
                } else {
                    let mut links = Vec::new();
                    for fetched in session.load_select::<T>(&select)? {
                        links.push(link_for(session, fetched)?);
                    }
                    RelatedMany::linked(links)
                }
            }
        };
        let get_mut = self.get_mut;
        Ok(Box::new(move |entity: &mut E| *get_mut(entity) = related))
    }
}

/// A handler declared on a type stored inside `O` (a parent type or an
/// embedded part), re-targeted at `O`.
pub(crate) struct Lifted<O, E> {
    inner: Arc<dyn AssociationHandler<E>>,
    to: fn(&O) -> &E,
    to_mut: fn(&mut O) -> &mut E,
}

impl<O, E> Lifted<O, E> {
    pub(crate) fn new(
        inner: Arc<dyn AssociationHandler<E>>,
        to: fn(&O) -> &E,
        to_mut: fn(&mut O) -> &mut E,
    ) -> Self {
        Self { inner, to, to_mut }
    }
}

impl<O: Model, E: Model> AssociationHandler<O> for Lifted<O, E> {
    fn descriptor(&self) -> &AssociationDescriptor {
        self.inner.descriptor()
    }

    fn owning_key(&self, entity: &O, supplied: &ColumnMap) -> Result<Option<(String, Value)>> {
        self.inner.owning_key((self.to)(entity), supplied)
    }

    fn cascade_save(&self, session: &Session, entity: &O, owner_id: &Value) -> Result<bool> {
        self.inner.cascade_save(session, (self.to)(entity), owner_id)
    }

    fn cascade_delete(&self, session: &Session, entity: &O, owner_id: &Value) -> Result<()> {
        self.inner.cascade_delete(session, (self.to)(entity), owner_id)
    }

    fn reconcile(&self, session: &Session, entity: &O, owner_id: &Value) -> Result<()> {
        self.inner.reconcile(session, (self.to)(entity), owner_id)
    }

    fn hydrate(&self, session: &Session, owner_id: &Value, row: &Row) -> Result<Attach<O>> {
        let attach = self.inner.hydrate(session, owner_id, row)?;
        let to_mut = self.to_mut;
        Ok(Box::new(move |entity: &mut O| attach(to_mut(entity))))
    }
}
