//! The session: save, update, delete and find for mapped entities.
//!
//! Every write runs in a transaction. An operation that finds no open
//! transaction opens one, commits it only when the whole operation
//! (cascades included) succeeded, and rolls it back otherwise. Writes issued
//! by a cascade reuse the caller's transaction.
//!
//! Reads run inside an identity scope: the first read that finds no scope
//! installs an [`IdentityMap`], nested reads share it, and it is dropped
//! when that outermost read returns.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relmodel_core::{ColumnMap, Connection, Dialect, EntityIdErrorKind, Error, Result, Row, Value};
use relmodel_query::{DeleteBuilder, Filter, InsertBuilder, Select, UpdateBuilder, bind_markers};

use crate::association::AssociationKind;
use crate::identity_map::IdentityMap;
use crate::lazy::LazyCollection;
use crate::metadata::{EntityDescriptor, describe, simple_name};
use crate::model::Model;
use crate::related::EntityRef;

/// An entity produced by a read, and whether this read created it.
pub(crate) struct Fetched<T> {
    pub(crate) entity: EntityRef<T>,
    pub(crate) id: Value,
    /// False when the instance was already live in the identity scope.
    pub(crate) fresh: bool,
}

type Undo = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SessionState {
    in_transaction: bool,
    identity: Option<IdentityMap>,
    /// In-memory changes to revert if the open transaction rolls back.
    undo: Vec<Undo>,
}

struct SessionInner {
    conn: Box<dyn Connection>,
    state: Mutex<SessionState>,
}

/// A unit of work over one database connection.
///
/// Cloning is cheap; clones share the connection and its transaction.
/// Lazy associations keep a clone to load themselves later.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Session")
            .field("dialect", &self.dialect())
            .field("in_transaction", &state.in_transaction)
            .field("identity", &state.identity)
            .finish()
    }
}

/// Keeps an identity map installed for the duration of a read.
struct Scope<'a> {
    session: &'a Session,
    owned: bool,
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if self.owned {
            let map = self.session.state().identity.take();
            drop(map);
            tracing::trace!("Closed identity scope");
        }
    }
}

/// The transaction opened by the outermost write.
///
/// Dropped without [`finish`](Self::finish) (when the operation panicked)
/// it rolls back and reverts the recorded in-memory changes.
struct Transaction<'a> {
    session: &'a Session,
    finished: bool,
}

impl<'a> Transaction<'a> {
    fn begin(session: &'a Session) -> Result<Self> {
        session.inner.conn.begin()?;
        session.state().in_transaction = true;
        Ok(Self {
            session,
            finished: false,
        })
    }

    fn close(&mut self) -> Vec<Undo> {
        self.finished = true;
        let mut state = self.session.state();
        state.in_transaction = false;
        std::mem::take(&mut state.undo)
    }

    /// Commit on `Ok(true)`, roll back otherwise.
    fn finish(mut self, outcome: Result<bool>) -> Result<bool> {
        let undo = self.close();
        let outcome = match outcome {
            Ok(true) => match self.session.inner.conn.commit() {
                Ok(()) => return Ok(true),
                Err(err) => Err(err),
            },
            other => other,
        };
        self.session.rollback_quietly();
        revert(undo);
        outcome
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let undo = self.close();
            self.session.rollback_quietly();
            revert(undo);
        }
    }
}

fn revert(undo: Vec<Undo>) {
    if !undo.is_empty() {
        tracing::debug!(changes = undo.len(), "Reverting in-memory changes");
    }
    for change in undo.into_iter().rev() {
        change();
    }
}

/// `SELECT * FROM <table>` for `T`, restricted to `T`'s discriminator value
/// when `T` is a subtype in a single-table hierarchy.
pub(crate) fn entity_select<T: Model>() -> Result<Select> {
    let desc = describe::<T>()?.require_entity()?;
    let info = desc.info();
    let mut select = Select::from(desc.table());
    if info.extends.is_some() {
        if let Some(d) = &info.discriminator {
            let column = format!("{}.{}", info.table, d.column);
            select.push_filter(Filter::eq(&column, d.value.clone()));
        }
    }
    Ok(select)
}

impl Session {
    pub fn new(conn: Box<dyn Connection>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                conn,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.conn.dialect()
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Writes ====================

    /// Insert `entity` and cascade into its children.
    ///
    /// An auto-generated identifier must be unset and is written back after
    /// the insert; any other identifier must be set. Returns `false`, with
    /// nothing committed, when a cascaded child could not be written.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = simple_name::<E>()))]
    pub fn save<E: Model>(&self, entity: &mut E) -> Result<bool> {
        self.save_with(entity, ColumnMap::new())
    }

    /// Write `entity`'s columns over its stored row, cascade into its
    /// children and unlink stored children no longer held in memory.
    ///
    /// Returns `false`, with nothing committed, when the row no longer
    /// exists or a child could not be written.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = simple_name::<E>()))]
    pub fn update<E: Model>(&self, entity: &E) -> Result<bool> {
        self.update_with(entity, ColumnMap::new())
    }

    /// Delete `entity` after removing or unlinking its children, then reset
    /// its identifier. Returns `false` when no row was deleted.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = simple_name::<E>()))]
    pub fn delete<E: Model>(&self, entity: &mut E) -> Result<bool> {
        let desc = describe::<E>()?.require_entity()?;
        let (id_column, id) = desc.extract_id(entity)?;
        if id.is_null() {
            return Err(Error::entity_id(desc.type_name(), EntityIdErrorKind::MissingIdValue));
        }
        let deleted = self.transactional(|| {
            // Join rows go before any child row they might reference.
            let (links, children): (Vec<_>, Vec<_>) = desc
                .handlers()
                .iter()
                .partition(|h| h.descriptor().kind == AssociationKind::ManyToMany);
            for handler in links.into_iter().chain(children) {
                handler.cascade_delete(self, &*entity, &id)?;
            }
            let (sql, params) = DeleteBuilder::new(desc.table())
                .filter(Filter::eq(id_column, id.clone()))
                .build(self.dialect());
            Ok(self.run_execute(&sql, &params)? > 0)
        })?;
        if deleted {
            desc.clear_id(entity)?;
        }
        Ok(deleted)
    }

    pub(crate) fn save_with<E: Model>(&self, entity: &mut E, supplied: ColumnMap) -> Result<bool> {
        let desc = describe::<E>()?.require_entity()?;
        let id = desc.id_value(entity)?;
        let generated = desc.is_auto_generated();
        if generated && !id.is_null() {
            return Err(Error::entity_id(desc.type_name(), EntityIdErrorKind::AutoGeneratedId));
        }
        if !generated && id.is_null() {
            return Err(Error::entity_id(desc.type_name(), EntityIdErrorKind::MissingIdValue));
        }

        let outcome = self.transactional(|| {
            let mut values = desc.column_values(entity, !generated);
            for (column, value) in self.owning_keys(desc, entity, &supplied)? {
                if !value.is_null() {
                    values.insert(column, value);
                }
            }
            values.extend(supplied);
            let (sql, params) = InsertBuilder::new(desc.table()).values(values).build(self.dialect());
            if generated {
                let key = self.run_insert(&sql, &params)?;
                desc.set_id(entity, &Value::BigInt(key))?;
            } else {
                self.run_execute(&sql, &params)?;
            }
            let owner_id = desc.id_value(entity)?;
            self.cascade_save(desc, entity, &owner_id)
        });
        if generated && !matches!(outcome, Ok(true)) {
            desc.clear_id(entity)?;
        }
        outcome
    }

    pub(crate) fn update_with<E: Model>(&self, entity: &E, supplied: ColumnMap) -> Result<bool> {
        let desc = describe::<E>()?.require_entity()?;
        let (id_column, id) = desc.extract_id(entity)?;
        if id.is_null() {
            return Err(Error::entity_id(desc.type_name(), EntityIdErrorKind::MissingIdValue));
        }

        self.transactional(|| {
            let mut values = desc.column_values(entity, false);
            values.extend(self.owning_keys(desc, entity, &supplied)?);
            values.extend(supplied);
            if values.is_empty() {
                values.insert(id_column.to_string(), id.clone());
            }
            let (sql, params) = UpdateBuilder::new(desc.table())
                .set_all(values)
                .filter(Filter::eq(id_column, id.clone()))
                .build(self.dialect())?;
            if self.run_execute(&sql, &params)? == 0 {
                tracing::debug!(entity = desc.type_name(), id = %id, "Update matched no row");
                return Ok(false);
            }
            if !self.cascade_save(desc, entity, &id)? {
                return Ok(false);
            }
            for handler in desc.handlers() {
                handler.reconcile(self, entity, &id)?;
            }
            Ok(true)
        })
    }

    /// Write a cascaded child: insert it when it has no identifier, update
    /// it otherwise. A child with an assigned identifier whose row does not
    /// exist yet is inserted.
    pub(crate) fn persist_child<T: Model>(&self, child: &mut T, supplied: ColumnMap) -> Result<bool> {
        let desc = describe::<T>()?.require_entity()?;
        if desc.id_value(child)?.is_null() {
            return self.save_with(child, supplied);
        }
        if self.update_with(child, supplied.clone())? {
            return Ok(true);
        }
        if desc.is_auto_generated() {
            Ok(false)
        } else {
            self.save_with(child, supplied)
        }
    }

    fn owning_keys<E: Model>(
        &self,
        desc: &EntityDescriptor<E>,
        entity: &E,
        supplied: &ColumnMap,
    ) -> Result<ColumnMap> {
        let mut keys = ColumnMap::new();
        for handler in desc.handlers() {
            if let Some((column, value)) = handler.owning_key(entity, supplied)? {
                keys.insert(column, value);
            }
        }
        Ok(keys)
    }

    fn cascade_save<E: Model>(&self, desc: &EntityDescriptor<E>, entity: &E, owner_id: &Value) -> Result<bool> {
        for handler in desc.handlers() {
            if !handler.cascade_save(self, entity, owner_id)? {
                tracing::debug!(
                    entity = desc.type_name(),
                    member = %handler.descriptor().member,
                    "Cascade save failed"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Run `op` in a transaction, opening one if none is active.
    ///
    /// A transaction opened here is committed when `op` returns `Ok(true)`
    /// and rolled back on `Ok(false)` or an error.
    fn transactional(&self, op: impl FnOnce() -> Result<bool>) -> Result<bool> {
        let nested = self.state().in_transaction;
        if nested {
            return op();
        }
        let transaction = Transaction::begin(self)?;
        let outcome = op();
        transaction.finish(outcome)
    }

    /// Record `change` to run if the open transaction rolls back. Outside a
    /// transaction there is nothing to revert and `change` is dropped.
    pub(crate) fn on_rollback(&self, change: impl FnOnce() + Send + 'static) {
        let mut state = self.state();
        if state.in_transaction {
            state.undo.push(Box::new(change));
        }
    }

    fn rollback_quietly(&self) {
        if let Err(err) = self.inner.conn.rollback() {
            tracing::warn!(error = %err, "Rollback failed");
        }
    }

    // ==================== Reads ====================

    /// The entity with identifier `id`, or `None` when no row matches.
    #[tracing::instrument(level = "debug", skip(self, id), fields(entity = simple_name::<E>()))]
    pub fn find_by_id<E: Model>(&self, id: impl Into<Value>) -> Result<Option<EntityRef<E>>> {
        let _scope = self.scope();
        Ok(self.fetch_by_id::<E>(&id.into())?.map(|fetched| fetched.entity))
    }

    /// Every stored `E`, as a collection that can be narrowed before it is
    /// loaded.
    pub fn find_all<E: Model>(&self) -> Result<LazyCollection<E>> {
        Ok(LazyCollection::new(self.clone(), entity_select::<E>()?))
    }

    /// Load entities from a hand-written query.
    pub fn query<E: Model>(&self, sql: &str) -> Result<Vec<EntityRef<E>>> {
        self.prepared_query_as(sql, &[])
    }

    /// Load entities from a hand-written query with `?` parameters.
    #[tracing::instrument(level = "debug", skip(self, params))]
    pub fn prepared_query_as<E: Model>(&self, sql: &str, params: &[Value]) -> Result<Vec<EntityRef<E>>> {
        let _scope = self.scope();
        let sql = bind_markers(sql, self.dialect());
        let rows = self.run_query(&sql, params)?;
        Ok(self.load_rows::<E>(rows)?.into_iter().map(|f| f.entity).collect())
    }

    /// Rows of a hand-written query, without entity loading.
    pub fn raw_query(&self, sql: &str) -> Result<Vec<ColumnMap>> {
        self.prepared_query(sql, &[])
    }

    /// Rows of a hand-written query with `?` parameters.
    pub fn prepared_query(&self, sql: &str, params: &[Value]) -> Result<Vec<ColumnMap>> {
        let sql = bind_markers(sql, self.dialect());
        let rows = self.run_query(&sql, params)?;
        Ok(rows
            .iter()
            .map(|row| row.iter().map(|(name, value)| (name.to_string(), value.clone())).collect())
            .collect())
    }

    /// Run a hand-written statement with `?` parameters and return the
    /// number of affected rows.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let sql = bind_markers(sql, self.dialect());
        self.run_execute(&sql, params)
    }

    fn scope(&self) -> Scope<'_> {
        let mut state = self.state();
        let owned = state.identity.is_none();
        if owned {
            state.identity = Some(IdentityMap::new());
            tracing::trace!("Opened identity scope");
        }
        Scope { session: self, owned }
    }

    pub(crate) fn identity_get<T: Model>(&self, id: &Value) -> Option<EntityRef<T>> {
        self.state().identity.as_ref()?.get::<T>(id)
    }

    fn identity_insert<T: Model>(&self, id: Value, entity: EntityRef<T>) -> EntityRef<T> {
        match self.state().identity.as_mut() {
            Some(map) => map.insert(id, entity),
            None => entity,
        }
    }

    pub(crate) fn fetch_by_id<T: Model>(&self, id: &Value) -> Result<Option<Fetched<T>>> {
        let _scope = self.scope();
        if let Some(entity) = self.identity_get::<T>(id) {
            return Ok(Some(Fetched {
                entity,
                id: id.clone(),
                fresh: false,
            }));
        }
        let id_column = describe::<T>()?.id_column()?;
        let select = entity_select::<T>()?.filter(Filter::eq(id_column, id.clone()));
        Ok(self.load_select::<T>(&select)?.into_iter().next())
    }

    pub(crate) fn load_select<T: Model>(&self, select: &Select) -> Result<Vec<Fetched<T>>> {
        let _scope = self.scope();
        let (sql, params) = select.build(self.dialect())?;
        let rows = self.run_query(&sql, &params)?;
        self.load_rows(rows)
    }

    /// Turn rows into entities in two passes: scalar columns of every row
    /// first, registering each instance in the identity scope, then the
    /// associations of the instances this call created. Associations that
    /// lead back to a row of the same batch therefore find it in the scope.
    fn load_rows<T: Model>(&self, rows: Vec<Row>) -> Result<Vec<Fetched<T>>> {
        let desc = describe::<T>()?.require_entity()?;
        let id_column = desc.id_column()?;
        let mut fetched = Vec::with_capacity(rows.len());
        let mut pending = Vec::new();

        for row in rows {
            let id = row
                .get_by_name(id_column)
                .filter(|v| !v.is_null())
                .cloned()
                .ok_or_else(|| Error::loader(desc.type_name(), Some(id_column), "row has no identifier value"))?;
            if let Some(entity) = self.identity_get::<T>(&id) {
                fetched.push(Fetched { entity, id, fresh: false });
                continue;
            }
            let entity = self.identity_insert(id.clone(), EntityRef::new(desc.hydrate(&row)?));
            pending.push((fetched.len(), row));
            fetched.push(Fetched { entity, id, fresh: true });
        }

        for (index, row) in pending {
            let Fetched { entity, id, .. } = &fetched[index];
            let mut attach = Vec::with_capacity(desc.handlers().len());
            for handler in desc.handlers() {
                attach.push(handler.hydrate(self, id, &row)?);
            }
            let mut guard = entity.write();
            for apply in attach {
                apply(&mut *guard);
            }
        }

        tracing::debug!(entity = desc.type_name(), rows = fetched.len(), "Loaded rows");
        Ok(fetched)
    }

    // ==================== Statements ====================

    pub(crate) fn run_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        tracing::trace!(sql = %sql, params = params.len(), "Executing query");
        self.inner.conn.query(sql, params)
    }

    pub(crate) fn run_execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        tracing::trace!(sql = %sql, params = params.len(), "Executing statement");
        self.inner.conn.execute(sql, params)
    }

    fn run_insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        tracing::trace!(sql = %sql, params = params.len(), "Executing insert");
        self.inner.conn.insert(sql, params)
    }
}
