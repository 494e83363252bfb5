//! Deferred loaders for associations and `find_all` results.
//!
//! Both loaders hold a query and the session to run it on, and fetch at
//! most once: the first read runs the query, every later read is served
//! from the loaded value. A failed load leaves the loader unloaded so the
//! next read tries again.

use std::fmt;
use std::sync::OnceLock;

use relmodel_core::{Error, Result, Value};
use relmodel_query::{Filter, OrderBy, Select};

use crate::model::Model;
use crate::related::EntityRef;
use crate::session::{Session, entity_select};

/// A single entity that is fetched on first access.
pub struct LazyProxy<T> {
    session: Session,
    select: Select,
    key: Option<Value>,
    cell: OnceLock<Option<EntityRef<T>>>,
}

impl<T: Model> LazyProxy<T> {
    pub(crate) fn new(session: Session, select: Select) -> Self {
        Self {
            session,
            select,
            key: None,
            cell: OnceLock::new(),
        }
    }

    /// A proxy for the `T` whose identifier is `key`.
    pub(crate) fn by_id(session: Session, key: Value) -> Result<Self> {
        let id_column = crate::metadata::describe::<T>()?.id_column()?.to_string();
        let select = entity_select::<T>()?.filter(Filter::eq(&id_column, key.clone()));
        Ok(Self {
            session,
            select,
            key: Some(key),
            cell: OnceLock::new(),
        })
    }

    /// The identifier this proxy was created for, known without loading.
    pub(crate) fn known_key(&self) -> Option<&Value> {
        self.key.as_ref()
    }

    /// The target entity, or `None` when no row matches.
    pub fn get(&self) -> Result<Option<EntityRef<T>>> {
        if let Some(loaded) = self.cell.get() {
            return Ok(loaded.clone());
        }
        tracing::debug!(table = self.select.table(), "Loading lazy reference");
        let found = self
            .session
            .load_select::<T>(&self.select)?
            .into_iter()
            .next()
            .map(|fetched| fetched.entity);
        Ok(self.cell.get_or_init(|| found).clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T> fmt::Debug for LazyProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyProxy")
            .field("select", &self.select)
            .field("loaded", &self.cell.get().is_some())
            .finish_non_exhaustive()
    }
}

/// A list of entities that is fetched on first read.
///
/// Until then it can be narrowed with [`filter`](Self::filter),
/// [`order_by`](Self::order_by), [`limit`](Self::limit) and
/// [`offset`](Self::offset). Once loaded it is a plain in-memory list and
/// every builder method fails.
///
/// ```ignore
/// let admins = session
///     .find_all::<User>()?
///     .filter("name LIKE ?", vec!["a%".into()])?
///     .order_by("name desc")?
///     .limit(10)?;
/// for user in admins.iter()? {
///     println!("{}", user.read().name);
/// }
/// ```
pub struct LazyCollection<T> {
    session: Session,
    select: Select,
    limit: Option<u64>,
    offset: Option<u64>,
    cell: OnceLock<Vec<EntityRef<T>>>,
}

impl<T: Model> LazyCollection<T> {
    pub(crate) fn new(session: Session, select: Select) -> Self {
        Self {
            session,
            select,
            limit: None,
            offset: None,
            cell: OnceLock::new(),
        }
    }

    fn ensure_unloaded(&self, operation: &str) -> Result<()> {
        if self.is_loaded() {
            Err(Error::builder(format!(
                "{operation} called on a collection that is already loaded"
            )))
        } else {
            Ok(())
        }
    }

    /// AND a condition onto the query. `?` markers in `fragment` are bound
    /// to `params` in order.
    pub fn filter(mut self, fragment: &str, params: Vec<Value>) -> Result<Self> {
        self.ensure_unloaded("filter")?;
        self.select.push_filter(Filter::raw(fragment, params));
        Ok(self)
    }

    /// Append an ordering term, `"column"` or `"column asc|desc"`.
    pub fn order_by(mut self, term: &str) -> Result<Self> {
        self.ensure_unloaded("order_by")?;
        self.select.push_order_by(OrderBy::parse(term)?);
        Ok(self)
    }

    pub fn limit(mut self, limit: u64) -> Result<Self> {
        self.ensure_unloaded("limit")?;
        if self.limit.is_some() {
            return Err(Error::builder("limit may only be set once"));
        }
        self.limit = Some(limit);
        Ok(self)
    }

    /// Skip the first `offset` rows. Requires a limit by the time the
    /// collection is loaded.
    pub fn offset(mut self, offset: u64) -> Result<Self> {
        self.ensure_unloaded("offset")?;
        if self.offset.is_some() {
            return Err(Error::builder("offset may only be set once"));
        }
        self.offset = Some(offset);
        Ok(self)
    }

    fn load(&self) -> Result<&Vec<EntityRef<T>>> {
        if let Some(items) = self.cell.get() {
            return Ok(items);
        }
        let mut select = self.select.clone();
        select.set_limit(self.limit);
        select.set_offset(self.offset);
        tracing::debug!(table = select.table(), "Loading lazy collection");
        let items: Vec<EntityRef<T>> = self
            .session
            .load_select::<T>(&select)?
            .into_iter()
            .map(|fetched| fetched.entity)
            .collect();
        Ok(self.cell.get_or_init(|| items))
    }

    /// The first entity. An unloaded collection is loaded with a limit of
    /// one; a different explicit limit is an error.
    pub fn first(&mut self) -> Result<Option<EntityRef<T>>> {
        if !self.is_loaded() {
            match self.limit {
                Some(1) | None => self.limit = Some(1),
                Some(other) => {
                    return Err(Error::builder(format!(
                        "first() conflicts with limit {other}"
                    )));
                }
            }
        }
        Ok(self.load()?.first().cloned())
    }

    /// Number of entities, loading the collection if needed.
    pub fn count(&self) -> Result<usize> {
        self.len()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.load()?.is_empty())
    }

    pub fn get(&self, index: usize) -> Result<Option<EntityRef<T>>> {
        Ok(self.load()?.get(index).cloned())
    }

    pub fn to_vec(&self) -> Result<Vec<EntityRef<T>>> {
        Ok(self.load()?.clone())
    }

    pub fn iter(&self) -> Result<std::slice::Iter<'_, EntityRef<T>>> {
        Ok(self.load()?.iter())
    }

    pub fn into_vec(self) -> Result<Vec<EntityRef<T>>> {
        self.load()?;
        Ok(self.cell.into_inner().unwrap_or_default())
    }

    /// The loaded list, for in-memory edits. Edits are not written to the
    /// database.
    pub fn items_mut(&mut self) -> Result<&mut Vec<EntityRef<T>>> {
        self.load()?;
        self.cell
            .get_mut()
            .ok_or_else(|| Error::builder("collection did not load"))
    }

    /// Empty the collection without loading it.
    pub fn clear(&mut self) {
        self.cell = OnceLock::from(Vec::new());
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T> fmt::Debug for LazyCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCollection")
            .field("select", &self.select)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("loaded", &self.cell.get().map(Vec::len))
            .finish_non_exhaustive()
    }
}
