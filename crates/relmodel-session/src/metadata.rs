//! Structural descriptors of mapped types.
//!
//! [`describe`] turns a [`Model`]'s declarations into an
//! [`EntityDescriptor`]: the table, the identifier, the flattened column
//! accessors (inherited and embedded members included), the discriminator
//! and the association handlers. Descriptors are built once per type and
//! live for the rest of the process.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use relmodel_core::{ColumnMap, EntityIdErrorKind, Error, Result, Row, Value};
use serde::Serialize;

use crate::association::AssociationDescriptor;
use crate::mapping::{ClearFn, Mapping, ReadFn, SlotKind, WriteFn};
use crate::model::Model;
use crate::resolver::{AssociationHandler, Lifted};

const DEFAULT_DISCRIMINATOR_COLUMN: &str = "dtype";

/// One persisted scalar member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub member: String,
    pub name: String,
    pub transient: bool,
}

/// An embedded member and the columns it contributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddedDescriptor {
    pub member: String,
    pub type_name: &'static str,
    pub columns: Vec<ColumnDescriptor>,
    pub embedded: Vec<EmbeddedDescriptor>,
}

/// Single-table inheritance marker written into every row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discriminator {
    pub column: String,
    pub value: String,
}

/// The type-independent part of a descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct EntityInfo {
    /// Simple (unqualified) type name.
    pub type_name: &'static str,
    pub table: String,
    /// `None` only for embeddable types.
    pub id_column: Option<String>,
    pub auto_generated: bool,
    /// Own and inherited scalar members, transient ones included.
    pub columns: Vec<ColumnDescriptor>,
    pub embedded: Vec<EmbeddedDescriptor>,
    pub discriminator: Option<Discriminator>,
    /// Simple name of the mapped parent type, if any.
    pub extends: Option<&'static str>,
    pub associations: Vec<Arc<AssociationDescriptor>>,
}

impl EntityInfo {
    /// Render the descriptor as JSON, for diagnostics.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub(crate) struct IdAccess<E> {
    column: String,
    generated: bool,
    read: ReadFn<E>,
    write: WriteFn<E>,
    clear: ClearFn<E>,
}

pub(crate) struct ColumnAccess<E> {
    member: String,
    column: String,
    read: ReadFn<E>,
    write: WriteFn<E>,
}

/// Members of a described type, re-expressed on a type that contains it.
pub(crate) struct Parts<E> {
    info: EntityInfo,
    discriminator_column: String,
    id: Option<IdAccess<E>>,
    columns: Vec<ColumnAccess<E>>,
    handlers: Vec<Arc<dyn AssociationHandler<E>>>,
}

/// Everything needed to read, write and load one mapped type.
pub struct EntityDescriptor<E> {
    info: EntityInfo,
    is_entity: bool,
    discriminator_column: String,
    id: Option<IdAccess<E>>,
    columns: Vec<ColumnAccess<E>>,
    handlers: Vec<Arc<dyn AssociationHandler<E>>>,
}

impl<E> std::fmt::Debug for EntityDescriptor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

type Registry = RwLock<HashMap<TypeId, &'static (dyn Any + Send + Sync)>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::default)
}

/// Describe `E`, building and caching its descriptor on first use.
///
/// Build failures are returned every time and never cached.
pub fn describe<E: Model>() -> Result<&'static EntityDescriptor<E>> {
    let key = TypeId::of::<E>();
    let cached = registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
        .copied();
    if let Some(found) = cached {
        return downcast(found);
    }

    // Built without holding the registry lock: describing a type describes
    // its parent and embedded types too.
    let built: &'static EntityDescriptor<E> = Box::leak(Box::new(build::<E>()?));
    tracing::debug!(entity = built.info.type_name, table = %built.info.table, "Described entity");
    let mut guard = registry().write().unwrap_or_else(PoisonError::into_inner);
    let entry = *guard
        .entry(key)
        .or_insert(built as &'static (dyn Any + Send + Sync));
    downcast(entry)
}

fn downcast<E: Model>(found: &'static (dyn Any + Send + Sync)) -> Result<&'static EntityDescriptor<E>> {
    found
        .downcast_ref::<EntityDescriptor<E>>()
        .ok_or_else(|| Error::annotation(simple_name::<E>(), "descriptor registry holds a different type"))
}

/// The unqualified name of `T`, without generic arguments.
pub(crate) fn simple_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn absorb_id<E>(
    type_name: &'static str,
    found: Option<IdAccess<E>>,
    id: &mut Option<IdAccess<E>>,
) -> Result<()> {
    if let Some(found) = found {
        if id.is_some() {
            return Err(Error::entity_id(type_name, EntityIdErrorKind::MultipleIds));
        }
        *id = Some(found);
    }
    Ok(())
}

fn build<E: Model>() -> Result<EntityDescriptor<E>> {
    let mut mapping = Mapping::<E>::new();
    E::mapping(&mut mapping);
    let Mapping {
        type_name,
        is_entity,
        is_embeddable,
        table,
        inheritance,
        discriminator_column,
        discriminator_value,
        parent,
        members,
        associations,
    } = mapping;

    if !is_entity && !is_embeddable {
        return Err(Error::annotation(
            type_name,
            "type is declared as neither an entity nor embeddable",
        ));
    }

    let mut id: Option<IdAccess<E>> = None;
    let mut columns = Vec::new();
    let mut handlers = Vec::new();
    let mut column_infos = Vec::new();
    let mut embedded_infos = Vec::new();
    let mut association_infos = Vec::new();

    let parent = match parent {
        Some(lift) => {
            let parts = lift()?;
            absorb_id(type_name, parts.id, &mut id)?;
            columns.extend(parts.columns);
            handlers.extend(parts.handlers);
            column_infos.extend(parts.info.columns.iter().cloned());
            embedded_infos.extend(parts.info.embedded.iter().cloned());
            association_infos.extend(parts.info.associations.iter().cloned());
            Some((parts.info, parts.discriminator_column))
        }
        None => None,
    };

    for slot in members {
        let decl = slot.decl;
        if decl.generated && !matches!(slot.kind, SlotKind::Id { .. }) {
            return Err(Error::annotation(
                type_name,
                format!(
                    "member '{}' is marked generated but only the identifier can be",
                    decl.member
                ),
            ));
        }
        match slot.kind {
            SlotKind::Id { read, write, clear } => {
                let found = IdAccess {
                    column: decl.column_name(),
                    generated: decl.generated,
                    read,
                    write,
                    clear,
                };
                absorb_id(type_name, Some(found), &mut id)?;
            }
            SlotKind::Field { read, write } => {
                let name = decl.column_name();
                column_infos.push(ColumnDescriptor {
                    member: decl.member.clone(),
                    name: name.clone(),
                    transient: decl.transient,
                });
                if !decl.transient {
                    columns.push(ColumnAccess {
                        member: decl.member,
                        column: name,
                        read,
                        write,
                    });
                }
            }
            SlotKind::Embedded(lift) => {
                if decl.transient {
                    continue;
                }
                let parts = lift()?;
                absorb_id(type_name, parts.id, &mut id)?;
                columns.extend(parts.columns);
                handlers.extend(parts.handlers);
                association_infos.extend(parts.info.associations.iter().cloned());
                embedded_infos.push(EmbeddedDescriptor {
                    member: decl.member,
                    type_name: parts.info.type_name,
                    columns: parts.info.columns,
                    embedded: parts.info.embedded,
                });
            }
        }
    }

    for slot in associations {
        let desc = Arc::new(slot.decl.into_descriptor());
        handlers.push((slot.make)(Arc::clone(&desc)));
        association_infos.push(desc);
    }

    if is_entity && id.is_none() {
        return Err(Error::entity_id(type_name, EntityIdErrorKind::NoId));
    }

    let (table, discriminator_column, extends) = match &parent {
        Some((info, column)) => (info.table.clone(), column.clone(), Some(info.type_name)),
        None => (
            table.unwrap_or_else(|| type_name.to_lowercase()),
            discriminator_column.unwrap_or_else(|| DEFAULT_DISCRIMINATOR_COLUMN.to_string()),
            None,
        ),
    };
    let discriminator = (extends.is_some() || inheritance).then(|| Discriminator {
        column: discriminator_column.clone(),
        value: discriminator_value.unwrap_or_else(|| type_name.to_string()),
    });

    Ok(EntityDescriptor {
        info: EntityInfo {
            type_name,
            table,
            id_column: id.as_ref().map(|id| id.column.clone()),
            auto_generated: id.as_ref().is_some_and(|id| id.generated),
            columns: column_infos,
            embedded: embedded_infos,
            discriminator,
            extends,
            associations: association_infos,
        },
        is_entity,
        discriminator_column,
        id,
        columns,
        handlers,
    })
}

impl<E: Model> EntityDescriptor<E> {
    pub fn info(&self) -> &EntityInfo {
        &self.info
    }

    pub fn type_name(&self) -> &'static str {
        self.info.type_name
    }

    pub fn table(&self) -> &str {
        &self.info.table
    }

    /// Fail unless the type carries the entity marker.
    pub fn require_entity(&self) -> Result<&Self> {
        if self.is_entity {
            Ok(self)
        } else {
            Err(Error::annotation(
                self.info.type_name,
                "type is embeddable and cannot be persisted on its own",
            ))
        }
    }

    fn id_access(&self) -> Result<&IdAccess<E>> {
        self.id
            .as_ref()
            .ok_or_else(|| Error::entity_id(self.info.type_name, EntityIdErrorKind::NoId))
    }

    pub fn id_column(&self) -> Result<&str> {
        Ok(&self.id_access()?.column)
    }

    pub fn is_auto_generated(&self) -> bool {
        self.id.as_ref().is_some_and(|id| id.generated)
    }

    /// The identifier column and its current value.
    pub fn extract_id(&self, entity: &E) -> Result<(&str, Value)> {
        let id = self.id_access()?;
        Ok((&id.column, (id.read)(entity)))
    }

    /// The identifier value alone.
    pub fn id_value(&self, entity: &E) -> Result<Value> {
        Ok((self.id_access()?.read)(entity))
    }

    pub fn set_id(&self, entity: &mut E, value: &Value) -> Result<()> {
        let id = self.id_access()?;
        (id.write)(entity, value).map_err(|e| self.load_error(&id.column, &e))
    }

    /// Reset the identifier to its default (unsaved) value.
    pub fn clear_id(&self, entity: &mut E) -> Result<()> {
        (self.id_access()?.clear)(entity);
        Ok(())
    }

    /// The persisted columns of `entity`, in declaration order.
    ///
    /// Null members are left out so database defaults apply. The
    /// discriminator is included for inheritance hierarchies.
    pub fn column_values(&self, entity: &E, include_id: bool) -> ColumnMap {
        let mut values = ColumnMap::new();
        if include_id {
            if let Some(id) = &self.id {
                let value = (id.read)(entity);
                if !value.is_null() {
                    values.insert(id.column.clone(), value);
                }
            }
        }
        for column in &self.columns {
            let value = (column.read)(entity);
            if !value.is_null() {
                values.insert(column.column.clone(), value);
            }
        }
        if let Some(d) = &self.info.discriminator {
            values.insert(d.column.clone(), Value::Text(d.value.clone()));
        }
        values
    }

    /// Build an instance from the scalar columns of `row`.
    ///
    /// Columns missing from the row, or NULL in it, leave the member at its
    /// default value.
    pub fn hydrate(&self, row: &Row) -> Result<E> {
        let mut entity = E::default();
        if let Some(id) = &self.id {
            if let Some(value) = row.get_by_name(&id.column).filter(|v| !v.is_null()) {
                (id.write)(&mut entity, value).map_err(|e| self.load_error(&id.column, &e))?;
            }
        }
        for column in &self.columns {
            if let Some(value) = row.get_by_name(&column.column).filter(|v| !v.is_null()) {
                (column.write)(&mut entity, value)
                    .map_err(|e| self.load_error(&column.member, &e))?;
            }
        }
        Ok(entity)
    }

    pub(crate) fn handlers(&self) -> &[Arc<dyn AssociationHandler<E>>] {
        &self.handlers
    }

    fn load_error(&self, member: &str, cause: &Error) -> Error {
        Error::loader(self.info.type_name, Some(member), cause.to_string())
    }

    /// Re-express this type's members on `O`, which stores an `E`.
    pub(crate) fn lift<O: Model>(&self, to: fn(&O) -> &E, to_mut: fn(&mut O) -> &mut E) -> Parts<O> {
        Parts {
            info: self.info.clone(),
            discriminator_column: self.discriminator_column.clone(),
            id: self.id.as_ref().map(|id| {
                let (read, write, clear) = (Arc::clone(&id.read), Arc::clone(&id.write), Arc::clone(&id.clear));
                IdAccess {
                    column: id.column.clone(),
                    generated: id.generated,
                    read: Arc::new(move |o: &O| read(to(o))),
                    write: Arc::new(move |o: &mut O, v: &Value| write(to_mut(o), v)),
                    clear: Arc::new(move |o: &mut O| clear(to_mut(o))),
                }
            }),
            columns: self
                .columns
                .iter()
                .map(|c| {
                    let (read, write) = (Arc::clone(&c.read), Arc::clone(&c.write));
                    ColumnAccess {
                        member: c.member.clone(),
                        column: c.column.clone(),
                        read: Arc::new(move |o: &O| read(to(o))) as ReadFn<O>,
                        write: Arc::new(move |o: &mut O, v: &Value| write(to_mut(o), v)) as WriteFn<O>,
                    }
                })
                .collect(),
            handlers: self
                .handlers
                .iter()
                .map(|h| Arc::new(Lifted::new(Arc::clone(h), to, to_mut)) as Arc<dyn AssociationHandler<O>>)
                .collect(),
        }
    }
}
