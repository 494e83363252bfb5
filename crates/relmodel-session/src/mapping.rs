//! Declaring how a Rust type maps onto a table.
//!
//! A [`Model`] fills in a [`Mapping`] once; the result is turned into an
//! [`EntityDescriptor`](crate::EntityDescriptor) and cached for the life of
//! the process.
//!
//! ```ignore
//! impl Model for User {
//!     fn mapping(m: &mut Mapping<Self>) {
//!         m.entity().table("users");
//!         m.id("id", |u| &u.id, |u| &mut u.id).generated();
//!         m.field("name", |u| &u.name, |u| &mut u.name);
//!         m.one_to_many("phones", |u| &u.phones, |u| &mut u.phones)
//!             .mapped_by("owner")
//!             .cascade(&[Cascade::All])
//!             .orphan_removal(true);
//!     }
//! }
//! ```

use std::sync::Arc;

use relmodel_core::{FromValue, Result, Value};

use crate::association::{AssociationDescriptor, AssociationKind, Cascade, Fetch, JoinTable};
use crate::metadata::{Parts, describe, simple_name};
use crate::model::Model;
use crate::related::{Related, RelatedMany};
use crate::resolver::{AssociationHandler, ToManyHandler, ToOneHandler};

pub(crate) type ReadFn<E> = Arc<dyn Fn(&E) -> Value + Send + Sync>;
pub(crate) type WriteFn<E> = Arc<dyn Fn(&mut E, &Value) -> Result<()> + Send + Sync>;
pub(crate) type ClearFn<E> = Arc<dyn Fn(&mut E) + Send + Sync>;
pub(crate) type LiftFn<E> = Box<dyn FnOnce() -> Result<Parts<E>>>;
type HandlerFn<E> = Box<dyn FnOnce(Arc<AssociationDescriptor>) -> Arc<dyn AssociationHandler<E>>>;

/// Options of one scalar or embedded member.
#[derive(Debug, Clone)]
pub struct ColumnDecl {
    pub(crate) member: String,
    pub(crate) column: Option<String>,
    pub(crate) transient: bool,
    pub(crate) generated: bool,
}

impl ColumnDecl {
    fn new(member: &str) -> Self {
        Self {
            member: member.to_string(),
            column: None,
            transient: false,
            generated: false,
        }
    }

    /// Store the member under a different column name.
    pub fn column(&mut self, name: &str) -> &mut Self {
        self.column = Some(name.to_string());
        self
    }

    /// Never read from or written to the database.
    pub fn transient(&mut self) -> &mut Self {
        self.transient = true;
        self
    }

    /// The database assigns the value on insert. Only valid on the
    /// identifier member.
    pub fn generated(&mut self) -> &mut Self {
        self.generated = true;
        self
    }

    pub(crate) fn column_name(&self) -> String {
        self.column.clone().unwrap_or_else(|| self.member.clone())
    }
}

pub(crate) enum SlotKind<E> {
    Id {
        read: ReadFn<E>,
        write: WriteFn<E>,
        clear: ClearFn<E>,
    },
    Field {
        read: ReadFn<E>,
        write: WriteFn<E>,
    },
    Embedded(LiftFn<E>),
}

pub(crate) struct MemberSlot<E> {
    pub(crate) decl: ColumnDecl,
    pub(crate) kind: SlotKind<E>,
}

/// Options of one association member.
#[derive(Debug, Clone)]
pub struct AssociationDecl {
    member: String,
    kind: AssociationKind,
    target: &'static str,
    mapped_by: Option<String>,
    join_column: Option<String>,
    join_table: Option<JoinTable>,
    cascade: Vec<Cascade>,
    fetch: Option<Fetch>,
    orphan_removal: bool,
}

impl AssociationDecl {
    fn new(member: &str, kind: AssociationKind, target: &'static str) -> Self {
        Self {
            member: member.to_string(),
            kind,
            target,
            mapped_by: None,
            join_column: None,
            join_table: None,
            cascade: Vec::new(),
            fetch: None,
            orphan_removal: false,
        }
    }

    /// Mark this member as the inverse side of `member` on the target.
    pub fn mapped_by(&mut self, member: &str) -> &mut Self {
        self.mapped_by = Some(member.to_string());
        self
    }

    pub fn join_column(&mut self, column: &str) -> &mut Self {
        self.join_column = Some(column.to_string());
        self
    }

    pub fn join_table(&mut self, join_table: JoinTable) -> &mut Self {
        self.join_table = Some(join_table);
        self
    }

    pub fn cascade(&mut self, cascade: &[Cascade]) -> &mut Self {
        self.cascade = cascade.to_vec();
        self
    }

    /// Override the default fetch mode (eager for to-one, lazy for to-many).
    pub fn fetch(&mut self, fetch: Fetch) -> &mut Self {
        self.fetch = Some(fetch);
        self
    }

    pub fn orphan_removal(&mut self, enabled: bool) -> &mut Self {
        self.orphan_removal = enabled;
        self
    }

    pub(crate) fn into_descriptor(self) -> AssociationDescriptor {
        let default_fetch = match self.kind {
            AssociationKind::OneToOne | AssociationKind::ManyToOne => Fetch::Eager,
            AssociationKind::OneToMany | AssociationKind::ManyToMany => Fetch::Lazy,
        };
        AssociationDescriptor {
            member: self.member,
            kind: self.kind,
            target: self.target,
            mapped_by: self.mapped_by,
            join_column: self.join_column,
            join_table: self.join_table,
            cascade: self.cascade,
            fetch: self.fetch.unwrap_or(default_fetch),
            orphan_removal: self.orphan_removal,
            resolved: std::sync::OnceLock::new(),
        }
    }
}

pub(crate) struct AssociationSlot<E> {
    pub(crate) decl: AssociationDecl,
    pub(crate) make: HandlerFn<E>,
}

/// Mapping declarations collected from [`Model::mapping`].
pub struct Mapping<E> {
    pub(crate) type_name: &'static str,
    pub(crate) is_entity: bool,
    pub(crate) is_embeddable: bool,
    pub(crate) table: Option<String>,
    pub(crate) inheritance: bool,
    pub(crate) discriminator_column: Option<String>,
    pub(crate) discriminator_value: Option<String>,
    pub(crate) parent: Option<LiftFn<E>>,
    pub(crate) members: Vec<MemberSlot<E>>,
    pub(crate) associations: Vec<AssociationSlot<E>>,
}

impl<E: Model> Mapping<E> {
    pub(crate) fn new() -> Self {
        Self {
            type_name: simple_name::<E>(),
            is_entity: false,
            is_embeddable: false,
            table: None,
            inheritance: false,
            discriminator_column: None,
            discriminator_value: None,
            parent: None,
            members: Vec::new(),
            associations: Vec::new(),
        }
    }

    /// Mark the type as a persistent entity.
    pub fn entity(&mut self) -> &mut Self {
        self.is_entity = true;
        self
    }

    /// Mark the type as a value embedded into its owner's row.
    pub fn embeddable(&mut self) -> &mut Self {
        self.is_embeddable = true;
        self
    }

    pub fn table(&mut self, name: &str) -> &mut Self {
        self.table = Some(name.to_string());
        self
    }

    /// Mark the root of a single-table hierarchy.
    pub fn inheritance(&mut self) -> &mut Self {
        self.inheritance = true;
        self
    }

    pub fn discriminator_column(&mut self, name: &str) -> &mut Self {
        self.discriminator_column = Some(name.to_string());
        self
    }

    pub fn discriminator_value(&mut self, value: &str) -> &mut Self {
        self.discriminator_value = Some(value.to_string());
        self
    }

    /// Inherit every member of `P`, which is stored inside this type.
    pub fn extends<P: Model>(
        &mut self,
        to_parent: fn(&E) -> &P,
        to_parent_mut: fn(&mut E) -> &mut P,
    ) -> &mut Self {
        self.parent = Some(Box::new(move || {
            Ok(describe::<P>()?.lift(to_parent, to_parent_mut))
        }));
        self
    }

    /// Declare the identifier member.
    pub fn id<F>(&mut self, member: &str, get: fn(&E) -> &F, get_mut: fn(&mut E) -> &mut F) -> &mut ColumnDecl
    where
        F: Clone + Default + Into<Value> + FromValue + 'static,
    {
        let (read, write) = accessors(get, get_mut);
        let clear: ClearFn<E> = Arc::new(move |e: &mut E| *get_mut(e) = F::default());
        self.push_member(member, SlotKind::Id { read, write, clear })
    }

    /// Declare a scalar member.
    pub fn field<F>(&mut self, member: &str, get: fn(&E) -> &F, get_mut: fn(&mut E) -> &mut F) -> &mut ColumnDecl
    where
        F: Clone + Into<Value> + FromValue + 'static,
    {
        let (read, write) = accessors(get, get_mut);
        self.push_member(member, SlotKind::Field { read, write })
    }

    /// Declare a member whose own members are stored in this row.
    pub fn embedded<A: Model>(
        &mut self,
        member: &str,
        get: fn(&E) -> &A,
        get_mut: fn(&mut E) -> &mut A,
    ) -> &mut ColumnDecl {
        let lift: LiftFn<E> = Box::new(move || Ok(describe::<A>()?.lift(get, get_mut)));
        self.push_member(member, SlotKind::Embedded(lift))
    }

    pub fn one_to_one<T: Model>(
        &mut self,
        member: &str,
        get: fn(&E) -> &Related<T>,
        get_mut: fn(&mut E) -> &mut Related<T>,
    ) -> &mut AssociationDecl {
        self.push_to_one(member, AssociationKind::OneToOne, get, get_mut)
    }

    pub fn many_to_one<T: Model>(
        &mut self,
        member: &str,
        get: fn(&E) -> &Related<T>,
        get_mut: fn(&mut E) -> &mut Related<T>,
    ) -> &mut AssociationDecl {
        self.push_to_one(member, AssociationKind::ManyToOne, get, get_mut)
    }

    pub fn one_to_many<T: Model>(
        &mut self,
        member: &str,
        get: fn(&E) -> &RelatedMany<T>,
        get_mut: fn(&mut E) -> &mut RelatedMany<T>,
    ) -> &mut AssociationDecl {
        self.push_to_many(member, AssociationKind::OneToMany, get, get_mut)
    }

    pub fn many_to_many<T: Model>(
        &mut self,
        member: &str,
        get: fn(&E) -> &RelatedMany<T>,
        get_mut: fn(&mut E) -> &mut RelatedMany<T>,
    ) -> &mut AssociationDecl {
        self.push_to_many(member, AssociationKind::ManyToMany, get, get_mut)
    }

    fn push_member(&mut self, member: &str, kind: SlotKind<E>) -> &mut ColumnDecl {
        let index = self.members.len();
        self.members.push(MemberSlot {
            decl: ColumnDecl::new(member),
            kind,
        });
        &mut self.members[index].decl
    }

    fn push_to_one<T: Model>(
        &mut self,
        member: &str,
        kind: AssociationKind,
        get: fn(&E) -> &Related<T>,
        get_mut: fn(&mut E) -> &mut Related<T>,
    ) -> &mut AssociationDecl {
        let make: HandlerFn<E> = Box::new(move |desc| {
            Arc::new(ToOneHandler::new(desc, get, get_mut)) as Arc<dyn AssociationHandler<E>>
        });
        self.push_association(AssociationDecl::new(member, kind, simple_name::<T>()), make)
    }

    fn push_to_many<T: Model>(
        &mut self,
        member: &str,
        kind: AssociationKind,
        get: fn(&E) -> &RelatedMany<T>,
        get_mut: fn(&mut E) -> &mut RelatedMany<T>,
    ) -> &mut AssociationDecl {
        let make: HandlerFn<E> = Box::new(move |desc| {
            Arc::new(ToManyHandler::new(desc, get, get_mut)) as Arc<dyn AssociationHandler<E>>
        });
        self.push_association(AssociationDecl::new(member, kind, simple_name::<T>()), make)
    }

    fn push_association(&mut self, decl: AssociationDecl, make: HandlerFn<E>) -> &mut AssociationDecl {
        let index = self.associations.len();
        self.associations.push(AssociationSlot { decl, make });
        &mut self.associations[index].decl
    }
}

fn accessors<E: 'static, F>(
    get: fn(&E) -> &F,
    get_mut: fn(&mut E) -> &mut F,
) -> (ReadFn<E>, WriteFn<E>)
where
    F: Clone + Into<Value> + FromValue + 'static,
{
    let read: ReadFn<E> = Arc::new(move |e: &E| get(e).clone().into());
    let write: WriteFn<E> = Arc::new(move |e: &mut E, value: &Value| {
        *get_mut(e) = F::from_value(value)?;
        Ok(())
    });
    (read, write)
}
