//! Entity mapping and the session for relmodel.
//!
//! `relmodel-session` is the **mapping layer**. It turns declared metadata
//! into table descriptors, resolves associations between mapped types, and
//! runs save/update/delete/find with cascades, stale-link cleanup and lazy
//! or eager loading.
//!
//! # Role In The Architecture
//!
//! - **Metadata**: [`Model`] impls declare a [`Mapping`]; [`describe`]
//!   turns it into a cached [`EntityDescriptor`].
//! - **Associations**: foreign-key and join-table naming, cascade and
//!   fetch rules, driven through per-member handlers.
//! - **Identity map**: one instance per (type, id) within a read, which is
//!   also what stops traversal of cyclic graphs.
//! - **Lazy loading**: [`LazyProxy`] and [`LazyCollection`] load once, on
//!   first access.
//! - **Session**: [`Session`] sequences all of the above inside
//!   transactions; [`SessionFactory`] opens sessions from a configured
//!   data source.
//!
//! # Example
//!
//! ```ignore
//! let mut user = User { name: "Ann".into(), ..User::default() };
//! user.phones.push(EntityRef::new(Phone { number: "555".into(), ..Phone::default() }))?;
//! session.save(&mut user)?;
//!
//! let loaded = session.find_by_id::<User>(user.id.unwrap())?.unwrap();
//! assert_eq!(loaded.read().phones.len()?, 1);
//! ```

pub mod association;
pub mod factory;
pub mod identity_map;
pub mod lazy;
pub mod mapping;
pub mod metadata;
pub mod model;
pub mod related;
mod resolver;
pub mod session;

pub use association::{
    AssociationDescriptor, AssociationKind, Cascade, Fetch, JoinTable, ResolvedNames,
};
pub use factory::SessionFactory;
pub use identity_map::IdentityMap;
pub use lazy::{LazyCollection, LazyProxy};
pub use mapping::{AssociationDecl, ColumnDecl, Mapping};
pub use metadata::{
    ColumnDescriptor, Discriminator, EmbeddedDescriptor, EntityDescriptor, EntityInfo, describe,
};
pub use model::Model;
pub use related::{EntityRef, Related, RelatedMany};
pub use session::Session;

#[cfg(test)]
pub(crate) mod testing {
    //! Mapped types and a recording connection shared by the unit tests.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, PoisonError};

    use relmodel_core::{
        Connection, DataSourceConfig, Dialect, Driver, Error, QueryError, QueryErrorKind, Result,
        Row, Value,
    };

    use crate::{Cascade, Fetch, Mapping, Model, Related, RelatedMany, Session};

    #[derive(Debug, Default)]
    pub struct User {
        pub id: Option<i64>,
        pub name: String,
        pub nickname: Option<String>,
        pub scratch: String,
        pub phones: RelatedMany<Phone>,
        pub roles: RelatedMany<Role>,
    }

    impl Model for User {
        fn mapping(m: &mut Mapping<Self>) {
            m.entity();
            m.id("id", |u| &u.id, |u| &mut u.id).generated();
            m.field("name", |u| &u.name, |u| &mut u.name);
            m.field("nickname", |u| &u.nickname, |u| &mut u.nickname);
            m.field("scratch", |u| &u.scratch, |u| &mut u.scratch).transient();
            m.one_to_many("phones", |u| &u.phones, |u| &mut u.phones)
                .mapped_by("owner")
                .cascade(&[Cascade::All])
                .orphan_removal(true);
            m.many_to_many("roles", |u| &u.roles, |u| &mut u.roles)
                .cascade(&[Cascade::Persist]);
        }
    }

    #[derive(Debug, Default)]
    pub struct Phone {
        pub id: Option<i64>,
        pub number: String,
        pub active: bool,
        pub kind: char,
        pub owner: Related<User>,
    }

    impl Model for Phone {
        fn mapping(m: &mut Mapping<Self>) {
            m.entity();
            m.id("id", |p| &p.id, |p| &mut p.id).generated();
            m.field("number", |p| &p.number, |p| &mut p.number);
            m.field("active", |p| &p.active, |p| &mut p.active);
            m.field("kind", |p| &p.kind, |p| &mut p.kind);
            m.many_to_one("owner", |p| &p.owner, |p| &mut p.owner);
        }
    }

    #[derive(Debug, Default)]
    pub struct Role {
        pub id: Option<i64>,
        pub name: String,
        pub users: RelatedMany<User>,
    }

    impl Model for Role {
        fn mapping(m: &mut Mapping<Self>) {
            m.entity();
            m.id("id", |r| &r.id, |r| &mut r.id).generated();
            m.field("name", |r| &r.name, |r| &mut r.name);
            m.many_to_many("users", |r| &r.users, |r| &mut r.users)
                .mapped_by("roles");
        }
    }

    #[derive(Debug, Default)]
    pub struct Course {
        pub id: Option<i64>,
        pub title: String,
        pub students: RelatedMany<Student>,
    }

    impl Model for Course {
        fn mapping(m: &mut Mapping<Self>) {
            m.entity();
            m.id("id", |c| &c.id, |c| &mut c.id).generated();
            m.field("title", |c| &c.title, |c| &mut c.title);
            m.many_to_many("students", |c| &c.students, |c| &mut c.students)
                .fetch(Fetch::Eager);
        }
    }

    #[derive(Debug, Default)]
    pub struct Student {
        pub id: Option<i64>,
        pub name: String,
    }

    impl Model for Student {
        fn mapping(m: &mut Mapping<Self>) {
            m.entity();
            m.id("id", |s| &s.id, |s| &mut s.id).generated();
            m.field("name", |s| &s.name, |s| &mut s.name);
        }
    }

    #[derive(Debug, Default)]
    pub struct Person {
        pub id: Option<i64>,
        pub name: String,
    }

    impl Model for Person {
        fn mapping(m: &mut Mapping<Self>) {
            m.entity().inheritance().discriminator_column("kind");
            m.id("id", |p| &p.id, |p| &mut p.id).generated();
            m.field("name", |p| &p.name, |p| &mut p.name);
        }
    }

    #[derive(Debug, Default)]
    pub struct Admin {
        pub person: Person,
        pub level: i64,
    }

    impl Model for Admin {
        fn mapping(m: &mut Mapping<Self>) {
            m.entity()
                .extends::<Person>(|a| &a.person, |a| &mut a.person)
                .discriminator_value("ADM");
            m.field("level", |a| &a.level, |a| &mut a.level);
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    pub struct Geo {
        pub lat: f64,
        pub lon: f64,
    }

    impl Model for Geo {
        fn mapping(m: &mut Mapping<Self>) {
            m.embeddable();
            m.field("lat", |g| &g.lat, |g| &mut g.lat);
            m.field("lon", |g| &g.lon, |g| &mut g.lon);
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    pub struct Address {
        pub street: String,
        pub city: String,
        pub geo: Geo,
    }

    impl Model for Address {
        fn mapping(m: &mut Mapping<Self>) {
            m.embeddable();
            m.field("street", |a| &a.street, |a| &mut a.street);
            m.field("city", |a| &a.city, |a| &mut a.city).column("town");
            m.embedded("geo", |a| &a.geo, |a| &mut a.geo);
        }
    }

    #[derive(Debug, Default)]
    pub struct Contact {
        pub id: Option<i64>,
        pub address: Address,
    }

    impl Model for Contact {
        fn mapping(m: &mut Mapping<Self>) {
            m.entity();
            m.id("id", |c| &c.id, |c| &mut c.id).generated();
            m.embedded("address", |c| &c.address, |c| &mut c.address);
        }
    }

    #[derive(Debug, Default)]
    pub struct MockState {
        pub statements: Vec<(String, Vec<Value>)>,
        pub events: Vec<&'static str>,
        pub results: VecDeque<Vec<Row>>,
        pub affected: VecDeque<u64>,
        pub next_id: i64,
        pub fail_on: Option<String>,
    }

    /// Records every statement and replays scripted query results in order.
    /// Statements without a scripted count affect one row.
    #[derive(Clone, Default)]
    pub struct MockConnection {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockConnection {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn push_rows(&self, columns: &[&str], rows: Vec<Vec<Value>>) {
            let names: Vec<String> = columns.iter().map(|c| (*c).to_string()).collect();
            let rows = rows.into_iter().map(|values| Row::new(names.clone(), values)).collect();
            self.state().results.push_back(rows);
        }

        pub fn push_affected(&self, count: u64) {
            self.state().affected.push_back(count);
        }

        pub fn fail_on(&self, fragment: &str) {
            self.state().fail_on = Some(fragment.to_string());
        }

        pub fn statements(&self) -> Vec<String> {
            self.state().statements.iter().map(|(sql, _)| sql.clone()).collect()
        }

        pub fn params(&self, index: usize) -> Vec<Value> {
            self.state().statements[index].1.clone()
        }

        pub fn events(&self) -> Vec<&'static str> {
            self.state().events.clone()
        }

        pub fn session(&self) -> Session {
            Session::new(Box::new(self.clone()))
        }

        fn record(&self, sql: &str, params: &[Value]) -> Result<()> {
            let mut state = self.state();
            state.statements.push((sql.to_string(), params.to_vec()));
            if state.fail_on.as_deref().is_some_and(|f| sql.contains(f)) {
                return Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Constraint,
                    sql: Some(sql.to_string()),
                    message: "scripted failure".to_string(),
                    source: None,
                }));
            }
            Ok(())
        }
    }

    impl Connection for MockConnection {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
            self.record(sql, params)?;
            Ok(self.state().results.pop_front().unwrap_or_default())
        }

        fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
            self.record(sql, params)?;
            Ok(self.state().affected.pop_front().unwrap_or(1))
        }

        fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
            self.record(sql, params)?;
            let mut state = self.state();
            state.next_id += 1;
            Ok(state.next_id)
        }

        fn begin(&self) -> Result<()> {
            self.state().events.push("begin");
            Ok(())
        }

        fn commit(&self) -> Result<()> {
            self.state().events.push("commit");
            Ok(())
        }

        fn rollback(&self) -> Result<()> {
            self.state().events.push("rollback");
            Ok(())
        }
    }

    pub struct MockDriver {
        conn: MockConnection,
    }

    impl MockDriver {
        pub fn new(conn: MockConnection) -> Self {
            Self { conn }
        }
    }

    impl Driver for MockDriver {
        fn name(&self) -> &str {
            "mock"
        }

        fn connect(&self, _config: &DataSourceConfig) -> Result<Box<dyn Connection>> {
            Ok(Box::new(self.conn.clone()))
        }
    }
}
