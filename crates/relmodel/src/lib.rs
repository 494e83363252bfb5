//! relmodel - declarative entity mapping for relational databases.
//!
//! relmodel maps plain Rust structs onto tables and keeps object graphs in
//! step with the rows behind them:
//!
//! - Metadata declared once per type through [`Model`]
//! - One-to-one, many-to-one, one-to-many and many-to-many associations
//!   with cascading save and delete
//! - An identity map so every row is one instance within a read
//! - Lazy references and collections that load on first access
//! - Single-table inheritance and embedded value types
//!
//! # Quick Start
//!
//! ```ignore
//! use relmodel::prelude::*;
//!
//! #[derive(Debug, Default)]
//! struct Author {
//!     id: Option<i64>,
//!     name: String,
//!     books: RelatedMany<Book>,
//! }
//!
//! impl Model for Author {
//!     fn mapping(m: &mut Mapping<Self>) {
//!         m.entity();
//!         m.id("id", |a| &a.id, |a| &mut a.id).generated();
//!         m.field("name", |a| &a.name, |a| &mut a.name);
//!         m.one_to_many("books", |a| &a.books, |a| &mut a.books)
//!             .mapped_by("author")
//!             .cascade(&[Cascade::All]);
//!     }
//! }
//!
//! let mut factory = relmodel::session_factory();
//! factory.configure(DataSourceConfig::new("sqlite", "library.db"))?;
//! let session = factory.session()?;
//!
//! let mut author = Author { name: "Le Guin".into(), ..Author::default() };
//! session.save(&mut author)?;
//! let found = session.find_by_id::<Author>(author.id.unwrap())?;
//! ```

pub use relmodel_core::{
    ColumnMap, Connection, DataSourceConfig, Dialect, Driver, Error, EntityIdErrorKind,
    QueryErrorKind, Result, Row, Value,
};
pub use relmodel_query::{Direction, Filter, OrderBy, Select};
pub use relmodel_session::{
    AssociationKind, Cascade, EntityDescriptor, EntityInfo, EntityRef, Fetch, IdentityMap,
    JoinTable, LazyCollection, LazyProxy, Mapping, Model, Related, RelatedMany, Session,
    SessionFactory, describe,
};
#[cfg(feature = "sqlite")]
pub use relmodel_sqlite::{SqliteConnection, SqliteDriver};

/// A [`SessionFactory`] with every driver compiled into this build
/// registered. Configure it before opening sessions.
pub fn session_factory() -> SessionFactory {
    #[allow(unused_mut)]
    let mut factory = SessionFactory::new();
    #[cfg(feature = "sqlite")]
    factory.register_driver(SqliteDriver);
    factory
}

/// Everything needed to declare and use mapped types.
pub mod prelude {
    pub use crate::{
        Cascade, DataSourceConfig, EntityRef, Error, Fetch, JoinTable, LazyCollection, Mapping,
        Model, Related, RelatedMany, Result, Session, SessionFactory, Value, session_factory,
    };
}
