use relmodel::prelude::*;
use relmodel::{EntityIdErrorKind, describe};

#[derive(Debug, Default)]
struct Author {
    id: Option<i64>,
    name: String,
    books: RelatedMany<Book>,
    tags: RelatedMany<Tag>,
}

impl Model for Author {
    fn mapping(m: &mut Mapping<Self>) {
        m.entity();
        m.id("id", |a| &a.id, |a| &mut a.id).generated();
        m.field("name", |a| &a.name, |a| &mut a.name);
        m.one_to_many("books", |a| &a.books, |a| &mut a.books)
            .mapped_by("author")
            .cascade(&[Cascade::All])
            .orphan_removal(true);
        m.many_to_many("tags", |a| &a.tags, |a| &mut a.tags)
            .cascade(&[Cascade::Persist]);
    }
}

#[derive(Debug, Default)]
struct Book {
    id: Option<i64>,
    title: String,
    author: Related<Author>,
    shelf: Related<Shelf>,
}

impl Model for Book {
    fn mapping(m: &mut Mapping<Self>) {
        m.entity();
        m.id("id", |b| &b.id, |b| &mut b.id).generated();
        m.field("title", |b| &b.title, |b| &mut b.title);
        m.many_to_one("author", |b| &b.author, |b| &mut b.author);
        m.many_to_one("shelf", |b| &b.shelf, |b| &mut b.shelf)
            .fetch(Fetch::Lazy);
    }
}

#[derive(Debug, Default)]
struct Shelf {
    id: Option<i64>,
    name: String,
    books: RelatedMany<Book>,
}

impl Model for Shelf {
    fn mapping(m: &mut Mapping<Self>) {
        m.entity();
        m.id("id", |s| &s.id, |s| &mut s.id).generated();
        m.field("name", |s| &s.name, |s| &mut s.name);
        m.one_to_many("books", |s| &s.books, |s| &mut s.books)
            .mapped_by("shelf")
            .cascade(&[Cascade::Persist]);
    }
}

#[derive(Debug, Default)]
struct Tag {
    id: Option<i64>,
    label: String,
    authors: RelatedMany<Author>,
}

impl Model for Tag {
    fn mapping(m: &mut Mapping<Self>) {
        m.entity();
        m.id("id", |t| &t.id, |t| &mut t.id).generated();
        m.field("label", |t| &t.label, |t| &mut t.label);
        m.many_to_many("authors", |t| &t.authors, |t| &mut t.authors)
            .mapped_by("tags");
    }
}

#[derive(Debug, Default)]
struct Person {
    id: Option<i64>,
    name: String,
}

impl Model for Person {
    fn mapping(m: &mut Mapping<Self>) {
        m.entity().inheritance().discriminator_column("kind");
        m.id("id", |p| &p.id, |p| &mut p.id).generated();
        m.field("name", |p| &p.name, |p| &mut p.name);
    }
}

#[derive(Debug, Default)]
struct Admin {
    person: Person,
    level: i64,
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
struct Geo {
    lat: f64,
    lon: f64,
}

impl Model for Geo {
    fn mapping(m: &mut Mapping<Self>) {
        m.embeddable();
        m.field("lat", |g| &g.lat, |g| &mut g.lat);
        m.field("lon", |g| &g.lon, |g| &mut g.lon);
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Address {
    street: String,
    city: String,
    geo: Geo,
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
struct Contact {
    id: Option<i64>,
    address: Address,
}

impl Model for Contact {
    fn mapping(m: &mut Mapping<Self>) {
        m.entity();
        m.id("id", |c| &c.id, |c| &mut c.id).generated();
        m.embedded("address", |c| &c.address, |c| &mut c.address);
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE author (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
    "CREATE TABLE shelf (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
    "CREATE TABLE book (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL CHECK (length(title) > 0),
        author_id INTEGER REFERENCES author(id),
        shelf_id INTEGER REFERENCES shelf(id)
    )",
    "CREATE TABLE tag (id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT NOT NULL)",
    "CREATE TABLE author_tag (author_id INTEGER NOT NULL, tag_id INTEGER NOT NULL)",
    "CREATE TABLE person (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, kind TEXT, level INTEGER)",
    "CREATE TABLE contact (id INTEGER PRIMARY KEY AUTOINCREMENT, street TEXT, town TEXT, lat REAL, lon REAL)",
];

fn open() -> Session {
    let mut factory = relmodel::session_factory();
    factory
        .configure(DataSourceConfig::new("sqlite", ":memory:"))
        .expect("configure data source");
    let session = factory.session().expect("open session");
    for ddl in SCHEMA {
        session.execute(ddl, &[]).expect("create schema");
    }
    session
}

fn count(session: &Session, table: &str) -> i64 {
    let rows = session
        .raw_query(&format!("SELECT COUNT(*) AS n FROM {table}"))
        .expect("count rows");
    rows[0].get("n").and_then(Value::as_i64).expect("count column")
}

fn book(title: &str) -> EntityRef<Book> {
    EntityRef::new(Book {
        title: title.to_string(),
        ..Book::default()
    })
}

fn author_with_books(titles: &[&str]) -> Author {
    Author {
        name: "Le Guin".to_string(),
        books: RelatedMany::new(titles.iter().map(|t| book(t)).collect()),
        ..Author::default()
    }
}

#[test]
fn save_cascades_and_find_loads_lazily() {
    let session = open();
    let mut author = author_with_books(&["Earthsea", "Lathe"]);
    assert!(session.save(&mut author).unwrap());

    let id = author.id.expect("generated id");
    for b in author.books.to_vec().unwrap() {
        assert!(b.read().id.is_some());
    }
    assert_eq!(count(&session, "book"), 2);

    let loaded = session.find_by_id::<Author>(id).unwrap().expect("author row");
    let guard = loaded.read();
    assert_eq!(guard.name, "Le Guin");
    assert!(!guard.books.is_loaded());
    let titles: Vec<String> = guard
        .books
        .to_vec()
        .unwrap()
        .iter()
        .map(|b| b.read().title.clone())
        .collect();
    assert_eq!(titles, vec!["Earthsea", "Lathe"]);

    // The eager back-reference points at the stored author.
    let first = guard.books.get(0).unwrap().unwrap();
    let owner = first.read().author.get().unwrap().unwrap();
    assert_eq!(owner.read().id, Some(id));
}

#[test]
fn find_by_id_without_row() {
    let session = open();
    assert!(session.find_by_id::<Author>(42_i64).unwrap().is_none());
}

#[test]
fn update_removes_orphans() {
    let session = open();
    let mut author = author_with_books(&["A", "B", "C"]);
    session.save(&mut author).unwrap();

    let loaded = session.find_by_id::<Author>(author.id.unwrap()).unwrap().unwrap();
    {
        let mut guard = loaded.write();
        guard.name = "Ursula".to_string();
        let second = guard.books.get(1).unwrap().unwrap();
        assert!(guard.books.remove(&second).unwrap());
        guard.books.push(book("D")).unwrap();
    }
    assert!(session.update(&*loaded.read()).unwrap());

    let titles: Vec<String> = session
        .prepared_query("SELECT title FROM book ORDER BY title", &[])
        .unwrap()
        .into_iter()
        .filter_map(|row| row.get("title").and_then(Value::as_str).map(String::from))
        .collect();
    assert_eq!(titles, vec!["A", "C", "D"]);

    let names = session.raw_query("SELECT name FROM author").unwrap();
    assert_eq!(names[0].get("name"), Some(&Value::Text("Ursula".into())));
}

#[test]
fn update_of_missing_row_reports_false() {
    let session = open();
    let ghost = Author {
        id: Some(99),
        name: "nobody".to_string(),
        ..Author::default()
    };
    assert!(!session.update(&ghost).unwrap());
}

#[test]
fn delete_removes_owned_children() {
    let session = open();
    let mut author = author_with_books(&["A", "B"]);
    session.save(&mut author).unwrap();

    assert!(session.delete(&mut author).unwrap());
    assert!(author.id.is_none());
    assert_eq!(count(&session, "author"), 0);
    assert_eq!(count(&session, "book"), 0);

    let books = author.books.to_vec().unwrap();
    assert!(books.iter().all(|b| b.read().id.is_none()));

    books[1].write().title = "Tehanu".to_string();
    assert!(session.save(&mut author).unwrap());
    assert!(author.id.is_some());
    assert!(books.iter().all(|b| b.read().id.is_some()));
    assert_eq!(count(&session, "author"), 1);
    assert_eq!(count(&session, "book"), 2);
}

#[test]
fn delete_nulls_foreign_key_without_remove_cascade() {
    let session = open();
    let mut shelf = Shelf {
        name: "fiction".to_string(),
        books: RelatedMany::new(vec![book("Dune")]),
        ..Shelf::default()
    };
    session.save(&mut shelf).unwrap();
    let rows = session.raw_query("SELECT shelf_id FROM book").unwrap();
    assert_eq!(rows[0].get("shelf_id"), Some(&Value::BigInt(shelf.id.unwrap())));

    assert!(session.delete(&mut shelf).unwrap());
    assert_eq!(count(&session, "book"), 1);
    let rows = session.raw_query("SELECT shelf_id FROM book").unwrap();
    assert_eq!(rows[0].get("shelf_id"), Some(&Value::Null));
}

#[test]
fn update_nulls_removed_children_without_orphan_removal() {
    let session = open();
    let kept = book("Kept");
    let dropped = book("Dropped");
    let mut shelf = Shelf {
        name: "misc".to_string(),
        books: RelatedMany::new(vec![kept, dropped.clone()]),
        ..Shelf::default()
    };
    session.save(&mut shelf).unwrap();

    assert!(shelf.books.remove(&dropped).unwrap());
    assert!(session.update(&shelf).unwrap());

    let rows = session
        .raw_query("SELECT title, shelf_id FROM book ORDER BY title")
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("title"), Some(&Value::Text("Dropped".into())));
    assert_eq!(rows[0].get("shelf_id"), Some(&Value::Null));
    assert_eq!(rows[1].get("shelf_id"), Some(&Value::BigInt(shelf.id.unwrap())));
}

#[test]
fn lazy_to_one_loads_on_access() {
    let session = open();
    let mut shelf = Shelf {
        name: "poetry".to_string(),
        books: RelatedMany::new(vec![book("Odes")]),
        ..Shelf::default()
    };
    session.save(&mut shelf).unwrap();

    let books = session.find_all::<Book>().unwrap().to_vec().unwrap();
    let guard = books[0].read();
    assert!(!guard.shelf.is_loaded());
    let loaded = guard.shelf.get().unwrap().unwrap();
    assert_eq!(loaded.read().name, "poetry");
    assert!(guard.shelf.is_loaded());
}

#[test]
fn unsaved_parent_is_rejected() {
    let session = open();
    let mut orphan = Book {
        title: "Draft".to_string(),
        author: Related::new(EntityRef::new(Author {
            name: "anon".to_string(),
            ..Author::default()
        })),
        ..Book::default()
    };
    let err = session.save(&mut orphan).unwrap_err();
    assert!(matches!(err, Error::Entity(_)));
    assert!(err.to_string().contains("save the Author before the Book"));
    assert!(orphan.id.is_none());
    assert_eq!(count(&session, "book"), 0);
}

#[test]
fn saved_parent_is_referenced() {
    let session = open();
    let mut author = Author {
        name: "Herbert".to_string(),
        ..Author::default()
    };
    session.save(&mut author).unwrap();
    let author_id = author.id.unwrap();

    let mut novel = Book {
        title: "Dune".to_string(),
        author: Related::new(EntityRef::new(author)),
        ..Book::default()
    };
    session.save(&mut novel).unwrap();
    let rows = session.raw_query("SELECT author_id FROM book").unwrap();
    assert_eq!(rows[0].get("author_id"), Some(&Value::BigInt(author_id)));
}

#[test]
fn failed_child_rolls_back_everything() {
    let session = open();
    let mut author = author_with_books(&["ok", ""]);
    let err = session.save(&mut author).unwrap_err();
    assert!(matches!(err, Error::Query(ref q) if q.kind == relmodel::QueryErrorKind::Constraint));
    assert!(author.id.is_none());
    assert_eq!(count(&session, "author"), 0);
    assert_eq!(count(&session, "book"), 0);
}

#[test]
fn generated_id_must_be_unset() {
    let session = open();
    let mut author = Author {
        id: Some(5),
        ..Author::default()
    };
    let err = session.save(&mut author).unwrap_err();
    assert_eq!(err.entity_id_kind(), Some(EntityIdErrorKind::AutoGeneratedId));
}

#[test]
fn many_to_many_link_is_written_once() {
    let session = open();
    let tag = EntityRef::new(Tag {
        label: "fantasy".to_string(),
        ..Tag::default()
    });
    let mut author = Author {
        name: "Jemisin".to_string(),
        tags: RelatedMany::new(vec![tag.clone()]),
        ..Author::default()
    };
    session.save(&mut author).unwrap();
    assert!(tag.read().id.is_some());
    assert!(session.update(&author).unwrap());
    assert!(session.update(&author).unwrap());
    assert_eq!(count(&session, "tag"), 1);
    assert_eq!(count(&session, "author_tag"), 1);

    // The inverse side reads through the same join table.
    let loaded = session.find_by_id::<Tag>(tag.read().id.unwrap()).unwrap().unwrap();
    let authors = loaded.read().authors.to_vec().unwrap();
    assert_eq!(authors.len(), 1);
    assert_eq!(authors[0].read().name, "Jemisin");
}

#[test]
fn identity_map_shares_parent_within_a_read() {
    let session = open();
    let mut author = author_with_books(&["A", "B"]);
    session.save(&mut author).unwrap();

    let books = session.find_all::<Book>().unwrap().to_vec().unwrap();
    assert_eq!(books.len(), 2);
    let first = books[0].read().author.get().unwrap().unwrap();
    let second = books[1].read().author.get().unwrap().unwrap();
    assert!(first.ptr_eq(&second));

    // A separate read materializes a separate instance.
    let again = session.find_by_id::<Author>(author.id.unwrap()).unwrap().unwrap();
    assert!(!again.ptr_eq(&first));
}

#[test]
fn lazy_collection_loads_once() {
    let session = open();
    let mut author = author_with_books(&["A"]);
    session.save(&mut author).unwrap();

    let books = session.find_all::<Book>().unwrap();
    assert_eq!(books.len().unwrap(), 1);
    session
        .execute("INSERT INTO book (title) VALUES (?1)", &[Value::from("late")])
        .unwrap();
    assert_eq!(books.len().unwrap(), 1);
    assert_eq!(session.find_all::<Book>().unwrap().len().unwrap(), 2);
}

#[test]
fn lazy_collection_window() {
    let session = open();
    let mut author = author_with_books(&["a", "b", "c", "d"]);
    session.save(&mut author).unwrap();

    let page = session
        .find_all::<Book>()
        .unwrap()
        .filter("title <> ?", vec![Value::from("a")])
        .unwrap()
        .order_by("title desc")
        .unwrap()
        .limit(2)
        .unwrap()
        .offset(1)
        .unwrap();
    let titles: Vec<String> = page
        .iter()
        .unwrap()
        .map(|b| b.read().title.clone())
        .collect();
    assert_eq!(titles, vec!["c", "b"]);

    let mut all = session.find_all::<Book>().unwrap().order_by("title").unwrap();
    assert_eq!(all.first().unwrap().unwrap().read().title, "a");
}

#[test]
fn single_table_inheritance() {
    let session = open();
    let mut plain = Person {
        name: "Pat".to_string(),
        ..Person::default()
    };
    let mut admin = Admin {
        person: Person {
            name: "Root".to_string(),
            ..Person::default()
        },
        level: 3,
    };
    session.save(&mut plain).unwrap();
    session.save(&mut admin).unwrap();
    assert!(admin.person.id.is_some());

    let kinds = session.raw_query("SELECT kind FROM person ORDER BY id").unwrap();
    assert_eq!(kinds[0].get("kind"), Some(&Value::Text("Person".into())));
    assert_eq!(kinds[1].get("kind"), Some(&Value::Text("ADM".into())));

    let admins = session.find_all::<Admin>().unwrap().to_vec().unwrap();
    assert_eq!(admins.len(), 1);
    assert_eq!(admins[0].read().level, 3);
    assert_eq!(admins[0].read().person.name, "Root");
    assert_eq!(session.find_all::<Person>().unwrap().len().unwrap(), 2);

    assert!(session.find_by_id::<Admin>(plain.id.unwrap()).unwrap().is_none());
    assert_eq!(describe::<Admin>().unwrap().info().table, "person");
}

#[test]
fn embedded_values_round_trip() {
    let session = open();
    let address = Address {
        street: "1 Main".to_string(),
        city: "Springfield".to_string(),
        geo: Geo { lat: 39.8, lon: -89.6 },
    };
    let mut contact = Contact {
        address: address.clone(),
        ..Contact::default()
    };
    session.save(&mut contact).unwrap();

    let towns = session.raw_query("SELECT town FROM contact").unwrap();
    assert_eq!(towns[0].get("town"), Some(&Value::Text("Springfield".into())));

    let loaded = session.find_by_id::<Contact>(contact.id.unwrap()).unwrap().unwrap();
    assert_eq!(loaded.read().address, address);
}

#[test]
fn typed_and_raw_queries() {
    let session = open();
    let mut author = author_with_books(&["x", "y"]);
    session.save(&mut author).unwrap();

    let books = session
        .prepared_query_as::<Book>("SELECT * FROM book WHERE title = ?1", &[Value::from("y")])
        .unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].read().title, "y");

    let all = session.query::<Book>("SELECT * FROM book").unwrap();
    assert_eq!(all.len(), 2);
}
