//! Shared fixtures for unit tests: a small mapped model, table persisters
//! and an in-memory connection that enforces foreign keys.

use crate::events::{EntityEvent, EntityListener, Veto};
use crate::{SessionFactory, SessionFactoryOptions};
use asupersync::runtime::RuntimeBuilder;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use unitwork_core::{
    CascadeStyle, CollectionPersister, Connection, Cx, DeleteSpec, EntityPersister, EntityShape,
    Error, IdGeneration, LockMode, Outcome, PropertyInfo, Row, Statement,
    StatementKind, StorageError, StorageErrorKind, UpdateSpec, Value, types,
};

// ============================================================================
// Model
// ============================================================================

pub(crate) const WIDGET_NAME: usize = 0;
pub(crate) const WIDGET_PRICE: usize = 1;
pub(crate) const WIDGET_VERSION: usize = 2;
pub(crate) const WIDGET_NOTES: usize = 3;
pub(crate) const WIDGET_OWNER: usize = 4;
pub(crate) const PARENT_CHILDREN: usize = 2;
pub(crate) const CHILD_NAME: usize = 0;
pub(crate) const CHILD_PARENT: usize = 1;
pub(crate) const NODE_NEXT: usize = 1;
pub(crate) const LINK_PARTNER: usize = 1;
pub(crate) const POST_TAGS: usize = 1;

const WIDGET_PROPS: &[PropertyInfo] = &[
    PropertyInfo::basic("name", &types::TEXT),
    PropertyInfo::basic("price", &types::INTEGER),
    PropertyInfo::basic("version", &types::INTEGER),
    PropertyInfo::basic("notes", &types::TEXT).lazy(true),
    PropertyInfo::to_one("owner", "Person").cascade(CascadeStyle::PERSIST),
];

/// Sequence ids, versioned, one lazy property, owner cascades persist.
pub(crate) static WIDGET: EntityShape = EntityShape::new("Widget", WIDGET_PROPS)
    .id("id", &types::INTEGER, IdGeneration::Sequence)
    .version(WIDGET_VERSION);

const PERSON_PROPS: &[PropertyInfo] = &[PropertyInfo::basic("name", &types::TEXT)];
pub(crate) static PERSON: EntityShape =
    EntityShape::new("Person", PERSON_PROPS).id("id", &types::INTEGER, IdGeneration::Identity);

const PARENT_PROPS: &[PropertyInfo] = &[
    PropertyInfo::basic("name", &types::TEXT),
    PropertyInfo::basic("version", &types::INTEGER),
    PropertyInfo::collection("children", "Child")
        .cascade(CascadeStyle::ALL_DELETE_ORPHAN)
        .inverse(true),
];
pub(crate) static PARENT: EntityShape = EntityShape::new("Parent", PARENT_PROPS).version(1);

const CHILD_PROPS: &[PropertyInfo] = &[
    PropertyInfo::basic("name", &types::TEXT),
    PropertyInfo::to_one("parent", "Parent").nullable(false),
];
pub(crate) static CHILD: EntityShape = EntityShape::new("Child", CHILD_PROPS);

const NODE_PROPS: &[PropertyInfo] = &[
    PropertyInfo::basic("name", &types::TEXT),
    PropertyInfo::to_one("next", "Node").cascade(CascadeStyle::ALL),
    PropertyInfo::to_one("watched", "Child"),
];
pub(crate) static NODE: EntityShape = EntityShape::new("Node", NODE_PROPS);

const ACCOUNT_PROPS: &[PropertyInfo] = &[
    PropertyInfo::basic("email", &types::TEXT),
    PropertyInfo::basic("name", &types::TEXT),
];
pub(crate) static ACCOUNT: EntityShape =
    EntityShape::new("Account", ACCOUNT_PROPS).natural_id(&[0], false);

const POST_PROPS: &[PropertyInfo] = &[
    PropertyInfo::basic("title", &types::TEXT),
    PropertyInfo::collection("tags", "Tag").cascade(CascadeStyle::PERSIST),
];
pub(crate) static POST: EntityShape = EntityShape::new("Post", POST_PROPS);

const TAG_PROPS: &[PropertyInfo] = &[PropertyInfo::basic("label", &types::TEXT)];
pub(crate) static TAG: EntityShape = EntityShape::new("Tag", TAG_PROPS);

const LINK_PROPS: &[PropertyInfo] = &[
    PropertyInfo::basic("name", &types::TEXT),
    PropertyInfo::to_one("partner", "Link")
        .cascade(CascadeStyle::PERSIST)
        .nullable(false),
];
pub(crate) static LINK: EntityShape = EntityShape::new("Link", LINK_PROPS);

const COUNTRY_PROPS: &[PropertyInfo] = &[PropertyInfo::basic("code", &types::TEXT)];
pub(crate) static COUNTRY: EntityShape = EntityShape::new("Country", COUNTRY_PROPS).immutable();

pub(crate) const TICKET_CODE: usize = 0;
pub(crate) const TICKET_STATUS: usize = 1;

const TICKET_PROPS: &[PropertyInfo] = &[
    PropertyInfo::basic("code", &types::TEXT).updatable(false),
    PropertyInfo::basic("status", &types::TEXT),
];
pub(crate) static TICKET: EntityShape = EntityShape::new("Ticket", TICKET_PROPS);

const ANIMAL_PROPS: &[PropertyInfo] = &[PropertyInfo::basic("name", &types::TEXT)];
pub(crate) static ANIMAL: EntityShape = EntityShape::new("Animal", ANIMAL_PROPS);
pub(crate) static CAT: EntityShape = EntityShape::new("Cat", ANIMAL_PROPS).extends("Animal");

pub(crate) fn widget_persister() -> Arc<dyn EntityPersister> {
    Arc::new(TablePersister::new(&WIDGET))
}

pub(crate) fn parent_persister() -> Arc<dyn EntityPersister> {
    Arc::new(TablePersister::new(&PARENT))
}

pub(crate) fn child_persister() -> Arc<dyn EntityPersister> {
    Arc::new(TablePersister::new(&CHILD))
}

pub(crate) fn node_persister() -> Arc<dyn EntityPersister> {
    Arc::new(TablePersister::new(&NODE))
}

pub(crate) fn factory_with(
    options: SessionFactoryOptions,
    listener: Option<Arc<dyn EntityListener>>,
) -> Arc<SessionFactory> {
    let mut builder = SessionFactory::builder().options(options);
    for shape in [
        &WIDGET, &PERSON, &PARENT, &CHILD, &NODE, &ACCOUNT, &POST, &TAG, &LINK, &COUNTRY,
        &TICKET, &ANIMAL, &CAT,
    ] {
        builder = builder.entity(Arc::new(TablePersister::new(shape)));
    }
    builder = builder
        .collection(Arc::new(InverseCollectionPersister {
            role: "Parent.children",
            table: "child",
            key: "parent",
        }))
        .collection(Arc::new(JoinTablePersister {
            role: "Post.tags",
            table: "post_tags",
            owner: "post",
            element: "tag",
        }));
    if let Some(listener) = listener {
        builder = builder.listener(listener);
    }
    builder.build().expect("test mapping is valid")
}

pub(crate) fn factory() -> Arc<SessionFactory> {
    factory_with(SessionFactoryOptions::default(), None)
}

pub(crate) fn factory_with_options(options: SessionFactoryOptions) -> Arc<SessionFactory> {
    factory_with(options, None)
}

pub(crate) fn factory_with_listener(listener: Arc<RecordingListener>) -> Arc<SessionFactory> {
    factory_with(SessionFactoryOptions::default(), Some(listener))
}

pub(crate) fn int(v: i64) -> Value {
    Value::BigInt(v)
}

pub(crate) fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// Run an async test body on a current-thread runtime.
pub(crate) fn run<F, Fut>(test: F)
where
    F: FnOnce(Cx) -> Fut,
    Fut: Future<Output = ()>,
{
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(test(cx));
}

pub(crate) fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => panic!("unexpected outcome: {other:?}"),
    }
}

// ============================================================================
// Persisters
// ============================================================================

/// One table per entity, named after the entity in lower case, one column
/// per basic or to-one property.
pub(crate) struct TablePersister {
    shape: &'static EntityShape,
    table: String,
}

impl TablePersister {
    pub(crate) fn new(shape: &'static EntityShape) -> Self {
        Self {
            shape,
            table: shape.root_name().to_lowercase(),
        }
    }

    fn is_column(&self, index: usize) -> bool {
        self.shape.property(index).is_some_and(|p| !p.is_collection())
    }

    fn column(&self, index: usize) -> &'static str {
        self.shape.properties[index].name
    }

    fn guarded(
        &self,
        sql: &mut String,
        params: &mut Vec<Value>,
        version: Option<&Value>,
        lock: &[(usize, Value)],
    ) {
        if let (Some(index), Some(version)) = (self.shape.version, version) {
            sql.push_str(&format!(" and {}=?", self.column(index)));
            params.push(version.clone());
        }
        for (index, value) in lock {
            sql.push_str(&format!(" and {}=?", self.column(*index)));
            params.push(value.clone());
        }
    }
}

impl EntityPersister for TablePersister {
    fn shape(&self) -> &EntityShape {
        self.shape
    }

    fn insert_statement(&self, id: Option<&Value>, values: &[Value]) -> Statement {
        let mut columns = Vec::new();
        let mut params = Vec::new();
        if let Some(id) = id {
            columns.push(self.shape.id_name);
            params.push(id.clone());
        }
        for (index, value) in values.iter().enumerate() {
            if self.is_column(index) {
                columns.push(self.column(index));
                params.push(value.clone());
            }
        }
        let marks = vec!["?"; columns.len()].join(",");
        let sql = format!(
            "insert into {} ({}) values ({marks})",
            self.table,
            columns.join(",")
        );
        Statement::new(StatementKind::Insert, self.shape.name, sql).bind_all(params)
    }

    fn update_statement(&self, update: &UpdateSpec<'_>) -> Statement {
        let mut sets = Vec::new();
        let mut params = Vec::new();
        for &index in update.changed {
            if self.is_column(index) {
                sets.push(format!("{}=?", self.column(index)));
                params.push(update.values[index].clone());
            }
        }
        let mut sql = format!(
            "update {} set {} where {}=?",
            self.table,
            sets.join(","),
            self.shape.id_name
        );
        params.push(update.id.clone());
        self.guarded(&mut sql, &mut params, update.expected_version, update.lock_state);
        Statement::new(StatementKind::Update, self.shape.name, sql).bind_all(params)
    }

    fn delete_statement(&self, delete: &DeleteSpec<'_>) -> Statement {
        let mut sql = format!("delete from {} where {}=?", self.table, self.shape.id_name);
        let mut params = vec![delete.id.clone()];
        self.guarded(&mut sql, &mut params, delete.expected_version, delete.lock_state);
        Statement::new(StatementKind::Delete, self.shape.name, sql).bind_all(params)
    }

    fn load_statement(&self, id: &Value) -> Statement {
        // One position per property; lazy and collection positions read NULL.
        let columns: Vec<&str> = self
            .shape
            .properties
            .iter()
            .map(|p| if p.is_collection() || p.is_lazy_basic() { "null" } else { p.name })
            .collect();
        let sql = format!(
            "select {} from {} where {}=?",
            columns.join(","),
            self.table,
            self.shape.id_name
        );
        Statement::new(StatementKind::Select, self.shape.name, sql).bind(id.clone())
    }

    fn lazy_load_statement(&self, id: &Value, properties: &[usize]) -> Statement {
        let columns: Vec<&str> = properties.iter().map(|&i| self.column(i)).collect();
        let sql = format!(
            "select {} from {} where {}=?",
            columns.join(","),
            self.table,
            self.shape.id_name
        );
        Statement::new(StatementKind::Select, self.shape.name, sql).bind(id.clone())
    }

    fn version_statement(&self, id: &Value) -> Statement {
        let column = self.shape.version.map_or(self.shape.id_name, |i| self.column(i));
        let sql = format!("select {column} from {} where {}=?", self.table, self.shape.id_name);
        Statement::new(StatementKind::Select, self.shape.name, sql).bind(id.clone())
    }

    fn lock_statement(&self, id: &Value, mode: LockMode) -> Statement {
        let column = self.shape.version.map_or(self.shape.id_name, |i| self.column(i));
        let clause = if mode == LockMode::PessimisticRead {
            "for share"
        } else {
            "for update"
        };
        let sql = format!(
            "select {column} from {} where {}=? {clause}",
            self.table, self.shape.id_name
        );
        Statement::new(StatementKind::Lock, self.shape.name, sql).bind(id.clone())
    }

    fn natural_id_statement(&self, values: &[Value]) -> Option<Statement> {
        let info = self.shape.natural_id?;
        let conditions: Vec<String> = info
            .properties
            .iter()
            .map(|&i| format!("{}=?", self.column(i)))
            .collect();
        let sql = format!(
            "select {} from {} where {}",
            self.shape.id_name,
            self.table,
            conditions.join(" and ")
        );
        Some(Statement::new(StatementKind::Select, self.shape.name, sql).bind_all(values.to_vec()))
    }

    fn next_id_statement(&self) -> Option<Statement> {
        (self.shape.id_generation == IdGeneration::Sequence).then(|| {
            Statement::new(StatementKind::Select, self.shape.name, format!("nextval {}", self.table))
        })
    }
}

/// Collection mapped by a foreign key on the element table.
pub(crate) struct InverseCollectionPersister {
    role: &'static str,
    table: &'static str,
    key: &'static str,
}

impl CollectionPersister for InverseCollectionPersister {
    fn role(&self) -> &'static str {
        self.role
    }

    fn load_statement(&self, owner_id: &Value) -> Statement {
        let sql = format!("select id from {} where {}=?", self.table, self.key);
        Statement::new(StatementKind::Select, self.role, sql).bind(owner_id.clone())
    }
}

/// Collection stored as rows of a join table.
pub(crate) struct JoinTablePersister {
    role: &'static str,
    table: &'static str,
    owner: &'static str,
    element: &'static str,
}

impl JoinTablePersister {
    fn insert_rows(&self, owner_id: &Value, elements: &[Value]) -> Vec<Statement> {
        let sql = format!(
            "insert into {} ({},{}) values (?,?)",
            self.table, self.owner, self.element
        );
        elements
            .iter()
            .map(|element| {
                Statement::new(StatementKind::Insert, self.role, sql.clone())
                    .bind(owner_id.clone())
                    .bind(element.clone())
            })
            .collect()
    }
}

impl CollectionPersister for JoinTablePersister {
    fn role(&self) -> &'static str {
        self.role
    }

    fn load_statement(&self, owner_id: &Value) -> Statement {
        let sql = format!("select {} from {} where {}=?", self.element, self.table, self.owner);
        Statement::new(StatementKind::Select, self.role, sql).bind(owner_id.clone())
    }

    fn recreate_statements(&self, owner_id: &Value, elements: &[Value]) -> Vec<Statement> {
        self.insert_rows(owner_id, elements)
    }

    fn remove_statements(&self, owner_id: &Value) -> Vec<Statement> {
        let sql = format!("delete from {} where {}=?", self.table, self.owner);
        vec![Statement::new(StatementKind::Delete, self.role, sql).bind(owner_id.clone())]
    }

    fn delete_rows_statements(&self, owner_id: &Value, removed: &[Value]) -> Vec<Statement> {
        let sql = format!(
            "delete from {} where {}=? and {}=?",
            self.table, self.owner, self.element
        );
        removed
            .iter()
            .map(|element| {
                Statement::new(StatementKind::Delete, self.role, sql.clone())
                    .bind(owner_id.clone())
                    .bind(element.clone())
                    .expect_rows(1)
            })
            .collect()
    }

    fn insert_rows_statements(&self, owner_id: &Value, added: &[Value]) -> Vec<Statement> {
        self.insert_rows(owner_id, added)
    }
}

// ============================================================================
// In-memory storage
// ============================================================================

/// `(table, column, referenced table)`
const FOREIGN_KEYS: &[(&str, &str, &str)] = &[
    ("widget", "owner", "person"),
    ("child", "parent", "parent"),
    ("node", "next", "node"),
    ("node", "watched", "child"),
    ("link", "partner", "link"),
    ("post_tags", "post", "post"),
    ("post_tags", "tag", "tag"),
];

const NOT_NULL: &[(&str, &str)] = &[("child", "parent"), ("link", "partner")];

const IDENTITY_TABLES: &[&str] = &["person"];

type Table = Vec<BTreeMap<String, Value>>;

#[derive(Debug, Default)]
struct MemoryDb {
    tables: BTreeMap<String, Table>,
    counters: HashMap<String, i64>,
    saved: Option<BTreeMap<String, Table>>,
    log: Vec<String>,
    batches: Vec<usize>,
    fail_on: Vec<String>,
    reject_batches: bool,
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Int(v) => Value::BigInt(i64::from(*v)),
        other => other.clone(),
    }
}

fn constraint(message: String, sql: &str) -> Error {
    StorageError::new(StorageErrorKind::Constraint, message)
        .with_sql(sql)
        .into()
}

/// `a=?,b=?` or `a=? and b=?` into column names.
fn columns_of(list: &str, separator: &str) -> Vec<String> {
    list.split(separator)
        .map(|part| part.trim().trim_end_matches("=?").to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

impl MemoryDb {
    fn table(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_default()
    }

    fn matching(&self, table: &str, conditions: &[(String, Value)]) -> Vec<usize> {
        self.tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .enumerate()
                    .filter(|(_, row)| {
                        conditions.iter().all(|(column, value)| {
                            normalize(row.get(column).unwrap_or(&Value::Null)) == normalize(value)
                        })
                    })
                    .map(|(i, _)| i)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check_row(&self, table: &str, row: &BTreeMap<String, Value>, sql: &str) -> Result<(), Error> {
        for (t, column) in NOT_NULL {
            if *t == table && row.get(*column).is_none_or(Value::is_null) {
                return Err(constraint(format!("{table}.{column} may not be NULL"), sql));
            }
        }
        for (t, column, target) in FOREIGN_KEYS {
            if *t != table {
                continue;
            }
            let Some(value) = row.get(*column).filter(|v| !v.is_null()) else {
                continue;
            };
            if self.matching(target, &[("id".to_string(), value.clone())]).is_empty() {
                return Err(constraint(
                    format!("{table}.{column} references missing {target}#{value}"),
                    sql,
                ));
            }
        }
        Ok(())
    }

    fn check_unreferenced(&self, table: &str, id: &Value, sql: &str) -> Result<(), Error> {
        for (t, column, target) in FOREIGN_KEYS {
            if *target == table && !self.matching(t, &[((*column).to_string(), id.clone())]).is_empty() {
                return Err(constraint(
                    format!("{table}#{id} is still referenced by {t}.{column}"),
                    sql,
                ));
            }
        }
        Ok(())
    }

    fn fail_if_asked(&self, sql: &str) -> Result<(), Error> {
        if self.fail_on.iter().any(|s| sql.contains(s.as_str())) {
            return Err(StorageError::new(StorageErrorKind::Statement, "injected failure")
                .with_sql(sql)
                .into());
        }
        Ok(())
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, Error> {
        let sql = statement.sql.as_str();
        self.log.push(sql.to_string());
        self.fail_if_asked(sql)?;
        if let Some(table) = sql.strip_prefix("nextval ") {
            let next = self.counters.entry(table.to_string()).or_insert(0);
            *next += 1;
            return Ok(vec![Row::new(vec![Value::BigInt(*next)])]);
        }
        let body = sql
            .trim_end_matches(" for update")
            .trim_end_matches(" for share");
        let rest = body.strip_prefix("select ").unwrap_or(body);
        let (columns, rest) = rest.split_once(" from ").unwrap_or((rest, ""));
        let (table, conditions) = rest.split_once(" where ").unwrap_or((rest, ""));
        let conditions: Vec<(String, Value)> = columns_of(conditions, " and ")
            .into_iter()
            .zip(statement.params.iter().cloned())
            .collect();
        let columns: Vec<&str> = columns.split(',').collect();
        let rows = self.tables.get(table);
        Ok(self
            .matching(table, &conditions)
            .into_iter()
            .filter_map(|i| rows.and_then(|r| r.get(i)))
            .map(|row| {
                Row::new(
                    columns
                        .iter()
                        .map(|c| row.get(*c).cloned().unwrap_or(Value::Null))
                        .collect(),
                )
            })
            .collect())
    }

    /// Execute a write. Returns the affected row count and, for an insert,
    /// the row identifier.
    fn write(&mut self, statement: &Statement) -> Result<(u64, Value), Error> {
        let sql = statement.sql.as_str();
        self.log.push(sql.to_string());
        self.fail_if_asked(sql)?;
        let params = &statement.params;

        if let Some(rest) = sql.strip_prefix("insert into ") {
            let (table, rest) = rest.split_once(" (").unwrap_or((rest, ""));
            let (columns, _) = rest.split_once(')').unwrap_or((rest, ""));
            let mut row: BTreeMap<String, Value> = columns
                .split(',')
                .map(str::to_string)
                .zip(params.iter().map(normalize))
                .collect();
            if IDENTITY_TABLES.contains(&table) && !row.contains_key("id") {
                let next = self.counters.entry(table.to_string()).or_insert(0);
                *next += 1;
                row.insert("id".to_string(), Value::BigInt(*next));
            }
            let id = row.get("id").cloned().unwrap_or(Value::Null);
            if !id.is_null() && !self.matching(table, &[("id".to_string(), id.clone())]).is_empty() {
                return Err(constraint(format!("duplicate key {table}#{id}"), sql));
            }
            self.check_row(table, &row, sql)?;
            self.table(table).push(row);
            return Ok((1, id));
        }

        if let Some(rest) = sql.strip_prefix("update ") {
            let (table, rest) = rest.split_once(" set ").unwrap_or((rest, ""));
            let (sets, conditions) = rest.split_once(" where ").unwrap_or((rest, ""));
            let sets = columns_of(sets, ",");
            let conditions: Vec<(String, Value)> = columns_of(conditions, " and ")
                .into_iter()
                .zip(params.iter().skip(sets.len()).cloned())
                .collect();
            let hits = self.matching(table, &conditions);
            for &i in &hits {
                let mut row = self.tables[table][i].clone();
                for (column, value) in sets.iter().zip(params) {
                    row.insert(column.clone(), normalize(value));
                }
                self.check_row(table, &row, sql)?;
                self.table(table)[i] = row;
            }
            return Ok((hits.len() as u64, Value::Null));
        }

        if let Some(rest) = sql.strip_prefix("delete from ") {
            let (table, conditions) = rest.split_once(" where ").unwrap_or((rest, ""));
            let conditions: Vec<(String, Value)> = columns_of(conditions, " and ")
                .into_iter()
                .zip(params.iter().cloned())
                .collect();
            let hits = self.matching(table, &conditions);
            for &i in &hits {
                if let Some(id) = self.tables[table][i].get("id") {
                    self.check_unreferenced(table, id, sql)?;
                }
            }
            let rows = self.table(table);
            for &i in hits.iter().rev() {
                rows.remove(i);
            }
            return Ok((hits.len() as u64, Value::Null));
        }

        Err(StorageError::new(StorageErrorKind::Statement, "unsupported statement")
            .with_sql(sql)
            .into())
    }
}

/// In-memory storage speaking the SQL dialect of the persisters above.
///
/// Clones share one database, so a test keeps a clone to inspect rows while
/// the session owns another.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryConnection {
    db: Arc<Mutex<MemoryDb>>,
}

impl MemoryConnection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with_db<T>(&self, f: impl FnOnce(&mut MemoryDb) -> T) -> T {
        let mut db = self.db.lock().expect("lock poisoned");
        f(&mut db)
    }

    /// Insert a row directly, bypassing constraints and the statement log.
    pub(crate) fn seed(&self, table: &str, row: &[(&str, Value)]) {
        self.with_db(|db| {
            let row: BTreeMap<String, Value> = row
                .iter()
                .map(|(c, v)| ((*c).to_string(), normalize(v)))
                .collect();
            if let Some(Value::BigInt(id)) = row.get("id") {
                let counter = db.counters.entry(table.to_string()).or_insert(0);
                *counter = (*counter).max(*id);
            }
            db.table(table).push(row);
        });
    }

    pub(crate) fn count(&self, table: &str) -> usize {
        self.with_db(|db| db.tables.get(table).map_or(0, Vec::len))
    }

    /// Column value of the row with identifier `id`, NULL if absent.
    pub(crate) fn value(&self, table: &str, id: i64, column: &str) -> Value {
        self.with_db(|db| {
            db.matching(table, &[("id".to_string(), Value::BigInt(id))])
                .first()
                .and_then(|&i| db.tables[table][i].get(column).cloned())
                .unwrap_or(Value::Null)
        })
    }

    /// Change a column behind the session's back.
    pub(crate) fn set_value(&self, table: &str, id: i64, column: &str, value: Value) {
        self.with_db(|db| {
            for i in db.matching(table, &[("id".to_string(), Value::BigInt(id))]) {
                db.table(table)[i].insert(column.to_string(), normalize(&value));
            }
        });
    }

    pub(crate) fn statement_count(&self) -> usize {
        self.with_db(|db| db.log.len())
    }

    pub(crate) fn statements_matching(&self, needle: &str) -> usize {
        self.with_db(|db| db.log.iter().filter(|sql| sql.contains(needle)).count())
    }

    /// Sizes of the batches executed so far.
    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.with_db(|db| db.batches.clone())
    }

    /// Fail every statement whose SQL contains `needle`.
    pub(crate) fn fail_on(&self, needle: &str) {
        self.with_db(|db| db.fail_on.push(needle.to_string()));
    }

    /// Refuse to execute batches, as a driver without batch support would.
    pub(crate) fn reject_batches(&self) {
        self.with_db(|db| db.reject_batches = true);
    }
}

fn outcome<T>(result: Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

impl Connection for MemoryConnection {
    fn query(
        &self,
        _cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.with_db(|db| db.query(statement));
        async move { outcome(result) }
    }

    fn query_one(
        &self,
        _cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = self.with_db(|db| db.query(statement)).map(|rows| rows.into_iter().next());
        async move { outcome(result) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.with_db(|db| db.write(statement)).map(|(rows, _)| rows);
        async move { outcome(result) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        let result = self.with_db(|db| db.write(statement)).map(|(_, id)| id);
        async move { outcome(result) }
    }

    fn batch(
        &self,
        _cx: &Cx,
        statements: &[Statement],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let result: Result<Vec<u64>, Error> = self.with_db(|db| {
            if db.reject_batches {
                return Err(StorageError::new(StorageErrorKind::Batch, "batching is not supported").into());
            }
            db.batches.push(statements.len());
            statements
                .iter()
                .map(|statement| db.write(statement).map(|(rows, _)| rows))
                .collect()
        });
        async move { outcome(result) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.with_db(|db| db.saved = Some(db.tables.clone()));
        async { Outcome::Ok(()) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.with_db(|db| db.saved = None);
        async { Outcome::Ok(()) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.with_db(|db| {
            if let Some(saved) = db.saved.take() {
                db.tables = saved;
            }
        });
        async { Outcome::Ok(()) }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Records every entity event as `"<event> <Entity>#<id>[ <properties>]"`.
#[derive(Debug, Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<String>>,
    veto: Option<&'static str>,
}

impl RecordingListener {
    /// A listener that rejects every write of `entity`.
    pub(crate) fn vetoing(entity: &'static str) -> Self {
        Self {
            events: Mutex::default(),
            veto: Some(entity),
        }
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().expect("lock poisoned").clone()
    }

    fn record(&self, name: &str, event: &EntityEvent<'_>) {
        let id = event.id.map_or_else(|| "?".to_string(), ToString::to_string);
        let mut line = format!("{name} {}#{id}", event.entity);
        if !event.properties.is_empty() {
            line.push_str(&format!(" {:?}", event.properties));
        }
        self.events.lock().expect("lock poisoned").push(line);
    }

    fn answer(&self, name: &str, event: &EntityEvent<'_>) -> Veto {
        self.record(name, event);
        if self.veto == Some(event.entity) {
            Veto::reject(format!("{} writes are frozen", event.entity))
        } else {
            Veto::Allow
        }
    }
}

impl EntityListener for RecordingListener {
    fn pre_insert(&self, event: &EntityEvent<'_>) -> Veto {
        self.answer("pre_insert", event)
    }

    fn post_insert(&self, event: &EntityEvent<'_>) {
        self.record("post_insert", event);
    }

    fn pre_update(&self, event: &EntityEvent<'_>) -> Veto {
        self.answer("pre_update", event)
    }

    fn post_update(&self, event: &EntityEvent<'_>) {
        self.record("post_update", event);
    }

    fn pre_delete(&self, event: &EntityEvent<'_>) -> Veto {
        self.answer("pre_delete", event)
    }

    fn post_delete(&self, event: &EntityEvent<'_>) {
        self.record("post_delete", event);
    }

    fn pre_load(&self, event: &EntityEvent<'_>) {
        self.record("pre_load", event);
    }

    fn post_load(&self, event: &EntityEvent<'_>) {
        self.record("post_load", event);
    }
}
