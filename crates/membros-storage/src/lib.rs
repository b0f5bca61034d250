//! SQLite persistence for people, friendships, reports and lookups.
//!
//! Every function takes a `&mut SqliteConnection` so callers decide the
//! transaction boundary: importers pass `&mut *tx`, request handlers pass a
//! pooled connection.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use membros_core::{
    FieldKind, FieldValue, Friendship, Lookup, MemberField, Membro, MembroDraft, Report,
    ReportDocument,
};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use sqlx::migrate::Migrator;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "membros-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const MEMBRO_SEARCH_FIELDS: [MemberField; 4] = [
    MemberField::Nome,
    MemberField::ComarcaLotacao,
    MemberField::CargoEfetivo,
    MemberField::Titularidade,
];

const FEMALE: &str = "Feminino";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duplicate record")]
    Duplicate,
    #[error("unknown field {0:?}")]
    UnknownField(String),
    #[error("stored report data is not a json object: {0}")]
    CorruptReport(#[from] serde_json::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Unique-constraint violations become [`StorageError::Duplicate`].
fn classify(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Duplicate,
        _ => StorageError::Database(err),
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://membros.db".to_string()),
            max_connections: std::env::var("MEMBROS_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

/// Open the pool and apply pending migrations.
pub async fn connect(config: &StorageConfig) -> Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let mut pool_options = SqlitePoolOptions::new();
    if config.is_in_memory() {
        // Each in-memory connection is its own database; keep exactly one alive.
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>);
    } else {
        pool_options = pool_options.max_connections(config.max_connections.max(1));
    }

    let pool = pool_options.connect_with(options).await?;
    MIGRATOR.run(&pool).await?;
    info!(database_url = %config.database_url, "database ready");
    Ok(pool)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    Updated(i64),
}

impl UpsertOutcome {
    pub fn id(self) -> i64 {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub const MAX_PER_PAGE: u32 = 500;

    pub fn new(page: Option<u32>, per_page: Option<u32>, default_per_page: u32) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page
                .unwrap_or(default_per_page)
                .clamp(1, Self::MAX_PER_PAGE),
        }
    }

    fn offset(self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.per_page)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub current_page: u32,
    pub per_page: u32,
    pub total: i64,
    pub last_page: u32,
}

impl<T> Page<T> {
    fn new(data: Vec<T>, request: PageRequest, total: i64) -> Self {
        let per_page = i64::from(request.per_page);
        let last_page = ((total.max(1) + per_page - 1) / per_page) as u32;
        Self {
            data,
            current_page: request.page,
            per_page: request.per_page,
            total,
            last_page,
        }
    }
}

/// Free-text search plus `field -> allowed values` filters.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub q: Option<String>,
    pub filters: BTreeMap<String, Vec<String>>,
}

impl RecordQuery {
    fn search(&self) -> Option<&str> {
        self.q.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }

    /// Filters with blank values dropped and empty value lists skipped.
    fn active_filters(&self) -> impl Iterator<Item = (&str, Vec<String>)> + '_ {
        self.filters.iter().filter_map(|(field, values)| {
            let values: Vec<String> = values
                .iter()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            (!values.is_empty()).then_some((field.as_str(), values))
        })
    }
}

/// One group of an aggregation: value and row count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub v: String,
    pub c: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MembroStats {
    pub total: i64,
    pub female_count: i64,
    pub female_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FriendRef {
    pub id: i64,
    pub nome: String,
}

fn member_field(column: &str) -> Result<MemberField, StorageError> {
    MemberField::from_column(column).ok_or_else(|| StorageError::UnknownField(column.to_string()))
}

/// SQLite JSON path for a top-level report label.
fn json_path(label: &str) -> Result<String, StorageError> {
    if label.is_empty() || label.contains('"') {
        return Err(StorageError::UnknownField(label.to_string()));
    }
    Ok(format!("$.\"{label}\""))
}

fn like_pattern(q: &str) -> String {
    format!("%{q}%")
}

// ---------------------------------------------------------------------------
// membros
// ---------------------------------------------------------------------------

fn member_columns() -> String {
    MemberField::ALL
        .iter()
        .map(|f| f.column())
        .collect::<Vec<_>>()
        .join(", ")
}

fn bind_member_fields<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    draft: &MembroDraft,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for field in MemberField::ALL {
        query = match draft.value(field) {
            FieldValue::Text(text) => query.bind(text),
            FieldValue::Integer(n) => query.bind(n),
        };
    }
    query
}

fn membro_from_row(row: &SqliteRow) -> Result<Membro, StorageError> {
    let mut fields = MembroDraft::default();
    for field in MemberField::ALL {
        let value = match field.kind() {
            FieldKind::Count => FieldValue::Integer(row.try_get(field.column())?),
            FieldKind::Text | FieldKind::StateCode => {
                FieldValue::Text(row.try_get(field.column())?)
            }
        };
        fields.put(field, value);
    }
    Ok(Membro {
        id: row.try_get("id")?,
        fields,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn push_membro_conditions(
    qb: &mut QueryBuilder<'_, Sqlite>,
    query: &RecordQuery,
) -> Result<(), StorageError> {
    qb.push(" WHERE 1 = 1");
    if let Some(q) = query.search() {
        qb.push(" AND (");
        for (i, field) in MEMBRO_SEARCH_FIELDS.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push(field.column()).push(" LIKE ").push_bind(like_pattern(q));
        }
        qb.push(")");
    }
    for (column, values) in query.active_filters() {
        let field = member_field(column)?;
        qb.push(" AND ").push(field.column()).push(" IN (");
        let mut list = qb.separated(", ");
        for value in values {
            list.push_bind(value);
        }
        list.push_unseparated(")");
    }
    Ok(())
}

/// Id of the person with this exact (name, email) identity. A missing email
/// only matches a missing email.
pub async fn find_membro_by_identity(
    conn: &mut SqliteConnection,
    nome: &str,
    email_pessoal: Option<&str>,
) -> Result<Option<i64>, StorageError> {
    let id = sqlx::query_scalar(
        "SELECT id FROM membros WHERE nome = ? AND email_pessoal IS ? ORDER BY id LIMIT 1",
    )
    .bind(nome)
    .bind(email_pessoal)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn insert_membro(
    conn: &mut SqliteConnection,
    draft: &MembroDraft,
) -> Result<i64, StorageError> {
    let now = Utc::now();
    let placeholders = vec!["?"; MemberField::ALL.len()].join(", ");
    let sql = format!(
        "INSERT INTO membros ({}, created_at, updated_at) VALUES ({placeholders}, ?, ?)",
        member_columns()
    );
    let result = bind_member_fields(sqlx::query(&sql), draft)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(classify)?;
    Ok(result.last_insert_rowid())
}

/// Overwrite every attribute of person `id`. Returns `false` when it does not exist.
pub async fn update_membro(
    conn: &mut SqliteConnection,
    id: i64,
    draft: &MembroDraft,
) -> Result<bool, StorageError> {
    let assignments = MemberField::ALL
        .iter()
        .map(|f| format!("{} = ?", f.column()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("UPDATE membros SET {assignments}, updated_at = ? WHERE id = ?");
    let result = bind_member_fields(sqlx::query(&sql), draft)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(classify)?;
    Ok(result.rows_affected() > 0)
}

pub async fn upsert_membro(
    conn: &mut SqliteConnection,
    draft: &MembroDraft,
) -> Result<UpsertOutcome, StorageError> {
    let (nome, email) = draft.identity();
    match find_membro_by_identity(conn, nome, email).await? {
        Some(id) => {
            update_membro(conn, id, draft).await?;
            Ok(UpsertOutcome::Updated(id))
        }
        None => Ok(UpsertOutcome::Inserted(insert_membro(conn, draft).await?)),
    }
}

pub async fn get_membro(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Membro>, StorageError> {
    let sql = format!(
        "SELECT id, {}, created_at, updated_at FROM membros WHERE id = ?",
        member_columns()
    );
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(membro_from_row).transpose()
}

pub async fn count_membros(conn: &mut SqliteConnection) -> Result<i64, StorageError> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM membros")
        .fetch_one(&mut *conn)
        .await?)
}

pub async fn list_membros(
    conn: &mut SqliteConnection,
    query: &RecordQuery,
    page: PageRequest,
) -> Result<Page<Membro>, StorageError> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM membros");
    push_membro_conditions(&mut count, query)?;
    let total: i64 = count.build_query_scalar().fetch_one(&mut *conn).await?;

    let mut select = QueryBuilder::<Sqlite>::new(format!(
        "SELECT id, {}, created_at, updated_at FROM membros",
        member_columns()
    ));
    push_membro_conditions(&mut select, query)?;
    select
        .push(" ORDER BY id DESC LIMIT ")
        .push_bind(i64::from(page.per_page))
        .push(" OFFSET ")
        .push_bind(page.offset());
    let rows = select.build().fetch_all(&mut *conn).await?;
    let data = rows.iter().map(membro_from_row).collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(data, page, total))
}

/// Count people per distinct value of `column`, most frequent first.
/// Null and blank values never appear in the result.
pub async fn aggregate_membros(
    conn: &mut SqliteConnection,
    column: &str,
    query: &RecordQuery,
    limit: u32,
) -> Result<Vec<Bucket>, StorageError> {
    let field = member_field(column)?;
    let col = field.column();
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT CAST({col} AS TEXT) AS v, COUNT(*) AS c FROM membros"
    ));
    push_membro_conditions(&mut qb, query)?;
    qb.push(format!(
        " AND {col} IS NOT NULL AND trim(CAST({col} AS TEXT)) <> '' \
         GROUP BY v ORDER BY c DESC, v ASC LIMIT "
    ))
    .push_bind(i64::from(limit.max(1)));

    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| {
            Ok(Bucket {
                v: row.try_get("v")?,
                c: row.try_get("c")?,
            })
        })
        .collect()
}

pub async fn membro_stats(
    conn: &mut SqliteConnection,
    query: &RecordQuery,
) -> Result<MembroStats, StorageError> {
    let mut qb =
        QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total, COALESCE(SUM(CASE WHEN sexo = ");
    qb.push_bind(FEMALE)
        .push(" COLLATE NOCASE THEN 1 ELSE 0 END), 0) AS female FROM membros");
    push_membro_conditions(&mut qb, query)?;
    let row = qb.build().fetch_one(&mut *conn).await?;
    let total: i64 = row.try_get("total")?;
    let female_count: i64 = row.try_get("female")?;
    let female_pct = if total > 0 {
        (female_count as f64 * 1000.0 / total as f64).round() / 10.0
    } else {
        0.0
    };
    Ok(MembroStats {
        total,
        female_count,
        female_pct,
    })
}

/// `(id, nome)` for every stored person.
pub async fn membro_directory(
    conn: &mut SqliteConnection,
) -> Result<Vec<(i64, String)>, StorageError> {
    let rows = sqlx::query("SELECT id, nome FROM membros ORDER BY id")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| Ok((row.try_get("id")?, row.try_get("nome")?)))
        .collect()
}

/// Remove all people and friendships and restart id numbering.
pub async fn clear_roster(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM membro_amizades").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM membros").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'membros'")
        .execute(&mut *conn)
        .await?;
    debug!("roster tables cleared");
    Ok(())
}

// ---------------------------------------------------------------------------
// friendships
// ---------------------------------------------------------------------------

/// Insert the edge unless it already exists. Returns `true` when it was new.
pub async fn add_friendship(
    conn: &mut SqliteConnection,
    edge: Friendship,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO membro_amizades (membro_low, membro_high, created_at) \
         VALUES (?, ?, ?)",
    )
    .bind(edge.low())
    .bind(edge.high())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn count_friendships(conn: &mut SqliteConnection) -> Result<i64, StorageError> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM membro_amizades")
        .fetch_one(&mut *conn)
        .await?)
}

/// Both directions of every edge as `(membro_id, amigo_id)`.
pub async fn directed_friendships(
    conn: &mut SqliteConnection,
) -> Result<Vec<(i64, i64)>, StorageError> {
    let rows =
        sqlx::query("SELECT membro_id, amigo_id FROM membro_amigos ORDER BY membro_id, amigo_id")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| Ok((row.try_get("membro_id")?, row.try_get("amigo_id")?)))
        .collect()
}

pub async fn friends_of(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Vec<FriendRef>, StorageError> {
    let rows = sqlx::query(
        r#"
        SELECT m.id, m.nome
          FROM membro_amigos a
          JOIN membros m ON m.id = a.amigo_id
         WHERE a.membro_id = ?
         ORDER BY m.nome, m.id
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(FriendRef {
                id: row.try_get("id")?,
                nome: row.try_get("nome")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// reports
// ---------------------------------------------------------------------------

fn report_from_row(row: &SqliteRow) -> Result<Report, StorageError> {
    let raw: String = row.try_get("data")?;
    let data: Map<String, JsonValue> = serde_json::from_str(&raw)?;
    Ok(Report {
        id: row.try_get("id")?,
        data,
        search_text: row.try_get("search_text")?,
        row_hash: row.try_get("row_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn document_json(doc: &ReportDocument) -> String {
    JsonValue::Object(doc.data().clone()).to_string()
}

fn push_report_conditions(
    qb: &mut QueryBuilder<'_, Sqlite>,
    query: &RecordQuery,
) -> Result<(), StorageError> {
    qb.push(" WHERE 1 = 1");
    if let Some(q) = query.search() {
        qb.push(" AND search_text LIKE ")
            .push_bind(like_pattern(&q.to_lowercase()));
    }
    for (label, values) in query.active_filters() {
        qb.push(" AND CAST(json_extract(data, ")
            .push_bind(json_path(label)?)
            .push(") AS TEXT) IN (");
        let mut list = qb.separated(", ");
        for value in values {
            list.push_bind(value);
        }
        list.push_unseparated(")");
    }
    Ok(())
}

pub async fn find_report_by_hash(
    conn: &mut SqliteConnection,
    row_hash: &str,
) -> Result<Option<i64>, StorageError> {
    Ok(sqlx::query_scalar("SELECT id FROM reports WHERE row_hash = ?")
        .bind(row_hash)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Insert a new report; an existing row with the same hash yields
/// [`StorageError::Duplicate`].
pub async fn insert_report(
    conn: &mut SqliteConnection,
    doc: &ReportDocument,
) -> Result<i64, StorageError> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO reports (data, search_text, row_hash, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(document_json(doc))
    .bind(doc.search_text())
    .bind(doc.row_hash())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(classify)?;
    Ok(result.last_insert_rowid())
}

/// Replace the content of report `id`. Returns `false` when it does not exist.
pub async fn update_report(
    conn: &mut SqliteConnection,
    id: i64,
    doc: &ReportDocument,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "UPDATE reports SET data = ?, search_text = ?, row_hash = ?, updated_at = ? WHERE id = ?",
    )
    .bind(document_json(doc))
    .bind(doc.search_text())
    .bind(doc.row_hash())
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(classify)?;
    Ok(result.rows_affected() > 0)
}

/// Content-addressed upsert: identical rows update in place.
pub async fn upsert_report(
    conn: &mut SqliteConnection,
    doc: &ReportDocument,
) -> Result<UpsertOutcome, StorageError> {
    match find_report_by_hash(conn, doc.row_hash()).await? {
        Some(id) => {
            update_report(conn, id, doc).await?;
            Ok(UpsertOutcome::Updated(id))
        }
        None => Ok(UpsertOutcome::Inserted(insert_report(conn, doc).await?)),
    }
}

pub async fn get_report(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Report>, StorageError> {
    let row = sqlx::query(
        "SELECT id, data, search_text, row_hash, created_at, updated_at FROM reports WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(report_from_row).transpose()
}

pub async fn delete_report(conn: &mut SqliteConnection, id: i64) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM reports WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_reports(conn: &mut SqliteConnection) -> Result<i64, StorageError> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM reports")
        .fetch_one(&mut *conn)
        .await?)
}

pub async fn clear_reports(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM reports").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'reports'")
        .execute(&mut *conn)
        .await?;
    debug!("reports cleared");
    Ok(())
}

pub async fn list_reports(
    conn: &mut SqliteConnection,
    query: &RecordQuery,
    page: PageRequest,
) -> Result<Page<Report>, StorageError> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM reports");
    push_report_conditions(&mut count, query)?;
    let total: i64 = count.build_query_scalar().fetch_one(&mut *conn).await?;

    let mut select = QueryBuilder::<Sqlite>::new(
        "SELECT id, data, search_text, row_hash, created_at, updated_at FROM reports",
    );
    push_report_conditions(&mut select, query)?;
    select
        .push(" ORDER BY id DESC LIMIT ")
        .push_bind(i64::from(page.per_page))
        .push(" OFFSET ")
        .push_bind(page.offset());
    let rows = select.build().fetch_all(&mut *conn).await?;
    let data = rows.iter().map(report_from_row).collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(data, page, total))
}

/// Count reports per distinct value of the `label` column.
pub async fn aggregate_reports(
    conn: &mut SqliteConnection,
    label: &str,
    query: &RecordQuery,
    limit: u32,
) -> Result<Vec<Bucket>, StorageError> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT CAST(json_extract(data, ");
    qb.push_bind(json_path(label)?)
        .push(") AS TEXT) AS v, COUNT(*) AS c FROM reports");
    push_report_conditions(&mut qb, query)?;
    qb.push(" GROUP BY v HAVING v IS NOT NULL AND trim(v) <> '' ORDER BY c DESC, v ASC LIMIT ")
        .push_bind(i64::from(limit.max(1)));

    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| {
            Ok(Bucket {
                v: row.try_get("v")?,
                c: row.try_get("c")?,
            })
        })
        .collect()
}

/// Raw text at `label` for every report, in id order. Missing labels are skipped.
pub async fn report_label_values(
    conn: &mut SqliteConnection,
    label: &str,
) -> Result<Vec<String>, StorageError> {
    let values: Vec<Option<String>> =
        sqlx::query_scalar("SELECT CAST(json_extract(data, ?) AS TEXT) FROM reports ORDER BY id")
            .bind(json_path(label)?)
            .fetch_all(&mut *conn)
            .await?;
    Ok(values.into_iter().flatten().collect())
}

// ---------------------------------------------------------------------------
// lookups
// ---------------------------------------------------------------------------

fn lookup_from_row(row: &SqliteRow) -> Result<Lookup, StorageError> {
    Ok(Lookup {
        id: row.try_get("id")?,
        lookup_type: row.try_get("type")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn get_lookup(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Lookup>, StorageError> {
    let row = sqlx::query("SELECT id, type, name, created_at, updated_at FROM lookups WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(lookup_from_row).transpose()
}

pub async fn find_lookup(
    conn: &mut SqliteConnection,
    lookup_type: &str,
    name: &str,
) -> Result<Option<Lookup>, StorageError> {
    let row = sqlx::query(
        "SELECT id, type, name, created_at, updated_at FROM lookups WHERE type = ? AND name = ?",
    )
    .bind(lookup_type)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(lookup_from_row).transpose()
}

/// Returns `true` when the pair was not present yet.
pub async fn insert_lookup_if_absent(
    conn: &mut SqliteConnection,
    lookup_type: &str,
    name: &str,
) -> Result<bool, StorageError> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT OR IGNORE INTO lookups (type, name, created_at, updated_at) VALUES (?, ?, ?, ?)",
    )
    .bind(lookup_type)
    .bind(name)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Existing entry for the pair, or a freshly created one (`true` when created).
pub async fn first_or_create_lookup(
    conn: &mut SqliteConnection,
    lookup_type: &str,
    name: &str,
) -> Result<(Lookup, bool), StorageError> {
    let created = insert_lookup_if_absent(conn, lookup_type, name).await?;
    let lookup = find_lookup(conn, lookup_type, name)
        .await?
        .ok_or(StorageError::Database(sqlx::Error::RowNotFound))?;
    Ok((lookup, created))
}

/// Rename entry `id`; another entry with the same pair yields [`StorageError::Duplicate`].
pub async fn update_lookup(
    conn: &mut SqliteConnection,
    id: i64,
    lookup_type: &str,
    name: &str,
) -> Result<Option<Lookup>, StorageError> {
    if let Some(existing) = find_lookup(conn, lookup_type, name).await? {
        if existing.id != id {
            return Err(StorageError::Duplicate);
        }
    }
    let result = sqlx::query("UPDATE lookups SET type = ?, name = ?, updated_at = ? WHERE id = ?")
        .bind(lookup_type)
        .bind(name)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(classify)?;
    if result.rows_affected() == 0 {
        return Ok(None);
    }
    get_lookup(conn, id).await
}

pub async fn delete_lookup(conn: &mut SqliteConnection, id: i64) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM lookups WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_lookups(
    conn: &mut SqliteConnection,
    lookup_type: Option<&str>,
    page: PageRequest,
) -> Result<Page<Lookup>, StorageError> {
    let lookup_type = lookup_type.map(str::trim).filter(|t| !t.is_empty());

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM lookups");
    if let Some(t) = lookup_type {
        count.push(" WHERE type = ").push_bind(t.to_string());
    }
    let total: i64 = count.build_query_scalar().fetch_one(&mut *conn).await?;

    let mut select =
        QueryBuilder::<Sqlite>::new("SELECT id, type, name, created_at, updated_at FROM lookups");
    if let Some(t) = lookup_type {
        select.push(" WHERE type = ").push_bind(t.to_string());
    }
    select
        .push(" ORDER BY type, name LIMIT ")
        .push_bind(i64::from(page.per_page))
        .push(" OFFSET ")
        .push_bind(page.offset());
    let rows = select.build().fetch_all(&mut *conn).await?;
    let data = rows.iter().map(lookup_from_row).collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(data, page, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::pool::PoolConnection;

    async fn memory_conn() -> (SqlitePool, PoolConnection<Sqlite>) {
        let pool = connect(&StorageConfig::in_memory()).await.expect("pool");
        let conn = pool.acquire().await.expect("conn");
        (pool, conn)
    }

    fn draft(nome: &str, email: Option<&str>) -> MembroDraft {
        let mut d = MembroDraft::new(nome);
        d.email_pessoal = email.map(str::to_string);
        d
    }

    fn doc(value: JsonValue) -> ReportDocument {
        ReportDocument::from_value(value).expect("object")
    }

    #[tokio::test]
    async fn membro_upsert_matches_on_name_and_email() {
        let (_pool, mut conn) = memory_conn().await;

        let mut ana = draft("Ana", Some("ana@example.org"));
        let first = upsert_membro(&mut conn, &ana).await.unwrap();
        assert!(matches!(first, UpsertOutcome::Inserted(_)));

        ana.comarca_lotacao = Some("Belo Horizonte".into());
        let second = upsert_membro(&mut conn, &ana).await.unwrap();
        assert_eq!(second, UpsertOutcome::Updated(first.id()));

        let other_email = upsert_membro(&mut conn, &draft("Ana", None)).await.unwrap();
        assert!(matches!(other_email, UpsertOutcome::Inserted(_)));
        let same_null = upsert_membro(&mut conn, &draft("Ana", None)).await.unwrap();
        assert_eq!(same_null, UpsertOutcome::Updated(other_email.id()));

        assert_eq!(count_membros(&mut conn).await.unwrap(), 2);
        let stored = get_membro(&mut conn, first.id()).await.unwrap().expect("stored");
        assert_eq!(stored.fields.comarca_lotacao.as_deref(), Some("Belo Horizonte"));
    }

    #[tokio::test]
    async fn friendships_are_stored_once_and_read_both_ways() {
        let (_pool, mut conn) = memory_conn().await;
        let a = insert_membro(&mut conn, &draft("Ana", None)).await.unwrap();
        let b = insert_membro(&mut conn, &draft("Bia", None)).await.unwrap();

        let edge = Friendship::new(b, a).expect("distinct");
        assert!(add_friendship(&mut conn, edge).await.unwrap());
        assert!(!add_friendship(&mut conn, edge).await.unwrap());

        assert_eq!(count_friendships(&mut conn).await.unwrap(), 1);
        assert_eq!(
            directed_friendships(&mut conn).await.unwrap(),
            vec![(a, b), (b, a)]
        );
        let friends = friends_of(&mut conn, b).await.unwrap();
        assert_eq!(friends, vec![FriendRef { id: a, nome: "Ana".into() }]);
    }

    #[tokio::test]
    async fn clear_roster_restarts_ids() {
        let (_pool, mut conn) = memory_conn().await;
        insert_membro(&mut conn, &draft("Ana", None)).await.unwrap();
        insert_membro(&mut conn, &draft("Bia", None)).await.unwrap();
        clear_roster(&mut conn).await.unwrap();
        let id = insert_membro(&mut conn, &draft("Caio", None)).await.unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn membro_aggregation_skips_blank_groups_and_rejects_unknown_fields() {
        let (_pool, mut conn) = memory_conn().await;
        for (nome, comarca) in [
            ("Ana", Some("BH")),
            ("Bia", Some("BH")),
            ("Caio", Some("Contagem")),
            ("Duda", None),
            ("Eva", Some("  ")),
        ] {
            let mut d = draft(nome, None);
            d.comarca_lotacao = comarca.map(str::to_string);
            insert_membro(&mut conn, &d).await.unwrap();
        }

        let buckets = aggregate_membros(&mut conn, "comarca_lotacao", &RecordQuery::default(), 50)
            .await
            .unwrap();
        assert_eq!(
            buckets,
            vec![
                Bucket { v: "BH".into(), c: 2 },
                Bucket { v: "Contagem".into(), c: 1 },
            ]
        );

        let hostile = "nome; DROP TABLE membros";
        let err = aggregate_membros(&mut conn, hostile, &RecordQuery::default(), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownField(_)));
    }

    #[tokio::test]
    async fn membro_listing_searches_filters_and_paginates() {
        let (_pool, mut conn) = memory_conn().await;
        for i in 0..5 {
            let mut d = draft(&format!("Pessoa {i}"), None);
            d.cargo_efetivo = Some(if i % 2 == 0 { "Promotor" } else { "Procurador" }.into());
            d.sexo = Some(if i < 2 { "Feminino" } else { "Masculino" }.into());
            insert_membro(&mut conn, &d).await.unwrap();
        }

        let mut query = RecordQuery::default();
        query
            .filters
            .insert("cargo_efetivo".into(), vec!["Promotor".into(), " ".into()]);
        let page = list_membros(&mut conn, &query, PageRequest::new(Some(1), Some(2), 20))
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.last_page, 2);
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[0].fields.nome, "Pessoa 4");

        let search = RecordQuery {
            q: Some("pessoa 1".into()),
            ..Default::default()
        };
        let page = list_membros(&mut conn, &search, PageRequest::new(None, None, 20))
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        let stats = membro_stats(&mut conn, &RecordQuery::default()).await.unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.female_count, 2);
        assert_eq!(stats.female_pct, 40.0);
    }

    #[tokio::test]
    async fn duplicate_report_content_is_rejected_on_insert() {
        let (_pool, mut conn) = memory_conn().await;
        let report = doc(json!({"Nome": "Ana", "Total": 3}));
        let id = insert_report(&mut conn, &report).await.unwrap();
        let err = insert_report(&mut conn, &report).await.unwrap_err();
        assert!(matches!(err, StorageError::Duplicate));

        assert_eq!(upsert_report(&mut conn, &report).await.unwrap(), UpsertOutcome::Updated(id));
        let stored = get_report(&mut conn, id).await.unwrap().expect("stored");
        assert_eq!(stored.data, report.data().clone());
        assert_eq!(stored.row_hash, report.row_hash());
    }

    #[tokio::test]
    async fn report_queries_filter_on_json_labels() {
        let (_pool, mut conn) = memory_conn().await;
        for (nome, comarca, concurso) in [
            ("Ana", "BH", json!(2019)),
            ("Bia", "BH", json!("2020")),
            ("Caio", "Contagem", json!(2019)),
            ("Duda", "", JsonValue::Null),
        ] {
            let report =
                doc(json!({"Membro": nome, "Comarca Lotação": comarca, "Concurso": concurso}));
            insert_report(&mut conn, &report).await.unwrap();
        }

        let mut query = RecordQuery::default();
        query.filters.insert("Concurso".into(), vec!["2019".into()]);
        let page = list_reports(&mut conn, &query, PageRequest::new(None, None, 20))
            .await
            .unwrap();
        assert_eq!(page.total, 2);

        let search = RecordQuery {
            q: Some("CONTAGEM".into()),
            ..Default::default()
        };
        let page = list_reports(&mut conn, &search, PageRequest::new(None, None, 20))
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        let buckets = aggregate_reports(&mut conn, "Comarca Lotação", &RecordQuery::default(), 10)
            .await
            .unwrap();
        assert_eq!(buckets[0], Bucket { v: "BH".into(), c: 2 });
        assert_eq!(buckets.len(), 2);

        let values = report_label_values(&mut conn, "Concurso").await.unwrap();
        assert_eq!(values, vec!["2019", "2020", "2019"]);
    }

    #[tokio::test]
    async fn lookup_pairs_are_unique() {
        let (_pool, mut conn) = memory_conn().await;
        assert!(insert_lookup_if_absent(&mut conn, "concurso", "2019").await.unwrap());
        assert!(!insert_lookup_if_absent(&mut conn, "concurso", "2019").await.unwrap());

        let (other, created) = first_or_create_lookup(&mut conn, "concurso", "2020").await.unwrap();
        assert!(created);
        let err = update_lookup(&mut conn, other.id, "concurso", "2019")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Duplicate));

        let renamed = update_lookup(&mut conn, other.id, "concurso", "2021")
            .await
            .unwrap()
            .expect("exists");
        assert_eq!(renamed.name, "2021");
        assert!(update_lookup(&mut conn, 999, "x", "y").await.unwrap().is_none());

        let page = list_lookups(&mut conn, Some("concurso"), PageRequest::new(None, None, 50))
            .await
            .unwrap();
        assert_eq!(
            page.data.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
            vec!["2019", "2021"]
        );
        assert!(delete_lookup(&mut conn, renamed.id).await.unwrap());
    }

    #[tokio::test]
    async fn file_database_is_created_on_connect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("membros.db");
        let config = StorageConfig {
            database_url: format!("sqlite://{}", path.display()),
            max_connections: 2,
        };
        let pool = connect(&config).await.expect("pool");
        let mut conn = pool.acquire().await.expect("conn");
        assert_eq!(count_reports(&mut conn).await.unwrap(), 0);
        assert!(path.exists());
    }
}
