//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, the PostgreSQL implementation of
//! the `RecordStore` port from the core crate. Every collection lives in the
//! single `records` table with its fields in a JSONB `data` column; filter strings
//! are parsed by the core and translated here into SQL with bound parameters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, Acquire, FromRow, PgPool, Postgres, QueryBuilder, Transaction};
use std::sync::Arc;
use story_engine_core::domain::{new_record_id, Collection, Fields, Record};
use story_engine_core::filter::{
    is_field_name, is_system_field, parse_filter, CmpOp, FilterExpr, FilterValue, Sort,
};
use story_engine_core::ports::{Clock, PortError, PortResult, RecordStore, RecordTx};
use tracing::debug;

const RECORD_COLUMNS: &str = "id, collection, data, created, updated";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `RecordStore` port.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgRecordStore {
    /// Creates a new `PgRecordStore`.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn begin(&self) -> PortResult<Box<dyn RecordTx>> {
        let tx = self.pool.begin().await.map_err(map_sqlx)?;
        Ok(Box::new(PgRecordTx {
            tx,
            clock: self.clock.clone(),
        }))
    }
}

/// One open database transaction. Dropping it rolls back.
pub struct PgRecordTx {
    tx: Transaction<'static, Postgres>,
    clock: Arc<dyn Clock>,
}

//=========================================================================================
// "Impure" Database Record Struct
//=========================================================================================

#[derive(FromRow)]
struct RecordRow {
    id: String,
    collection: String,
    data: Json<Fields>,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl RecordRow {
    fn to_domain(self) -> PortResult<Record> {
        Ok(Record {
            id: self.id,
            collection: self.collection.parse()?,
            data: self.data.0,
            created: self.created,
            updated: self.updated,
        })
    }
}

fn map_sqlx(e: sqlx::Error) -> PortError {
    match e {
        sqlx::Error::RowNotFound => PortError::NotFound(e.to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            PortError::Conflict(db.message().to_string())
        }
        other => PortError::Unexpected(other.to_string()),
    }
}

//=========================================================================================
// Filter and Sort Translation
//=========================================================================================

/// Quotes a validated field name as a JSON key literal.
fn json_key(field: &str) -> PortResult<String> {
    if !is_field_name(field) {
        return Err(PortError::InvalidFilter(format!("invalid field '{field}'")));
    }
    Ok(format!("'{field}'"))
}

fn sql_op(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "=",
        CmpOp::Neq => "<>",
        CmpOp::Gt => ">",
        CmpOp::Gte => ">=",
        CmpOp::Lt => "<",
        CmpOp::Lte => "<=",
    }
}

/// Appends the SQL condition for `expr`.
///
/// Mirrors the in-memory evaluation: comparisons between mismatched types are
/// false (true for `!=`), and an absent field, JSON null and `""` are equal.
pub(crate) fn push_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    expr: &FilterExpr,
) -> PortResult<()> {
    match expr {
        FilterExpr::All => {
            qb.push("TRUE");
        }
        FilterExpr::And(children) | FilterExpr::Or(children) if children.is_empty() => {
            qb.push(if matches!(expr, FilterExpr::And(_)) { "TRUE" } else { "FALSE" });
        }
        FilterExpr::And(children) | FilterExpr::Or(children) => {
            let joiner = if matches!(expr, FilterExpr::And(_)) { " AND " } else { " OR " };
            qb.push("(");
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    qb.push(joiner);
                }
                push_filter(qb, child)?;
            }
            qb.push(")");
        }
        FilterExpr::Comparison { field, op, value } => push_comparison(qb, field, *op, value)?,
    }
    Ok(())
}

fn push_comparison(
    qb: &mut QueryBuilder<'_, Postgres>,
    field: &str,
    op: CmpOp,
    value: &FilterValue,
) -> PortResult<()> {
    match field {
        "id" => {
            return match value {
                FilterValue::String(s) => {
                    // Byte order, matching the in-memory comparison.
                    qb.push(format!("id COLLATE \"C\" {} ", sql_op(op)));
                    qb.push_bind(s.clone());
                    Ok(())
                }
                _ => {
                    qb.push(if op == CmpOp::Neq { "TRUE" } else { "FALSE" });
                    Ok(())
                }
            };
        }
        "created" | "updated" => {
            match value.as_timestamp() {
                Some(at) => {
                    qb.push(format!("{field} {} ", sql_op(op)));
                    qb.push_bind(at);
                }
                None => {
                    qb.push(if op == CmpOp::Neq { "TRUE" } else { "FALSE" });
                }
            }
            return Ok(());
        }
        _ => {}
    }

    let key = json_key(field)?;
    match value {
        FilterValue::Null => push_blank_check(qb, &key, op),
        FilterValue::String(s) if s.is_empty() => push_blank_check(qb, &key, op),
        FilterValue::String(s) => {
            push_typed(qb, &key, "string", "data ->> KEY", op);
            qb.push_bind(s.clone());
        }
        FilterValue::Number(n) => {
            push_typed(qb, &key, "number", "(data ->> KEY)::float8", op);
            qb.push_bind(*n);
        }
        FilterValue::Bool(b) => {
            push_typed(qb, &key, "boolean", "(data ->> KEY)::boolean", op);
            qb.push_bind(*b);
        }
    }
    Ok(())
}

/// Equality against null or the empty string.
fn push_blank_check(qb: &mut QueryBuilder<'_, Postgres>, key: &str, op: CmpOp) {
    match op {
        CmpOp::Eq => qb.push(format!("COALESCE(data ->> {key}, '') = ''")),
        CmpOp::Neq => qb.push(format!("COALESCE(data ->> {key}, '') <> ''")),
        // Ordering against null never matches.
        _ => qb.push("FALSE"),
    };
}

/// `CASE WHEN <type matches> THEN <cast> END <op> `, ready for the bound literal.
fn push_typed(
    qb: &mut QueryBuilder<'_, Postgres>,
    key: &str,
    json_type: &str,
    cast: &str,
    op: CmpOp,
) {
    let cast = cast.replace("KEY", key);
    let lhs = format!("CASE WHEN jsonb_typeof(data -> {key}) = '{json_type}' THEN {cast} END");
    if op == CmpOp::Neq {
        qb.push(format!("{lhs} IS DISTINCT FROM "));
    } else {
        qb.push(format!("{lhs} {} ", sql_op(op)));
    }
}

fn push_order_by(qb: &mut QueryBuilder<'_, Postgres>, sort: &Sort) -> PortResult<()> {
    qb.push(" ORDER BY ");
    for key in &sort.keys {
        let direction = if key.descending { "DESC" } else { "ASC" };
        if is_system_field(&key.field) {
            qb.push(format!("{} {direction}, ", key.field));
        } else {
            qb.push(format!("data -> {} {direction}, ", json_key(&key.field)?));
        }
    }
    // Insertion order breaks ties.
    qb.push("created ASC, id ASC");
    Ok(())
}

/// Builds the `SELECT` for one filtered page.
pub(crate) fn select_query(
    collection: Collection,
    filter: &str,
    sort: &str,
    limit: usize,
    offset: usize,
) -> PortResult<QueryBuilder<'static, Postgres>> {
    let expr = parse_filter(filter)?;
    let sort = Sort::parse(sort)?;

    let mut qb = QueryBuilder::new(format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE collection = "
    ));
    qb.push_bind(collection.as_str());
    qb.push(" AND ");
    push_filter(&mut qb, &expr)?;
    push_order_by(&mut qb, &sort)?;
    if limit > 0 {
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);
    }
    if offset > 0 {
        qb.push(" OFFSET ");
        qb.push_bind(offset as i64);
    }
    // Engine-owned rows are read-modify-written; hold them until commit.
    if !collection.unique_keys().is_empty() {
        qb.push(" FOR UPDATE");
    }
    Ok(qb)
}

//=========================================================================================
// `RecordTx` Trait Implementation
//=========================================================================================

#[async_trait]
impl RecordTx for PgRecordTx {
    async fn find_by_id(&mut self, collection: Collection, id: &str) -> PortResult<Record> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE collection = $1 AND id = $2 FOR UPDATE"
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(collection.as_str())
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        row.ok_or_else(|| PortError::NotFound(format!("{collection} {id}")))?
            .to_domain()
    }

    async fn find_by_filter(
        &mut self,
        collection: Collection,
        filter: &str,
        sort: &str,
        limit: usize,
        offset: usize,
    ) -> PortResult<Vec<Record>> {
        let mut qb = select_query(collection, filter, sort, limit, offset)?;
        let rows: Vec<RecordRow> = qb
            .build_query_as()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(RecordRow::to_domain).collect()
    }

    async fn count(&mut self, collection: Collection, filter: &str) -> PortResult<u64> {
        let expr = parse_filter(filter)?;
        let mut qb = QueryBuilder::new("SELECT count(*) FROM records WHERE collection = ");
        qb.push_bind(collection.as_str());
        qb.push(" AND ");
        push_filter(&mut qb, &expr)?;
        let (n,): (i64,) = qb
            .build_query_as()
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(n.max(0) as u64)
    }

    async fn create(&mut self, collection: Collection, data: Fields) -> PortResult<Record> {
        let now = self.clock.now();
        let sql = format!(
            "INSERT INTO records (id, collection, data, created, updated) \
             VALUES ($1, $2, $3, $4, $4) RETURNING {RECORD_COLUMNS}"
        );
        // A savepoint keeps a unique violation from aborting the whole transaction.
        let mut savepoint = Acquire::begin(&mut self.tx).await.map_err(map_sqlx)?;
        let row: RecordRow = sqlx::query_as(&sql)
            .bind(new_record_id())
            .bind(collection.as_str())
            .bind(Json(data))
            .bind(now)
            .fetch_one(&mut *savepoint)
            .await
            .map_err(map_sqlx)?;
        savepoint.commit().await.map_err(map_sqlx)?;
        debug!(collection = %collection, id = %row.id, "record created");
        row.to_domain()
    }

    async fn update(&mut self, record: &Record, data: Fields) -> PortResult<Record> {
        let now = self.clock.now();
        let sql = format!(
            "UPDATE records SET data = data || $1, updated = $2 \
             WHERE collection = $3 AND id = $4 RETURNING {RECORD_COLUMNS}"
        );
        let mut savepoint = Acquire::begin(&mut self.tx).await.map_err(map_sqlx)?;
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(Json(data))
            .bind(now)
            .bind(record.collection.as_str())
            .bind(&record.id)
            .fetch_optional(&mut *savepoint)
            .await
            .map_err(map_sqlx)?;
        savepoint.commit().await.map_err(map_sqlx)?;
        row.ok_or_else(|| PortError::NotFound(format!("{} {}", record.collection, record.id)))?
            .to_domain()
    }

    async fn delete(&mut self, record: &Record) -> PortResult<()> {
        let result = sqlx::query("DELETE FROM records WHERE collection = $1 AND id = $2")
            .bind(record.collection.as_str())
            .bind(&record.id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!(
                "{} {}",
                record.collection, record.id
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> PortResult<()> {
        self.tx.commit().await.map_err(map_sqlx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_sql(filter: &str) -> String {
        let expr = parse_filter(filter).unwrap();
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("");
        push_filter(&mut qb, &expr).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn string_equality_binds_the_value() {
        assert_eq!(
            filter_sql(r#"story="abc""#),
            "CASE WHEN jsonb_typeof(data -> 'story') = 'string' THEN data ->> 'story' END = $1"
        );
    }

    #[test]
    fn hostile_values_never_reach_the_sql_text() {
        let filter = story_engine_core::filter::eq("user", r#"x" || user!="y"#);
        let sql = filter_sql(&filter);
        assert!(!sql.contains("x\""));
        assert!(sql.ends_with("$1"));
    }

    #[test]
    fn blank_and_metadata_comparisons() {
        assert_eq!(filter_sql("user=''"), "COALESCE(data ->> 'user', '') = ''");
        assert_eq!(
            filter_sql(r#"created>="2025-05-10T08:00:00.000Z" && id!="v1""#),
            "(created >= $1 AND id COLLATE \"C\" <> $2)"
        );
        assert_eq!(
            filter_sql("is_free=true || chapter_number>2"),
            "(CASE WHEN jsonb_typeof(data -> 'is_free') = 'boolean' THEN (data ->> 'is_free')::boolean END = $1 \
             OR CASE WHEN jsonb_typeof(data -> 'chapter_number') = 'number' THEN (data ->> 'chapter_number')::float8 END > $2)"
        );
    }

    #[test]
    fn predecessor_filter_compares_ids_bytewise() {
        let at = Utc::now();
        let view = Record {
            id: "v2".into(),
            collection: Collection::Views,
            data: Fields::new(),
            created: at,
            updated: at,
        };
        assert_eq!(
            filter_sql(&story_engine_core::filter::precedes(&view)),
            "(created < $1 OR (created = $2 AND id COLLATE \"C\" < $3))"
        );
    }

    #[test]
    fn not_equal_includes_rows_without_the_field() {
        assert_eq!(
            filter_sql(r#"type!="story""#),
            "CASE WHEN jsonb_typeof(data -> 'type') = 'string' THEN data ->> 'type' END IS DISTINCT FROM $1"
        );
    }

    #[test]
    fn select_locks_engine_owned_rows_only() {
        let stats = select_query(Collection::UserStats, r#"user="u1""#, "", 1, 0).unwrap();
        assert!(stats.sql().ends_with(" LIMIT $3 FOR UPDATE"));

        let reviews = select_query(Collection::Reviews, "", "-created,rating", 0, 20).unwrap();
        assert_eq!(
            reviews.sql(),
            "SELECT id, collection, data, created, updated FROM records WHERE collection = $1 \
             AND TRUE ORDER BY created DESC, data -> 'rating' ASC, created ASC, id ASC OFFSET $2"
        );
    }
}
