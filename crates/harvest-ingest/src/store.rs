//! Postgres storage for normalized records and the subject stream

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use harvest_common::types::{ColumnType, FieldValue, NormalizedRecord, Subject, TableSchema};
use harvest_common::{HarvestError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info};

use crate::source::{RankedSubject, RankedSubjects, StartPoint, SubjectStore};
use crate::writer::RecordSink;

/// SQLSTATE classes a batch can be bisected around: cardinality violations
/// such as one key twice in a single upsert (21), data exceptions (22),
/// integrity violations (23), syntax or schema errors (42) and program
/// limits such as too many bind parameters (54)
const RECOVERABLE_SQLSTATE_CLASSES: [&str; 5] = ["21", "22", "23", "42", "54"];

/// Map a sqlx error onto the harvest taxonomy
pub fn classify_db_error(err: sqlx::Error) -> HarvestError {
    if let sqlx::Error::Database(ref db) = err {
        let class = db.code().and_then(|code| code.get(..2).map(str::to_string));
        if class.is_some_and(|c| RECOVERABLE_SQLSTATE_CLASSES.contains(&c.as_str())) {
            return HarvestError::SchemaOrConstraint(db.message().to_string());
        }
    }
    HarvestError::Database(err.to_string())
}

/// Subjects read per keyset query
pub const DEFAULT_SUBJECT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    subject_page_size: usize,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            subject_page_size: DEFAULT_SUBJECT_PAGE_SIZE,
        }
    }

    pub fn with_subject_page_size(mut self, page_size: usize) -> Self {
        self.subject_page_size = page_size.max(1);
        self
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(classify_db_error)?;

        info!(max_connections, "Database connection pool created");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| HarvestError::Database(format!("Migration failed: {e}")))
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Bind `value` as the SQL type of `ty`; `Null` binds a typed NULL
fn bind_value<'args>(
    row: &mut Separated<'_, 'args, Postgres, &'static str>,
    ty: ColumnType,
    value: &'args FieldValue,
) {
    match ty {
        ColumnType::Text => {
            row.push_bind(match value {
                FieldValue::Text(s) => Some(s.as_str()),
                _ => None,
            });
        },
        ColumnType::BigInt => {
            row.push_bind(match value {
                FieldValue::Integer(i) => Some(*i),
                _ => None,
            });
        },
        ColumnType::Double => {
            row.push_bind(match value {
                FieldValue::Float(f) => Some(*f),
                FieldValue::Integer(i) => Some(*i as f64),
                _ => None,
            });
        },
        ColumnType::Boolean => {
            row.push_bind(match value {
                FieldValue::Bool(b) => Some(*b),
                _ => None,
            });
        },
        ColumnType::Timestamp => {
            row.push_bind(match value {
                FieldValue::Timestamp(ts) => Some(*ts),
                _ => None,
            });
        },
        ColumnType::Jsonb => {
            row.push_bind(match value {
                FieldValue::Json(v) => Some(v),
                _ => None,
            });
        },
    }
}

#[async_trait]
impl RecordSink for PgStore {
    async fn column_count(&self, table: &TableSchema) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            "#,
        )
        .bind(&table.name)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_db_error)?;

        // Table not created yet: fall back to what the normalizer binds
        Ok(match usize::try_from(count) {
            Ok(n) if n > 0 => n,
            _ => table.column_count(),
        })
    }

    async fn upsert(&self, table: &TableSchema, records: &[NormalizedRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        if let Some((record, column)) = records
            .iter()
            .find_map(|r| table.find_mismatch(r).map(|c| (r, c)))
        {
            return Err(HarvestError::schema_or_constraint(format!(
                "record {} has a value of the wrong type for {} column '{}'",
                record.id(),
                column.ty,
                column.name
            )));
        }

        let columns: Vec<String> = std::iter::once(&table.key)
            .chain(table.columns.iter().map(|c| &c.name))
            .map(|c| quote_ident(c))
            .collect();

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            quote_ident(&table.name),
            columns.join(", ")
        ));

        query_builder.push_values(records, |mut b, record| {
            b.push_bind(record.id());
            for column in &table.columns {
                bind_value(&mut b, column.ty, record.get(&column.name));
            }
        });

        query_builder.push(format!(" ON CONFLICT ({}) ", quote_ident(&table.key)));
        if table.columns.is_empty() {
            query_builder.push("DO NOTHING");
        } else {
            let assignments: Vec<String> = table
                .columns
                .iter()
                .map(|c| {
                    let col = quote_ident(&c.name);
                    format!("{col} = EXCLUDED.{col}")
                })
                .collect();
            query_builder.push("DO UPDATE SET ");
            query_builder.push(assignments.join(", "));
        }

        let result = query_builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(classify_db_error)?;

        debug!(table = %table.name, rows = result.rows_affected(), "Upserted batch");
        Ok(result.rows_affected())
    }
}

const RESOLVE_LABEL_SQL: &str = "SELECT id FROM users_clean WHERE username = $1 LIMIT 1";

/// One keyset page of subjects: $1 inclusive start id, $2 last id already
/// read, $3 label lower bound (exclusive), $4 page size
const SUBJECT_PAGE_SQL: &str = r#"
    SELECT id, username
    FROM users_clean
    WHERE ($1::text IS NULL OR id >= $1)
      AND ($2::text IS NULL OR id > $2)
      AND ($3::text IS NULL OR username > $3)
    ORDER BY id
    LIMIT $4
"#;

/// Position of a paged subject read
enum Keyset {
    First,
    After(String),
    Done,
}

#[async_trait]
impl SubjectStore for PgStore {
    async fn resolve_label(&self, label: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>(RESOLVE_LABEL_SQL)
            .bind(label)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_db_error)
    }

    /// Reads one page per query so no connection is held between pages
    fn fetch(&self, start: StartPoint) -> BoxStream<'_, Result<Subject>> {
        let (from_id, after_label) = match start {
            StartPoint::Beginning => (None, None),
            StartPoint::AtId(id) => (Some(id), None),
            StartPoint::AfterLabel(label) => (None, Some(label)),
        };
        let page_size = self.subject_page_size;

        stream::try_unfold(Keyset::First, move |keyset| {
            let from_id = from_id.clone();
            let after_label = after_label.clone();
            async move {
                let after_id = match keyset {
                    Keyset::Done => return Ok::<_, HarvestError>(None),
                    Keyset::First => None,
                    Keyset::After(id) => Some(id),
                };

                let rows: Vec<(String, String)> = sqlx::query_as(SUBJECT_PAGE_SQL)
                    .bind(from_id.as_deref())
                    .bind(after_id.as_deref())
                    .bind(after_label.as_deref())
                    .bind(i64::try_from(page_size).unwrap_or(i64::MAX))
                    .fetch_all(&self.pool)
                    .await
                    .map_err(classify_db_error)?;

                let next = match rows.last() {
                    Some((id, _)) if rows.len() >= page_size => Keyset::After(id.clone()),
                    _ => Keyset::Done,
                };
                debug!(subjects = rows.len(), "Read subject page");

                let subjects = rows
                    .into_iter()
                    .map(|(id, label)| Ok::<_, HarvestError>(Subject::new(id, label)));
                Ok(Some((stream::iter(subjects), next)))
            }
        })
        .try_flatten()
        .boxed()
    }
}

const TOP_SUBJECTS_SQL: &str = r#"
    SELECT u.id, u.username, COUNT(b.id) AS bet_count
    FROM users_clean u
    JOIN bets_clean b ON b.user_id = u.id
    GROUP BY u.id, u.username
    ORDER BY bet_count DESC, u.id
    LIMIT $1
"#;

#[async_trait]
impl RankedSubjects for PgStore {
    async fn top_subjects(&self, limit: usize) -> Result<Vec<RankedSubject>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<(String, String, i64)> = sqlx::query_as(TOP_SUBJECTS_SQL)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(classify_db_error)?;

        Ok(rows
            .into_iter()
            .map(|(id, label, count)| RankedSubject {
                subject: Subject::new(id, label),
                item_count: u64::try_from(count).unwrap_or_default(),
            })
            .collect())
    }
}
