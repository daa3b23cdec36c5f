use crate::error::{Result, StoreError};
use crate::store::TupleStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use warden_models::{
    Caveat, Entity, RelationTuple, Revision, SubjectRef, SubjectSelector, TupleFilter, TupleKey,
};

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/warden".to_string(),
            max_connections: 10,
        }
    }
}

impl PostgresConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("DATABASE_URL").unwrap_or_else(|_| Self::default().url),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS relation_tuples (
    tenant_id        TEXT NOT NULL,
    object_type      TEXT NOT NULL,
    object_id        TEXT NOT NULL,
    relation         TEXT NOT NULL,
    subject_type     TEXT NOT NULL,
    subject_id       TEXT NOT NULL,
    subject_relation TEXT NOT NULL DEFAULT '',
    caveat           JSONB,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (tenant_id, object_type, object_id, relation,
                 subject_type, subject_id, subject_relation)
);

CREATE INDEX IF NOT EXISTS idx_relation_tuples_subject
    ON relation_tuples (tenant_id, subject_type, subject_id, relation, object_type);

CREATE TABLE IF NOT EXISTS tenant_revisions (
    tenant_id TEXT PRIMARY KEY,
    revision  BIGINT NOT NULL DEFAULT 0
);
"#;

#[derive(Debug, sqlx::FromRow)]
struct TupleRow {
    tenant_id: String,
    object_type: String,
    object_id: String,
    relation: String,
    subject_type: String,
    subject_id: String,
    subject_relation: String,
    caveat: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl TupleRow {
    fn into_tuple(self) -> Result<RelationTuple> {
        let caveat = match self.caveat {
            Some(value) => Some(
                serde_json::from_value::<Caveat>(value)
                    .map_err(|e| StoreError::Corrupt(format!("caveat: {}", e)))?,
            ),
            None => None,
        };
        let subject = if self.subject_relation.is_empty() {
            SubjectRef::entity(self.subject_type, self.subject_id)
        } else {
            SubjectRef::userset(self.subject_type, self.subject_id, self.subject_relation)
        };
        Ok(RelationTuple {
            tenant_id: self.tenant_id,
            object: Entity::new(self.object_type, self.object_id),
            relation: self.relation,
            subject,
            caveat,
            created_at: self.created_at,
        })
    }
}

/// Postgres-backed tuple store. The per-tenant row in `tenant_revisions` is
/// locked `FOR UPDATE` inside every write transaction, which serializes
/// writers per tenant while leaving other tenants fully concurrent.
#[derive(Clone)]
pub struct PostgresTupleStore {
    pool: PgPool,
}

impl PostgresTupleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    /// Create the backing tables when they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn build_filter_clause(filter: &TupleFilter, first_bind: usize) -> (String, Vec<String>) {
        let mut clause = String::new();
        let mut binds: Vec<String> = Vec::new();
        let mut n = first_bind;

        let mut push = |clause: &mut String, binds: &mut Vec<String>, col: &str, value: &str| {
            clause.push_str(&format!(" AND {} = ${}", col, n));
            binds.push(value.to_string());
            n += 1;
        };

        if let Some(v) = &filter.object_type {
            push(&mut clause, &mut binds, "object_type", v);
        }
        if let Some(v) = &filter.object_id {
            push(&mut clause, &mut binds, "object_id", v);
        }
        if let Some(v) = &filter.relation {
            push(&mut clause, &mut binds, "relation", v);
        }
        if let Some(v) = &filter.subject_type {
            push(&mut clause, &mut binds, "subject_type", v);
        }
        if let Some(v) = &filter.subject_id {
            push(&mut clause, &mut binds, "subject_id", v);
        }
        match &filter.subject_kind {
            SubjectSelector::Any => {}
            SubjectSelector::Concrete => clause.push_str(" AND subject_relation = ''"),
            SubjectSelector::Userset(rel) => {
                push(&mut clause, &mut binds, "subject_relation", rel);
            }
        }

        (clause, binds)
    }

    async fn bump_revision_if_changed(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: &str,
        current: Revision,
        changed: u64,
    ) -> Result<Revision> {
        if changed == 0 {
            return Ok(current);
        }
        let revision: i64 = sqlx::query_scalar(
            "UPDATE tenant_revisions SET revision = revision + 1 WHERE tenant_id = $1 RETURNING revision",
        )
        .bind(tenant_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(revision)
    }

    async fn lock_revision_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: &str,
    ) -> Result<Revision> {
        sqlx::query("INSERT INTO tenant_revisions (tenant_id, revision) VALUES ($1, 0) ON CONFLICT (tenant_id) DO NOTHING")
            .bind(tenant_id)
            .execute(&mut **tx)
            .await?;
        let current: i64 =
            sqlx::query_scalar("SELECT revision FROM tenant_revisions WHERE tenant_id = $1 FOR UPDATE")
                .bind(tenant_id)
                .fetch_one(&mut **tx)
                .await?;
        Ok(current)
    }
}

#[async_trait]
impl TupleStore for PostgresTupleStore {
    async fn write(
        &self,
        tenant_id: &str,
        adds: Vec<RelationTuple>,
        removes: Vec<TupleKey>,
    ) -> Result<Revision> {
        for tuple in &adds {
            if tuple.tenant_id != tenant_id {
                return Err(StoreError::InvalidRequest(format!(
                    "tuple tenant {} does not match write tenant {}",
                    tuple.tenant_id, tenant_id
                )));
            }
        }

        let mut tx = self.pool.begin().await?;
        let current = Self::lock_revision_row(&mut tx, tenant_id).await?;
        let mut changed: u64 = 0;

        for key in &removes {
            let result = sqlx::query(
                r#"
                DELETE FROM relation_tuples
                WHERE tenant_id = $1
                  AND object_type = $2
                  AND object_id = $3
                  AND relation = $4
                  AND subject_type = $5
                  AND subject_id = $6
                  AND subject_relation = $7
                "#,
            )
            .bind(&key.tenant_id)
            .bind(&key.object_type)
            .bind(&key.object_id)
            .bind(&key.relation)
            .bind(&key.subject_type)
            .bind(&key.subject_id)
            .bind(&key.subject_relation)
            .execute(&mut *tx)
            .await?;
            changed += result.rows_affected();
        }

        for tuple in &adds {
            let caveat = tuple
                .caveat
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| StoreError::InvalidRequest(format!("caveat: {}", e)))?;
            let result = sqlx::query(
                r#"
                INSERT INTO relation_tuples
                    (tenant_id, object_type, object_id, relation,
                     subject_type, subject_id, subject_relation, caveat, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (tenant_id, object_type, object_id, relation,
                             subject_type, subject_id, subject_relation)
                DO UPDATE SET caveat = EXCLUDED.caveat
                WHERE relation_tuples.caveat IS DISTINCT FROM EXCLUDED.caveat
                "#,
            )
            .bind(&tuple.tenant_id)
            .bind(&tuple.object.entity_type)
            .bind(&tuple.object.entity_id)
            .bind(&tuple.relation)
            .bind(&tuple.subject.entity.entity_type)
            .bind(&tuple.subject.entity.entity_id)
            .bind(tuple.subject.relation.as_deref().unwrap_or(""))
            .bind(&caveat)
            .bind(tuple.created_at)
            .execute(&mut *tx)
            .await?;
            changed += result.rows_affected();
        }

        let revision = Self::bump_revision_if_changed(&mut tx, tenant_id, current, changed).await?;
        tx.commit().await?;

        tracing::debug!(tenant_id, revision, changed, "tuple write committed");
        Ok(revision)
    }

    async fn read(&self, tenant_id: &str, filter: &TupleFilter) -> Result<Vec<RelationTuple>> {
        let (clause, binds) = Self::build_filter_clause(filter, 2);
        let query = format!(
            "SELECT * FROM relation_tuples WHERE tenant_id = $1{} ORDER BY created_at DESC",
            clause
        );

        let mut q = sqlx::query_as::<_, TupleRow>(&query).bind(tenant_id);
        for bind in &binds {
            q = q.bind(bind);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(TupleRow::into_tuple).collect()
    }

    async fn delete_by_filter(&self, tenant_id: &str, filter: &TupleFilter) -> Result<Revision> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_revision_row(&mut tx, tenant_id).await?;

        let (clause, binds) = Self::build_filter_clause(filter, 2);
        let query = format!("DELETE FROM relation_tuples WHERE tenant_id = $1{}", clause);

        let mut q = sqlx::query(&query).bind(tenant_id);
        for bind in &binds {
            q = q.bind(bind);
        }
        let changed = q.execute(&mut *tx).await?.rows_affected();

        let revision = Self::bump_revision_if_changed(&mut tx, tenant_id, current, changed).await?;
        tx.commit().await?;
        Ok(revision)
    }

    async fn current_revision(&self, tenant_id: &str) -> Result<Revision> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM tenant_revisions WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(revision.unwrap_or(0))
    }

    async fn find_objects_for_subject(
        &self,
        tenant_id: &str,
        subject: &SubjectRef,
        relation: &str,
        object_type: &str,
    ) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT object_id FROM relation_tuples
            WHERE tenant_id = $1
              AND subject_type = $2
              AND subject_id = $3
              AND subject_relation = $4
              AND relation = $5
              AND object_type = $6
            "#,
        )
        .bind(tenant_id)
        .bind(&subject.entity.entity_type)
        .bind(&subject.entity.entity_id)
        .bind(subject.relation.as_deref().unwrap_or(""))
        .bind(relation)
        .bind(object_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
