use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Sqlite};

use tenantry_core::directory::{StoreError, TenantDirectory};
use tenantry_core::domain::audit::Page;
use tenantry_core::domain::tenant::{FeatureMap, Tenant, TenantId, TenantStatus, TenantUsage};

use super::{
    column, format_timestamp, non_negative, parse_optional_timestamp, parse_timestamp,
    saturating_i64, RepositoryError,
};
use crate::DbPool;

const TENANT_COLUMNS: &str = "id, name, subdomain, primary_domain, status, status_reason,
    database_name, features_json, operation_count, last_activity_at, created_at, updated_at";

/// Tenant directory backed by the platform database.
#[derive(Clone)]
pub struct SqlTenantDirectory {
    pool: DbPool,
}

impl SqlTenantDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find_one(
        &self,
        column_name: &str,
        value: &str,
    ) -> Result<Option<Tenant>, RepositoryError> {
        let sql = format!("SELECT {TENANT_COLUMNS} FROM tenant WHERE {column_name} = ?");
        let row = sqlx::query(&sql).bind(value).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_tenant).transpose()
    }
}

fn row_to_tenant(row: &SqliteRow) -> Result<Tenant, RepositoryError> {
    let status: String = column(row, "status")?;
    let status = TenantStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown tenant status `{status}`")))?;
    let features: String = column(row, "features_json")?;
    let features: FeatureMap = serde_json::from_str(&features)
        .map_err(|e| RepositoryError::Decode(format!("features_json: {e}")))?;
    let operation_count: i64 = column(row, "operation_count")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(Tenant {
        id: TenantId(column(row, "id")?),
        name: column(row, "name")?,
        subdomain: column(row, "subdomain")?,
        primary_domain: column(row, "primary_domain")?,
        status,
        status_reason: column(row, "status_reason")?,
        database_name: column(row, "database_name")?,
        features,
        usage: TenantUsage {
            operation_count: non_negative(operation_count, "operation_count")?,
            last_activity_at: parse_optional_timestamp(column(row, "last_activity_at")?)?,
        },
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl TenantDirectory for SqlTenantDirectory {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        Ok(self.find_one("id", &id.0).await?)
    }

    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self.find_one("subdomain", subdomain).await?)
    }

    async fn find_by_domain(&self, domain: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self.find_one("primary_domain", domain).await?)
    }

    /// Usage counters are left alone on update; only `increment_operation_count` moves them.
    async fn save(&self, tenant: Tenant) -> Result<(), StoreError> {
        let features = serde_json::to_string(&tenant.features)
            .map_err(|e| StoreError::Decode(format!("features: {e}")))?;

        sqlx::query(
            "INSERT INTO tenant (id, name, subdomain, primary_domain, status, status_reason,
                                 database_name, features_json, operation_count, last_activity_at,
                                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 subdomain = excluded.subdomain,
                 primary_domain = excluded.primary_domain,
                 status = excluded.status,
                 status_reason = excluded.status_reason,
                 database_name = excluded.database_name,
                 features_json = excluded.features_json,
                 updated_at = excluded.updated_at",
        )
        .bind(&tenant.id.0)
        .bind(&tenant.name)
        .bind(&tenant.subdomain)
        .bind(&tenant.primary_domain)
        .bind(tenant.status.as_str())
        .bind(&tenant.status_reason)
        .bind(&tenant.database_name)
        .bind(features)
        .bind(saturating_i64(tenant.usage.operation_count))
        .bind(tenant.usage.last_activity_at.map(format_timestamp))
        .bind(format_timestamp(tenant.created_at))
        .bind(format_timestamp(tenant.updated_at))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn update_status(
        &self,
        id: &TenantId,
        status: TenantStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE tenant SET status = ?, status_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(format_timestamp(Utc::now()))
        .bind(&id.0)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(updated.rows_affected() > 0)
    }

    async fn increment_operation_count(
        &self,
        id: &TenantId,
        by: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tenant
             SET operation_count = operation_count + ?, last_activity_at = ?
             WHERE id = ?",
        )
        .bind(saturating_i64(by))
        .bind(format_timestamp(at))
        .bind(&id.0)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn list(
        &self,
        status: Option<TenantStatus>,
        page: Page,
    ) -> Result<Vec<Tenant>, StoreError> {
        let mut query =
            QueryBuilder::<Sqlite>::new(format!("SELECT {TENANT_COLUMNS} FROM tenant WHERE 1=1"));
        if let Some(status) = status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        query
            .push(" ORDER BY id ASC LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset));

        let rows = query.build().fetch_all(&self.pool).await.map_err(RepositoryError::from)?;
        Ok(rows.iter().map(row_to_tenant).collect::<Result<Vec<_>, _>>()?)
    }
}
