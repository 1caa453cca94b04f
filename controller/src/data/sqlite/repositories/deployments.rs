//! Deployment repository
//!
//! A deployment is a module schema plus the runner endpoint serving it. At
//! most one deployment per module is active; activation flips the previous
//! one off and the reconciler records the replacement in the timeline.

use sqlx::{SqliteConnection, SqlitePool};

use crate::data::error::DataError;
use crate::data::types::DeploymentRow;
use crate::model::keys::DeploymentKey;
use crate::model::schema::ModuleSchema;
use crate::utils::crypto::sha256_hex;
use crate::utils::time::now_ms;

/// Insert a new, active deployment row
pub async fn create_deployment(
    conn: &mut SqliteConnection,
    key: &DeploymentKey,
    schema: &ModuleSchema,
    endpoint: Option<&str>,
) -> Result<i64, DataError> {
    let schema_json = serde_json::to_string(schema)
        .map_err(|e| DataError::Payload(format!("unserializable module schema: {e}")))?;
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO deployments (key, module, schema, digest, endpoint, active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 1, ?, ?)
        RETURNING id
        "#,
    )
    .bind(key.to_string())
    .bind(&schema.name)
    .bind(&schema_json)
    .bind(sha256_hex(&schema_json))
    .bind(endpoint)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Deactivate any other active deployment of the module, returning the
/// replaced deployment's key if there was one.
pub async fn deactivate_module_except(
    conn: &mut SqliteConnection,
    module: &str,
    key: &DeploymentKey,
) -> Result<Option<String>, DataError> {
    let replaced: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE deployments SET active = 0, updated_at = ?
        WHERE module = ? AND key <> ? AND active = 1
        RETURNING key
        "#,
    )
    .bind(now_ms())
    .bind(module)
    .bind(key.to_string())
    .fetch_all(&mut *conn)
    .await?;
    Ok(replaced.into_iter().next())
}

/// Mark a deployment inactive. Returns false when the key is unknown.
pub async fn deactivate(conn: &mut SqliteConnection, key: &DeploymentKey) -> Result<bool, DataError> {
    let result = sqlx::query("UPDATE deployments SET active = 0, updated_at = ? WHERE key = ?")
        .bind(now_ms())
        .bind(key.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

type Row = (i64, String, String, String, Option<String>, bool, i64);

fn hydrate((id, key, module, schema, endpoint, active, created_at): Row) -> Result<DeploymentRow, DataError> {
    let key = DeploymentKey::parse(&key)
        .map_err(|e| DataError::Internal(format!("corrupt deployment key: {e}")))?;
    let schema: ModuleSchema = serde_json::from_str(&schema)
        .map_err(|e| DataError::Internal(format!("corrupt module schema: {e}")))?;
    Ok(DeploymentRow {
        id,
        key,
        module,
        schema,
        endpoint,
        active,
        created_at,
    })
}

const COLUMNS: &str = "id, key, module, schema, endpoint, active, created_at";

/// Get a deployment by key
pub async fn get_deployment(
    conn: &mut SqliteConnection,
    key: &DeploymentKey,
) -> Result<DeploymentRow, DataError> {
    let row = sqlx::query_as::<_, Row>(&format!(
        "SELECT {COLUMNS} FROM deployments WHERE key = ?"
    ))
    .bind(key.to_string())
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DataError::NotFound("deployment"))?;
    hydrate(row)
}

/// The active deployment of a module, if any
pub async fn get_active_for_module(
    conn: &mut SqliteConnection,
    module: &str,
) -> Result<Option<DeploymentRow>, DataError> {
    let row = sqlx::query_as::<_, Row>(&format!(
        "SELECT {COLUMNS} FROM deployments WHERE module = ? AND active = 1 ORDER BY id DESC LIMIT 1"
    ))
    .bind(module)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(hydrate).transpose()
}

/// All deployments, newest first (console listing)
pub async fn list_deployments(pool: &SqlitePool) -> Result<Vec<DeploymentRow>, DataError> {
    let rows = sqlx::query_as::<_, Row>(&format!(
        "SELECT {COLUMNS} FROM deployments ORDER BY id DESC"
    ))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(hydrate).collect()
}

/// Runner endpoint of a module's active deployment (routing table lookup)
pub async fn endpoint_for_module(
    pool: &SqlitePool,
    module: &str,
) -> Result<Option<String>, DataError> {
    let endpoint: Option<Option<String>> = sqlx::query_scalar(
        "SELECT endpoint FROM deployments WHERE module = ? AND active = 1 ORDER BY id DESC LIMIT 1",
    )
    .bind(module)
    .fetch_optional(pool)
    .await?;
    Ok(endpoint.flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::test_pool;

    fn schema(module: &str) -> ModuleSchema {
        serde_json::from_value(serde_json::json!({
            "name": module,
            "decls": [{"type": "topic", "name": "invoices"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let key = DeploymentKey::new("billing").unwrap();
        create_deployment(&mut conn, &key, &schema("billing"), Some("http://runner:8893"))
            .await
            .unwrap();

        let dep = get_deployment(&mut conn, &key).await.unwrap();
        assert_eq!(dep.module, "billing");
        assert!(dep.active);
        assert_eq!(dep.endpoint.as_deref(), Some("http://runner:8893"));
        assert_eq!(dep.schema.topics().collect::<Vec<_>>(), vec!["invoices"]);
    }

    #[tokio::test]
    async fn test_activation_replaces_previous() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let old = DeploymentKey::new("billing").unwrap();
        create_deployment(&mut conn, &old, &schema("billing"), None).await.unwrap();

        let new = DeploymentKey::new("billing").unwrap();
        create_deployment(&mut conn, &new, &schema("billing"), None).await.unwrap();
        let replaced = deactivate_module_except(&mut conn, "billing", &new).await.unwrap();
        assert_eq!(replaced, Some(old.to_string()));

        let active = get_active_for_module(&mut conn, "billing").await.unwrap().unwrap();
        assert_eq!(active.key, new);
        assert!(!get_deployment(&mut conn, &old).await.unwrap().active);
    }

    #[tokio::test]
    async fn test_endpoint_for_module() {
        let pool = test_pool().await;
        assert_eq!(endpoint_for_module(&pool, "billing").await.unwrap(), None);

        let mut conn = pool.acquire().await.unwrap();
        let key = DeploymentKey::new("billing").unwrap();
        create_deployment(&mut conn, &key, &schema("billing"), Some("http://runner:8893"))
            .await
            .unwrap();
        drop(conn);
        assert_eq!(
            endpoint_for_module(&pool, "billing").await.unwrap(),
            Some("http://runner:8893".to_string())
        );
    }

    #[tokio::test]
    async fn test_deactivate_unknown() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let key = DeploymentKey::new("billing").unwrap();
        assert!(!deactivate(&mut conn, &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let a = DeploymentKey::new("billing").unwrap();
        let b = DeploymentKey::new("shipping").unwrap();
        create_deployment(&mut conn, &a, &schema("billing"), None).await.unwrap();
        create_deployment(&mut conn, &b, &schema("shipping"), None).await.unwrap();
        drop(conn);

        let all = list_deployments(&pool).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, b);
        assert_eq!(all[1].key, a);
    }
}
