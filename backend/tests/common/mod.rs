// Common test utilities that are shared across integration tests
use sqlx::PgPool;
use std::sync::Once;
use uuid::Uuid;

use steward_backend::database;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init()
            .ok();
    });
}

/// Migrated pool for TEST_DATABASE_URL, or `None` to skip the test
pub async fn test_pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return None;
    };

    let pool = database::create_pool(&url).await.expect("connect to test database");
    database::migrate(&pool).await.expect("run migrations");
    Some(pool)
}

pub async fn insert_realm(pool: &PgPool) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO realms (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(format!("realm-{}", id))
        .execute(pool)
        .await
        .expect("insert realm");
    id
}

pub async fn insert_user(pool: &PgPool, realm_id: Uuid, username: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, realm_id, username, email) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(realm_id)
        .bind(username)
        .bind(format!("{}@example.com", username))
        .execute(pool)
        .await
        .expect("insert user");
    id
}

pub async fn join_group(pool: &PgPool, realm_id: Uuid, user_id: Uuid, path: &str) {
    let group_id: Uuid = sqlx::query_scalar(
        "INSERT INTO realm_groups (id, realm_id, path) VALUES ($1, $2, $3)
         ON CONFLICT (realm_id, path) DO UPDATE SET path = EXCLUDED.path
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(realm_id)
    .bind(path)
    .fetch_one(pool)
    .await
    .expect("upsert group");

    sqlx::query("INSERT INTO user_group_memberships (user_id, group_id) VALUES ($1, $2)")
        .bind(user_id)
        .bind(group_id)
        .execute(pool)
        .await
        .expect("insert membership");
}
