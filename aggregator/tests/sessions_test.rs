//! Session cap + revocation behavior against a live Postgres database.
//! Run with: cargo test -p aggregator --test sessions_test -- --ignored

use aggregator::{auth, sessions};
use common::init_db_pool;
use sqlx::PgPool;
use uuid::Uuid;

async fn connect() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required for integration tests");
    let cfg = common::DatabaseConfig { url, max_connections: Some(5) };
    let pool = init_db_pool(&cfg).await.expect("failed to connect to postgres");
    common::run_migrations(&pool).await.expect("failed to run migrations");
    pool
}

#[tokio::test]
#[ignore]
async fn enforce_session_cap_evicts_oldest() {
    let pool = connect().await;
    let user = auth::register(&pool, &format!("cap_user_{}", Uuid::new_v4()), "correct horse battery", 3, 32, 8, 128, true)
        .await
        .expect("register user");

    for _ in 0..5 {
        auth::enforce_session_cap(&pool, user.id, 5).await.expect("enforce cap");
        sessions::create_session(&pool, user.id, "dummy-hash", chrono::Utc::now() + chrono::Duration::days(1), None, None)
            .await
            .expect("create session");
    }

    let before = sessions::get_active_session_count(&pool, user.id).await.expect("count");
    assert_eq!(before, 5);

    auth::enforce_session_cap(&pool, user.id, 5).await.expect("enforce cap at limit");
    sessions::create_session(&pool, user.id, "dummy-hash-6", chrono::Utc::now() + chrono::Duration::days(1), None, None)
        .await
        .expect("create sixth session");

    let after = sessions::get_active_session_count(&pool, user.id).await.expect("count after");
    assert_eq!(after, 5, "active session count must stay at the configured ceiling");
}

#[tokio::test]
#[ignore]
async fn revoke_session_by_id_is_scoped_to_owner() {
    let pool = connect().await;
    let owner = auth::register(&pool, &format!("owner_{}", Uuid::new_v4()), "correct horse battery", 3, 32, 8, 128, true)
        .await
        .expect("register owner");
    let intruder = auth::register(&pool, &format!("intruder_{}", Uuid::new_v4()), "correct horse battery", 3, 32, 8, 128, false)
        .await
        .expect("register intruder");

    let session = sessions::create_session(&pool, owner.id, "owner-hash", chrono::Utc::now() + chrono::Duration::days(1), None, None)
        .await
        .expect("create session");

    let removed_by_intruder = sessions::revoke_session_by_id(&pool, intruder.id, session.id).await.expect("revoke attempt");
    assert!(!removed_by_intruder, "a session must not be revocable by a different user");

    let removed_by_owner = sessions::revoke_session_by_id(&pool, owner.id, session.id).await.expect("revoke attempt");
    assert!(removed_by_owner);
}
