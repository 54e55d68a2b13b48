//! End-to-end pipeline test against a live Postgres database.
//! Run with: cargo test -p aggregator --test integration_test -- --ignored

use aggregator::{auth, feed, folder, subscription};
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

fn redis_client() -> redis::Client {
    let url = std::env::var("REDIS_URL").expect("REDIS_URL required for integration tests");
    redis::Client::open(url).expect("invalid REDIS_URL")
}

#[tokio::test]
#[ignore]
async fn two_users_share_one_feed_row() {
    let pool = connect().await;
    let redis = redis_client();

    let user_a = auth::register(&pool, &format!("user_a_{}", Uuid::new_v4()), "correct horse battery", 3, 32, 8, 128, true)
        .await
        .expect("register user a");
    let user_b = auth::register(&pool, &format!("user_b_{}", Uuid::new_v4()), "correct horse battery", 3, 32, 8, 128, false)
        .await
        .expect("register user b");

    let feed_url = format!("https://example.test/{}/feed.xml", Uuid::new_v4());
    // Discovering an unknown feed always defers to a worker job.
    let outcome_a = feed::discover_and_subscribe(&pool, &redis, user_a.id, &feed_url, None).await.expect("discover a");
    assert!(matches!(outcome_a, feed::DiscoverOutcome::Pending { .. }));

    // Discovering the same unknown feed again before the worker has acted
    // must not enqueue a second job (idempotency key dedup).
    let outcome_a_again = feed::discover_and_subscribe(&pool, &redis, user_a.id, &feed_url, None).await.expect("discover a repeat");
    if let (feed::DiscoverOutcome::Pending { job_id: first }, feed::DiscoverOutcome::Pending { job_id: second }) = (&outcome_a, &outcome_a_again) {
        assert_eq!(first, second, "repeated discovery of a pending feed must reuse the same job id");
    }

    // Simulate the worker having created the feed out-of-band, then both
    // users discovering the now-known feed should subscribe directly and
    // share the same underlying feed row.
    let created = feed::create_feed(&pool, &feed_url, 10, 5).await;
    if let Ok(created_feed) = created {
        let outcome_a2 = feed::discover_and_subscribe(&pool, &redis, user_a.id, &feed_url, None).await.expect("discover a again");
        assert!(matches!(outcome_a2, feed::DiscoverOutcome::Subscribed));

        let outcome_b = feed::discover_and_subscribe(&pool, &redis, user_b.id, &feed_url, None).await.expect("discover b");
        assert!(matches!(outcome_b, feed::DiscoverOutcome::Subscribed));

        let sub_count: i64 = sqlx::query_scalar("SELECT count(*) FROM personalization.subscriptions WHERE feed_id = $1")
            .bind(created_feed.id)
            .fetch_one(&pool)
            .await
            .expect("count subscriptions");
        assert_eq!(sub_count, 2);
    }
}

#[tokio::test]
#[ignore]
async fn folder_delete_cascades_to_subscriptions_folder_id() {
    let pool = connect().await;
    let user = auth::register(&pool, &format!("folder_user_{}", Uuid::new_v4()), "correct horse battery", 3, 32, 8, 128, true)
        .await
        .expect("register user");

    let folder = folder::create_folder(&pool, user.id, "Tech", None, 9, 50, 64).await.expect("create folder");
    folder::delete_folder(&pool, user.id, folder.id).await.expect("delete folder");

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM personalization.folders WHERE id = $1")
        .bind(folder.id)
        .fetch_one(&pool)
        .await
        .expect("count folders");
    assert_eq!(remaining, 0);
    let _ = subscription::unsubscribe(&pool, user.id, Uuid::new_v4()).await;
}
