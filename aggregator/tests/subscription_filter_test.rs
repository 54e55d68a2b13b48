//! Integration test that ensures only articles coming from feeds the user
//! is subscribed to are selected by the same join shape `server.rs`'s
//! `list_articles` route uses, against a live Postgres database.
//! Run with: cargo test -p aggregator --test subscription_filter_test -- --ignored

use chrono::Utc;
use common::init_db_pool;
use sqlx::{PgPool, Row};
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
async fn only_subscribed_feeds_surface_articles() {
    let pool = connect().await;

    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO personalization.users (id, username, password_hash, is_admin, created_at, updated_at) VALUES ($1, $2, 'x', false, now(), now())")
        .bind(user_id)
        .bind(format!("alice_{}", Uuid::new_v4()))
        .execute(&pool)
        .await
        .expect("insert user");

    let feed_a = Uuid::new_v4();
    let feed_b = Uuid::new_v4();
    for (id, url) in [(feed_a, "http://feed-a.example/rss"), (feed_b, "http://feed-b.example/rss")] {
        sqlx::query(
            "INSERT INTO content.feeds (id, canonical_url, title, feed_type, error_count, is_active, latest_articles, created_at) \
             VALUES ($1, $2, $2, 'rss', 0, true, '[]'::jsonb, now())",
        )
        .bind(id)
        .bind(url)
        .execute(&pool)
        .await
        .expect("insert feed");
    }

    // Subscribe the user only to feed A.
    sqlx::query(
        "INSERT INTO personalization.subscriptions (id, user_id, feed_id, pinned, is_active, unread_count, created_at) \
         VALUES ($1, $2, $3, false, true, 0, now())",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(feed_a)
    .execute(&pool)
    .await
    .expect("insert subscription");

    let now = Utc::now();
    let article_a = Uuid::new_v4();
    let article_b = Uuid::new_v4();
    for (id, url, feed_id) in [(article_a, "http://article-a.example/1", feed_a), (article_b, "http://article-b.example/1", feed_b)] {
        sqlx::query(
            "INSERT INTO content.article_urls (canonical_url, article_id) VALUES ($1, $2)",
        )
        .bind(url)
        .bind(id)
        .execute(&pool)
        .await
        .expect("insert article url");
        sqlx::query(
            "INSERT INTO content.articles (id, canonical_url, title, source_tags, platform_metadata, published_at, created_at) \
             VALUES ($1, $2, $2, '[]'::jsonb, '{}'::jsonb, $3, now())",
        )
        .bind(id)
        .bind(url)
        .bind(now)
        .execute(&pool)
        .await
        .expect("insert article");
        sqlx::query("INSERT INTO content.article_sources (article_id, feed_id, created_at) VALUES ($1, $2, now())")
            .bind(id)
            .bind(feed_id)
            .execute(&pool)
            .await
            .expect("link article to feed");
        sqlx::query("INSERT INTO personalization.user_articles (user_id, article_id, is_read, read_later) VALUES ($1, $2, false, false)")
            .bind(user_id)
            .bind(id)
            .execute(&pool)
            .await
            .expect("insert user_article");
    }

    let rows = sqlx::query(
        r#"
        SELECT DISTINCT a.id
        FROM content.articles a
        JOIN personalization.user_articles ua ON ua.article_id = a.id
        JOIN content.article_sources src ON src.article_id = a.id
        JOIN personalization.subscriptions s ON s.feed_id = src.feed_id AND s.user_id = ua.user_id
        WHERE ua.user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_all(&pool)
    .await
    .expect("query failed");

    assert_eq!(rows.len(), 1, "only the subscribed feed's article should surface");
    let returned: Uuid = rows[0].get("id");
    assert_eq!(returned, article_a);
}
