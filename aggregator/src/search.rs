//! Universal search (R). Grounded on `application/search/search.py`
//! (fan-out/merge/weights) and `infrastructure/repositories/search.py`
//! (the per-type `tsvector`/trigram ranking SQL). No search crate: all
//! ranking is pushed into Postgres per spec.md's explicit Non-goal
//! "custom full-text indexers (we lean on the RDBMS)".

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

const RESULT_CAP: i64 = 20;
const WEIGHT_ARTICLES: f64 = 1.8;
const WEIGHT_FEEDS: f64 = 2.0;
const WEIGHT_TAGS: f64 = 0.8;
const WEIGHT_FOLDERS: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Article,
    Feed,
    Tag,
    Folder,
}

impl EntityType {
    fn as_str(&self) -> &'static str {
        match self {
            EntityType::Article => "article",
            EntityType::Feed => "feed",
            EntityType::Tag => "tag",
            EntityType::Folder => "folder",
        }
    }

    fn weight(&self) -> f64 {
        match self {
            EntityType::Article => WEIGHT_ARTICLES,
            EntityType::Feed => WEIGHT_FEEDS,
            EntityType::Tag => WEIGHT_TAGS,
            EntityType::Folder => WEIGHT_FOLDERS,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub entity_type: &'static str,
    pub id: Uuid,
    pub title: String,
    pub snippet: Option<String>,
    pub score: f64,
}

#[derive(sqlx::FromRow)]
struct RawHit {
    id: Uuid,
    title: String,
    snippet: Option<String>,
    rank: f64,
}

fn prefix_tsquery(raw: &str) -> String {
    raw.split_whitespace()
        .filter(|w| !w.is_empty())
        .map(|w| format!("{}:*", sanitize_tsquery_word(w)))
        .collect::<Vec<_>>()
        .join(" & ")
}

fn sanitize_tsquery_word(word: &str) -> String {
    word.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Ranking combines a boolean prefix-match indicator with trigram
/// similarity: `prefix_match + 0.5 * similarity`, matching the original
/// repository's exact scoring formula.
pub async fn search_articles(pool: &PgPool, user_id: Uuid, query: &str, limit: i64) -> sqlx::Result<Vec<RawHit>> {
    let tsquery = prefix_tsquery(query);
    sqlx::query_as::<_, RawHit>(
        r#"
        SELECT a.id AS id,
               a.title AS title,
               left(coalesce(a.summary, a.content, ''), 200) AS snippet,
               (
                 CASE WHEN to_tsvector('english', a.title) @@ to_tsquery('english', $2) THEN 1.0 ELSE 0.0 END
                 + 0.5 * similarity(a.title, $3)
               ) AS rank
        FROM content.articles a
        JOIN personalization.user_articles ua ON ua.article_id = a.id
        WHERE ua.user_id = $1
          AND (
            to_tsvector('english', a.title) @@ to_tsquery('english', $2)
            OR a.title % $3
          )
        ORDER BY rank DESC
        LIMIT $4
        "#,
    )
    .bind(user_id)
    .bind(&tsquery)
    .bind(query)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn search_feeds(pool: &PgPool, user_id: Uuid, query: &str, limit: i64) -> sqlx::Result<Vec<RawHit>> {
    let tsquery = prefix_tsquery(query);
    sqlx::query_as::<_, RawHit>(
        r#"
        SELECT f.id AS id,
               f.title AS title,
               f.description AS snippet,
               (
                 CASE WHEN to_tsvector('english', f.title) @@ to_tsquery('english', $2) THEN 1.0 ELSE 0.0 END
                 + 0.5 * similarity(f.title, $3)
               ) AS rank
        FROM content.feeds f
        JOIN personalization.subscriptions s ON s.feed_id = f.id
        WHERE s.user_id = $1 AND s.is_active = true
          AND (
            to_tsvector('english', f.title) @@ to_tsquery('english', $2)
            OR f.title % $3
          )
        ORDER BY rank DESC
        LIMIT $4
        "#,
    )
    .bind(user_id)
    .bind(&tsquery)
    .bind(query)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn search_tags(pool: &PgPool, user_id: Uuid, query: &str, limit: i64) -> sqlx::Result<Vec<RawHit>> {
    let tsquery = prefix_tsquery(query);
    sqlx::query_as::<_, RawHit>(
        r#"
        SELECT id,
               name AS title,
               NULL::text AS snippet,
               (
                 CASE WHEN to_tsvector('english', name) @@ to_tsquery('english', $2) THEN 1.0 ELSE 0.0 END
                 + 0.5 * similarity(name, $3)
               ) AS rank
        FROM personalization.user_tags
        WHERE user_id = $1
          AND (
            to_tsvector('english', name) @@ to_tsquery('english', $2)
            OR name % $3
          )
        ORDER BY rank DESC
        LIMIT $4
        "#,
    )
    .bind(user_id)
    .bind(&tsquery)
    .bind(query)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn search_folders(pool: &PgPool, user_id: Uuid, query: &str, limit: i64) -> sqlx::Result<Vec<RawHit>> {
    let tsquery = prefix_tsquery(query);
    sqlx::query_as::<_, RawHit>(
        r#"
        SELECT id,
               name AS title,
               NULL::text AS snippet,
               (
                 CASE WHEN to_tsvector('english', name) @@ to_tsquery('english', $2) THEN 1.0 ELSE 0.0 END
                 + 0.5 * similarity(name, $3)
               ) AS rank
        FROM personalization.folders
        WHERE user_id = $1
          AND (
            to_tsvector('english', name) @@ to_tsquery('english', $2)
            OR name % $3
          )
        ORDER BY rank DESC
        LIMIT $4
        "#,
    )
    .bind(user_id)
    .bind(&tsquery)
    .bind(query)
    .bind(limit)
    .fetch_all(pool)
    .await
}

fn normalize(hits: Vec<RawHit>, entity_type: EntityType) -> Vec<SearchHit> {
    if hits.is_empty() {
        return Vec::new();
    }
    let max = hits.iter().map(|h| h.rank).fold(f64::MIN, f64::max);
    let min = hits.iter().map(|h| h.rank).fold(f64::MAX, f64::min);
    let range = max - min;
    hits.into_iter()
        .map(|h| {
            let normalized = if range > 0.0 { (h.rank - min) / range } else { 1.0 };
            SearchHit {
                entity_type: entity_type.as_str(),
                id: h.id,
                title: h.title,
                snippet: h.snippet,
                score: normalized * entity_type.weight(),
            }
        })
        .collect()
}

/// Per-type search, exposed for the scoped search endpoints (§6.1).
pub async fn search_by_type(pool: &PgPool, user_id: Uuid, entity_type: EntityType, query: &str) -> sqlx::Result<Vec<SearchHit>> {
    let raw = match entity_type {
        EntityType::Article => search_articles(pool, user_id, query, RESULT_CAP).await?,
        EntityType::Feed => search_feeds(pool, user_id, query, RESULT_CAP).await?,
        EntityType::Tag => search_tags(pool, user_id, query, RESULT_CAP).await?,
        EntityType::Folder => search_folders(pool, user_id, query, RESULT_CAP).await?,
    };
    Ok(normalize(raw, entity_type))
}

/// Universal search: runs all four type searches concurrently, tolerates
/// per-type failures (a broken trigram index on one table shouldn't sink
/// the whole query), min-max normalizes each type's scores independently,
/// applies type weights, merges, and caps at `RESULT_CAP`.
pub async fn universal_search(pool: &PgPool, user_id: Uuid, query: &str) -> Vec<SearchHit> {
    if query.trim().is_empty() {
        return Vec::new();
    }
    let (articles, feeds, tags, folders) = tokio::join!(
        search_articles(pool, user_id, query, RESULT_CAP),
        search_feeds(pool, user_id, query, RESULT_CAP),
        search_tags(pool, user_id, query, RESULT_CAP),
        search_folders(pool, user_id, query, RESULT_CAP),
    );

    let mut merged = Vec::new();
    match articles {
        Ok(hits) => merged.extend(normalize(hits, EntityType::Article)),
        Err(e) => tracing::warn!(error = %e, "article search failed, continuing without it"),
    }
    match feeds {
        Ok(hits) => merged.extend(normalize(hits, EntityType::Feed)),
        Err(e) => tracing::warn!(error = %e, "feed search failed, continuing without it"),
    }
    match tags {
        Ok(hits) => merged.extend(normalize(hits, EntityType::Tag)),
        Err(e) => tracing::warn!(error = %e, "tag search failed, continuing without it"),
    }
    match folders {
        Ok(hits) => merged.extend(normalize(hits, EntityType::Folder)),
        Err(e) => tracing::warn!(error = %e, "folder search failed, continuing without it"),
    }

    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(RESULT_CAP as usize);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_tsquery_joins_words_with_and() {
        assert_eq!(prefix_tsquery("rust lang"), "rust:* & lang:*");
    }

    #[test]
    fn prefix_tsquery_strips_punctuation() {
        assert_eq!(prefix_tsquery("c++ dev!"), "c:* & dev:*");
    }

    #[test]
    fn normalize_empty_input_yields_empty_output() {
        assert!(normalize(Vec::new(), EntityType::Article).is_empty());
    }

    #[test]
    fn normalize_applies_type_weight_to_top_hit() {
        let hits = vec![
            RawHit { id: Uuid::new_v4(), title: "a".into(), snippet: None, rank: 1.0 },
            RawHit { id: Uuid::new_v4(), title: "b".into(), snippet: None, rank: 0.0 },
        ];
        let normalized = normalize(hits, EntityType::Feed);
        assert_eq!(normalized[0].score, WEIGHT_FEEDS);
        assert_eq!(normalized[1].score, 0.0);
    }
}
