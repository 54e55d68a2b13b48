//! OPML import/export (O). Grounded on `application/opml/opml.py`:
//! upload validation, worker-side streamed import with per-feed failure
//! logging, export-then-download, and rollback (delegated to
//! `subscription::rollback_import`).

use anyhow::{Context, Result};
use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{OpmlImport, OpmlStatus};

const FORBIDDEN_MARKERS: &[&str] = &["<script", "<iframe", "<object", "<embed", "javascript:", "<!--"];

pub struct OpmlOutline {
    pub title: String,
    pub xml_url: Option<String>,
    pub children: Vec<OpmlOutline>,
}

/// Validates filename suffix, size, encoding markers, required elements,
/// and rejects dangerous embedded content. Does not persist; callers
/// write bytes to `users/{user_id}/imports/{name}-{import_id}.opml` after
/// this passes.
pub fn validate_opml_upload(
    filename: &str,
    contents: &str,
    max_size_bytes: usize,
    max_nesting_depth: usize,
    max_outlines: usize,
) -> Result<Vec<OpmlOutline>, AppError> {
    if !filename.to_lowercase().ends_with(".opml") {
        return Err(AppError::Validation("file must have .opml extension".into()));
    }
    if contents.len() > max_size_bytes {
        return Err(AppError::Validation("file exceeds maximum size".into()));
    }
    if !contents.contains("<opml") || !contents.contains("</opml>") {
        return Err(AppError::Validation("not a valid OPML document".into()));
    }
    if !contents.contains("<head") || !contents.contains("<body") {
        return Err(AppError::Validation("OPML document missing head/body".into()));
    }
    let lower = contents.to_lowercase();
    for marker in FORBIDDEN_MARKERS {
        if lower.contains(marker) {
            return Err(AppError::Validation(format!("OPML document contains forbidden content: {marker}")));
        }
    }

    let outlines = parse_outlines(contents).map_err(|e| AppError::Validation(format!("failed to parse OPML: {e}")))?;
    if outlines.is_empty() {
        return Err(AppError::Validation("OPML document has no outlines".into()));
    }

    let (count, depth) = measure_outlines(&outlines, 1);
    if depth > max_nesting_depth {
        return Err(AppError::Validation("OPML nesting depth exceeds limit".into()));
    }
    if count > max_outlines {
        return Err(AppError::Validation("OPML outline count exceeds limit".into()));
    }

    Ok(outlines)
}

fn measure_outlines(outlines: &[OpmlOutline], depth: usize) -> (usize, usize) {
    let mut count = outlines.len();
    let mut max_depth = depth;
    for o in outlines {
        let (child_count, child_depth) = measure_outlines(&o.children, depth + 1);
        count += child_count;
        max_depth = max_depth.max(child_depth);
    }
    (count, max_depth)
}

fn parse_outlines(xml: &str) -> Result<Vec<OpmlOutline>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut stack: Vec<Vec<OpmlOutline>> = vec![Vec::new()];
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).context("xml read error")? {
            Event::Empty(e) if e.name().as_ref() == b"outline" => {
                let outline = outline_from_attrs(&e)?;
                stack.last_mut().unwrap().push(outline);
            }
            Event::Start(e) if e.name().as_ref() == b"outline" => {
                let outline = outline_from_attrs(&e)?;
                stack.last_mut().unwrap().push(outline);
                stack.push(Vec::new());
            }
            Event::End(e) if e.name().as_ref() == b"outline" => {
                let children = stack.pop().unwrap_or_default();
                if let Some(parent_list) = stack.last_mut() {
                    if let Some(last) = parent_list.last_mut() {
                        last.children = children;
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(stack.into_iter().next().unwrap_or_default())
}

fn outline_from_attrs(e: &quick_xml::events::BytesStart) -> Result<OpmlOutline> {
    let mut title = String::new();
    let mut xml_url = None;
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value().unwrap_or_default().to_string();
        match key.as_str() {
            "text" | "title" if title.is_empty() => title = value,
            "xmlUrl" => xml_url = Some(value),
            _ => {}
        }
    }
    Ok(OpmlOutline { title, xml_url, children: Vec::new() })
}

/// `import_id` is generated by the caller (not here) because the
/// on-disk storage key embeds it (`users/{user_id}/imports/{name}-{import_id}.opml`)
/// and must be known before the file is written.
pub async fn create_import_record(
    pool: &PgPool,
    import_id: Uuid,
    user_id: Uuid,
    filename: &str,
    storage_key: &str,
) -> Result<OpmlImport> {
    let record = sqlx::query_as::<_, OpmlImport>(
        r#"
        INSERT INTO personalization.opml_imports
            (id, user_id, filename, storage_key, status, total, imported, failed, duplicate, failed_feeds_log, created_at)
        VALUES ($1, $2, $3, $4, 'pending', 0, 0, 0, 0, '[]'::jsonb, now())
        RETURNING id, user_id, filename, storage_key, status, total, imported, failed, duplicate, failed_feeds_log, created_at, completed_at
        "#,
    )
    .bind(import_id)
    .bind(user_id)
    .bind(filename)
    .bind(storage_key)
    .fetch_one(pool)
    .await
    .context("failed to create import record")?;
    Ok(record)
}

/// Worker-side import: streams outlines into folder+subscription create
/// operations, tags every created subscription with `import_id`.
pub async fn run_import(pool: &PgPool, user_id: Uuid, import_id: Uuid, outlines: &[OpmlOutline]) -> Result<()> {
    let mut total = 0usize;
    let mut imported = 0usize;
    let mut failed = 0usize;
    let mut duplicate = 0usize;
    let mut failure_log = Vec::new();

    import_level(pool, user_id, import_id, outlines, None, 0, &mut total, &mut imported, &mut failed, &mut duplicate, &mut failure_log).await;

    sqlx::query(
        r#"
        UPDATE personalization.opml_imports
        SET status = 'completed', total = $1, imported = $2, failed = $3, duplicate = $4,
            failed_feeds_log = $5, completed_at = now()
        WHERE id = $6
        "#,
    )
    .bind(total as i32)
    .bind(imported as i32)
    .bind(failed as i32)
    .bind(duplicate as i32)
    .bind(json!(failure_log))
    .bind(import_id)
    .execute(pool)
    .await
    .context("failed to finalize import record")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn import_level<'a>(
    pool: &'a PgPool,
    user_id: Uuid,
    import_id: Uuid,
    outlines: &'a [OpmlOutline],
    folder_id: Option<Uuid>,
    depth: i32,
    total: &'a mut usize,
    imported: &'a mut usize,
    failed: &'a mut usize,
    duplicate: &'a mut usize,
    failure_log: &'a mut Vec<serde_json::Value>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        for outline in outlines {
            if let Some(url) = &outline.xml_url {
                *total += 1;
                match import_one_feed(pool, user_id, import_id, url, folder_id).await {
                    Ok(true) => *imported += 1,
                    Ok(false) => *duplicate += 1,
                    Err(e) => {
                        *failed += 1;
                        failure_log.push(json!({ "url": url, "reason": e.to_string() }));
                    }
                }
            } else if !outline.children.is_empty() {
                let child_folder = sqlx::query_scalar::<_, Uuid>(
                    r#"
                    INSERT INTO personalization.folders (id, user_id, name, parent_id, depth, pinned, created_at)
                    VALUES ($1, $2, $3, $4, $5, false, now())
                    RETURNING id
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(user_id)
                .bind(&outline.title)
                .bind(folder_id)
                .bind(depth)
                .fetch_one(pool)
                .await
                .ok();

                import_level(pool, user_id, import_id, &outline.children, child_folder, depth + 1, total, imported, failed, duplicate, failure_log).await;
            }
        }
    })
}

async fn import_one_feed(pool: &PgPool, user_id: Uuid, import_id: Uuid, url: &str, folder_id: Option<Uuid>) -> Result<bool> {
    let canonical_url = crate::url_normalize::normalize(url);
    let existing_sub: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT s.id FROM personalization.subscriptions s
        JOIN content.feeds f ON f.id = s.feed_id
        WHERE s.user_id = $1 AND f.canonical_url = $2
        "#,
    )
    .bind(user_id)
    .bind(&canonical_url)
    .fetch_optional(pool)
    .await?;
    if existing_sub.is_some() {
        return Ok(false);
    }

    let feed = crate::feed::create_feed(pool, url, 30, 5)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    sqlx::query(
        r#"
        INSERT INTO personalization.subscriptions
            (id, user_id, feed_id, folder_id, pinned, is_active, unread_count, import_id, created_at)
        VALUES ($1, $2, $3, $4, false, true, 0, $5, now())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(feed.id)
    .bind(folder_id)
    .bind(import_id)
    .execute(pool)
    .await?;
    Ok(true)
}

pub async fn get_import_status(pool: &PgPool, user_id: Uuid, import_id: Uuid) -> Result<OpmlImport, AppError> {
    sqlx::query_as::<_, OpmlImport>(
        r#"
        SELECT id, user_id, filename, storage_key, status, total, imported, failed, duplicate,
               failed_feeds_log, created_at, completed_at
        FROM personalization.opml_imports WHERE id = $1 AND user_id = $2
        "#,
    )
    .bind(import_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?
    .ok_or_else(|| AppError::NotFound("import not found".into()))
}

/// Generates an OPML export document for the user's subscriptions, folder
/// grouping preserved.
pub async fn generate_export(pool: &PgPool, user_id: Uuid) -> Result<String> {
    #[derive(sqlx::FromRow)]
    struct Row {
        feed_title: String,
        canonical_url: String,
        folder_name: Option<String>,
    }
    let rows = sqlx::query_as::<_, Row>(
        r#"
        SELECT f.title AS feed_title, f.canonical_url, fo.name AS folder_name
        FROM personalization.subscriptions s
        JOIN content.feeds f ON f.id = s.feed_id
        LEFT JOIN personalization.folders fo ON fo.id = s.folder_id
        WHERE s.user_id = $1
        ORDER BY folder_name NULLS FIRST, feed_title
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to query subscriptions for export")?;

    let mut body = String::new();
    let mut current_folder: Option<String> = None;
    let mut in_folder = false;
    for row in &rows {
        if row.folder_name != current_folder {
            if in_folder {
                body.push_str("  </outline>\n");
            }
            if let Some(name) = &row.folder_name {
                body.push_str(&format!("  <outline text=\"{}\">\n", xml_escape(name)));
                in_folder = true;
            } else {
                in_folder = false;
            }
            current_folder = row.folder_name.clone();
        }
        let indent = if in_folder { "    " } else { "  " };
        body.push_str(&format!(
            "{indent}<outline text=\"{}\" xmlUrl=\"{}\"/>\n",
            xml_escape(&row.feed_title),
            xml_escape(&row.canonical_url)
        ));
    }
    if in_folder {
        body.push_str("  </outline>\n");
    }

    Ok(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<opml version=\"2.0\">\n<head><title>Subscriptions export</title><dateCreated>{}</dateCreated></head>\n<body>\n{body}</body>\n</opml>\n",
        Utc::now().to_rfc2822()
    ))
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

pub fn is_export_expired(mtime: std::time::SystemTime, expiry_hours: i64) -> bool {
    match mtime.elapsed() {
        Ok(elapsed) => elapsed.as_secs() > (expiry_hours as u64) * 3600,
        Err(_) => false,
    }
}

pub use OpmlStatus as ImportStatus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_opml_extension() {
        let err = validate_opml_upload("feeds.xml", "<opml></opml>", 1000, 9, 10_000);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_script_content() {
        let doc = "<opml><head></head><body><outline text=\"a\"/><script>bad()</script></body></opml>";
        let err = validate_opml_upload("feeds.opml", doc, 10_000, 9, 10_000);
        assert!(err.is_err());
    }

    #[test]
    fn parses_nested_outlines() {
        let doc = r#"<opml><head></head><body>
            <outline text="Tech">
                <outline text="Rust Blog" xmlUrl="https://example.com/rss"/>
            </outline>
        </body></opml>"#;
        let outlines = validate_opml_upload("feeds.opml", doc, 10_000, 9, 10_000).unwrap();
        assert_eq!(outlines.len(), 1);
        assert_eq!(outlines[0].children.len(), 1);
        assert_eq!(outlines[0].children[0].xml_url.as_deref(), Some("https://example.com/rss"));
    }
}
