//! Folder module, grounded on `application/folder/folders.py`: capacity
//! and depth validation, circular-reference checks, and in-memory tree
//! assembly (including the orphan-promotion and "Uncategorized"
//! synthetic-folder handling for feeds with no folder).

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Folder;

pub async fn create_folder(
    pool: &PgPool,
    user_id: Uuid,
    name: &str,
    parent_id: Option<Uuid>,
    max_depth: i32,
    max_per_parent: i32,
    max_name_length: usize,
) -> Result<Folder, AppError> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > max_name_length {
        return Err(AppError::Validation("invalid folder name".into()));
    }

    let depth = match parent_id {
        None => 0,
        Some(pid) => {
            let parent = get_folder(pool, user_id, pid).await?;
            parent.depth + 1
        }
    };
    if depth > max_depth {
        let folder_count = count_children(pool, user_id, parent_id).await.map_err(AppError::from)?;
        return Err(AppError::FolderLimit { depth, folder_count: folder_count as i32 });
    }

    let sibling_count = count_children(pool, user_id, parent_id).await.map_err(AppError::from)?;
    if sibling_count >= max_per_parent as i64 {
        return Err(AppError::FolderLimit { depth, folder_count: sibling_count as i32 });
    }

    let name_taken: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM personalization.folders
            WHERE user_id = $1 AND lower(name) = lower($2)
              AND parent_id IS NOT DISTINCT FROM $3
        )
        "#,
    )
    .bind(user_id)
    .bind(name)
    .bind(parent_id)
    .fetch_one(pool)
    .await
    .map_err(AppError::from)?;
    if name_taken {
        return Err(AppError::Conflict("folder name already exists under this parent".into()));
    }

    let folder = sqlx::query_as::<_, Folder>(
        r#"
        INSERT INTO personalization.folders (id, user_id, name, parent_id, depth, pinned, created_at)
        VALUES ($1, $2, $3, $4, $5, false, now())
        RETURNING id, user_id, name, parent_id, depth, pinned, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(name)
    .bind(parent_id)
    .bind(depth)
    .fetch_one(pool)
    .await
    .map_err(AppError::from)?;
    Ok(folder)
}

pub async fn get_folder(pool: &PgPool, user_id: Uuid, folder_id: Uuid) -> Result<Folder, AppError> {
    sqlx::query_as::<_, Folder>(
        "SELECT id, user_id, name, parent_id, depth, pinned, created_at FROM personalization.folders WHERE id = $1 AND user_id = $2",
    )
    .bind(folder_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?
    .ok_or_else(|| AppError::NotFound("folder not found".into()))
}

async fn count_children(pool: &PgPool, user_id: Uuid, parent_id: Option<Uuid>) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM personalization.folders WHERE user_id = $1 AND parent_id IS NOT DISTINCT FROM $2",
    )
    .bind(user_id)
    .bind(parent_id)
    .fetch_one(pool)
    .await
    .context("failed to count sibling folders")?;
    Ok(count)
}

/// Rejects a move that would place `folder_id` beneath one of its own
/// descendants (§3 invariant: folder tree is acyclic).
pub async fn check_circular_reference(
    pool: &PgPool,
    user_id: Uuid,
    folder_id: Uuid,
    new_parent_id: Uuid,
) -> Result<bool, AppError> {
    if folder_id == new_parent_id {
        return Ok(true);
    }
    let all_folders = list_all_folders(pool, user_id).await.map_err(AppError::from)?;
    let by_id: HashMap<Uuid, &Folder> = all_folders.iter().map(|f| (f.id, f)).collect();

    let mut current = by_id.get(&new_parent_id).copied();
    while let Some(f) = current {
        if f.id == folder_id {
            return Ok(true);
        }
        current = f.parent_id.and_then(|pid| by_id.get(&pid).copied());
    }
    Ok(false)
}

pub async fn update_folder(
    pool: &PgPool,
    user_id: Uuid,
    folder_id: Uuid,
    new_name: Option<&str>,
    new_parent_id: Option<Option<Uuid>>,
    max_depth: i32,
    max_name_length: usize,
) -> Result<Folder, AppError> {
    let folder = get_folder(pool, user_id, folder_id).await?;

    if let Some(pid) = new_parent_id.flatten() {
        if check_circular_reference(pool, user_id, folder_id, pid).await? {
            return Err(AppError::CircularReference);
        }
        let parent = get_folder(pool, user_id, pid).await?;
        if parent.depth + 1 > max_depth {
            return Err(AppError::FolderLimit { depth: parent.depth + 1, folder_count: 0 });
        }
    }

    if let Some(name) = new_name {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > max_name_length {
            return Err(AppError::Validation("invalid folder name".into()));
        }
    }

    let effective_name = new_name.map(str::trim).unwrap_or(folder.name.as_str());
    let effective_parent = new_parent_id.unwrap_or(folder.parent_id);
    let effective_depth = match effective_parent {
        None => 0,
        Some(pid) => get_folder(pool, user_id, pid).await?.depth + 1,
    };

    let updated = sqlx::query_as::<_, Folder>(
        r#"
        UPDATE personalization.folders
        SET name = $1, parent_id = $2, depth = $3
        WHERE id = $4 AND user_id = $5
        RETURNING id, user_id, name, parent_id, depth, pinned, created_at
        "#,
    )
    .bind(effective_name)
    .bind(effective_parent)
    .bind(effective_depth)
    .bind(folder_id)
    .bind(user_id)
    .fetch_one(pool)
    .await
    .map_err(AppError::from)?;
    Ok(updated)
}

pub async fn delete_folder(pool: &PgPool, user_id: Uuid, folder_id: Uuid) -> Result<(), AppError> {
    sqlx::query("DELETE FROM personalization.folders WHERE id = $1 AND user_id = $2")
        .bind(folder_id)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

async fn list_all_folders(pool: &PgPool, user_id: Uuid) -> Result<Vec<Folder>> {
    let folders = sqlx::query_as::<_, Folder>(
        "SELECT id, user_id, name, parent_id, depth, pinned, created_at FROM personalization.folders WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list folders")?;
    Ok(folders)
}

#[derive(Debug, Serialize)]
pub struct FolderNode {
    pub id: Option<Uuid>,
    pub name: String,
    pub pinned: bool,
    /// Rolled up across this folder and every descendant (§4.S).
    pub feed_count: i64,
    pub unread_count: i64,
    pub children: Vec<FolderNode>,
}

#[derive(Debug, sqlx::FromRow)]
struct FolderRollup {
    id: Uuid,
    name: String,
    parent_id: Option<Uuid>,
    pinned: bool,
    feed_count: i64,
    unread_count: i64,
}

/// Recursive folder CTE for tree + unread rollup (§4.S): one statement
/// builds, for every folder, the feed/unread counts summed over itself and
/// all its descendants, via a self-ancestry closure joined against direct
/// per-folder subscription counts.
async fn fetch_folder_rollups(pool: &PgPool, user_id: Uuid) -> Result<Vec<FolderRollup>> {
    let rows = sqlx::query_as::<_, FolderRollup>(
        r#"
        WITH RECURSIVE ancestry AS (
            SELECT id AS folder_id, id AS ancestor_id
            FROM personalization.folders
            WHERE user_id = $1
            UNION ALL
            SELECT a.folder_id, f.parent_id
            FROM ancestry a
            JOIN personalization.folders f ON f.id = a.ancestor_id
            WHERE f.parent_id IS NOT NULL
        ),
        direct_counts AS (
            SELECT folder_id, count(*) AS feed_count, coalesce(sum(unread_count), 0) AS unread_count
            FROM personalization.subscriptions
            WHERE user_id = $1 AND folder_id IS NOT NULL AND is_active = true
            GROUP BY folder_id
        )
        SELECT
            f.id, f.name, f.parent_id, f.pinned,
            coalesce(sum(dc.feed_count), 0) AS feed_count,
            coalesce(sum(dc.unread_count), 0)::bigint AS unread_count
        FROM personalization.folders f
        JOIN ancestry a ON a.ancestor_id = f.id
        LEFT JOIN direct_counts dc ON dc.folder_id = a.folder_id
        WHERE f.user_id = $1
        GROUP BY f.id, f.name, f.parent_id, f.pinned
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to compute folder rollup")?;
    Ok(rows)
}

struct OrphanFeeds {
    feed_count: i64,
    unread_count: i64,
}

/// Subscriptions with no folder (§4.S's "Uncategorized" synthetic node).
async fn fetch_orphan_feed_stats(pool: &PgPool, user_id: Uuid) -> Result<OrphanFeeds> {
    let row: (i64, i64) = sqlx::query_as(
        r#"
        SELECT count(*), coalesce(sum(unread_count), 0)::bigint
        FROM personalization.subscriptions
        WHERE user_id = $1 AND folder_id IS NULL AND is_active = true
        "#,
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("failed to compute orphan feed stats")?;
    Ok(OrphanFeeds { feed_count: row.0, unread_count: row.1 })
}

/// Builds the full hierarchy (with rolled-up feed/unread counts) from the
/// flat rollup list, appending a synthetic "Uncategorized" node for
/// folder-less feeds when any exist. Folders whose parent id doesn't
/// resolve (orphaned) are promoted to root with a warning log rather than
/// dropped.
pub async fn get_folder_tree(pool: &PgPool, user_id: Uuid) -> Result<Vec<FolderNode>> {
    let rollups = fetch_folder_rollups(pool, user_id).await?;
    let ids: std::collections::HashSet<Uuid> = rollups.iter().map(|f| f.id).collect();

    let mut children_by_parent: HashMap<Option<Uuid>, Vec<&FolderRollup>> = HashMap::new();
    for folder in &rollups {
        let parent_key = match folder.parent_id {
            Some(pid) if !ids.contains(&pid) => {
                warn!(folder_id = %folder.id, parent_id = %pid, "folder has dangling parent, promoting to root");
                None
            }
            other => other,
        };
        children_by_parent.entry(parent_key).or_default().push(folder);
    }

    fn build(node: &FolderRollup, children_by_parent: &HashMap<Option<Uuid>, Vec<&FolderRollup>>) -> FolderNode {
        let children = children_by_parent
            .get(&Some(node.id))
            .map(|kids| kids.iter().map(|k| build(k, children_by_parent)).collect())
            .unwrap_or_default();
        FolderNode {
            id: Some(node.id),
            name: node.name.clone(),
            pinned: node.pinned,
            feed_count: node.feed_count,
            unread_count: node.unread_count,
            children,
        }
    }

    let roots = children_by_parent.get(&None).cloned().unwrap_or_default();
    let mut tree: Vec<FolderNode> = roots.iter().map(|f| build(f, &children_by_parent)).collect();

    let orphans = fetch_orphan_feed_stats(pool, user_id).await?;
    if orphans.feed_count > 0 {
        tree.push(FolderNode {
            id: None,
            name: "Uncategorized".to_string(),
            pinned: false,
            feed_count: orphans.feed_count,
            unread_count: orphans.unread_count,
            children: Vec::new(),
        });
    }

    Ok(tree)
}
