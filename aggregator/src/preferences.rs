//! User preferences (§6.4). Grounded on §9's redesign note ("replace
//! dynamic kwargs with an enum of preference keys + a sum type of
//! values, validated in one place") — the teacher has no preferences
//! module of its own, so the validation table itself is the source of
//! truth, stored as a single JSONB blob per user.

use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bool,
    Choice(&'static [&'static str]),
    /// "language" is a string with no enforced choice set, per the
    /// decision recorded in DESIGN.md.
    OpaqueString,
}

const KEYS: &[(&str, Kind)] = &[
    ("theme", Kind::Choice(&["light", "dark", "system"])),
    ("show_article_thumbnails", Kind::Bool),
    ("app_layout", Kind::Choice(&["split", "focus"])),
    ("article_layout", Kind::Choice(&["grid", "list", "magazine"])),
    ("font_spacing", Kind::Choice(&["compact", "normal", "comfortable"])),
    ("font_size", Kind::Choice(&["xs", "s", "m", "l", "xl"])),
    ("feed_sort_order", Kind::Choice(&["alphabetical", "recent_first"])),
    ("show_feed_favicons", Kind::Bool),
    ("date_format", Kind::Choice(&["relative", "absolute"])),
    ("time_format", Kind::Choice(&["12h", "24h"])),
    ("language", Kind::OpaqueString),
    ("auto_mark_as_read", Kind::Choice(&["disabled", "7_days", "14_days", "30_days"])),
    ("estimated_reading_time", Kind::Bool),
    ("show_summaries", Kind::Bool),
];

pub fn defaults() -> Value {
    json!({
        "theme": "system",
        "show_article_thumbnails": true,
        "app_layout": "split",
        "article_layout": "grid",
        "font_spacing": "normal",
        "font_size": "m",
        "feed_sort_order": "recent_first",
        "show_feed_favicons": true,
        "date_format": "relative",
        "time_format": "12h",
        "language": "en",
        "auto_mark_as_read": "disabled",
        "estimated_reading_time": true,
        "show_summaries": true,
    })
}

fn kind_for(key: &str) -> Option<Kind> {
    KEYS.iter().find(|(k, _)| *k == key).map(|(_, kind)| *kind)
}

fn validate_value(key: &str, kind: Kind, value: &Value) -> Result<(), AppError> {
    match kind {
        Kind::Bool => {
            if !value.is_boolean() {
                return Err(AppError::Validation(format!("preference '{key}' must be a boolean")));
            }
        }
        Kind::Choice(choices) => {
            let s = value
                .as_str()
                .ok_or_else(|| AppError::Validation(format!("preference '{key}' must be a string")))?;
            if !choices.contains(&s) {
                return Err(AppError::Validation(format!(
                    "preference '{key}' must be one of: {}",
                    choices.join("/")
                )));
            }
        }
        Kind::OpaqueString => {
            if !value.is_string() {
                return Err(AppError::Validation(format!("preference '{key}' must be a string")));
            }
        }
    }
    Ok(())
}

/// Applies `updates` on top of the user's current preferences (or the
/// defaults if none stored yet). Unknown keys are rejected outright;
/// known keys are type/choice-checked before the merge.
pub async fn update_preferences(pool: &PgPool, user_id: Uuid, updates: &Value) -> Result<Value, AppError> {
    let updates_obj = updates
        .as_object()
        .ok_or_else(|| AppError::Validation("preferences payload must be an object".into()))?;

    for (key, value) in updates_obj {
        let kind = kind_for(key).ok_or_else(|| AppError::Validation(format!("unknown preference key: {key}")))?;
        validate_value(key, kind, value)?;
    }

    let mut current = get_preferences(pool, user_id).await?;
    let current_obj = current.as_object_mut().expect("preferences are always a JSON object");
    for (key, value) in updates_obj {
        current_obj.insert(key.clone(), value.clone());
    }

    sqlx::query(
        r#"
        INSERT INTO personalization.user_preferences (user_id, preferences)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO UPDATE SET preferences = EXCLUDED.preferences
        "#,
    )
    .bind(user_id)
    .bind(&current)
    .execute(pool)
    .await
    .map_err(AppError::from)?;

    Ok(current)
}

pub async fn get_preferences(pool: &PgPool, user_id: Uuid) -> Result<Value, AppError> {
    let stored: Option<Value> = sqlx::query_scalar(
        "SELECT preferences FROM personalization.user_preferences WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?;

    let mut merged = defaults();
    if let Some(stored) = stored {
        if let (Some(merged_obj), Some(stored_obj)) = (merged.as_object_mut(), stored.as_object()) {
            for (k, v) in stored_obj {
                merged_obj.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_known_key() {
        let d = defaults();
        let obj = d.as_object().unwrap();
        for (key, _) in KEYS {
            assert!(obj.contains_key(*key), "missing default for {key}");
        }
    }

    #[test]
    fn validate_rejects_unknown_choice() {
        let result = validate_value("theme", Kind::Choice(&["light", "dark", "system"]), &json!("neon"));
        assert!(result.is_err());
    }

    #[test]
    fn validate_accepts_opaque_language_string() {
        assert!(validate_value("language", Kind::OpaqueString, &json!("xx-not-real")).is_ok());
    }

    #[test]
    fn validate_rejects_wrong_type_for_bool() {
        assert!(validate_value("show_summaries", Kind::Bool, &json!("true")).is_err());
    }
}
