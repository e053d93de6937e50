//! Structured identifier rewrite for outbox entries
//!
//! Only known identifier slots are replaced: URL path segments, the
//! top-level `id`/`shift_id`/`ride_id` body fields and the meta slots.
//! A value that merely contains a stale id as a substring is left alone.

use crate::database::{OutboxMeta, OutboxUpdate};
use crate::error::Result;
use serde_json::Value;

/// Top-level body fields that may carry an entity id
const BODY_ID_FIELDS: [&str; 3] = ["id", "shift_id", "ride_id"];

/// A stale identifier and the id that replaced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remap {
    pub stale: String,
    pub current: String,
}

impl Remap {
    pub fn new(stale: impl Into<String>, current: impl Into<String>) -> Self {
        Self {
            stale: stale.into(),
            current: current.into(),
        }
    }

    fn lookup<'a>(remaps: &'a [Remap], id: &str) -> Option<&'a str> {
        remaps
            .iter()
            .find(|remap| remap.stale == id)
            .map(|remap| remap.current.as_str())
    }
}

/// Rewrite the id slots of an outbox entry.
///
/// Returns only the fields that changed, or `None` when the entry already
/// references current ids.
pub fn rewrite_entry(
    url: &str,
    body: &str,
    meta: &OutboxMeta,
    remaps: &[Remap],
) -> Result<Option<OutboxUpdate>> {
    let remaps: Vec<Remap> = remaps
        .iter()
        .filter(|remap| remap.stale != remap.current)
        .cloned()
        .collect();
    if remaps.is_empty() {
        return Ok(None);
    }

    let update = OutboxUpdate {
        url: rewrite_url(url, &remaps),
        body: rewrite_body(body, &remaps)?,
        meta: match rewrite_meta(meta, &remaps) {
            Some(meta) => Some(serde_json::to_string(&meta)?),
            None => None,
        },
    };

    if update == OutboxUpdate::default() {
        return Ok(None);
    }
    Ok(Some(update))
}

fn rewrite_url(url: &str, remaps: &[Remap]) -> Option<String> {
    let mut changed = false;
    let segments: Vec<&str> = url
        .split('/')
        .map(|segment| match Remap::lookup(remaps, segment) {
            Some(current) if !segment.is_empty() => {
                changed = true;
                current
            }
            _ => segment,
        })
        .collect();

    changed.then(|| segments.join("/"))
}

fn rewrite_body(body: &str, remaps: &[Remap]) -> Result<Option<String>> {
    let Ok(mut value) = serde_json::from_str::<Value>(body) else {
        tracing::warn!("Outbox body is not JSON, leaving it unchanged");
        return Ok(None);
    };
    let Some(object) = value.as_object_mut() else {
        return Ok(None);
    };

    let mut changed = false;
    for field in BODY_ID_FIELDS {
        if let Some(Value::String(id)) = object.get_mut(field) {
            if let Some(current) = Remap::lookup(remaps, id) {
                *id = current.to_string();
                changed = true;
            }
        }
    }

    if !changed {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(&value)?))
}

fn rewrite_meta(meta: &OutboxMeta, remaps: &[Remap]) -> Option<OutboxMeta> {
    let mut rewritten = meta.clone();
    let mut changed = false;

    for slot in [
        &mut rewritten.local_id,
        &mut rewritten.shift_id,
        &mut rewritten.ride_id,
    ] {
        if let Some(id) = slot {
            if let Some(current) = Remap::lookup(remaps, id) {
                *id = current.to_string();
                changed = true;
            }
        }
    }

    changed.then_some(rewritten)
}
