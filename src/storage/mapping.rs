//! Mapping store: `(entity_type, source_id) -> remote_id`
//!
//! Every mutation is a single-row statement. The unique index on
//! `(mapping_type, source_id)` arbitrates concurrent claims; `remote_id`
//! is write-once.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{MirrorError, Result};
use crate::types::{EntityKey, EntityKind, MappingEntry, MappingStats};

/// Result of a placeholder insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderOutcome {
    Inserted,
    /// Another worker already claimed the entity
    AlreadyExists,
}

fn row_to_entry(row: &Row) -> rusqlite::Result<MappingEntry> {
    let kind: String = row.get("mapping_type")?;
    let last_update: String = row.get("last_update")?;
    Ok(MappingEntry {
        kind: kind.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        source_id: row.get("source_id")?,
        remote_id: row.get("remote_id")?,
        last_update: DateTime::parse_from_rfc3339(&last_update)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Full mapping row, bound or not
pub fn get_entry(conn: &Connection, key: EntityKey) -> Result<Option<MappingEntry>> {
    let entry = conn
        .query_row(
            "SELECT mapping_type, source_id, remote_id, last_update
             FROM mirror_mapping WHERE mapping_type = ? AND source_id = ?",
            params![key.kind.as_str(), key.source_id],
            row_to_entry,
        )
        .optional()?;
    Ok(entry)
}

/// Bound remote id, if any
pub fn lookup(conn: &Connection, key: EntityKey) -> Result<Option<String>> {
    let remote_id: Option<Option<String>> = conn
        .query_row(
            "SELECT remote_id FROM mirror_mapping WHERE mapping_type = ? AND source_id = ?",
            params![key.kind.as_str(), key.source_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(remote_id.flatten())
}

/// Claim an entity with a null remote id
pub fn create_placeholder(conn: &Connection, key: EntityKey) -> Result<PlaceholderOutcome> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO mirror_mapping (mapping_type, source_id, remote_id, last_update)
         VALUES (?, ?, NULL, ?)",
        params![key.kind.as_str(), key.source_id, Utc::now().to_rfc3339()],
    )?;

    if changed == 1 {
        tracing::debug!(entity = %key, "Created mapping placeholder");
        Ok(PlaceholderOutcome::Inserted)
    } else {
        tracing::debug!(entity = %key, "Mapping already claimed");
        Ok(PlaceholderOutcome::AlreadyExists)
    }
}

/// Set the remote id once the remote object is confirmed to exist.
///
/// Binding the same id twice is a no-op; binding a different id onto an
/// already bound row is a [`MirrorError::Conflict`].
pub fn bind(conn: &Connection, key: EntityKey, remote_id: &str) -> Result<()> {
    if remote_id.is_empty() {
        return Err(MirrorError::InvalidInput(format!(
            "Refusing to bind {} to an empty remote id",
            key
        )));
    }

    let changed = conn.execute(
        "INSERT INTO mirror_mapping (mapping_type, source_id, remote_id, last_update)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(mapping_type, source_id) DO UPDATE
            SET remote_id = excluded.remote_id, last_update = excluded.last_update
            WHERE mirror_mapping.remote_id IS NULL",
        params![
            key.kind.as_str(),
            key.source_id,
            remote_id,
            Utc::now().to_rfc3339()
        ],
    )?;

    if changed == 1 {
        tracing::info!(entity = %key, remote_id, "Bound mapping");
        return Ok(());
    }

    match lookup(conn, key)? {
        Some(existing) if existing == remote_id => Ok(()),
        Some(existing) => Err(MirrorError::Conflict(format!(
            "{} is already bound to {}, refusing {}",
            key, existing, remote_id
        ))),
        None => Err(MirrorError::Storage(format!(
            "Bind of {} affected no row",
            key
        ))),
    }
}

/// All bound rows of one kind, keyed by source id
pub fn load_bound(conn: &Connection, kind: EntityKind) -> Result<HashMap<i64, String>> {
    let mut stmt = conn.prepare(
        "SELECT source_id, remote_id FROM mirror_mapping
         WHERE mapping_type = ? AND remote_id IS NOT NULL",
    )?;

    let rows = stmt.query_map(params![kind.as_str()], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut bound = HashMap::new();
    for row in rows {
        let (source_id, remote_id) = row?;
        bound.insert(source_id, remote_id);
    }
    Ok(bound)
}

/// All bound rows of every kind
pub fn load_all_bound(conn: &Connection) -> Result<HashMap<EntityKey, String>> {
    let mut all = HashMap::new();
    for kind in EntityKind::ALL {
        for (source_id, remote_id) in load_bound(conn, kind)? {
            all.insert(EntityKey::new(kind, source_id), remote_id);
        }
    }
    Ok(all)
}

/// Number of bound rows across all kinds
pub fn count_bound(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM mirror_mapping WHERE remote_id IS NOT NULL",
        [],
        |row| row.get(0),
    )?)
}

/// Per-kind bound/unbound counts
pub fn mapping_stats(conn: &Connection) -> Result<Vec<MappingStats>> {
    let mut stmt = conn.prepare(
        "SELECT mapping_type,
                SUM(CASE WHEN remote_id IS NOT NULL THEN 1 ELSE 0 END),
                SUM(CASE WHEN remote_id IS NULL THEN 1 ELSE 0 END)
         FROM mirror_mapping GROUP BY mapping_type ORDER BY mapping_type",
    )?;

    let stats = stmt
        .query_map([], |row| {
            Ok(MappingStats {
                kind: row.get(0)?,
                bound: row.get(1)?,
                unbound: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn folder(id: i64) -> EntityKey {
        EntityKey::new(EntityKind::DmsfFolder, id)
    }

    #[test]
    fn test_placeholder_then_bind() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                assert_eq!(lookup(conn, folder(7))?, None);
                assert_eq!(
                    create_placeholder(conn, folder(7))?,
                    PlaceholderOutcome::Inserted
                );

                let entry = get_entry(conn, folder(7))?.unwrap();
                assert!(!entry.is_bound());
                assert_eq!(lookup(conn, folder(7))?, None);

                bind(conn, folder(7), "remote-7")?;
                assert_eq!(lookup(conn, folder(7))?.as_deref(), Some("remote-7"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_duplicate_placeholder_is_not_an_error() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                create_placeholder(conn, folder(1))?;
                assert_eq!(
                    create_placeholder(conn, folder(1))?,
                    PlaceholderOutcome::AlreadyExists
                );
                // Same source id under another kind is a distinct entity
                assert_eq!(
                    create_placeholder(conn, EntityKey::new(EntityKind::Document, 1))?,
                    PlaceholderOutcome::Inserted
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_bind_is_write_once() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                bind(conn, folder(2), "first")?;
                // Re-binding the same id is idempotent
                bind(conn, folder(2), "first")?;
                match bind(conn, folder(2), "second") {
                    Err(MirrorError::Conflict(_)) => {}
                    other => panic!("expected conflict, got {:?}", other),
                }
                assert_eq!(lookup(conn, folder(2))?.as_deref(), Some("first"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_bind_rejects_empty_id() {
        let storage = Storage::open_in_memory().unwrap();
        let result = storage.with_connection(|conn| bind(conn, folder(3), ""));
        assert!(matches!(result, Err(MirrorError::InvalidInput(_))));
    }

    #[test]
    fn test_load_bound_and_stats() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                bind(conn, EntityKey::basedir(), "base")?;
                bind(conn, folder(1), "f1")?;
                create_placeholder(conn, folder(2))?;

                let folders = load_bound(conn, EntityKind::DmsfFolder)?;
                assert_eq!(folders.len(), 1);
                assert_eq!(folders.get(&1).map(String::as_str), Some("f1"));

                let all = load_all_bound(conn)?;
                assert_eq!(all.len(), 2);
                assert_eq!(count_bound(conn)?, 2);

                let stats = mapping_stats(conn)?;
                let dmsf = stats.iter().find(|s| s.kind == "dmsf_folder").unwrap();
                assert_eq!((dmsf.bound, dmsf.unbound), (1, 1));
                Ok(())
            })
            .unwrap();
    }
}
