//! SQLite storage layer for the theme catalog
//!
//! Owns every persisted row: responses, themes, assignments, the evolution
//! log, batch metadata, and the embedding cache. All catalog mutation is
//! funneled through this type and serialized on a single connection; the
//! other components only ever hold in-memory copies within a batch.
//!
//! Similarity queries run against in-process IVF indexes maintained
//! alongside the tables (one for active themes, one for responses).

mod index;
mod schema;

pub use index::IvfIndex;
pub use schema::SCHEMA;

use crate::error::{EngineError, Result};
use crate::models::{
    BatchMetadata, EvolutionAction, EvolutionDetails, EvolutionEntry, HighlightedKeyword,
    SurveyResponse, Theme, ThemeOrigin, ThemeStatus,
};
use crate::vectors::is_zero;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Database handle plus the in-process vector indexes
pub struct Store {
    conn: Mutex<Connection>,
    theme_index: Mutex<IvfIndex>,
    response_index: Mutex<IvfIndex>,
}

/// Aggregate counts for the `stats` surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub active_themes: usize,
    pub total_responses: usize,
    pub total_assignments: usize,
    pub total_batches: usize,
    pub cached_embeddings: usize,
}

impl Store {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| EngineError::StoreUnavailable(format!("open {:?}: {e}", path.as_ref())))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (tests, fixtures)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::StoreUnavailable(format!("open in-memory: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        let store = Self {
            conn: Mutex::new(conn),
            theme_index: Mutex::new(IvfIndex::new()),
            response_index: Mutex::new(IvfIndex::new()),
        };
        store.rebuild_indexes()?;
        Ok(store)
    }

    /// Reload both vector indexes from the tables
    fn rebuild_indexes(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let mut themes = self.theme_index.lock().unwrap();
        themes.clear();
        let mut stmt =
            conn.prepare("SELECT id, embedding FROM extracted_themes WHERE status = 'active'")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (id, blob) = row?;
            let vector = blob_to_vec(&blob);
            if !is_zero(&vector) {
                themes.insert(id, vector);
            }
        }
        drop(themes);

        let mut responses = self.response_index.lock().unwrap();
        responses.clear();
        let mut stmt = conn.prepare("SELECT id, embedding FROM survey_responses")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (id, blob) = row?;
            let vector = blob_to_vec(&blob);
            if !is_zero(&vector) {
                responses.insert(id, vector);
            }
        }

        Ok(())
    }

    // ==================== Transactions ====================

    /// Open the batch-level transaction
    pub fn begin_batch(&self) -> Result<()> {
        self.conn.lock().unwrap().execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    /// Commit the batch-level transaction
    pub fn commit_batch(&self) -> Result<()> {
        self.conn.lock().unwrap().execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll the batch back and resynchronize the vector indexes
    pub fn rollback_batch(&self) -> Result<()> {
        self.conn.lock().unwrap().execute_batch("ROLLBACK")?;
        self.rebuild_indexes()
    }

    /// Whether a batch transaction is currently open
    pub fn in_transaction(&self) -> bool {
        !self.conn.lock().unwrap().is_autocommit()
    }

    // ==================== Responses ====================

    /// Persist a response together with its embedding
    pub fn put_response(&self, response: &SurveyResponse) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO survey_responses (batch_id, question, response_text, embedding, processed_at)
            VALUES (?1, ?2, ?3, ?4, datetime('now'))
            "#,
            params![
                response.batch_id,
                response.question,
                response.text,
                vec_to_blob(&response.embedding),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        if !is_zero(&response.embedding) {
            self.response_index
                .lock()
                .unwrap()
                .insert(id, response.embedding.clone());
        }
        Ok(id)
    }

    pub fn get_response(&self, id: i64) -> Result<Option<SurveyResponse>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, batch_id, question, response_text, embedding FROM survey_responses WHERE id = ?1",
                params![id],
                response_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn responses_by_batch(&self, batch_id: i64) -> Result<Vec<SurveyResponse>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, batch_id, question, response_text, embedding FROM survey_responses WHERE batch_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![batch_id], response_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ==================== Themes ====================

    /// Insert a theme and return its id
    pub fn put_theme(&self, theme: &Theme) -> Result<i64> {
        let metadata = serde_json::to_string(&theme.metadata)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO extracted_themes
                (name, description, embedding, created_at_batch, last_updated_batch,
                 status, parent_theme_id, response_count, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))
            "#,
            params![
                theme.name,
                theme.description,
                vec_to_blob(&theme.embedding),
                theme.created_at_batch,
                theme.last_updated_batch,
                theme.status.as_str(),
                theme.parent_theme_id,
                theme.response_count,
                metadata,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        if theme.status == ThemeStatus::Active && !is_zero(&theme.embedding) {
            self.theme_index
                .lock()
                .unwrap()
                .insert(id, theme.embedding.clone());
        }
        Ok(id)
    }

    pub fn get_theme(&self, id: i64) -> Result<Option<Theme>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {THEME_COLUMNS} FROM extracted_themes WHERE id = ?1"),
                params![id],
                theme_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn themes_by_status(&self, status: ThemeStatus) -> Result<Vec<Theme>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {THEME_COLUMNS} FROM extracted_themes WHERE status = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], theme_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Rewrite a theme row; keeps the active-theme index in sync
    pub fn update_theme(&self, theme: &Theme) -> Result<()> {
        let id = theme
            .id
            .ok_or_else(|| EngineError::InputInvalid("update_theme requires an id".into()))?;
        // Parent links always point at an earlier theme, never at self
        assert!(theme.parent_theme_id != Some(id), "theme cannot parent itself");

        let metadata = serde_json::to_string(&theme.metadata)?;
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE extracted_themes
            SET name = ?1, description = ?2, embedding = ?3, last_updated_batch = ?4,
                status = ?5, parent_theme_id = ?6, response_count = ?7, metadata = ?8
            WHERE id = ?9
            "#,
            params![
                theme.name,
                theme.description,
                vec_to_blob(&theme.embedding),
                theme.last_updated_batch,
                theme.status.as_str(),
                theme.parent_theme_id,
                theme.response_count,
                metadata,
                id,
            ],
        )?;
        drop(conn);

        if changed == 0 {
            return Err(EngineError::IntegrityConflict(format!(
                "theme {id} does not exist"
            )));
        }

        let mut themes = self.theme_index.lock().unwrap();
        if theme.status == ThemeStatus::Active && !is_zero(&theme.embedding) {
            themes.insert(id, theme.embedding.clone());
        } else {
            themes.remove(id);
        }
        Ok(())
    }

    /// Retire a theme that has no live assignments left
    pub fn soft_retire_theme(&self, id: i64, reason: &str, batch_id: i64) -> Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            let changed = conn.execute(
                "UPDATE extracted_themes SET status = 'retired', last_updated_batch = ?1 WHERE id = ?2 AND status = 'active'",
                params![batch_id, id],
            )?;
            if changed == 0 {
                return Err(EngineError::IntegrityConflict(format!(
                    "theme {id} is not active"
                )));
            }
        }
        self.theme_index.lock().unwrap().remove(id);

        self.append_evolution(&EvolutionEntry {
            id: None,
            batch_id,
            action: EvolutionAction::Retired,
            theme_id: id,
            related_theme_id: None,
            affected_response_count: 0,
            details: EvolutionDetails {
                reason: Some(reason.to_string()),
                ..Default::default()
            },
        })?;
        Ok(())
    }

    // ==================== Assignments ====================

    /// Insert or update a (response, theme) assignment
    ///
    /// A duplicate pair upserts confidence, keywords, and the update batch,
    /// resolving the uniqueness conflict the way the evolver expects.
    pub fn put_assignment(
        &self,
        response_id: i64,
        theme_id: i64,
        confidence: f32,
        keywords: &[HighlightedKeyword],
        batch_id: i64,
    ) -> Result<i64> {
        let keywords_json = serde_json::to_string(keywords)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO theme_assignments
                (response_id, theme_id, confidence, highlighted_keywords,
                 assigned_at_batch, last_updated_batch)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT (response_id, theme_id) DO UPDATE SET
                confidence = excluded.confidence,
                highlighted_keywords = excluded.highlighted_keywords,
                last_updated_batch = excluded.last_updated_batch
            "#,
            params![
                response_id,
                theme_id,
                confidence.clamp(0.0, 1.0),
                keywords_json,
                batch_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        refresh_response_count(&conn, theme_id)?;
        Ok(id)
    }

    pub fn assignments_by_theme(
        &self,
        theme_id: i64,
    ) -> Result<Vec<crate::models::ThemeAssignment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, response_id, theme_id, confidence, highlighted_keywords, assigned_at_batch, last_updated_batch
             FROM theme_assignments WHERE theme_id = ?1 ORDER BY confidence DESC",
        )?;
        let rows = stmt.query_map(params![theme_id], assignment_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn assignments_by_response(
        &self,
        response_id: i64,
    ) -> Result<Vec<crate::models::ThemeAssignment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, response_id, theme_id, confidence, highlighted_keywords, assigned_at_batch, last_updated_batch
             FROM theme_assignments WHERE response_id = ?1 ORDER BY confidence DESC",
        )?;
        let rows = stmt.query_map(params![response_id], assignment_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Move every assignment from one theme to another in a single step
    ///
    /// Pairs that would collide with an existing assignment on the target
    /// theme collapse into it. Returns the number of affected pairs.
    pub fn rewrite_assignments(
        &self,
        from_theme: i64,
        to_theme: i64,
        batch_id: i64,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("SAVEPOINT rewrite")?;
        let result = (|| -> Result<usize> {
            // Collapse pairs the target theme already has
            let collapsed = conn.execute(
                r#"
                DELETE FROM theme_assignments
                WHERE theme_id = ?1
                  AND response_id IN (SELECT response_id FROM theme_assignments WHERE theme_id = ?2)
                "#,
                params![from_theme, to_theme],
            )?;
            if collapsed > 0 {
                conn.execute(
                    "UPDATE theme_assignments SET last_updated_batch = ?1 WHERE theme_id = ?2",
                    params![batch_id, to_theme],
                )?;
            }
            let moved = conn.execute(
                "UPDATE theme_assignments SET theme_id = ?1, last_updated_batch = ?2 WHERE theme_id = ?3",
                params![to_theme, batch_id, from_theme],
            )?;
            refresh_response_count(&conn, from_theme)?;
            refresh_response_count(&conn, to_theme)?;
            Ok(collapsed + moved)
        })();

        match result {
            Ok(n) => {
                conn.execute_batch("RELEASE rewrite")?;
                Ok(n)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO rewrite; RELEASE rewrite");
                Err(e)
            }
        }
    }

    /// Redirect specific responses of a split parent to its children
    pub fn reassign_to_children(
        &self,
        parent_theme: i64,
        routing: &[(i64, i64)],
        batch_id: i64,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("SAVEPOINT split")?;
        let result = (|| -> Result<usize> {
            let mut moved = 0usize;
            for (response_id, child_theme) in routing {
                moved += conn.execute(
                    r#"
                    UPDATE theme_assignments
                    SET theme_id = ?1, last_updated_batch = ?2
                    WHERE theme_id = ?3 AND response_id = ?4
                    "#,
                    params![child_theme, batch_id, parent_theme, response_id],
                )?;
            }
            refresh_response_count(&conn, parent_theme)?;
            let mut children: Vec<i64> = routing.iter().map(|(_, c)| *c).collect();
            children.sort_unstable();
            children.dedup();
            for child in children {
                refresh_response_count(&conn, child)?;
            }
            Ok(moved)
        })();

        match result {
            Ok(n) => {
                conn.execute_batch("RELEASE split")?;
                Ok(n)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO split; RELEASE split");
                Err(e)
            }
        }
    }

    // ==================== Similarity ====================

    /// Active themes with cosine similarity >= `min_cos`, best first
    pub fn find_similar_themes(
        &self,
        embedding: &[f32],
        min_cos: f32,
        k: usize,
    ) -> Result<Vec<(Theme, f32)>> {
        if is_zero(embedding) {
            return Ok(Vec::new());
        }
        let hits = self
            .theme_index
            .lock()
            .unwrap()
            .search(embedding, min_cos, k);
        let mut out = Vec::with_capacity(hits.len());
        for (id, sim) in hits {
            if let Some(theme) = self.get_theme(id)? {
                out.push((theme, sim));
            }
        }
        Ok(out)
    }

    /// Responses with cosine similarity >= `min_cos`, best first
    pub fn find_similar_responses(
        &self,
        embedding: &[f32],
        min_cos: f32,
        k: usize,
    ) -> Result<Vec<(SurveyResponse, f32)>> {
        if is_zero(embedding) {
            return Ok(Vec::new());
        }
        let hits = self
            .response_index
            .lock()
            .unwrap()
            .search(embedding, min_cos, k);
        let mut out = Vec::with_capacity(hits.len());
        for (id, sim) in hits {
            if let Some(response) = self.get_response(id)? {
                out.push((response, sim));
            }
        }
        Ok(out)
    }

    // ==================== Evolution log ====================

    pub fn append_evolution(&self, entry: &EvolutionEntry) -> Result<i64> {
        let details = serde_json::to_string(&entry.details)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO theme_evolution_log
                (batch_id, action, theme_id, related_theme_id, details, affected_response_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
            "#,
            params![
                entry.batch_id,
                entry.action.as_str(),
                entry.theme_id,
                entry.related_theme_id,
                details,
                entry.affected_response_count,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn evolution_by_batch(&self, batch_id: i64) -> Result<Vec<EvolutionEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, batch_id, action, theme_id, related_theme_id, details, affected_response_count
             FROM theme_evolution_log WHERE batch_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![batch_id], evolution_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ==================== Batch metadata ====================

    /// Strict insert; a replayed batch_id surfaces as an integrity conflict
    pub fn put_batch_metadata(&self, metadata: &BatchMetadata) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO batch_metadata
                (batch_id, question, total_responses, new_themes_count,
                 updated_themes_count, deleted_themes_count, processing_time_seconds, processed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
            "#,
            params![
                metadata.batch_id,
                metadata.question,
                metadata.total_responses,
                metadata.new_themes_count,
                metadata.updated_themes_count,
                metadata.deleted_themes_count,
                metadata.processing_time_seconds,
            ],
        )?;
        Ok(())
    }

    pub fn get_batch_metadata(&self, batch_id: i64) -> Result<Option<BatchMetadata>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT batch_id, question, total_responses, new_themes_count,
                       updated_themes_count, deleted_themes_count, processing_time_seconds
                FROM batch_metadata WHERE batch_id = ?1
                "#,
                params![batch_id],
                |row| {
                    Ok(BatchMetadata {
                        batch_id: row.get(0)?,
                        question: row.get(1)?,
                        total_responses: row.get(2)?,
                        new_themes_count: row.get(3)?,
                        updated_themes_count: row.get(4)?,
                        deleted_themes_count: row.get(5)?,
                        processing_time_seconds: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn latest_batch_id(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let id = conn
            .query_row("SELECT MAX(batch_id) FROM batch_metadata", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        Ok(id)
    }

    // ==================== Embedding cache ====================

    /// Look up a cached vector; a miss is not an error
    pub fn cache_get(&self, text_hash: &str, model_name: &str) -> Result<Option<Vec<f32>>> {
        let conn = self.conn.lock().unwrap();
        let blob = conn
            .query_row(
                "SELECT embedding FROM embedding_cache WHERE text_hash = ?1 AND model_name = ?2",
                params![text_hash, model_name],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    /// Cache a vector; rows are immutable, so a duplicate hash is a no-op
    pub fn cache_put(&self, text_hash: &str, embedding: &[f32], model_name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO embedding_cache (text_hash, embedding, model_name, created_at)
            VALUES (?1, ?2, ?3, datetime('now'))
            "#,
            params![text_hash, vec_to_blob(embedding), model_name],
        )?;
        Ok(())
    }

    // ==================== Statistics ====================

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().unwrap();
        let count = |sql: &str| -> Result<usize> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as usize)
        };
        Ok(StoreStats {
            active_themes: count("SELECT COUNT(*) FROM extracted_themes WHERE status = 'active'")?,
            total_responses: count("SELECT COUNT(*) FROM survey_responses")?,
            total_assignments: count("SELECT COUNT(*) FROM theme_assignments")?,
            total_batches: count("SELECT COUNT(*) FROM batch_metadata")?,
            cached_embeddings: count("SELECT COUNT(*) FROM embedding_cache")?,
        })
    }
}

const THEME_COLUMNS: &str = "id, name, description, embedding, created_at_batch, last_updated_batch, status, parent_theme_id, response_count, metadata";

fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("4-byte chunk")))
        .collect()
}

fn refresh_response_count(conn: &Connection, theme_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        UPDATE extracted_themes
        SET response_count = (SELECT COUNT(*) FROM theme_assignments WHERE theme_id = ?1)
        WHERE id = ?1
        "#,
        params![theme_id],
    )?;
    Ok(())
}

fn response_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SurveyResponse> {
    Ok(SurveyResponse {
        id: Some(row.get(0)?),
        batch_id: row.get(1)?,
        question: row.get(2)?,
        text: row.get(3)?,
        embedding: blob_to_vec(&row.get::<_, Vec<u8>>(4)?),
    })
}

fn theme_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Theme> {
    let status: String = row.get(6)?;
    let metadata: String = row.get(9)?;
    Ok(Theme {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        embedding: blob_to_vec(&row.get::<_, Vec<u8>>(3)?),
        created_at_batch: row.get(4)?,
        last_updated_batch: row.get(5)?,
        status: ThemeStatus::parse(&status).unwrap_or(ThemeStatus::Retired),
        parent_theme_id: row.get(7)?,
        response_count: row.get(8)?,
        metadata: serde_json::from_str::<ThemeOrigin>(&metadata).unwrap_or(ThemeOrigin::Seeded),
    })
}

fn assignment_from_row(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<crate::models::ThemeAssignment> {
    let keywords: String = row.get(4)?;
    Ok(crate::models::ThemeAssignment {
        id: Some(row.get(0)?),
        response_id: row.get(1)?,
        theme_id: row.get(2)?,
        confidence: row.get(3)?,
        highlighted_keywords: serde_json::from_str(&keywords).unwrap_or_default(),
        assigned_at_batch: row.get(5)?,
        last_updated_batch: row.get(6)?,
    })
}

fn evolution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EvolutionEntry> {
    let action: String = row.get(2)?;
    let details: String = row.get(5)?;
    Ok(EvolutionEntry {
        id: Some(row.get(0)?),
        batch_id: row.get(1)?,
        action: EvolutionAction::parse(&action).unwrap_or(EvolutionAction::Updated),
        theme_id: row.get(3)?,
        related_theme_id: row.get(4)?,
        details: serde_json::from_str(&details).unwrap_or_default(),
        affected_response_count: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vectors::l2_normalize;

    fn unit(raw: &[f32]) -> Vec<f32> {
        let mut v = raw.to_vec();
        l2_normalize(&mut v);
        v
    }

    fn test_theme(name: &str, embedding: Vec<f32>, batch: i64) -> Theme {
        Theme {
            id: None,
            name: name.to_string(),
            description: format!("{name} description"),
            embedding,
            status: ThemeStatus::Active,
            created_at_batch: batch,
            last_updated_batch: batch,
            parent_theme_id: None,
            response_count: 0,
            metadata: ThemeOrigin::Seeded,
        }
    }

    fn test_response(text: &str, embedding: Vec<f32>, batch: i64) -> SurveyResponse {
        SurveyResponse {
            id: None,
            batch_id: batch,
            question: "test question".to_string(),
            text: text.to_string(),
            embedding,
        }
    }

    #[test]
    fn empty_store_stats() {
        let store = Store::open_in_memory().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.active_themes, 0);
        assert_eq!(stats.total_responses, 0);
    }

    #[test]
    fn response_round_trip_preserves_embedding() {
        let store = Store::open_in_memory().unwrap();
        let embedding = unit(&[0.3, 0.4, 0.5]);
        let id = store
            .put_response(&test_response("hello", embedding.clone(), 1))
            .unwrap();

        let loaded = store.get_response(id).unwrap().unwrap();
        assert_eq!(loaded.text, "hello");
        assert_eq!(loaded.embedding, embedding);
    }

    #[test]
    fn similar_themes_respect_threshold_and_status() {
        let store = Store::open_in_memory().unwrap();
        let a = store
            .put_theme(&test_theme("A", unit(&[1.0, 0.0, 0.0]), 1))
            .unwrap();
        store
            .put_theme(&test_theme("B", unit(&[0.0, 1.0, 0.0]), 1))
            .unwrap();

        let hits = store
            .find_similar_themes(&unit(&[0.95, 0.05, 0.0]), 0.75, 3)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, Some(a));
        assert!(hits[0].1 >= 0.75);

        // Merged themes leave the index
        let mut theme = store.get_theme(a).unwrap().unwrap();
        theme.status = ThemeStatus::Merged;
        store.update_theme(&theme).unwrap();
        let hits = store
            .find_similar_themes(&unit(&[0.95, 0.05, 0.0]), 0.75, 3)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn zero_vector_queries_return_nothing() {
        let store = Store::open_in_memory().unwrap();
        store
            .put_theme(&test_theme("A", unit(&[1.0, 0.0]), 1))
            .unwrap();
        assert!(store
            .find_similar_themes(&[0.0, 0.0], 0.0, 5)
            .unwrap()
            .is_empty());
        assert!(store
            .find_similar_responses(&[0.0, 0.0], 0.0, 5)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn assignment_upsert_keeps_pair_unique() {
        let store = Store::open_in_memory().unwrap();
        let theme = store
            .put_theme(&test_theme("A", unit(&[1.0, 0.0]), 1))
            .unwrap();
        let response = store
            .put_response(&test_response("text", unit(&[1.0, 0.0]), 1))
            .unwrap();

        store.put_assignment(response, theme, 0.8, &[], 1).unwrap();
        store.put_assignment(response, theme, 0.9, &[], 2).unwrap();

        let assignments = store.assignments_by_theme(theme).unwrap();
        assert_eq!(assignments.len(), 1);
        assert!((assignments[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(assignments[0].assigned_at_batch, 1);
        assert_eq!(assignments[0].last_updated_batch, 2);

        let loaded = store.get_theme(theme).unwrap().unwrap();
        assert_eq!(loaded.response_count, 1);
    }

    #[test]
    fn rewrite_assignments_moves_and_collapses() {
        let store = Store::open_in_memory().unwrap();
        let loser = store
            .put_theme(&test_theme("loser", unit(&[1.0, 0.0]), 1))
            .unwrap();
        let survivor = store
            .put_theme(&test_theme("survivor", unit(&[0.9, 0.1]), 1))
            .unwrap();

        let r1 = store
            .put_response(&test_response("one", unit(&[1.0, 0.0]), 1))
            .unwrap();
        let r2 = store
            .put_response(&test_response("two", unit(&[1.0, 0.1]), 1))
            .unwrap();

        store.put_assignment(r1, loser, 0.9, &[], 1).unwrap();
        store.put_assignment(r2, loser, 0.8, &[], 1).unwrap();
        // r2 already assigned to the survivor: this pair collapses
        store.put_assignment(r2, survivor, 0.85, &[], 1).unwrap();

        let affected = store.rewrite_assignments(loser, survivor, 2).unwrap();
        assert_eq!(affected, 2);

        assert!(store.assignments_by_theme(loser).unwrap().is_empty());
        let survivors = store.assignments_by_theme(survivor).unwrap();
        assert_eq!(survivors.len(), 2);
        assert!(survivors.iter().all(|a| a.last_updated_batch == 2));

        assert_eq!(store.get_theme(loser).unwrap().unwrap().response_count, 0);
        assert_eq!(
            store.get_theme(survivor).unwrap().unwrap().response_count,
            2
        );
    }

    #[test]
    fn batch_metadata_replay_is_a_conflict() {
        let store = Store::open_in_memory().unwrap();
        let metadata = BatchMetadata {
            batch_id: 1,
            question: "q".to_string(),
            total_responses: 4,
            new_themes_count: 2,
            updated_themes_count: 0,
            deleted_themes_count: 0,
            processing_time_seconds: 0.1,
        };
        store.put_batch_metadata(&metadata).unwrap();
        assert!(matches!(
            store.put_batch_metadata(&metadata),
            Err(EngineError::IntegrityConflict(_))
        ));
        assert_eq!(store.latest_batch_id().unwrap(), Some(1));
    }

    #[test]
    fn cache_is_content_addressed_and_immutable() {
        let store = Store::open_in_memory().unwrap();
        let hash = "a".repeat(64);
        assert!(store.cache_get(&hash, "model").unwrap().is_none());

        store.cache_put(&hash, &[0.1, 0.2], "model").unwrap();
        assert_eq!(
            store.cache_get(&hash, "model").unwrap(),
            Some(vec![0.1, 0.2])
        );
        // Lookup is scoped by model
        assert!(store.cache_get(&hash, "other-model").unwrap().is_none());

        // Duplicate writes never overwrite
        store.cache_put(&hash, &[9.0, 9.0], "model").unwrap();
        assert_eq!(
            store.cache_get(&hash, "model").unwrap(),
            Some(vec![0.1, 0.2])
        );
    }

    #[test]
    fn rollback_restores_catalog_and_indexes() {
        let store = Store::open_in_memory().unwrap();
        let kept = store
            .put_theme(&test_theme("kept", unit(&[1.0, 0.0]), 1))
            .unwrap();

        store.begin_batch().unwrap();
        store
            .put_theme(&test_theme("doomed", unit(&[0.0, 1.0]), 2))
            .unwrap();
        store.rollback_batch().unwrap();

        assert_eq!(store.themes_by_status(ThemeStatus::Active).unwrap().len(), 1);
        let hits = store
            .find_similar_themes(&unit(&[0.0, 1.0]), 0.9, 3)
            .unwrap();
        assert!(hits.is_empty(), "rolled-back theme must leave the index");
        let hits = store
            .find_similar_themes(&unit(&[1.0, 0.0]), 0.9, 3)
            .unwrap();
        assert_eq!(hits[0].0.id, Some(kept));
    }

    #[test]
    fn evolution_log_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let theme = store
            .put_theme(&test_theme("A", unit(&[1.0, 0.0]), 1))
            .unwrap();
        store
            .append_evolution(&EvolutionEntry {
                id: None,
                batch_id: 1,
                action: EvolutionAction::Created,
                theme_id: theme,
                related_theme_id: None,
                affected_response_count: 3,
                details: EvolutionDetails {
                    theme_name: Some("A".to_string()),
                    ..Default::default()
                },
            })
            .unwrap();

        let entries = store.evolution_by_batch(1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, EvolutionAction::Created);
        assert_eq!(entries[0].details.theme_name.as_deref(), Some("A"));
    }

    #[test]
    fn soft_retire_flips_status_and_logs() {
        let store = Store::open_in_memory().unwrap();
        let theme = store
            .put_theme(&test_theme("A", unit(&[1.0, 0.0]), 1))
            .unwrap();
        store
            .soft_retire_theme(theme, "no live assignments", 3)
            .unwrap();

        let loaded = store.get_theme(theme).unwrap().unwrap();
        assert_eq!(loaded.status, ThemeStatus::Retired);
        assert_eq!(loaded.last_updated_batch, 3);

        let entries = store.evolution_by_batch(3).unwrap();
        assert_eq!(entries[0].action, EvolutionAction::Retired);
        // No resurrection
        assert!(store.soft_retire_theme(theme, "again", 4).is_err());
    }

    #[test]
    fn deleting_a_response_cascades_to_assignments() {
        let store = Store::open_in_memory().unwrap();
        let theme = store
            .put_theme(&test_theme("A", unit(&[1.0, 0.0]), 1))
            .unwrap();
        let response = store
            .put_response(&test_response("text", unit(&[1.0, 0.0]), 1))
            .unwrap();
        store.put_assignment(response, theme, 0.9, &[], 1).unwrap();

        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "DELETE FROM survey_responses WHERE id = ?1",
                params![response],
            )
            .unwrap();
        }
        assert!(store.assignments_by_theme(theme).unwrap().is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        let embedding = unit(&[0.6, 0.8]);
        {
            let store = Store::open(&path).unwrap();
            store
                .put_theme(&test_theme("A", embedding.clone(), 1))
                .unwrap();
        }
        let store = Store::open(&path).unwrap();
        let hits = store.find_similar_themes(&embedding, 0.9, 1).unwrap();
        assert_eq!(hits.len(), 1, "index must be rebuilt on reopen");
    }
}
