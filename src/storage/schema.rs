//! Database schema definition

/// SQL schema for the theme catalog database
///
/// Embeddings are stored as little-endian f32 BLOBs; similarity queries go
/// through the in-process vector index rather than SQL. JSON columns hold
/// the typed payloads serialized at the store boundary.
pub const SCHEMA: &str = r#"
-- Living theme catalog
CREATE TABLE IF NOT EXISTS extracted_themes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    embedding BLOB NOT NULL,
    created_at_batch INTEGER NOT NULL,
    last_updated_batch INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    parent_theme_id INTEGER REFERENCES extracted_themes(id),
    response_count INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    CHECK (parent_theme_id IS NULL OR parent_theme_id <> id),
    CHECK (created_at_batch <= last_updated_batch)
);

CREATE INDEX IF NOT EXISTS idx_themes_status ON extracted_themes(status);

-- Ingested survey responses; immutable after insert
CREATE TABLE IF NOT EXISTS survey_responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id INTEGER NOT NULL,
    question TEXT NOT NULL,
    response_text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    processed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_responses_batch ON survey_responses(batch_id);

-- Response/theme junction with per-pair uniqueness
CREATE TABLE IF NOT EXISTS theme_assignments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    response_id INTEGER NOT NULL REFERENCES survey_responses(id) ON DELETE CASCADE,
    theme_id INTEGER NOT NULL REFERENCES extracted_themes(id) ON DELETE CASCADE,
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    highlighted_keywords TEXT NOT NULL,
    assigned_at_batch INTEGER NOT NULL,
    last_updated_batch INTEGER NOT NULL,
    UNIQUE (response_id, theme_id)
);

CREATE INDEX IF NOT EXISTS idx_assignments_response ON theme_assignments(response_id);
CREATE INDEX IF NOT EXISTS idx_assignments_theme ON theme_assignments(theme_id);

-- Append-only evolution log
CREATE TABLE IF NOT EXISTS theme_evolution_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id INTEGER NOT NULL,
    action TEXT NOT NULL,
    theme_id INTEGER NOT NULL,
    related_theme_id INTEGER,
    details TEXT NOT NULL,
    affected_response_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_evolution_batch ON theme_evolution_log(batch_id);

-- One row per processed batch; primary key doubles as the replay guard
CREATE TABLE IF NOT EXISTS batch_metadata (
    batch_id INTEGER PRIMARY KEY,
    question TEXT NOT NULL,
    total_responses INTEGER NOT NULL,
    new_themes_count INTEGER NOT NULL DEFAULT 0,
    updated_themes_count INTEGER NOT NULL DEFAULT 0,
    deleted_themes_count INTEGER NOT NULL DEFAULT 0,
    processing_time_seconds REAL NOT NULL,
    processed_at TEXT NOT NULL
);

-- Content-addressed embedding cache
CREATE TABLE IF NOT EXISTS embedding_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text_hash TEXT NOT NULL UNIQUE,
    embedding BLOB NOT NULL,
    model_name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_hash ON embedding_cache(text_hash);
"#;
