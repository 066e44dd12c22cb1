//! Catalog statements. `@schema` is substituted with the escaped catalog
//! schema by the connection layer. Creation runs on every startup, so every
//! statement is idempotent.

pub(crate) const INIT_SQL: &[&str] = &[
    r#"CREATE SCHEMA IF NOT EXISTS @schema;"#,
    r#"
CREATE TABLE IF NOT EXISTS @schema.peers (
    id BIGINT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    host TEXT NOT NULL,
    port INT NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    database TEXT NOT NULL,
    ssl_mode TEXT NOT NULL DEFAULT 'prefer'
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS @schema.mirrors (
    name TEXT PRIMARY KEY,
    source_peer_id BIGINT NOT NULL,
    destination_peer_id BIGINT NOT NULL,
    config JSONB NOT NULL,
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS @schema.mirror_state (
    mirror_name TEXT PRIMARY KEY,
    slot_name TEXT,
    publication_name TEXT,
    last_lsn BIGINT NOT NULL DEFAULT 0,
    last_sync_batch_id BIGINT NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    error_message TEXT,
    error_count INT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS @schema.table_sync_status (
    mirror_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    status TEXT NOT NULL,
    rows_synced BIGINT NOT NULL DEFAULT 0,
    rows_inserted BIGINT NOT NULL DEFAULT 0,
    rows_updated BIGINT NOT NULL DEFAULT 0,
    last_synced_at TIMESTAMPTZ,
    error_message TEXT,
    PRIMARY KEY (mirror_name, table_name)
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS @schema.fk_definitions (
    mirror_name TEXT NOT NULL,
    source_table TEXT NOT NULL,
    constraint_name TEXT NOT NULL,
    constraint_definition TEXT NOT NULL,
    target_table TEXT NOT NULL,
    on_delete TEXT NOT NULL,
    on_update TEXT NOT NULL,
    is_deferrable BOOLEAN NOT NULL DEFAULT false,
    initially_deferred BOOLEAN NOT NULL DEFAULT false,
    dropped_at TIMESTAMPTZ,
    recreated_at TIMESTAMPTZ,
    PRIMARY KEY (mirror_name, source_table, constraint_name)
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS @schema.index_definitions (
    mirror_name TEXT NOT NULL,
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    index_name TEXT NOT NULL,
    definition TEXT NOT NULL,
    is_unique BOOLEAN NOT NULL DEFAULT false,
    is_primary BOOLEAN NOT NULL DEFAULT false,
    index_type TEXT NOT NULL DEFAULT 'btree',
    PRIMARY KEY (mirror_name, schema_name, table_name, index_name)
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS @schema.mirror_logs (
    id BIGSERIAL PRIMARY KEY,
    mirror_name TEXT NOT NULL,
    log_level TEXT NOT NULL,
    message TEXT NOT NULL,
    details JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#,
    r#"
CREATE INDEX IF NOT EXISTS mirror_logs_by_mirror
    ON @schema.mirror_logs (mirror_name, created_at);
"#,
];

pub(crate) const INSERT_MIRROR_SQL: &str = r#"
INSERT INTO @schema.mirrors (name, source_peer_id, destination_peer_id, config, status)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (name) DO NOTHING
"#;

pub(crate) const INIT_MIRROR_STATE_SQL: &str = r#"
INSERT INTO @schema.mirror_state (mirror_name, status)
VALUES ($1, $2)
ON CONFLICT (mirror_name) DO NOTHING
"#;

pub(crate) const GET_MIRROR_SQL: &str = r#"
SELECT config FROM @schema.mirrors WHERE name = $1
"#;

pub(crate) const DELETE_MIRROR_CASCADE_SQL: &[&str] = &[
    r#"DELETE FROM @schema.mirror_logs WHERE mirror_name = $1"#,
    r#"DELETE FROM @schema.index_definitions WHERE mirror_name = $1"#,
    r#"DELETE FROM @schema.fk_definitions WHERE mirror_name = $1"#,
    r#"DELETE FROM @schema.table_sync_status WHERE mirror_name = $1"#,
    r#"DELETE FROM @schema.mirror_state WHERE mirror_name = $1"#,
    r#"DELETE FROM @schema.mirrors WHERE name = $1"#,
];

pub(crate) const GET_STATE_SQL: &str = r#"
SELECT mirror_name, slot_name, publication_name, last_lsn, last_sync_batch_id,
       status, error_message, error_count
FROM @schema.mirror_state
WHERE mirror_name = $1
"#;

pub(crate) const SET_REPLICATION_OBJECTS_SQL: &str = r#"
UPDATE @schema.mirror_state
SET slot_name = $2, publication_name = $3, updated_at = now()
WHERE mirror_name = $1
"#;

pub(crate) const SET_MIRROR_STATUS_SQL: &str = r#"
UPDATE @schema.mirrors SET status = $2, updated_at = now() WHERE name = $1
"#;

pub(crate) const SET_STATE_STATUS_SQL: &str = r#"
UPDATE @schema.mirror_state SET status = $2, updated_at = now() WHERE mirror_name = $1
"#;

pub(crate) const ADVANCE_CURSOR_SQL: &str = r#"
UPDATE @schema.mirror_state
SET last_lsn = GREATEST(last_lsn, $2),
    last_sync_batch_id = last_sync_batch_id + $3,
    updated_at = now()
WHERE mirror_name = $1
"#;

pub(crate) const RESET_CURSOR_SQL: &str = r#"
UPDATE @schema.mirror_state
SET last_lsn = 0, last_sync_batch_id = 0, updated_at = now()
WHERE mirror_name = $1
"#;

pub(crate) const RECORD_ERROR_SQL: &str = r#"
UPDATE @schema.mirror_state
SET error_message = $2, error_count = error_count + 1, updated_at = now()
WHERE mirror_name = $1
"#;

pub(crate) const CLEAR_ERROR_SQL: &str = r#"
UPDATE @schema.mirror_state
SET error_message = NULL, error_count = 0, updated_at = now()
WHERE mirror_name = $1
"#;

pub(crate) const UPSERT_TABLE_STATUS_SQL: &str = r#"
INSERT INTO @schema.table_sync_status (mirror_name, table_name, status)
VALUES ($1, $2, $3)
ON CONFLICT (mirror_name, table_name)
DO UPDATE SET status = EXCLUDED.status,
              error_message = CASE WHEN EXCLUDED.status = 'error'
                                   THEN table_sync_status.error_message
                                   ELSE NULL END
"#;

pub(crate) const RECORD_TABLE_PROGRESS_SQL: &str = r#"
UPDATE @schema.table_sync_status
SET rows_synced = rows_synced + $3,
    rows_inserted = rows_inserted + $4,
    rows_updated = rows_updated + $5,
    last_synced_at = now()
WHERE mirror_name = $1 AND table_name = $2
"#;

pub(crate) const SET_TABLE_ERROR_SQL: &str = r#"
INSERT INTO @schema.table_sync_status (mirror_name, table_name, status, error_message)
VALUES ($1, $2, 'error', $3)
ON CONFLICT (mirror_name, table_name)
DO UPDATE SET status = 'error', error_message = EXCLUDED.error_message
"#;

pub(crate) const LIST_TABLE_STATUS_SQL: &str = r#"
SELECT table_name, status, rows_synced, rows_inserted, rows_updated, error_message
FROM @schema.table_sync_status
WHERE mirror_name = $1
ORDER BY table_name
"#;

pub(crate) const CAPTURE_FOREIGN_KEY_SQL: &str = r#"
INSERT INTO @schema.fk_definitions
    (mirror_name, source_table, constraint_name, constraint_definition, target_table,
     on_delete, on_update, is_deferrable, initially_deferred, dropped_at, recreated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), NULL)
ON CONFLICT (mirror_name, source_table, constraint_name)
DO UPDATE SET constraint_definition = EXCLUDED.constraint_definition,
              target_table = EXCLUDED.target_table,
              on_delete = EXCLUDED.on_delete,
              on_update = EXCLUDED.on_update,
              is_deferrable = EXCLUDED.is_deferrable,
              initially_deferred = EXCLUDED.initially_deferred,
              dropped_at = now(),
              recreated_at = NULL
"#;

pub(crate) const MARK_FOREIGN_KEY_RECREATED_SQL: &str = r#"
UPDATE @schema.fk_definitions
SET recreated_at = now()
WHERE mirror_name = $1 AND source_table = $2 AND constraint_name = $3
"#;

pub(crate) const LIST_CAPTURED_FOREIGN_KEYS_SQL: &str = r#"
SELECT source_table, constraint_name, constraint_definition, on_delete, target_table,
       on_update, is_deferrable, initially_deferred, dropped_at, recreated_at
FROM @schema.fk_definitions
WHERE mirror_name = $1
ORDER BY source_table, constraint_name
"#;

pub(crate) const CAPTURE_INDEX_SQL: &str = r#"
INSERT INTO @schema.index_definitions
    (mirror_name, schema_name, table_name, index_name, definition, is_unique, is_primary, index_type)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (mirror_name, schema_name, table_name, index_name)
DO UPDATE SET definition = EXCLUDED.definition,
              is_unique = EXCLUDED.is_unique,
              is_primary = EXCLUDED.is_primary,
              index_type = EXCLUDED.index_type
"#;

pub(crate) const LIST_CAPTURED_INDEXES_SQL: &str = r#"
SELECT schema_name, table_name, index_name, definition, is_unique, is_primary, index_type
FROM @schema.index_definitions
WHERE mirror_name = $1
ORDER BY schema_name, table_name, index_name
"#;

pub(crate) const INSERT_EVENT_SQL: &str = r#"
INSERT INTO @schema.mirror_logs (mirror_name, log_level, message, details)
VALUES ($1, $2, $3, $4)
"#;

pub(crate) const UPSERT_PEER_SQL: &str = r#"
INSERT INTO @schema.peers (id, name, host, port, username, password, database, ssl_mode)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (id)
DO UPDATE SET name = EXCLUDED.name,
              host = EXCLUDED.host,
              port = EXCLUDED.port,
              username = EXCLUDED.username,
              password = EXCLUDED.password,
              database = EXCLUDED.database,
              ssl_mode = EXCLUDED.ssl_mode
"#;

pub(crate) const GET_PEER_SQL: &str = r#"
SELECT id, name, host, port, username, password, database, ssl_mode
FROM @schema.peers
WHERE id = $1
"#;
