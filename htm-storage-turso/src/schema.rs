//! SQL schema for the Turso backend.
//!
//! Timestamps are stored as microseconds since the Unix epoch. Soft-delete
//! uniqueness is enforced with partial indices over `deleted_at IS NULL`,
//! so a deleted row frees its key for reuse.

/// Node rows. The embedding is a JSON float array padded to the configured
/// storage width, with the original dimension recorded alongside.
pub const CREATE_NODES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    token_count INTEGER NOT NULL DEFAULT 0,
    embedding TEXT,
    embedding_dimension INTEGER,
    source_id INTEGER,
    chunk_position INTEGER,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_accessed INTEGER,
    access_count INTEGER NOT NULL DEFAULT 0,
    deleted_at INTEGER
)
"#;

/// Tag rows; names are unique among active rows only.
pub const CREATE_TAGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
)
"#;

/// Node-tag associations; the pair is unique among active rows.
pub const CREATE_NODE_TAGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS node_tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id INTEGER NOT NULL,
    tag_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
)
"#;

/// Robot identities.
pub const CREATE_ROBOTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS robots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    last_active_at INTEGER NOT NULL
)
"#;

/// A robot's relationship to a node.
pub const CREATE_ROBOT_NODES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS robot_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    robot_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    first_remembered_at INTEGER NOT NULL,
    last_remembered_at INTEGER NOT NULL,
    remember_count INTEGER NOT NULL DEFAULT 1,
    in_working_memory INTEGER NOT NULL DEFAULT 0,
    UNIQUE(robot_id, node_id)
)
"#;

/// Loaded files that chunk nodes point back to.
pub const CREATE_FILE_SOURCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS file_sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    content_hash TEXT NOT NULL,
    mtime INTEGER NOT NULL,
    frontmatter TEXT NOT NULL DEFAULT '{}',
    last_synced_at INTEGER NOT NULL
)
"#;

/// Ordered pub/sub payloads; subscribers poll past their high-water mark.
pub const CREATE_NOTIFICATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL
)
"#;

/// Indices: hash uniqueness and tag-name uniqueness are partial over
/// active rows; time-ordered reads go through `created_at`.
pub const CREATE_INDICES: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_active_hash
    ON nodes(content_hash) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_nodes_created_at ON nodes(created_at);
CREATE INDEX IF NOT EXISTS idx_nodes_source ON nodes(source_id)
    WHERE source_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_tags_active_name
    ON tags(name) WHERE deleted_at IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_node_tags_active_pair
    ON node_tags(node_id, tag_id) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_node_tags_tag ON node_tags(tag_id)
    WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_robot_nodes_wm
    ON robot_nodes(robot_id) WHERE in_working_memory = 1;
CREATE INDEX IF NOT EXISTS idx_notifications_channel
    ON notifications(channel, id)
"#;
