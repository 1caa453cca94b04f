//! SQLite schema definitions
//!
//! Initial schema with all tables. Timestamps are milliseconds since the
//! Unix epoch.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema SQL
pub const SCHEMA: &str = r#"
-- =============================================================================
-- Infrastructure: Schema version tracking
-- =============================================================================
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    execution_time_ms INTEGER,
    success INTEGER NOT NULL DEFAULT 1
);

-- =============================================================================
-- 1. Deployments (module schemas + runner endpoints)
-- =============================================================================
CREATE TABLE IF NOT EXISTS deployments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    module TEXT NOT NULL,
    schema TEXT NOT NULL,
    digest TEXT NOT NULL,
    endpoint TEXT,
    active INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deployments_module ON deployments(module);

-- =============================================================================
-- 2. Topics and the append-only event journal
-- =============================================================================
CREATE TABLE IF NOT EXISTS topics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    module TEXT NOT NULL,
    name TEXT NOT NULL,
    -- id of the latest event; monotonically advances, never decreases
    head INTEGER REFERENCES topic_events(id),
    created_at INTEGER NOT NULL,
    UNIQUE(module, name)
);

CREATE TABLE IF NOT EXISTS topic_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    topic_id INTEGER NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
    caller TEXT NOT NULL,
    payload BLOB NOT NULL,
    request_key TEXT,
    trace_context TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_topic_events_topic ON topic_events(topic_id, id);

-- =============================================================================
-- 3. Subscriptions and subscribers
-- =============================================================================
CREATE TABLE IF NOT EXISTS subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    module TEXT NOT NULL,
    name TEXT NOT NULL,
    deployment_key TEXT NOT NULL,
    topic_id INTEGER NOT NULL REFERENCES topics(id),
    -- id of the last consumed event; NULL means start at the topic head
    cursor INTEGER REFERENCES topic_events(id),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(module, name)
);

CREATE TABLE IF NOT EXISTS subscribers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
    deployment_key TEXT NOT NULL,
    sink_module TEXT NOT NULL,
    sink_verb TEXT NOT NULL,
    retry_attempts INTEGER NOT NULL DEFAULT 0,
    backoff_ms INTEGER NOT NULL,
    max_backoff_ms INTEGER NOT NULL,
    catch_module TEXT,
    catch_verb TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_subscribers_subscription ON subscribers(subscription_id);

-- One in-flight delivery per subscription; the primary key is the gate.
CREATE TABLE IF NOT EXISTS topic_event_consumptions (
    subscription_id INTEGER PRIMARY KEY REFERENCES subscriptions(id) ON DELETE CASCADE,
    event_id INTEGER NOT NULL REFERENCES topic_events(id),
    started_at INTEGER NOT NULL
);

-- =============================================================================
-- 4. Async call queue
-- =============================================================================
CREATE TABLE IF NOT EXISTS async_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    verb_module TEXT NOT NULL,
    verb_name TEXT NOT NULL,
    origin TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending'
        CHECK(state IN ('pending', 'leased', 'success', 'failed', 'caught')),
    request BLOB NOT NULL,
    response BLOB,
    error TEXT,
    remaining_attempts INTEGER NOT NULL DEFAULT 0,
    backoff_ms INTEGER NOT NULL,
    max_backoff_ms INTEGER NOT NULL,
    scheduled_at INTEGER NOT NULL,
    lease_id TEXT,
    lease_expiry INTEGER,
    parent_request_key TEXT,
    trace_context TEXT,
    catch_module TEXT,
    catch_verb TEXT,
    created_at INTEGER NOT NULL,
    CHECK (state <> 'leased' OR (lease_id IS NOT NULL AND lease_expiry IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_async_calls_due ON async_calls(state, scheduled_at);

-- =============================================================================
-- 5. Console timeline projection
-- =============================================================================
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    time_stamp INTEGER NOT NULL,
    event_type TEXT NOT NULL
        CHECK(event_type IN ('call', 'log', 'deployment_created', 'deployment_updated')),
    deployment_key TEXT NOT NULL,
    request_key TEXT,
    -- call columns
    source_module TEXT,
    source_verb TEXT,
    dest_module TEXT,
    dest_verb TEXT,
    duration_ms INTEGER,
    request TEXT,
    response TEXT,
    error TEXT,
    -- log columns
    log_level INTEGER,
    message TEXT,
    attributes TEXT,
    -- deployment lifecycle columns
    module_name TEXT,
    replaced_deployment TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_time ON events(time_stamp, id);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_deployment ON events(deployment_key);
"#;
