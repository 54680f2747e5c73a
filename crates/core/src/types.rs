/// Database primary keys (users, target entries, audit rows) are BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Server-generated opaque job identifier.
pub type JobId = uuid::Uuid;
