/// Identifier of a layer; by convention the creation time in milliseconds since the epoch.
pub type LayerId = i64;

/// Identity of a persisted item record.
pub type RecordId = i64;
