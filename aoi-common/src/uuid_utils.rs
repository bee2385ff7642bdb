//! Identifier utilities

use uuid::Uuid;

/// Generate a new UUIDv4 in its hyphenated string form (entity primary keys)
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Short random token (8 lowercase hex characters) for file and batch names
pub fn short_token() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..8].to_string()
}
