// Row identifiers for the gateway tables.
//
// Sessions, refresh tokens, transactions and payments are all read back in
// creation order by the reporting layer, so every id is a UUIDv7 generated
// app-side. Users keep PG's gen_random_uuid() default when the dashboard
// creates them without an explicit id.

use uuid::Uuid;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn uuidv7() -> Uuid {
    Uuid::now_v7()
}

/// Parse a textual id coming from a request or a token claim.
///
/// Returns `None` for anything that is not a UUID so callers can map it to
/// their own "not found" / "invalid" error without touching the database.
pub fn parse_id(value: &str) -> Option<Uuid> {
    Uuid::parse_str(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuidv7_is_valid() {
        let id = uuidv7();
        assert_eq!(id.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn uuidv7_is_monotonic() {
        let a = uuidv7();
        let b = uuidv7();
        assert!(b >= a);
    }

    #[test]
    fn parse_id_rejects_garbage() {
        assert!(parse_id("not-a-uuid").is_none());
        assert!(parse_id("").is_none());
        let id = uuidv7();
        assert_eq!(parse_id(&id.to_string()), Some(id));
    }
}
