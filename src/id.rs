use ulid::Ulid;

/// Scan identifiers are ULIDs so artifact names sort by start time.
pub fn new_scan_id() -> String {
    Ulid::new().to_string().to_ascii_lowercase()
}
