use chrono::{SecondsFormat, Utc};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Current time as fixed-width RFC 3339 (microseconds, `Z`), so text order is time order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::persistence::MessageType;

    #[test]
    fn parse_enum_success() {
        let result: Result<crate::sessions::SessionStatus, _> =
            parse_enum("ended", "sessions", "status");
        assert!(result.is_ok());
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<MessageType, _> = parse_enum("INVALID", "messages", "type");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "type", .. })
        ));
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = now_timestamp();
        let b = now_timestamp();
        assert!(a.ends_with('Z'));
        assert_eq!(a.len(), b.len());
        assert!(a <= b);
    }
}
