use crate::interpreter::identifiers::IdentifierMaps;
use regex::Regex;
use std::sync::LazyLock;

static ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+AS\s+\[[^\]]*\]").expect("valid regex"));
static QUALIFIED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]]+)\]\.\[([^\[\]]+)\]").expect("valid regex"));

// xmSQL: "Estimated size ( volume, marshalling bytes ) : 110, 1760"
static ESTIMATED_SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Estimated size\s*\(\s*volume\s*,\s*marshalling bytes\s*\)\s*:\s*(\d+)\s*,\s*(\d+)")
        .expect("valid regex")
});
// Free form / JSON (i.e. execution metrics): "Rows: 10", "rowCount": 10
static ROWS_FALLBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\brows?(?:\s*count)?"?\s*[:=]\s*(\d+)"#).expect("valid regex")
});
static BYTES_FALLBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bbytes?(?:\s*count)?"?\s*[:=]\s*(\d+)|\b(\d+)\s*bytes\b"#)
        .expect("valid regex")
});

/// Make the storage engine query text readable (cosmetic only):
/// - internal ids -> names
/// - drop "AS [alias]"
/// - [Table].[Column] -> 'Table'[Column]
pub fn normalize_query_text(text: &str, identifiers: &IdentifierMaps) -> String {
    let text = identifiers.resolve(text);
    let text = ALIAS.replace_all(&text, "");
    let text = QUALIFIED.replace_all(&text, "'$1'[$2]");
    return text.into_owned();
}

fn capture_u64(regex: &Regex, text: &str) -> Option<u64> {
    let captures = regex.captures(text)?;
    return captures
        .iter()
        .skip(1)
        .flatten()
        .find_map(|group| group.as_str().parse::<u64>().ok());
}

/// Estimated rows of a scan, 0 if the text does not have it.
pub fn estimated_rows(text: &str) -> u64 {
    if let Some(captures) = ESTIMATED_SIZE.captures(text) {
        if let Some(rows) = captures.get(1).and_then(|m| m.as_str().parse::<u64>().ok()) {
            return rows;
        }
    }
    return capture_u64(&ROWS_FALLBACK, text).unwrap_or(0);
}

/// Estimated (marshalling) bytes of a scan, 0 if the text does not have it.
pub fn estimated_bytes(text: &str) -> u64 {
    if let Some(captures) = ESTIMATED_SIZE.captures(text) {
        if let Some(bytes) = captures.get(2).and_then(|m| m.as_str().parse::<u64>().ok()) {
            return bytes;
        }
    }
    return capture_u64(&BYTES_FALLBACK, text).unwrap_or(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SCAN: &str = "SET DC_KIND=\"AUTO\";\n\
        SELECT [Sales (12)].[Amount (34)] AS [$Expr0] FROM [Sales (12)];\n\n\
        Estimated size ( volume, marshalling bytes ) : 110, 1760";

    fn identifiers() -> IdentifierMaps {
        let mut maps = IdentifierMaps::default();
        maps.insert_table("Sales (12)", "Sales");
        maps.insert_column("Amount (34)", "Amount");
        return maps;
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize_query_text(SCAN, &identifiers()),
            "SET DC_KIND=\"AUTO\";\n\
             SELECT 'Sales'[Amount] FROM [Sales];\n\n\
             Estimated size ( volume, marshalling bytes ) : 110, 1760"
        );
    }

    #[test]
    fn test_normalize_idempotent() {
        let identifiers = identifiers();
        let once = normalize_query_text(SCAN, &identifiers);
        assert_eq!(normalize_query_text(&once, &identifiers), once);
    }

    #[test]
    fn test_normalize_name_is_another_id() {
        let mut identifiers = IdentifierMaps::default();
        identifiers.insert_table("Product (99)", "Product");
        identifiers.insert_column("Product", "Product Name");
        assert_eq!(
            normalize_query_text("SELECT [Product (99)].[Product] FROM [Product (99)]", &identifiers),
            "SELECT 'Product'[Product Name] FROM [Product]"
        );
    }

    #[test]
    fn test_normalize_without_identifiers() {
        assert_eq!(
            normalize_query_text("SELECT [T].[C] AS [x], [T].[D]", &IdentifierMaps::default()),
            "SELECT 'T'[C], 'T'[D]"
        );
    }

    #[test]
    fn test_estimated_size() {
        assert_eq!(estimated_rows(SCAN), 110);
        assert_eq!(estimated_bytes(SCAN), 1760);
    }

    #[test]
    fn test_estimated_size_fallback() {
        assert_eq!(estimated_rows("{\"rowCount\": 42, \"bytes\": 1024}"), 42);
        assert_eq!(estimated_bytes("{\"rowCount\": 42, \"bytes\": 1024}"), 1024);
        assert_eq!(estimated_rows("Rows: 7"), 7);
        assert_eq!(estimated_bytes("read 512 bytes"), 512);
    }

    #[test]
    fn test_estimated_size_malformed() {
        assert_eq!(estimated_rows(""), 0);
        assert_eq!(estimated_rows("Estimated size ( volume, marshalling bytes ) : many, lots"), 0);
        assert_eq!(estimated_bytes("Estimated size ( volume, marshalling bytes ) : many, lots"), 0);
        assert_eq!(estimated_rows("rows: 99999999999999999999999"), 0);
    }
}
