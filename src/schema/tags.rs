//! Declarative field tag parser
//!
//! A tag is a comma-separated list of `key:value` pairs, e.g.
//! `metric_type:counter,unit:W,help:bytes sent`. Keys end at the first `:`,
//! values end at the first unescaped `,`. A backslash in a value escapes the
//! following character. A malformed segment stops parsing; pairs parsed
//! before it are kept.

use std::collections::BTreeMap;

/// Tag key selecting the metric type (`gauge`, `counter`, or `-` to suppress)
pub const METRIC_TYPE_KEY: &str = "metric_type";
/// Tag key overriding the metric name
pub const METRIC_NAME_KEY: &str = "metric_name";
/// Tag key carrying the metric's help text
pub const HELP_KEY: &str = "help";

/// Parse a declarative tag into its key/value pairs.
pub fn parse_tag(tag: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut rest = tag;

    while !rest.is_empty() {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            break;
        }

        // Spaces, quotes and control characters are not allowed in keys.
        let bytes = rest.as_bytes();
        let mut i = 0;
        while i < bytes.len()
            && bytes[i] > b' '
            && bytes[i] != b':'
            && bytes[i] != b'"'
            && bytes[i] != 0x7f
        {
            i += 1;
        }
        if i == 0 || i + 1 >= bytes.len() || bytes[i] != b':' {
            break;
        }
        let key = &rest[..i];
        rest = &rest[i + 1..];

        let (value, consumed) = scan_value(rest);
        labels.insert(key.to_string(), value);
        rest = &rest[consumed..];
    }

    labels
}

/// Scan a value up to the first unescaped comma.
///
/// Returns the unescaped value and the number of bytes consumed, including
/// the terminating comma when present.
fn scan_value(input: &str) -> (String, usize) {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((idx, c)) = chars.next() {
        match c {
            ',' => return (value, idx + 1),
            '\\' => match chars.next() {
                Some((_, escaped)) => value.push(escaped),
                // trailing backslash is kept literally
                None => value.push('\\'),
            },
            _ => value.push(c),
        }
    }

    (value, input.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(tag: &str) -> Vec<(String, String)> {
        parse_tag(tag).into_iter().collect()
    }

    #[test]
    fn test_parse_simple_tag() {
        let labels = parse_tag("metric_type:gauge,unit:W,help:cpu usage");
        assert_eq!(labels.len(), 3);
        assert_eq!(labels["metric_type"], "gauge");
        assert_eq!(labels["unit"], "W");
        assert_eq!(labels["help"], "cpu usage");
    }

    #[test]
    fn test_malformed_trailing_segment_is_dropped() {
        assert_eq!(
            pairs("metric_type:gauge,badsegment"),
            vec![("metric_type".to_string(), "gauge".to_string())]
        );
    }

    #[test]
    fn test_malformed_segment_stops_parsing() {
        let labels = parse_tag("metric_type:counter,:empty,unit:W");
        assert_eq!(labels.len(), 1);
        assert!(!labels.contains_key("unit"));
    }

    #[test]
    fn test_empty_and_blank_tags() {
        assert!(parse_tag("").is_empty());
        assert!(parse_tag("   ").is_empty());
    }

    #[test]
    fn test_key_without_value_at_end() {
        assert_eq!(
            pairs("metric_type:gauge,unit:"),
            vec![("metric_type".to_string(), "gauge".to_string())]
        );
    }

    #[test]
    fn test_escaped_comma_in_value() {
        let labels = parse_tag(r"help:reads\, writes,unit:B");
        assert_eq!(labels["help"], "reads, writes");
        assert_eq!(labels["unit"], "B");
    }

    #[test]
    fn test_leading_spaces_between_segments() {
        let labels = parse_tag("metric_type:gauge, unit:W");
        assert_eq!(labels["unit"], "W");
    }

    #[test]
    fn test_trailing_comma() {
        assert_eq!(parse_tag("metric_type:gauge,").len(), 1);
    }

    #[test]
    fn test_value_may_contain_colon() {
        let labels = parse_tag("source:host:9100");
        assert_eq!(labels["source"], "host:9100");
    }
}
