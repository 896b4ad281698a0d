//! `Key: value` tag files with line folding.

use std::io::Write;
use std::path::Path;

use crate::error::BagError;

pub const LINE_WIDTH: usize = 78;
const CONTINUATION: &str = "    ";

/// Formats one tag, folding at spaces so no line exceeds [`LINE_WIDTH`]
/// unless a single word is longer.
///
/// A fold consumes exactly one space, so runs of whitespace survive.
/// Line breaks and `%` are percent-encoded.
pub fn fold_tag(key: &str, value: &str) -> String {
    let value = encode_value(value);
    let mut out = String::new();
    let mut line = format!("{}:", key);
    if !value.is_empty() {
        line.push(' ');
    }
    let mut rest = value.as_str();

    while line.chars().count() + rest.chars().count() > LINE_WIDTH {
        let room = LINE_WIDTH.saturating_sub(line.chars().count());
        let breaks = rest
            .char_indices()
            .filter(|(at, c)| {
                *c == ' ' && !rest[..*at].trim().is_empty() && !rest[at + 1..].trim().is_empty()
            });
        let fitting = breaks.clone().filter(|(at, _)| rest[..*at].chars().count() <= room).last();
        let Some((at, _)) = fitting.or_else(|| breaks.clone().next()) else {
            break;
        };
        line.push_str(&rest[..at]);
        out.push_str(&line);
        out.push('\n');
        line = CONTINUATION.to_string();
        rest = &rest[at + 1..];
    }
    line.push_str(rest);
    out.push_str(&line);
    out.push('\n');
    out
}

pub fn serialize_tags<'a, I>(tags: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    tags.into_iter().map(|(k, v)| fold_tag(k, v)).collect()
}

fn encode_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '\r' => out.push_str("%0D"),
            '\n' => out.push_str("%0A"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`encode_value`]. Any other `%` sequence is kept as is.
fn decode_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let escape = rest.get(idx..idx + 3).map(str::to_ascii_uppercase);
        let decoded = match escape.as_deref() {
            Some("%25") => Some('%'),
            Some("%0D") => Some('\r'),
            Some("%0A") => Some('\n'),
            _ => None,
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[idx + 3..];
            }
            None => {
                out.push('%');
                rest = &rest[idx + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parses tag file content.
///
/// A continuation line indented by [`CONTINUATION`] joins its value with
/// one space and keeps the rest verbatim; other indentation is trimmed.
/// Leading whitespace of a value is not kept.
pub fn parse_tags(content: &str, path: &Path) -> Result<Vec<(String, String)>, BagError> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut tags: Vec<(String, String)> = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            let Some((_, value)) = tags.last_mut() else {
                return Err(BagError::MalformedTagFile {
                    path: path.to_path_buf(),
                    line: idx + 1,
                });
            };
            let continued = line
                .strip_prefix(CONTINUATION)
                .unwrap_or_else(|| line.trim_start());
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(continued);
            continue;
        }
        let (key, value) = line.split_once(':').ok_or_else(|| BagError::MalformedTagFile {
            path: path.to_path_buf(),
            line: idx + 1,
        })?;
        tags.push((key.trim().to_string(), value.trim_start().to_string()));
    }
    Ok(tags
        .into_iter()
        .map(|(key, value)| (key, decode_value(&value)))
        .collect())
}

pub fn read_tags(path: &Path) -> Result<Vec<(String, String)>, BagError> {
    let content = std::fs::read_to_string(path).map_err(|e| BagError::io(path, e))?;
    parse_tags(&content, path)
}

/// Writes `content` next to `path` and renames it into place.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), BagError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = std::fs::File::create(&tmp).map_err(|e| BagError::io(&tmp, e))?;
    file.write_all(content).map_err(|e| BagError::io(&tmp, e))?;
    file.sync_all().map_err(|e| BagError::io(&tmp, e))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| BagError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_tag_is_single_line() {
        assert_eq!(fold_tag("Payload-Oxum", "1024.2"), "Payload-Oxum: 1024.2\n");
    }

    #[test]
    fn test_long_tag_is_folded() {
        let value = "word ".repeat(40);
        let folded = fold_tag("External-Description", value.trim());
        let lines: Vec<&str> = folded.lines().collect();

        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| l.chars().count() <= LINE_WIDTH));
        assert!(lines[1..].iter().all(|l| l.starts_with("    ") && !l.starts_with("     ")));

        let parsed = parse_tags(&folded, Path::new("bag-info.txt")).unwrap();
        assert_eq!(parsed, vec![("External-Description".to_string(), value.trim().to_string())]);
    }

    #[test]
    fn test_whitespace_and_line_breaks_round_trip() {
        let value = format!(
            "Line one  with  doubled spaces\nline two 100%0A{}\r\n  indented",
            " spaced ".repeat(12)
        );
        let folded = fold_tag("External-Description", &value);
        assert!(folded.lines().count() > 1);
        assert!(folded.lines().all(|l| l.chars().count() <= LINE_WIDTH));

        let parsed = parse_tags(&folded, Path::new("bag-info.txt")).unwrap();
        assert_eq!(parsed, vec![("External-Description".to_string(), value)]);
    }

    #[test]
    fn test_empty_value_has_no_trailing_space() {
        assert_eq!(fold_tag("Bag-Group-Identifier", ""), "Bag-Group-Identifier:\n");
        let parsed = parse_tags("Bag-Group-Identifier:\n", Path::new("bag-info.txt")).unwrap();
        assert_eq!(parsed[0].1, "");
    }

    #[test]
    fn test_foreign_indentation_is_trimmed() {
        let parsed = parse_tags("Contact-Name: Jane\n\tDoe\n", Path::new("bag-info.txt")).unwrap();
        assert_eq!(parsed[0].1, "Jane Doe");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_tags("BagIt-Version: 0.97\nnot a tag\n", Path::new("bagit.txt")).unwrap_err();
        assert!(matches!(err, BagError::MalformedTagFile { line: 2, .. }));
    }

    #[test]
    fn test_parse_strips_bom() {
        let parsed = parse_tags("\u{feff}BagIt-Version: 0.97\n", Path::new("bagit.txt")).unwrap();
        assert_eq!(parsed[0].0, "BagIt-Version");
    }
}
