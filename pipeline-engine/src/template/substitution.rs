// Parameter substitution
// Parses `${name}` references in node properties; `$${` yields a literal `${`

use thiserror::Error;

/// Piece of a templated string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Reference(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstitutionError {
    #[error("unterminated parameter reference starting at offset {0}")]
    Unterminated(usize),

    #[error("empty parameter reference at offset {0}")]
    EmptyName(usize),

    #[error("invalid parameter name '{0}'")]
    InvalidName(String),

    /// Every distinct unknown name, in order of first appearance
    #[error("unknown parameter(s): {}", .0.join(", "))]
    Unresolved(Vec<String>),
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Split a string into literal text and parameter references
pub fn parse(input: &str) -> Result<Vec<Segment>, SubstitutionError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = input;
    let mut offset = 0;

    while let Some(pos) = rest.find('$') {
        literal.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("$${") {
            literal.push_str("${");
            rest = &tail[3..];
            offset += pos + 3;
            continue;
        }

        if !tail.starts_with("${") {
            literal.push('$');
            rest = &tail[1..];
            offset += pos + 1;
            continue;
        }

        let start = offset + pos;
        let close = tail.find('}').ok_or(SubstitutionError::Unterminated(start))?;
        let name = tail[2..close].trim();
        if name.is_empty() {
            return Err(SubstitutionError::EmptyName(start));
        }
        if !name.chars().all(is_name_char) {
            return Err(SubstitutionError::InvalidName(name.to_string()));
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Reference(name.to_string()));

        rest = &tail[close + 1..];
        offset += pos + close + 1;
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Names referenced by a string, in order of appearance
pub fn references(input: &str) -> Result<Vec<String>, SubstitutionError> {
    Ok(parse(input)?
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Reference(name) => Some(name),
            Segment::Literal(_) => None,
        })
        .collect())
}

/// Replace every reference using `lookup`
pub fn substitute<'a, F>(input: &str, lookup: F) -> Result<String, SubstitutionError>
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut output = String::with_capacity(input.len());
    let mut missing: Vec<String> = Vec::new();
    for segment in parse(input)? {
        match segment {
            Segment::Literal(text) => output.push_str(&text),
            Segment::Reference(name) => match lookup(&name) {
                Some(value) => output.push_str(value),
                None if !missing.contains(&name) => missing.push(name),
                None => {}
            },
        }
    }
    if !missing.is_empty() {
        return Err(SubstitutionError::Unresolved(missing));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_mixed_segments() {
        let segments = parse("s3://${bucket}/runs/${ date }.csv").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Literal("s3://".to_string()),
                Segment::Reference("bucket".to_string()),
                Segment::Literal("/runs/".to_string()),
                Segment::Reference("date".to_string()),
                Segment::Literal(".csv".to_string()),
            ]
        );
    }

    #[test]
    fn test_escape_and_lone_dollar() {
        let segments = parse("cost $5 and $${literal}").unwrap();
        assert_eq!(
            segments,
            vec![Segment::Literal("cost $5 and ${literal}".to_string())]
        );
    }

    #[test]
    fn test_malformed_references() {
        assert_eq!(parse("x ${open"), Err(SubstitutionError::Unterminated(2)));
        assert_eq!(parse("${}"), Err(SubstitutionError::EmptyName(0)));
        assert_eq!(
            parse("${a b}"),
            Err(SubstitutionError::InvalidName("a b".to_string()))
        );
    }

    #[test]
    fn test_substitute() {
        let params: HashMap<&str, &str> = [("epochs", "10"), ("model.name", "resnet")].into();
        let lookup = |name: &str| params.get(name).copied();

        assert_eq!(
            substitute("--epochs=${epochs} ${model.name}", lookup).unwrap(),
            "--epochs=10 resnet"
        );
        assert_eq!(
            substitute("${missing}", lookup),
            Err(SubstitutionError::Unresolved(vec!["missing".to_string()]))
        );
        assert_eq!(references("${a}${b}${a}").unwrap(), vec!["a", "b", "a"]);
    }

    #[test]
    fn test_every_missing_name_is_reported() {
        let params: HashMap<&str, &str> = [("day", "2024-05-01")].into();
        let err = substitute("${bucket}/${day}/${prefix}-${bucket}", |name| params.get(name).copied())
            .unwrap_err();
        assert_eq!(
            err,
            SubstitutionError::Unresolved(vec!["bucket".to_string(), "prefix".to_string()])
        );
        assert_eq!(err.to_string(), "unknown parameter(s): bucket, prefix");
    }
}
