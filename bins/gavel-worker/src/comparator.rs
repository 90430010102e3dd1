/// Output Comparator
///
/// Pure matching of actual against expected output. Knows nothing about
/// processes, languages or limits.
///
/// **Modes:**
/// - `Exact`: byte-for-byte
/// - `TrimmedWhitespace`: CRLF folded to LF, each line trimmed, runs of
///   blanks inside a line collapsed to one space, blank lines at either end
///   dropped. Line structure is otherwise kept.
/// - `NumericTolerance(eps)`: whitespace tokens compared pairwise. Equal
///   tokens match; otherwise both must parse as numbers within `eps`.
///   Two integer tokens are compared in integer arithmetic, so large values
///   do not collapse onto the same float. Different token counts never match.
use gavel_common::types::ComparisonMode;

pub fn compare(actual: &[u8], expected: &[u8], mode: ComparisonMode) -> bool {
    match mode {
        ComparisonMode::Exact => actual == expected,
        ComparisonMode::TrimmedWhitespace => {
            normalize_whitespace(actual) == normalize_whitespace(expected)
        }
        ComparisonMode::NumericTolerance { epsilon } => numeric_match(actual, expected, epsilon),
    }
}

/// Canonical form used by `TrimmedWhitespace`.
pub fn normalize_whitespace(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let lines: Vec<String> = text
        .split('\n')
        .map(|line| {
            let words: Vec<&str> =
                line.split([' ', '\t', '\r']).filter(|w| !w.is_empty()).collect();
            words.join(" ")
        })
        .collect();

    let first = lines.iter().position(|l| !l.is_empty());
    let last = lines.iter().rposition(|l| !l.is_empty());
    match (first, last) {
        (Some(first), Some(last)) => lines[first..=last].join("\n"),
        _ => String::new(),
    }
}

fn numeric_match(actual: &[u8], expected: &[u8], epsilon: f64) -> bool {
    let actual = String::from_utf8_lossy(actual);
    let expected = String::from_utf8_lossy(expected);
    let mut actual_tokens = actual.split_ascii_whitespace();
    let mut expected_tokens = expected.split_ascii_whitespace();

    loop {
        match (actual_tokens.next(), expected_tokens.next()) {
            (None, None) => return true,
            (Some(a), Some(e)) => {
                if !tokens_match(a, e, epsilon) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

fn tokens_match(actual: &str, expected: &str, epsilon: f64) -> bool {
    if actual == expected {
        return true;
    }
    // integers compare exactly; f64 loses precision past 2^53
    if let (Some(a), Some(e)) = (parse_integer(actual), parse_integer(expected)) {
        return integers_match(a, e, epsilon);
    }
    match (parse_number(actual), parse_number(expected)) {
        (Some(a), Some(e)) => (a - e).abs() <= epsilon,
        // mixed or non-numeric tokens fall back to exact match
        _ => false,
    }
}

/// Sign and significant digits of an integer token: "-007" is `(true, "7")`.
/// Negative zero comes back as plain zero.
fn parse_integer(token: &str) -> Option<(bool, &str)> {
    let (negative, digits) = match token.as_bytes().first()? {
        b'-' => (true, &token[1..]),
        b'+' => (false, &token[1..]),
        _ => (false, token),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits = digits.trim_start_matches('0');
    Some((negative && !digits.is_empty(), digits))
}

fn integers_match(actual: (bool, &str), expected: (bool, &str), epsilon: f64) -> bool {
    if actual == expected {
        return true;
    }
    match (to_i128(actual), to_i128(expected)) {
        (Some(a), Some(e)) => a.abs_diff(e) as f64 <= epsilon,
        // beyond i128 only identical digits match
        _ => false,
    }
}

fn to_i128((negative, digits): (bool, &str)) -> Option<i128> {
    if digits.is_empty() {
        return Some(0);
    }
    let value: i128 = digits.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Finite decimal numbers only; "nan", "inf" and hex stay textual.
fn parse_number(token: &str) -> Option<f64> {
    let looks_numeric = token
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
    if !looks_numeric {
        return None;
    }
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}
