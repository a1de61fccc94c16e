//! Feature request expressions: `NAME(arg,...);NAME(arg,...)`.

use std::fmt;
use std::str::FromStr;

use crate::error::{FeatureError, FeatureResult};

const CLAUSE_SEPARATOR: char = ';';

/// One parsed `NAME(arg0,arg1,...)` clause.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FeatureCall {
    pub name: String,
    pub args: Vec<String>,
}

impl FeatureCall {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        args: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Output column identifier: the clause with `(` and `,` turned into `_`
    /// and `)` dropped, e.g. `ATR(3,close,high,low)` -> `ATR_3_close_high_low`.
    pub fn column_name(&self) -> String {
        let mut name = String::with_capacity(self.name.len() + 16);
        name.push_str(&self.name);
        name.push('_');
        name.push_str(&self.args.join("_"));
        name
    }
}

impl fmt::Display for FeatureCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args.join(","))
    }
}

impl FromStr for FeatureCall {
    type Err = FeatureError;

    fn from_str(clause: &str) -> Result<Self, Self::Err> {
        parse_clause(clause)
    }
}

/// Parse a full request. Empty clauses are skipped; any malformed clause
/// fails the whole request.
pub fn parse_feature_expr(expr: &str) -> FeatureResult<Vec<FeatureCall>> {
    expr.split(CLAUSE_SEPARATOR)
        .filter(|clause| !clause.trim().is_empty())
        .map(parse_clause)
        .collect()
}

fn strip_whitespace(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

fn parse_clause(raw: &str) -> FeatureResult<FeatureCall> {
    let clause = raw.trim();
    let open = clause
        .find('(')
        .ok_or_else(|| FeatureError::parse(clause, "missing '('"))?;
    let close = clause
        .rfind(')')
        .ok_or_else(|| FeatureError::parse(clause, "missing matching ')'"))?;
    if close < open {
        return Err(FeatureError::parse(clause, "')' appears before '('"));
    }
    if !clause[close + 1..].trim().is_empty() {
        return Err(FeatureError::parse(
            clause,
            "unexpected text after closing ')'",
        ));
    }

    let name = strip_whitespace(&clause[..open]);
    if name.is_empty() {
        return Err(FeatureError::parse(clause, "empty indicator name"));
    }

    let body = &clause[open + 1..close];
    if body.contains(['(', ')']) {
        return Err(FeatureError::parse(clause, "nested parentheses"));
    }

    let body = strip_whitespace(body);
    let args = if body.is_empty() {
        Vec::new()
    } else {
        let parts: Vec<String> = body.split(',').map(str::to_string).collect();
        if parts.iter().any(|arg| arg.is_empty()) {
            return Err(FeatureError::parse(clause, "empty argument"));
        }
        parts
    };

    Ok(FeatureCall { name, args })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_clauses_with_canonical_names() {
        let calls = parse_feature_expr("SMA(20,close);ATR(3,close,high,low)").unwrap();
        assert_eq!(
            calls,
            vec![
                FeatureCall::new("SMA", ["20", "close"]),
                FeatureCall::new("ATR", ["3", "close", "high", "low"]),
            ]
        );
        assert_eq!(calls[0].column_name(), "SMA_20_close");
        assert_eq!(calls[1].column_name(), "ATR_3_close_high_low");
    }

    #[test]
    fn whitespace_and_trailing_separators_are_ignored() {
        let calls = parse_feature_expr("  BBANDS ( 20, 1.8 ,1, close ) ;; ").unwrap();
        assert_eq!(
            calls,
            vec![FeatureCall::new("BBANDS", ["20", "1.8", "1", "close"])]
        );
        assert_eq!(calls[0].column_name(), "BBANDS_20_1.8_1_close");
    }

    #[test]
    fn empty_expression_yields_no_calls() {
        assert!(parse_feature_expr("").unwrap().is_empty());
        assert!(parse_feature_expr(" ; ").unwrap().is_empty());
    }

    #[test]
    fn duplicates_are_kept_in_request_order() {
        let calls = parse_feature_expr("SMA(5,close);SMA(5,close)").unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
    }

    #[test]
    fn malformed_clauses_fail_the_whole_request() {
        for bad in [
            "SMA(20,close",
            "SMA 20,close)",
            "(20,close)",
            "SMA(20,close)x",
            "SMA(20,,close)",
            "SMA((20),close)",
        ] {
            let expr = format!("ATR(3,close,high,low);{bad}");
            let err = parse_feature_expr(&expr).unwrap_err();
            match err {
                FeatureError::Parse { clause, .. } => assert_eq!(clause, bad),
                other => panic!("expected parse error for {bad}, got {other:?}"),
            }
        }
    }

    #[test]
    fn display_round_trips_through_the_parser() {
        let parsed = parse_feature_expr(" VOLUME_LOG_MA( 12 , volume )").unwrap();
        let call = &parsed[0];
        let reparsed: FeatureCall = call.to_string().parse().unwrap();
        assert_eq!(&reparsed, call);
        assert_eq!(reparsed.column_name(), "VOLUME_LOG_MA_12_volume");
    }
}
