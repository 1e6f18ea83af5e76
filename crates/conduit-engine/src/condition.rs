use crate::{Context, NodeOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Clause<'a> {
    key: &'a str,
    operator: Operator,
    literal: &'a str,
}

/// Checks syntax only. Graph validation reports the error text as a
/// diagnostic so that evaluation never has to.
pub fn validate_condition_expression(condition: &str) -> Result<(), String> {
    parse_clauses(condition).map(|_| ())
}

/// Evaluates `Clause ('&&' Clause)*` against an outcome and a context.
/// Empty expressions are true; malformed ones are false.
pub fn evaluate_condition(condition: &str, outcome: &NodeOutcome, context: &Context) -> bool {
    let Ok(clauses) = parse_clauses(condition) else {
        return false;
    };
    clauses.iter().all(|clause| {
        let matched = clause_matches(clause, outcome, context);
        match clause.operator {
            Operator::Eq => matched,
            Operator::Ne => !matched,
        }
    })
}

fn parse_clauses(condition: &str) -> Result<Vec<Clause<'_>>, String> {
    let condition = condition.trim();
    if condition.is_empty() {
        return Ok(Vec::new());
    }

    let mut clauses = Vec::new();
    for raw_clause in condition.split("&&") {
        let clause = raw_clause.trim();
        if clause.is_empty() {
            return Err(format!("condition '{}' contains an empty clause", condition));
        }
        clauses.push(parse_clause(clause)?);
    }
    Ok(clauses)
}

fn parse_clause(clause: &str) -> Result<Clause<'_>, String> {
    let (key, operator, literal) = if let Some((left, right)) = clause.split_once("!=") {
        (left, Operator::Ne, right)
    } else if let Some((left, right)) = clause.split_once('=') {
        (left, Operator::Eq, right)
    } else {
        return Err(format!(
            "condition clause '{}' is missing an '=' or '!=' operator",
            clause
        ));
    };

    let key = key.trim();
    let literal = literal.trim();
    if key.is_empty() {
        return Err(format!("condition clause '{}' has empty key", clause));
    }
    if !is_condition_key(key) {
        return Err(format!("condition key '{}' is invalid", key));
    }
    if literal.starts_with('=') {
        return Err(format!(
            "condition clause '{}' uses an unsupported operator",
            clause
        ));
    }
    if literal.is_empty() {
        return Err(format!("condition clause '{}' has empty value", clause));
    }
    if literal.starts_with('"') && (literal.len() < 2 || !literal.ends_with('"')) {
        return Err(format!(
            "condition clause '{}' has an unterminated quoted value",
            clause
        ));
    }

    Ok(Clause {
        key,
        operator,
        literal,
    })
}

fn is_condition_key(key: &str) -> bool {
    if key == "outcome" || key == "preferred_label" {
        return true;
    }
    let Some(suffix) = key.strip_prefix("context.") else {
        return false;
    };
    let mut chars = suffix.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.')
}

fn clause_matches(clause: &Clause<'_>, outcome: &NodeOutcome, context: &Context) -> bool {
    let expected = unquote(clause.literal);
    match clause.key {
        "outcome" => outcome.status.as_str().eq_ignore_ascii_case(expected),
        "preferred_label" => outcome.preferred_label.as_deref().unwrap_or("").trim() == expected,
        key => {
            let name = key.strip_prefix("context.").unwrap_or(key);
            let actual = if context.get(name).is_some() {
                context.get_string(name)
            } else {
                context.get_string(key)
            };
            actual == expected
        }
    }
}

fn unquote(literal: &str) -> &str {
    literal
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(literal)
}
