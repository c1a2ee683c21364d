//! Rule indexing: a discrimination tree over literal `input` patterns.
//!
//! Each rule contributes the equality patterns it places on the input
//! document (`input.method == "GET"` and unification spellings of the
//! same). The tree branches on one input path per level; at query time
//! a single traversal with the concrete input yields the candidate
//! rules that could possibly match. Rules with no pattern on a level
//! follow the wildcard edge, so they are always candidates.
//!
//! Candidates come back in source order: partial rules need the union
//! of all matching definitions, and complete rules must agree anyway.

use crate::ast::{CompareOp, ExprKind, Rule, Term};
use crate::value::Value;
use std::collections::BTreeMap;

/// Index over one rule set (all rules at a single path).
#[derive(Debug, Clone)]
pub struct RuleIndex {
    /// Ordered distinct input paths the tree discriminates on.
    keys: Vec<Vec<String>>,
    root: Node,
    rule_count: usize,
}

#[derive(Debug, Clone, Default)]
struct Node {
    /// Branch per observed literal value at this level's key.
    values: BTreeMap<Value, Node>,
    /// Rules with no pattern on this level's key.
    any: Option<Box<Node>>,
    /// At the last level: matching rule positions.
    rules: Vec<usize>,
}

impl RuleIndex {
    /// Build the index for `rules` (one rule set, source order).
    pub fn build(rules: &[Rule]) -> RuleIndex {
        let patterns: Vec<BTreeMap<Vec<String>, Value>> =
            rules.iter().map(rule_patterns).collect();

        let mut keys: Vec<Vec<String>> = patterns
            .iter()
            .flat_map(|p| p.keys().cloned())
            .collect();
        keys.sort();
        keys.dedup();

        let all: Vec<usize> = (0..rules.len()).collect();
        let root = build_node(&all, &patterns, &keys, 0);

        RuleIndex {
            keys,
            root,
            rule_count: rules.len(),
        }
    }

    /// Candidate rule positions for a concrete input document, in
    /// source order. `None` input matches only pattern-free rules.
    pub fn candidates(&self, input: Option<&Value>) -> Vec<usize> {
        let mut out = Vec::new();
        walk(&self.root, &self.keys, 0, input, &mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Number of rules the index was built over.
    pub fn len(&self) -> usize {
        self.rule_count
    }

    pub fn is_empty(&self) -> bool {
        self.rule_count == 0
    }
}

fn build_node(
    rules: &[usize],
    patterns: &[BTreeMap<Vec<String>, Value>],
    keys: &[Vec<String>],
    level: usize,
) -> Node {
    if level == keys.len() {
        return Node {
            rules: rules.to_vec(),
            ..Node::default()
        };
    }
    let key = &keys[level];
    let mut by_value: BTreeMap<Value, Vec<usize>> = BTreeMap::new();
    let mut rest: Vec<usize> = Vec::new();
    for &idx in rules {
        match patterns[idx].get(key) {
            Some(value) => by_value.entry(value.clone()).or_default().push(idx),
            None => rest.push(idx),
        }
    }
    let values = by_value
        .into_iter()
        .map(|(value, subset)| (value, build_node(&subset, patterns, keys, level + 1)))
        .collect();
    let any = if rest.is_empty() && level + 1 == keys.len() {
        None
    } else {
        Some(Box::new(build_node(&rest, patterns, keys, level + 1)))
    };
    Node {
        values,
        any,
        rules: Vec::new(),
    }
}

fn walk(node: &Node, keys: &[Vec<String>], level: usize, input: Option<&Value>, out: &mut Vec<usize>) {
    if level == keys.len() {
        out.extend_from_slice(&node.rules);
        return;
    }
    if let Some(concrete) = input.and_then(|doc| lookup(doc, &keys[level])) {
        if let Some(child) = node.values.get(concrete) {
            walk(child, keys, level + 1, input, out);
        }
    }
    if let Some(any) = &node.any {
        walk(any, keys, level + 1, input, out);
    }
}

fn lookup<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path {
        current = current.get_key(&Value::String(segment.clone()))?;
    }
    Some(current)
}

/// Literal input patterns of one rule: `input.<path> == scalar` in
/// either operand order, via `==` or `=`, not negated and not under a
/// `with` modifier. Only the first pattern per path counts.
fn rule_patterns(rule: &Rule) -> BTreeMap<Vec<String>, Value> {
    let mut out = BTreeMap::new();
    for expr in &rule.body {
        if expr.negated || !expr.with.is_empty() {
            continue;
        }
        let (a, b) = match &expr.kind {
            ExprKind::Eq(a, b) | ExprKind::Comparison(CompareOp::Eq, a, b) => (a, b),
            _ => continue,
        };
        let pair = static_input_path(a)
            .map(|p| (p, b))
            .or_else(|| static_input_path(b).map(|p| (p, a)));
        if let Some((path, other)) = pair {
            if let Some(value) = other.as_ground() {
                if is_scalar(value) {
                    out.entry(path).or_insert_with(|| value.clone());
                }
            }
        }
    }
    out
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

/// `input.a.b` with all-static string segments.
fn static_input_path(term: &Term) -> Option<Vec<String>> {
    let Term::Ref(parts) = term else {
        return None;
    };
    if parts.first().and_then(Term::as_var) != Some("input") {
        return None;
    }
    let mut path = Vec::new();
    for part in parts.iter().skip(1) {
        match part {
            Term::Value(Value::String(s)) => path.push(s.clone()),
            _ => return None,
        }
    }
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn rules_of(source: &str) -> Vec<Rule> {
        parse_module(source).expect("parse").rules
    }

    fn input(json: &str) -> Value {
        Value::from_json_str(json).expect("json")
    }

    #[test]
    fn test_index_selects_by_literal() {
        let rules = rules_of(
            "package p\n\nallow { input.method == \"GET\" }\nallow { input.method == \"POST\" }\nallow { input.admin == true }\n",
        );
        let index = RuleIndex::build(&rules);

        let get = index.candidates(Some(&input(r#"{"method":"GET"}"#)));
        assert!(get.contains(&0));
        assert!(!get.contains(&1));
        // Rule 2 has no pattern on "method"; wildcard edge keeps it.
        assert!(get.contains(&2));
    }

    #[test]
    fn test_index_no_input() {
        let rules = rules_of(
            "package p\n\nallow { input.method == \"GET\" }\nallow { true }\n",
        );
        let index = RuleIndex::build(&rules);
        let cands = index.candidates(None);
        assert_eq!(cands, vec![1]);
    }

    #[test]
    fn test_index_multiple_keys() {
        let rules = rules_of(
            "package p\n\na { input.m == \"GET\"; input.p == \"/x\" }\na { input.m == \"GET\" }\na { true }\n",
        );
        let index = RuleIndex::build(&rules);
        let cands = index.candidates(Some(&input(r#"{"m":"GET","p":"/y"}"#)));
        assert!(!cands.contains(&0));
        assert!(cands.contains(&1));
        assert!(cands.contains(&2));
    }

    #[test]
    fn test_unification_spelling_counts() {
        let rules = rules_of("package p\n\na { input.user = \"alice\" }\n");
        let index = RuleIndex::build(&rules);
        assert!(index
            .candidates(Some(&input(r#"{"user":"alice"}"#)))
            .contains(&0));
        assert!(index
            .candidates(Some(&input(r#"{"user":"bob"}"#)))
            .is_empty());
    }

    #[test]
    fn test_source_order_preserved() {
        let rules = rules_of("package p\n\na { input.x == 1 }\na { input.x == 1; input.y == 2 }\n");
        let index = RuleIndex::build(&rules);
        let cands = index.candidates(Some(&input(r#"{"x":1,"y":2}"#)));
        assert_eq!(cands, vec![0, 1]);
    }
}
