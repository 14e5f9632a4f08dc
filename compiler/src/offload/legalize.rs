//! Name legalization for kernel parameter lists
//!
//! Internal IR names may contain `$` and `.`, which cannot appear in a
//! generated parameter list. Legalization maps each name to a legal one and
//! copies its type so later lookups under the new name succeed.

use crate::ir::{is_legal_identifier, TypeMap};
use indexmap::IndexMap;
use std::collections::HashSet;

fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if !out.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        out.insert(0, '_');
    }
    out
}

/// Legalize `names`, returning the old-to-new mapping in input order.
///
/// Already-legal names map to themselves. A sanitized name that would clash
/// with an existing variable or with another result gets a numeric suffix.
pub fn legalize_names<'a>(
    names: impl IntoIterator<Item = &'a str>,
    typemap: &mut TypeMap,
) -> IndexMap<String, String> {
    let names: Vec<&str> = names.into_iter().collect();
    // Legal names claim themselves first so a renamed name never steals one
    let mut taken: HashSet<String> = names
        .iter()
        .filter(|n| is_legal_identifier(n))
        .map(|n| n.to_string())
        .collect();

    let mut mapping = IndexMap::new();
    for name in names {
        if mapping.contains_key(name) {
            continue;
        }
        if is_legal_identifier(name) {
            mapping.insert(name.to_string(), name.to_string());
            continue;
        }

        let base = sanitize(name);
        let mut candidate = base.clone();
        let mut suffix = 1;
        while taken.contains(&candidate) || typemap.contains(&candidate) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        taken.insert(candidate.clone());

        if let Some(ty) = typemap.get(name).cloned() {
            typemap.insert(candidate.clone(), ty);
        }
        log::trace!("legalized {} -> {}", name, candidate);
        mapping.insert(name.to_string(), candidate);
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrType;

    #[test]
    fn test_illegal_names_are_sanitized_and_typed() {
        let mut typemap = TypeMap::new();
        typemap.insert("$parfor_index.12", IrType::i64());
        typemap.insert("a", IrType::f64());

        let map = legalize_names(["$parfor_index.12", "a"], &mut typemap);
        assert_eq!(map["a"], "a");
        let new_name = &map["$parfor_index.12"];
        assert_eq!(new_name, "_parfor_index_12");
        assert_eq!(typemap.get(new_name), Some(&IrType::i64()));
    }

    #[test]
    fn test_collisions_get_suffixes() {
        let mut typemap = TypeMap::new();
        typemap.insert("a_b", IrType::f64());
        typemap.insert("a.b", IrType::i64());
        typemap.insert("a$b", IrType::bool());

        let map = legalize_names(["a.b", "a$b"], &mut typemap);
        assert_eq!(map["a.b"], "a_b_1");
        assert_eq!(map["a$b"], "a_b_2");
        assert_eq!(typemap.get("a_b_1"), Some(&IrType::i64()));
        assert_eq!(typemap.get("a_b"), Some(&IrType::f64()));
    }

    #[test]
    fn test_legalization_is_idempotent() {
        let mut typemap = TypeMap::new();
        typemap.insert("$x.1", IrType::f64());
        typemap.insert("0y", IrType::i64());

        let first = legalize_names(["$x.1", "0y"], &mut typemap);
        let legal: Vec<&str> = first.values().map(String::as_str).collect();
        let second = legalize_names(legal.iter().copied(), &mut typemap);

        for (old, new) in &first {
            assert_eq!(second[new.as_str()], *new);
            assert_eq!(typemap.get(new), typemap.get(old));
        }
    }
}
