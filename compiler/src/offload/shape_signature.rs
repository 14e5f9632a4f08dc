//! Generalized-ufunc style shape signatures for kernel arguments
//!
//! Every argument gets a tuple of symbolic letters, one per array dimension;
//! dimensions sharing a shape-rank class share a letter. A `sched`
//! pseudo-argument is prepended with a class larger than any real one.

use crate::ir::{IrType, TypeMap};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Class that always receives a fresh letter
const UNCONSTRAINED_CLASS: i64 = -1;

/// Symbolic shape signature: `(a),(a),(b)->(a)`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShapeSignature {
    pub inputs: Vec<Vec<String>>,
    pub outputs: Vec<Vec<String>>,
}

impl ShapeSignature {
    /// Letters of the `sched` pseudo-argument.
    pub fn sched(&self) -> Option<&[String]> {
        self.inputs.first().map(Vec::as_slice)
    }
}

/// Letters `a..z`, `A..Z`, then the same pool again with a round suffix
/// (`a1`, `b1`, ...), so every class name stays distinct.
struct ClassNames {
    next: usize,
}

impl ClassNames {
    const POOL: &'static [u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

    fn fresh(&mut self) -> String {
        let k = self.next;
        self.next += 1;
        let letter = char::from(Self::POOL[k % Self::POOL.len()]);
        match k / Self::POOL.len() {
            0 => letter.to_string(),
            round => format!("{}{}", letter, round),
        }
    }
}

fn write_group(f: &mut fmt::Formatter<'_>, group: &[Vec<String>]) -> fmt::Result {
    for (i, letters) in group.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "(")?;
        for (j, c) in letters.iter().enumerate() {
            if j > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, ")")?;
    }
    Ok(())
}

impl fmt::Display for ShapeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_group(f, &self.inputs)?;
        write!(f, "->")?;
        write_group(f, &self.outputs)
    }
}

/// Build the signature for `args` (kernel order; the first `num_inputs`
/// are inputs).
///
/// `shape_classes` holds the analysis-provided classes per array; arrays
/// missing from it get classes of their own. `races` are forced into the
/// unconstrained class, which never shares a letter.
pub fn build_shape_signature(
    args: &[String],
    num_inputs: usize,
    typemap: &TypeMap,
    shape_classes: &BTreeMap<String, Vec<i64>>,
    races: &BTreeSet<String>,
) -> ShapeSignature {
    let known_max = shape_classes
        .values()
        .flatten()
        .copied()
        .filter(|&c| c >= 0)
        .max();
    let mut next_class = known_max.map_or(0, |m| m + 1);

    let mut classes: Vec<Vec<i64>> = Vec::with_capacity(args.len() + 1);
    for arg in args {
        if races.contains(arg) {
            classes.push(vec![UNCONSTRAINED_CLASS]);
            continue;
        }
        let ndim = match typemap.get(arg).map(IrType::scalar_from_0d) {
            Some(IrType::Array(arr)) => arr.ndim,
            _ => 0,
        };
        match shape_classes.get(arg) {
            Some(c) if c.len() == ndim => classes.push(c.clone()),
            _ => {
                let fresh = (0..ndim as i64).map(|k| next_class + k).collect();
                next_class += ndim as i64;
                classes.push(fresh);
            }
        }
    }

    let class_set: BTreeSet<i64> = classes.iter().flatten().copied().collect();
    let sched_class = class_set.iter().next_back().map_or(0, |&m| m.max(UNCONSTRAINED_CLASS) + 1);
    classes.insert(0, vec![sched_class]);

    let mut letters = ClassNames { next: 0 };
    let mut class_map: BTreeMap<i64, String> = BTreeMap::new();
    for &class in class_set.iter().chain(std::iter::once(&sched_class)) {
        if class >= 0 && !class_map.contains_key(&class) {
            class_map.insert(class, letters.fresh());
        }
    }

    let mut signature = ShapeSignature::default();
    for (position, arg_classes) in classes.iter().enumerate() {
        let arg_letters: Vec<String> = arg_classes
            .iter()
            .map(|&c| match class_map.get(&c) {
                Some(name) if c >= 0 => name.clone(),
                _ => letters.fresh(),
            })
            .collect();
        // Position 0 is `sched`, always an input
        if position <= num_inputs {
            signature.inputs.push(arg_letters);
        } else {
            signature.outputs.push(arg_letters);
        }
    }
    signature
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ScalarType;

    fn typemap() -> TypeMap {
        let mut map = TypeMap::new();
        map.insert("a", IrType::array(ScalarType::F64, 1));
        map.insert("b", IrType::array(ScalarType::F64, 1));
        map.insert("m", IrType::array(ScalarType::F64, 2));
        map.insert("n", IrType::i64());
        map.insert("acc", IrType::array(ScalarType::F64, 1));
        map
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_shared_classes_share_letters() {
        let mut classes = BTreeMap::new();
        classes.insert("a".to_string(), vec![0]);
        classes.insert("b".to_string(), vec![0]);
        let sig = build_shape_signature(&names(&["a", "n", "b"]), 2, &typemap(), &classes, &BTreeSet::new());
        assert_eq!(sig.to_string(), "(b),(a),()->(a)");
        assert_eq!(sig.sched(), Some(&["b".to_string()][..]));
    }

    #[test]
    fn test_races_get_fresh_letters() {
        let mut classes = BTreeMap::new();
        classes.insert("a".to_string(), vec![0]);
        classes.insert("m".to_string(), vec![0, 1]);
        let races: BTreeSet<String> = ["acc".to_string()].into_iter().collect();
        let sig = build_shape_signature(&names(&["a", "acc", "m"]), 2, &typemap(), &classes, &races);
        // classes 0,1 -> a,b; sched 2 -> c; race takes the next unused letter
        assert_eq!(sig.to_string(), "(c),(a),(d)->(a,b)");
    }

    #[test]
    fn test_unknown_arrays_get_own_classes() {
        let sig = build_shape_signature(&names(&["a", "b"]), 1, &typemap(), &BTreeMap::new(), &BTreeSet::new());
        assert_eq!(sig.to_string(), "(c),(a)->(b)");
    }

    #[test]
    fn test_names_stay_distinct_past_the_alphabet() {
        let mut map = TypeMap::new();
        let args: Vec<String> = (0..60).map(|i| format!("x{}", i)).collect();
        for arg in &args {
            map.insert(arg.as_str(), IrType::array(ScalarType::F64, 1));
        }
        let sig = build_shape_signature(&args, args.len(), &map, &BTreeMap::new(), &BTreeSet::new());

        let names: Vec<&String> = sig.inputs.iter().flatten().collect();
        let unique: BTreeSet<&String> = names.iter().copied().collect();
        assert_eq!(names.len(), 61);
        assert_eq!(unique.len(), 61);
        assert_eq!(sig.inputs[52][0], "Z");
        assert_eq!(sig.inputs[53][0], "a1");
        // sched takes the class after the 60 arrays
        assert_eq!(sig.sched().map(|s| s[0].as_str()), Some("i1"));
    }
}
