//! IR Type System
//!
//! Types are attached to variables by name through a [`TypeMap`]. Arrays carry
//! their rank and an optional address space; the address space is only filled
//! in on kernel parameter types handed to a device backend.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Bool,
    I32,
    I64,
    /// Pointer-sized unsigned integer (index arithmetic)
    Uintp,
    F32,
    F64,
}

impl ScalarType {
    /// Size in bytes of one element of this type.
    pub fn byte_size(self) -> usize {
        match self {
            ScalarType::Bool => 1,
            ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::I64 | ScalarType::Uintp | ScalarType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, ScalarType::I32 | ScalarType::I64 | ScalarType::Uintp)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::Bool => "bool",
            ScalarType::I32 => "int32",
            ScalarType::I64 => "int64",
            ScalarType::Uintp => "uintp",
            ScalarType::F32 => "float32",
            ScalarType::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Memory address space of a kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressSpace {
    Private,
    Global,
    Constant,
    Local,
    Generic,
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressSpace::Private => "private",
            AddressSpace::Global => "global",
            AddressSpace::Constant => "constant",
            AddressSpace::Local => "local",
            AddressSpace::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// N-dimensional array type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayType {
    pub dtype: ScalarType,
    pub ndim: usize,
    pub addrspace: Option<AddressSpace>,
}

impl ArrayType {
    pub fn new(dtype: ScalarType, ndim: usize) -> Self {
        Self {
            dtype,
            ndim,
            addrspace: None,
        }
    }

    /// Same array type placed in the given address space.
    pub fn in_addrspace(self, addrspace: AddressSpace) -> Self {
        Self {
            addrspace: Some(addrspace),
            ..self
        }
    }
}

/// IR type representation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IrType {
    /// No value
    None,

    /// Scalar value
    Scalar(ScalarType),

    /// Strided n-dimensional array
    Array(ArrayType),
}

impl IrType {
    pub fn f64() -> Self {
        IrType::Scalar(ScalarType::F64)
    }

    pub fn i64() -> Self {
        IrType::Scalar(ScalarType::I64)
    }

    pub fn uintp() -> Self {
        IrType::Scalar(ScalarType::Uintp)
    }

    pub fn bool() -> Self {
        IrType::Scalar(ScalarType::Bool)
    }

    pub fn array(dtype: ScalarType, ndim: usize) -> Self {
        IrType::Array(ArrayType::new(dtype, ndim))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, IrType::Array(_))
    }

    pub fn as_array(&self) -> Option<&ArrayType> {
        match self {
            IrType::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Collapse a 0-d array to its element type; every other type is returned as is.
    pub fn scalar_from_0d(&self) -> IrType {
        match self {
            IrType::Array(arr) if arr.ndim == 0 => IrType::Scalar(arr.dtype),
            other => other.clone(),
        }
    }

    /// Element type for scalars and arrays.
    pub fn element_type(&self) -> Option<ScalarType> {
        match self {
            IrType::Scalar(s) => Some(*s),
            IrType::Array(arr) => Some(arr.dtype),
            IrType::None => None,
        }
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::None => write!(f, "none"),
            IrType::Scalar(s) => write!(f, "{}", s),
            IrType::Array(arr) => {
                write!(f, "array({}, {}d", arr.dtype, arr.ndim)?;
                if let Some(space) = arr.addrspace {
                    write!(f, ", {}", space)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Mapping from variable name to inferred type.
///
/// Insertion order is preserved so dumps stay stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMap {
    entries: IndexMap<String, IrType>,
}

impl TypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, ty: IrType) -> Option<IrType> {
        self.entries.insert(name.into(), ty)
    }

    pub fn get(&self, name: &str) -> Option<&IrType> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<IrType> {
        self.entries.shift_remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &IrType)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, IrType)> for TypeMap {
    fn from_iter<I: IntoIterator<Item = (String, IrType)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_from_0d() {
        let zero_d = IrType::array(ScalarType::F32, 0);
        assert_eq!(zero_d.scalar_from_0d(), IrType::Scalar(ScalarType::F32));

        let one_d = IrType::array(ScalarType::F32, 1);
        assert_eq!(one_d.scalar_from_0d(), one_d);
    }

    #[test]
    fn test_type_display() {
        let ty = IrType::Array(ArrayType::new(ScalarType::F64, 2).in_addrspace(AddressSpace::Global));
        assert_eq!(ty.to_string(), "array(float64, 2d, global)");
        assert_eq!(IrType::i64().to_string(), "int64");
    }

    #[test]
    fn test_typemap_keeps_insertion_order() {
        let mut map = TypeMap::new();
        map.insert("b", IrType::f64());
        map.insert("a", IrType::i64());
        let names: Vec<_> = map.names().collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(map.remove("b"), Some(IrType::f64()));
        assert_eq!(map.len(), 1);
    }
}
