use crate::VarType;

/// A named field of an object's variable struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarDecl {
    pub name: String,
    pub var_type: VarType,
    /// Byte offset of the field inside the variable struct.
    pub offset: usize,
}

impl VarDecl {
    pub fn new(name: impl Into<String>, var_type: VarType, offset: usize) -> Self {
        Self { name: name.into(), var_type, offset }
    }

    pub fn size(&self) -> usize {
        self.var_type.bytes()
    }

    /// One past the last byte occupied by this field.
    pub fn end(&self) -> usize {
        self.offset + self.size()
    }

    pub fn overlaps(&self, other: &VarDecl) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}
