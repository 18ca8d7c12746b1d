//! Variable layouts and per-instance variable storage.

use std::collections::HashMap;

use parking_lot::RwLock;
use snafu::{OptionExt, ensure};
use strix_dtype::{HasVarType, VarDecl};

use crate::error::{
    InvalidLayoutSnafu, Result, UnknownVariableSnafu, VariableSizeMismatchSnafu, VariableTypeMismatchSnafu,
};

/// Name of the pseudo-variable covering a whole variable struct.
pub const WHOLE_STRUCT: &str = "<struct>";

/// Field layout of an object type's variable struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableLayout {
    struct_size: usize,
    decls: Vec<VarDecl>,
    by_name: HashMap<String, usize>,
}

impl VariableLayout {
    /// Validate `decls` against a struct of `struct_size` bytes.
    ///
    /// Every field must fit in the struct, names must be unique and fields may not overlap.
    pub fn new(struct_size: usize, decls: Vec<VarDecl>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(decls.len());
        for (index, decl) in decls.iter().enumerate() {
            ensure!(
                decl.end() <= struct_size,
                InvalidLayoutSnafu {
                    reason: format!("`{}` ends at byte {} of a {struct_size}-byte struct", decl.name, decl.end())
                }
            );
            ensure!(
                by_name.insert(decl.name.clone(), index).is_none(),
                InvalidLayoutSnafu { reason: format!("`{}` declared twice", decl.name) }
            );
        }

        let mut sorted: Vec<&VarDecl> = decls.iter().collect();
        sorted.sort_by_key(|decl| decl.offset);
        if let Some(pair) = sorted.windows(2).find(|pair| pair[0].overlaps(pair[1])) {
            return InvalidLayoutSnafu { reason: format!("`{}` overlaps `{}`", pair[0].name, pair[1].name) }.fail();
        }

        Ok(Self { struct_size, decls, by_name })
    }

    /// Layout with no variables.
    pub fn empty() -> Self {
        Self { struct_size: 0, decls: Vec::new(), by_name: HashMap::new() }
    }

    pub fn struct_size(&self) -> usize {
        self.struct_size
    }

    pub fn decls(&self) -> &[VarDecl] {
        &self.decls
    }

    pub fn decl(&self, name: &str) -> Result<&VarDecl> {
        let index = self.by_name.get(name).context(UnknownVariableSnafu { name })?;
        Ok(&self.decls[*index])
    }
}

#[derive(Debug)]
struct VariableState {
    bytes: Vec<u8>,
    version: u64,
}

/// Variable bytes of one object instance.
///
/// Every successful write bumps the version, which SBT records and bounds
/// buffers compare against to detect staleness.
#[derive(Debug)]
pub struct InstanceVariables {
    layout: VariableLayout,
    state: RwLock<VariableState>,
}

impl InstanceVariables {
    /// Zero-filled variables for `layout`.
    pub fn new(layout: VariableLayout) -> Self {
        let bytes = vec![0; layout.struct_size()];
        Self { layout, state: RwLock::new(VariableState { bytes, version: 0 }) }
    }

    pub fn layout(&self) -> &VariableLayout {
        &self.layout
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Current bytes and the version they belong to.
    pub fn snapshot(&self) -> (Vec<u8>, u64) {
        let state = self.state.read();
        (state.bytes.clone(), state.version)
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.state.read().bytes.clone()
    }

    /// Raw bytes of variable `name`.
    pub fn get_raw(&self, name: &str) -> Result<Vec<u8>> {
        let decl = self.layout.decl(name)?;
        Ok(self.state.read().bytes[decl.offset..decl.end()].to_vec())
    }

    /// Overwrite variable `name`. `bytes` must be exactly the declared size.
    pub fn set_raw(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let decl = self.layout.decl(name)?;
        ensure!(
            bytes.len() == decl.size(),
            VariableSizeMismatchSnafu { name, expected: decl.size(), actual: bytes.len() }
        );

        let mut state = self.state.write();
        state.bytes[decl.offset..decl.end()].copy_from_slice(bytes);
        state.version += 1;
        Ok(())
    }

    /// Typed write. The value's type must be accepted by the declaration.
    pub fn set<T: HasVarType>(&self, name: &str, value: &T) -> Result<()> {
        let decl = self.layout.decl(name)?;
        ensure!(
            decl.var_type.accepts(&T::VAR_TYPE),
            VariableTypeMismatchSnafu { name, expected: decl.var_type, actual: T::VAR_TYPE }
        );
        self.set_raw(name, value.var_bytes())
    }

    /// Overwrite the whole variable struct.
    pub fn set_struct(&self, bytes: &[u8]) -> Result<()> {
        let expected = self.layout.struct_size();
        ensure!(
            bytes.len() == expected,
            VariableSizeMismatchSnafu { name: WHOLE_STRUCT, expected, actual: bytes.len() }
        );

        let mut state = self.state.write();
        state.bytes.copy_from_slice(bytes);
        state.version += 1;
        Ok(())
    }
}

/// Objects that carry instance variables.
pub trait HasVariables {
    fn variables(&self) -> &InstanceVariables;

    fn set_variable(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.variables().set_raw(name, bytes)
    }

    fn set<T: HasVarType>(&self, name: &str, value: T) -> Result<()> {
        self.variables().set(name, &value)
    }

    fn set_struct(&self, bytes: &[u8]) -> Result<()> {
        self.variables().set_struct(bytes)
    }
}
