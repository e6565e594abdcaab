use crate::compile::expr::parse::ExprNode;
use crate::compile::regs::SReg;
use crate::compile::types::{BaseType, DataType, DataValue};
use std::fmt;

/// Storage and linkage classification of a symbol. Program-unit heads,
/// callable names, and storage classes share one namespace per unit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SymbolClass {
    Program,
    Subroutine,
    Function,
    BlockData,
    StmtFunction,
    Intrinsic,
    External,
    Auto,
    Static,
    Adjustable,
    Global,
    Argument,
    Parameter,
    Pointee,
}

impl SymbolClass {
    pub fn is_unit_head(self) -> bool {
        matches!(
            self,
            SymbolClass::Program
                | SymbolClass::Subroutine
                | SymbolClass::Function
                | SymbolClass::BlockData
        )
    }

    pub fn is_storage(self) -> bool {
        matches!(
            self,
            SymbolClass::Auto
                | SymbolClass::Static
                | SymbolClass::Adjustable
                | SymbolClass::Global
                | SymbolClass::Argument
                | SymbolClass::Function
        )
    }
}

impl fmt::Display for SymbolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = match self {
            SymbolClass::Program => "PROGRAM",
            SymbolClass::Subroutine => "SUBROUTINE",
            SymbolClass::Function => "FUNCTION",
            SymbolClass::BlockData => "BLOCK DATA",
            SymbolClass::StmtFunction => "STMT FUNC",
            SymbolClass::Intrinsic => "INTRINSIC",
            SymbolClass::External => "EXTERNAL",
            SymbolClass::Auto => "AUTO",
            SymbolClass::Static => "STATIC",
            SymbolClass::Adjustable => "ADJUSTABLE",
            SymbolClass::Global => "COMMON",
            SymbolClass::Argument => "ARGUMENT",
            SymbolClass::Parameter => "PARAMETER",
            SymbolClass::Pointee => "POINTEE",
        };
        write!(f, "{}", t)
    }
}

/// Statement-function definition captured at declaration time: formal
/// names plus the unevaluated right-hand-side tree. Expansion shadows the
/// formals with the actual arguments and walks the tree in place.
#[derive(Clone, Debug)]
pub struct StmtFuncDef {
    pub formals: Vec<String>,
    pub body: ExprNode,
}

/// Value a shadow symbol is bound to during statement-function expansion.
#[derive(Clone, Debug)]
pub enum ShadowBinding {
    Const(DataValue),
    Reg(SReg, BaseType),
}

#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    pub class: SymbolClass,
    pub dtype: DataType,
    /// Class-dependent placement: negative frame words for Auto and
    /// Function results, positive static words for Static, words within
    /// the block for Global, positive frame words for Argument.
    pub offset: i64,
    /// COMMON block this symbol is bound to (Global class).
    pub common: Option<String>,
    /// Declared in a COMMON statement, so the block cursor places it.
    pub in_common_decl: bool,
    /// Constant value (Parameter class).
    pub value: Option<DataValue>,
    /// The pointer variable this Pointee is accessed through.
    pub pointer: Option<String>,
    pub stmt_func: Option<StmtFuncDef>,
    /// Declared bound expressions of an adjustable array, one pair per
    /// dimension; `None` for an assumed upper bound (`*`).
    pub adj_bounds: Vec<(Option<ExprNode>, Option<ExprNode>)>,
    /// For an adjustable array, the argument slot whose word feeds the
    /// dope vector's base address.
    pub arg_slot: Option<i64>,
    /// Index into the unit's equivalence chains.
    pub equiv: Option<usize>,
    pub saved: bool,
    pub laid_out: bool,
    pub is_deleted: bool,
    pub shadow: Option<ShadowBinding>,
}

impl Symbol {
    pub fn new(name: &str, class: SymbolClass, dtype: DataType) -> Symbol {
        Symbol {
            name: name.to_string(),
            class,
            dtype,
            offset: 0,
            common: None,
            in_common_decl: false,
            value: None,
            pointer: None,
            stmt_func: None,
            adj_bounds: Vec::new(),
            arg_slot: None,
            equiv: None,
            saved: false,
            laid_out: false,
            is_deleted: false,
            shadow: None,
        }
    }

    /// Size in 64-bit words as the layout passes see it. Adjustable arrays
    /// contribute their dope vector; non-storage classes occupy nothing.
    pub fn size_words(&self) -> u64 {
        match self.class {
            SymbolClass::Adjustable => (self.dtype.rank() as u64) * 2 + 1,
            SymbolClass::Argument => 1,
            c if c.is_storage() => self.dtype.size_words(),
            _ => 0,
        }
    }
}
