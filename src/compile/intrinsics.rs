use crate::compile::types::BaseType;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

/// How an intrinsic produces its result.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IntrinsicKind {
    /// Conversion through `%cif` / `%cfi`.
    ToReal,
    ToInt,
    ToDouble,
    /// Open-coded sign test.
    Abs,
    /// Open-coded `a - (a/b)*b`.
    Mod,
    /// Open-coded pairwise compare chain.
    Max,
    Min,
    /// Character length out of the descriptor.
    Len,
    /// One-argument runtime library call.
    Runtime(&'static str),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IntrinsicResult {
    Fixed(BaseType),
    /// Result type follows the (first) argument.
    SameAsArg,
}

#[derive(Copy, Clone, Debug)]
pub struct Intrinsic {
    pub kind: IntrinsicKind,
    pub result: IntrinsicResult,
    pub min_args: u8,
    pub max_args: u8,
}

const fn fixed(kind: IntrinsicKind, base: BaseType, min: u8, max: u8) -> Intrinsic {
    Intrinsic {
        kind,
        result: IntrinsicResult::Fixed(base),
        min_args: min,
        max_args: max,
    }
}

const fn same(kind: IntrinsicKind, min: u8, max: u8) -> Intrinsic {
    Intrinsic {
        kind,
        result: IntrinsicResult::SameAsArg,
        min_args: min,
        max_args: max,
    }
}

/// The intrinsic-function table, built once at startup and never mutated.
/// Names declared in an INTRINSIC statement resolve here, as do undeclared
/// called names before falling back to external linkage.
pub static INTRINSICS: Lazy<BTreeMap<&'static str, Intrinsic>> = Lazy::new(|| {
    use BaseType::*;
    use IntrinsicKind::*;

    let mut t = BTreeMap::new();

    t.insert("ABS", same(Abs, 1, 1));
    t.insert("IABS", fixed(Abs, Integer, 1, 1));
    t.insert("DABS", fixed(Abs, Double, 1, 1));

    t.insert("MOD", fixed(Mod, Integer, 2, 2));
    t.insert("AMOD", fixed(Runtime("@%amod"), Real, 2, 2));
    t.insert("DMOD", fixed(Runtime("@%amod"), Double, 2, 2));

    t.insert("MAX", same(Max, 2, 63));
    t.insert("MAX0", fixed(Max, Integer, 2, 63));
    t.insert("AMAX1", fixed(Max, Real, 2, 63));
    t.insert("DMAX1", fixed(Max, Double, 2, 63));
    t.insert("MIN", same(Min, 2, 63));
    t.insert("MIN0", fixed(Min, Integer, 2, 63));
    t.insert("AMIN1", fixed(Min, Real, 2, 63));
    t.insert("DMIN1", fixed(Min, Double, 2, 63));

    t.insert("INT", fixed(ToInt, Integer, 1, 1));
    t.insert("IFIX", fixed(ToInt, Integer, 1, 1));
    t.insert("IDINT", fixed(ToInt, Integer, 1, 1));
    t.insert("REAL", fixed(ToReal, Real, 1, 1));
    t.insert("FLOAT", fixed(ToReal, Real, 1, 1));
    t.insert("SNGL", fixed(ToReal, Real, 1, 1));
    t.insert("DBLE", fixed(ToDouble, Double, 1, 1));

    t.insert("SQRT", fixed(Runtime("@%sqrt"), Real, 1, 1));
    t.insert("DSQRT", fixed(Runtime("@%sqrt"), Double, 1, 1));
    t.insert("EXP", fixed(Runtime("@%exp"), Real, 1, 1));
    t.insert("DEXP", fixed(Runtime("@%exp"), Double, 1, 1));
    t.insert("ALOG", fixed(Runtime("@%log"), Real, 1, 1));
    t.insert("DLOG", fixed(Runtime("@%log"), Double, 1, 1));
    t.insert("ALOG10", fixed(Runtime("@%log10"), Real, 1, 1));
    t.insert("SIN", fixed(Runtime("@%sin"), Real, 1, 1));
    t.insert("DSIN", fixed(Runtime("@%sin"), Double, 1, 1));
    t.insert("COS", fixed(Runtime("@%cos"), Real, 1, 1));
    t.insert("DCOS", fixed(Runtime("@%cos"), Double, 1, 1));
    t.insert("TAN", fixed(Runtime("@%tan"), Real, 1, 1));
    t.insert("ATAN", fixed(Runtime("@%atan"), Real, 1, 1));
    t.insert("DATAN", fixed(Runtime("@%atan"), Double, 1, 1));

    t.insert("LEN", fixed(Len, Integer, 1, 1));
    t.insert("ICHAR", fixed(Runtime("@%ichar"), Integer, 1, 1));
    t.insert("CHAR", fixed(Runtime("@%char"), Character, 1, 1));

    t
});

pub fn lookup(name: &str) -> Option<&'static Intrinsic> {
    INTRINSICS.get(name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table_resolves_common_names() {
        assert!(lookup("SQRT").is_some());
        assert!(lookup("IABS").is_some());
        assert!(lookup("NOSUCH").is_none());
    }

    #[test]
    fn generic_abs_follows_its_argument() {
        let abs = lookup("ABS").unwrap();
        assert_eq!(abs.result, IntrinsicResult::SameAsArg);
        let iabs = lookup("IABS").unwrap();
        assert_eq!(iabs.result, IntrinsicResult::Fixed(BaseType::Integer));
    }
}
