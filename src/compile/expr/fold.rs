use crate::compile::token::OperatorId;
use crate::compile::types::{BaseType, DataValue};
use crate::error::CompileError;

/// Compile-time application of an operator to constant operands. The
/// result type has already been chosen by the coercion rules; both
/// operands are converted into that domain before the arithmetic runs, so
/// integer expressions stay bit-exact and floating expressions match the
/// hardware's 64-bit arithmetic.
pub fn fold_binary(
    op: OperatorId,
    result: BaseType,
    left: &DataValue,
    right: &DataValue,
) -> Result<DataValue, CompileError> {
    use OperatorId::*;

    if op.is_relational() {
        return fold_relational(op, left, right);
    }

    match result {
        BaseType::Integer => {
            let (a, b) = match (left.as_i64(), right.as_i64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(type_mismatch(op, left, right)),
            };
            let v = match op {
                Add => a.wrapping_add(b),
                Sub => a.wrapping_sub(b),
                Mul => a.wrapping_mul(b),
                Div => {
                    if b == 0 {
                        return Err(CompileError::ConstantDivZero);
                    }
                    a.wrapping_div(b)
                }
                Pow => int_pow(a, b),
                And => a & b,
                Or => a | b,
                Neqv => a ^ b,
                Eqv => !(a ^ b),
                _ => return Err(type_mismatch(op, left, right)),
            };
            Ok(DataValue::Int(v))
        }
        BaseType::Real | BaseType::Double => {
            let (a, b) = match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(type_mismatch(op, left, right)),
            };
            let v = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div => {
                    if b == 0.0 {
                        return Err(CompileError::ConstantDivZero);
                    }
                    a / b
                }
                Pow => a.powf(b),
                _ => return Err(type_mismatch(op, left, right)),
            };
            if result == BaseType::Double {
                Ok(DataValue::Double(v))
            } else {
                Ok(DataValue::Real(v))
            }
        }
        BaseType::Complex => {
            let (ar, ai) = complex_parts(left).ok_or_else(|| type_mismatch(op, left, right))?;
            let (br, bi) = complex_parts(right).ok_or_else(|| type_mismatch(op, left, right))?;
            let v = match op {
                Add => (ar + br, ai + bi),
                Sub => (ar - br, ai - bi),
                Mul => (ar * br - ai * bi, ar * bi + ai * br),
                Div => {
                    let den = br * br + bi * bi;
                    if den == 0.0 {
                        return Err(CompileError::ConstantDivZero);
                    }
                    ((ar * br + ai * bi) / den, (ai * br - ar * bi) / den)
                }
                _ => return Err(type_mismatch(op, left, right)),
            };
            Ok(DataValue::Complex(v.0, v.1))
        }
        BaseType::Logical => {
            let (a, b) = match (left, right) {
                (DataValue::Log(a), DataValue::Log(b)) => (*a, *b),
                _ => return Err(type_mismatch(op, left, right)),
            };
            let v = match op {
                And => a && b,
                Or => a || b,
                Eqv => a == b,
                Neqv => a != b,
                _ => return Err(type_mismatch(op, left, right)),
            };
            Ok(DataValue::Log(v))
        }
        BaseType::Character => match (op, left, right) {
            (Concat, DataValue::Char(a), DataValue::Char(b)) => {
                Ok(DataValue::Char(format!("{}{}", a, b)))
            }
            _ => Err(type_mismatch(op, left, right)),
        },
        _ => Err(type_mismatch(op, left, right)),
    }
}

pub fn fold_unary(op: OperatorId, v: &DataValue) -> Result<DataValue, CompileError> {
    match (op, v) {
        (OperatorId::Plus, _) => Ok(v.clone()),
        (OperatorId::Neg, DataValue::Int(i)) => Ok(DataValue::Int(i.wrapping_neg())),
        (OperatorId::Neg, DataValue::Real(r)) => Ok(DataValue::Real(-r)),
        (OperatorId::Neg, DataValue::Double(d)) => Ok(DataValue::Double(-d)),
        (OperatorId::Neg, DataValue::Complex(re, im)) => Ok(DataValue::Complex(-re, -im)),
        (OperatorId::Not, DataValue::Log(b)) => Ok(DataValue::Log(!b)),
        (OperatorId::Not, DataValue::Int(i)) => Ok(DataValue::Int(!i)),
        _ => Err(CompileError::TypeMismatch {
            op: op.text(),
            left: v.base_type().to_string(),
            right: String::new(),
        }),
    }
}

fn fold_relational(
    op: OperatorId,
    left: &DataValue,
    right: &DataValue,
) -> Result<DataValue, CompileError> {
    use std::cmp::Ordering;

    let ord = match (left, right) {
        (DataValue::Char(a), DataValue::Char(b)) => Some(compare_padded(a, b)),
        (DataValue::Int(a), DataValue::Int(b)) => Some(a.cmp(b)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => return Err(type_mismatch(op, left, right)),
        },
    };
    let ord = match ord {
        Some(o) => o,
        None => return Err(type_mismatch(op, left, right)),
    };
    let v = match op {
        OperatorId::Eq => ord == Ordering::Equal,
        OperatorId::Ne => ord != Ordering::Equal,
        OperatorId::Lt => ord == Ordering::Less,
        OperatorId::Le => ord != Ordering::Greater,
        OperatorId::Gt => ord == Ordering::Greater,
        OperatorId::Ge => ord != Ordering::Less,
        _ => unreachable!(),
    };
    Ok(DataValue::Log(v))
}

/// FORTRAN character comparison pads the shorter operand with blanks.
fn compare_padded(a: &str, b: &str) -> std::cmp::Ordering {
    let n = a.len().max(b.len());
    let ab = a.as_bytes();
    let bb = b.as_bytes();
    for i in 0..n {
        let ca = ab.get(i).copied().unwrap_or(b' ');
        let cb = bb.get(i).copied().unwrap_or(b' ');
        match ca.cmp(&cb) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

fn int_pow(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        // integer division semantics: only unit bases survive
        return match base {
            1 => 1,
            -1 => {
                if exp % 2 == 0 {
                    1
                } else {
                    -1
                }
            }
            _ => 0,
        };
    }
    let mut acc: i64 = 1;
    for _ in 0..exp {
        acc = acc.wrapping_mul(base);
    }
    acc
}

fn complex_parts(v: &DataValue) -> Option<(f64, f64)> {
    match *v {
        DataValue::Complex(re, im) => Some((re, im)),
        _ => v.as_f64().map(|f| (f, 0.0)),
    }
}

fn type_mismatch(op: OperatorId, left: &DataValue, right: &DataValue) -> CompileError {
    CompileError::TypeMismatch {
        op: op.text(),
        left: left.base_type().to_string(),
        right: right.base_type().to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn integer_arithmetic_is_bit_exact() {
        let v = fold_binary(
            OperatorId::Mul,
            BaseType::Integer,
            &DataValue::Int(3),
            &DataValue::Int(4),
        )
        .unwrap();
        assert_eq!(v, DataValue::Int(12));
        let v = fold_binary(
            OperatorId::Pow,
            BaseType::Integer,
            &DataValue::Int(2),
            &DataValue::Int(10),
        )
        .unwrap();
        assert_eq!(v, DataValue::Int(1024));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(matches!(
            fold_binary(
                OperatorId::Div,
                BaseType::Integer,
                &DataValue::Int(1),
                &DataValue::Int(0),
            ),
            Err(CompileError::ConstantDivZero)
        ));
        assert!(fold_binary(
            OperatorId::Div,
            BaseType::Real,
            &DataValue::Real(1.0),
            &DataValue::Real(0.0),
        )
        .is_err());
    }

    #[test]
    fn negative_integer_exponents_truncate() {
        assert_eq!(int_pow(2, -1), 0);
        assert_eq!(int_pow(1, -5), 1);
        assert_eq!(int_pow(-1, -3), -1);
    }

    #[test]
    fn mixed_comparison_goes_floating() {
        let v = fold_relational(OperatorId::Lt, &DataValue::Int(1), &DataValue::Real(1.5)).unwrap();
        assert_eq!(v, DataValue::Log(true));
    }

    #[test]
    fn character_comparison_pads_with_blanks() {
        let v = fold_relational(
            OperatorId::Eq,
            &DataValue::Char("AB".into()),
            &DataValue::Char("AB  ".into()),
        )
        .unwrap();
        assert_eq!(v, DataValue::Log(true));
        let v = fold_relational(
            OperatorId::Lt,
            &DataValue::Char("AB".into()),
            &DataValue::Char("AC".into()),
        )
        .unwrap();
        assert_eq!(v, DataValue::Log(true));
    }

    #[test]
    fn concat_folds() {
        let v = fold_binary(
            OperatorId::Concat,
            BaseType::Character,
            &DataValue::Char("AB".into()),
            &DataValue::Char("CD".into()),
        )
        .unwrap();
        assert_eq!(v, DataValue::Char("ABCD".into()));
    }

    #[test]
    fn complex_multiply() {
        let v = fold_binary(
            OperatorId::Mul,
            BaseType::Complex,
            &DataValue::Complex(1.0, 2.0),
            &DataValue::Complex(3.0, 4.0),
        )
        .unwrap();
        assert_eq!(v, DataValue::Complex(-5.0, 10.0));
    }
}
