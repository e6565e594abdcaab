use crate::compile::emit::{Base, CharRef, MemRef};
use crate::compile::expr::fold;
use crate::compile::expr::parse::ExprNode;
use crate::compile::intrinsics::{self, Intrinsic, IntrinsicKind, IntrinsicResult};
use crate::compile::regs::{SReg, S_RESULT};
use crate::compile::symbol::{ShadowBinding, SymbolClass};
use crate::compile::token::OperatorId;
use crate::compile::types::{BaseType, DataType, DataValue};
use crate::compile::Compiler;
use crate::error::CompileError;

pub const MAX_EXPR_STACK: usize = 64;
const MAX_EXPANSION_DEPTH: u32 = 16;

/// Subscript displacement attached to a reference, counted in array
/// elements. A register-held offset owns its register.
#[derive(Clone, Debug)]
pub enum ArgOffset {
    None,
    Constant(i64),
    Register(SReg),
}

/// A value produced during expression evaluation: a compile-time
/// constant, a register-held calculation (which owns its register), a
/// storage reference with an optional subscript offset, or a procedure
/// name passed as an argument.
#[derive(Clone, Debug)]
pub enum OperatorArgument {
    Constant(DataValue),
    Calculation { reg: SReg, ty: BaseType },
    Reference { name: String, offset: ArgOffset },
    ProcedureRef(String),
}

impl OperatorArgument {
    pub fn as_constant(&self) -> Option<&DataValue> {
        match self {
            OperatorArgument::Constant(v) => Some(v),
            _ => None,
        }
    }
}

/// Snapshot of the symbol fields the evaluator needs, copied out so the
/// borrow on the table does not outlive a single lookup.
#[derive(Clone, Debug)]
struct SymView {
    class: SymbolClass,
    dtype: DataType,
    offset: i64,
    common: Option<String>,
    pointer: Option<String>,
}

fn view(ctx: &Compiler, name: &str) -> Option<SymView> {
    ctx.symbols.find(name).map(|s| SymView {
        class: s.class,
        dtype: s.dtype.clone(),
        offset: s.offset,
        common: s.common.clone(),
        pointer: s.pointer.clone(),
    })
}

/// Evaluates a parsed expression tree to a single argument. The walk is
/// infix over the tree; precedence is resolved on the operator stack, and
/// a parenthesised sub-expression is a hard barrier no pop crosses.
pub fn evaluate(ctx: &mut Compiler, node: &ExprNode) -> Result<OperatorArgument, CompileError> {
    push_operator_raw(ctx, OperatorId::Sexpr)?;
    let arg_floor = ctx.arg_stack.len();
    walk(ctx, node)?;
    pop_to_barrier(ctx)?;
    debug_assert_eq!(ctx.arg_stack.len(), arg_floor + 1);
    ctx.arg_stack
        .pop()
        .ok_or(CompileError::ExpressionSyntax("operand expected"))
}

/// Evaluates and materialises into a register of the wanted type.
pub fn evaluate_into(
    ctx: &mut Compiler,
    node: &ExprNode,
    want: BaseType,
) -> Result<SReg, CompileError> {
    let arg = evaluate(ctx, node)?;
    materialize(ctx, arg, want)
}

fn walk(ctx: &mut Compiler, node: &ExprNode) -> Result<(), CompileError> {
    match node {
        ExprNode::Const(v) => push_arg(ctx, OperatorArgument::Constant(v.clone())),
        ExprNode::Paren(inner) => {
            push_operator_raw(ctx, OperatorId::Sexpr)?;
            walk(ctx, inner)?;
            pop_to_barrier(ctx)
        }
        ExprNode::Unary { op, arg } => {
            push_operator(ctx, *op)?;
            walk(ctx, arg)
        }
        ExprNode::Binary { op, left, right } => {
            walk(ctx, left)?;
            push_operator(ctx, *op)?;
            walk(ctx, right)
        }
        ExprNode::Ref { name, args } => {
            let arg = evaluate_reference(ctx, name, args)?;
            push_arg(ctx, arg)
        }
    }
}

fn push_arg(ctx: &mut Compiler, arg: OperatorArgument) -> Result<(), CompileError> {
    if ctx.arg_stack.len() >= MAX_EXPR_STACK {
        return Err(CompileError::StackOverflow("operand"));
    }
    ctx.arg_stack.push(arg);
    Ok(())
}

fn push_operator_raw(ctx: &mut Compiler, op: OperatorId) -> Result<(), CompileError> {
    if ctx.op_stack.len() >= MAX_EXPR_STACK {
        return Err(CompileError::StackOverflow("operator"));
    }
    ctx.op_stack.push(op);
    Ok(())
}

/// Pops and applies every stacked operator that binds at least as tightly
/// as `op`, then pushes `op`. Right-associative and unary operators only
/// yield to strictly tighter ones.
fn push_operator(ctx: &mut Compiler, op: OperatorId) -> Result<(), CompileError> {
    while let Some(&top) = ctx.op_stack.last() {
        if top == OperatorId::Sexpr {
            break;
        }
        let pop = if op.right_associative() || op.is_unary() {
            top.precedence() < op.precedence()
        } else {
            top.precedence() <= op.precedence()
        };
        if !pop {
            break;
        }
        apply_top(ctx)?;
    }
    push_operator_raw(ctx, op)
}

/// Applies stacked operators down to (and removes) the nearest barrier.
fn pop_to_barrier(ctx: &mut Compiler) -> Result<(), CompileError> {
    loop {
        match ctx.op_stack.last() {
            Some(OperatorId::Sexpr) => {
                ctx.op_stack.pop();
                return Ok(());
            }
            Some(_) => apply_top(ctx)?,
            None => return Err(CompileError::ExpressionSyntax("unbalanced expression")),
        }
    }
}

fn apply_top(ctx: &mut Compiler) -> Result<(), CompileError> {
    let op = ctx.op_stack.pop().expect("operator stack underflow");
    if op.is_unary() {
        let arg = ctx
            .arg_stack
            .pop()
            .ok_or(CompileError::ExpressionSyntax("operand expected"))?;
        let result = apply_unary(ctx, op, arg)?;
        push_arg(ctx, result)
    } else {
        let right = ctx
            .arg_stack
            .pop()
            .ok_or(CompileError::ExpressionSyntax("operand expected"))?;
        let left = ctx
            .arg_stack
            .pop()
            .ok_or(CompileError::ExpressionSyntax("operand expected"))?;
        let result = apply_binary(ctx, op, left, right)?;
        push_arg(ctx, result)
    }
}

/// Frees every register an argument owns.
pub fn free_argument(ctx: &mut Compiler, arg: &OperatorArgument) {
    match arg {
        OperatorArgument::Calculation { reg, .. } => ctx.regs.free_s(*reg),
        OperatorArgument::Reference {
            offset: ArgOffset::Register(r),
            ..
        } => ctx.regs.free_s(*r),
        _ => {}
    }
}

/// Drops both stacks after a statement-level error, releasing any
/// registers the abandoned arguments held.
pub fn reset_stacks(ctx: &mut Compiler) {
    let args = std::mem::take(&mut ctx.arg_stack);
    for arg in &args {
        free_argument(ctx, arg);
    }
    ctx.op_stack.clear();
}

pub fn base_type_of(ctx: &Compiler, arg: &OperatorArgument) -> BaseType {
    match arg {
        OperatorArgument::Constant(v) => v.base_type(),
        OperatorArgument::Calculation { ty, .. } => *ty,
        OperatorArgument::Reference { name, .. } => view(ctx, name)
            .map(|v| v.dtype.base)
            .unwrap_or(BaseType::Undefined),
        OperatorArgument::ProcedureRef(_) => BaseType::Undefined,
    }
}

fn char_len_of(ctx: &Compiler, arg: &OperatorArgument) -> u32 {
    match arg {
        OperatorArgument::Constant(DataValue::Char(s)) => s.len() as u32,
        OperatorArgument::Reference { name, .. } => view(ctx, name)
            .map(|v| v.dtype.len.bytes() as u32)
            .unwrap_or(0),
        _ => 0,
    }
}

// --- coercion -------------------------------------------------------

/// The coercion matrix: the result type of a binary operator over the
/// operand types, or a type-mismatch error for illegal pairings. Being an
/// exhaustive match, an unhandled pairing cannot slip through as a stray
/// null the way a dispatch table would allow.
fn binary_result_type(
    op: OperatorId,
    lt: BaseType,
    rt: BaseType,
) -> Result<BaseType, CompileError> {
    use BaseType::*;

    let err = || CompileError::TypeMismatch {
        op: op.text(),
        left: lt.to_string(),
        right: rt.to_string(),
    };

    if op == OperatorId::Concat {
        return match (lt, rt) {
            (Character, Character) => Ok(Character),
            _ => Err(err()),
        };
    }

    if op.is_relational() {
        return match (lt, rt) {
            (Character, Character) => Ok(Logical),
            (Pointer, Pointer) | (Pointer, Integer) | (Integer, Pointer) => Ok(Logical),
            (a, b) if a.is_numeric() && b.is_numeric() && a != Complex && b != Complex => {
                Ok(Logical)
            }
            _ => Err(err()),
        };
    }

    if op.is_logical() {
        return match (lt, rt) {
            (Logical, Logical) => Ok(Logical),
            (Logical, Integer) | (Integer, Logical) | (Integer, Integer) => Ok(Integer),
            _ => Err(err()),
        };
    }

    // arithmetic
    match (lt, rt) {
        (Character, _) | (_, Character) => Err(err()),
        (Logical, _) | (_, Logical) => Err(err()),
        (Pointer, Integer) | (Integer, Pointer)
            if matches!(op, OperatorId::Add | OperatorId::Sub) =>
        {
            Ok(Pointer)
        }
        (Pointer, _) | (_, Pointer) => Err(err()),
        (Complex, a) | (a, Complex) if a.is_numeric() || a == Complex => Ok(Complex),
        (Double, a) | (a, Double) if a.is_numeric() => Ok(Double),
        (Real, a) | (a, Real) if a.is_numeric() => Ok(Real),
        (Integer, Integer) => Ok(Integer),
        _ => Err(err()),
    }
}

/// The operand domain a relational comparison runs in.
fn comparison_domain(lt: BaseType, rt: BaseType) -> BaseType {
    use BaseType::*;
    if lt == Double || rt == Double {
        Double
    } else if lt == Real || rt == Real {
        Real
    } else {
        Integer
    }
}

fn apply_unary(
    ctx: &mut Compiler,
    op: OperatorId,
    arg: OperatorArgument,
) -> Result<OperatorArgument, CompileError> {
    let ty = base_type_of(ctx, &arg);

    if let OperatorArgument::Constant(v) = &arg {
        return Ok(OperatorArgument::Constant(fold::fold_unary(op, v)?));
    }

    match op {
        OperatorId::Plus => Ok(arg),
        OperatorId::Neg => {
            if !ty.is_numeric() || ty == BaseType::Complex {
                return Err(CompileError::TypeMismatch {
                    op: op.text(),
                    left: ty.to_string(),
                    right: String::new(),
                });
            }
            let r = materialize(ctx, arg, ty)?;
            if ty.is_floating() {
                ctx.emit.neg_float(r, r);
            } else {
                ctx.emit.neg_int(r, r);
            }
            Ok(OperatorArgument::Calculation { reg: r, ty })
        }
        OperatorId::Not => {
            let want = if ty == BaseType::Integer {
                BaseType::Integer
            } else {
                BaseType::Logical
            };
            if ty != BaseType::Logical && ty != BaseType::Integer {
                return Err(CompileError::TypeMismatch {
                    op: op.text(),
                    left: ty.to_string(),
                    right: String::new(),
                });
            }
            let r = materialize(ctx, arg, want)?;
            ctx.emit.complement(r, r);
            Ok(OperatorArgument::Calculation { reg: r, ty: want })
        }
        _ => unreachable!("not a unary operator"),
    }
}

fn apply_binary(
    ctx: &mut Compiler,
    op: OperatorId,
    left: OperatorArgument,
    right: OperatorArgument,
) -> Result<OperatorArgument, CompileError> {
    let lt = base_type_of(ctx, &left);
    let rt = base_type_of(ctx, &right);
    let result = binary_result_type(op, lt, rt)?;

    // both constant: fold without emitting a single instruction
    if let (OperatorArgument::Constant(lv), OperatorArgument::Constant(rv)) = (&left, &right) {
        let v = fold::fold_binary(op, result, lv, rv)?;
        return Ok(OperatorArgument::Constant(v));
    }

    if result == BaseType::Complex || (op.is_relational() && lt == BaseType::Complex) {
        return Err(CompileError::TypeMismatch {
            op: op.text(),
            left: lt.to_string(),
            right: rt.to_string(),
        });
    }

    if op == OperatorId::Concat {
        return concat_strings(ctx, left, right);
    }
    if op.is_relational() && lt == BaseType::Character {
        return compare_strings(ctx, op, left, right);
    }
    if op.is_relational() {
        let domain = comparison_domain(lt, rt);
        let a = materialize(ctx, left, domain)?;
        let b = materialize(ctx, right, domain)?;
        let skip = ctx.labels.generate();
        ctx.emit.compare(a, a, b, op, domain.is_floating(), &skip);
        ctx.regs.free_s(b);
        return Ok(OperatorArgument::Calculation {
            reg: a,
            ty: BaseType::Logical,
        });
    }
    if op.is_logical() {
        let a = materialize(ctx, left, result)?;
        let b = materialize(ctx, right, result)?;
        match op {
            OperatorId::And => ctx.emit.and(a, a, b),
            OperatorId::Or => ctx.emit.or(a, a, b),
            OperatorId::Neqv => ctx.emit.xor(a, a, b),
            OperatorId::Eqv => {
                ctx.emit.xor(a, a, b);
                ctx.emit.complement(a, a);
            }
            _ => unreachable!(),
        }
        ctx.regs.free_s(b);
        return Ok(OperatorArgument::Calculation { reg: a, ty: result });
    }

    if op == OperatorId::Pow {
        return apply_power(ctx, result, left, right);
    }

    // plain arithmetic; pointers run in the integer ALU
    let float = result.is_floating();
    let a = materialize(ctx, left, result)?;
    let b = materialize(ctx, right, result)?;
    match op {
        OperatorId::Add => {
            if float {
                ctx.emit.add_float(a, a, b)
            } else {
                ctx.emit.add_int(a, a, b)
            }
        }
        OperatorId::Sub => {
            if float {
                ctx.emit.sub_float(a, a, b)
            } else {
                ctx.emit.sub_int(a, a, b)
            }
        }
        OperatorId::Mul => {
            if float {
                ctx.emit.mul_float(a, a, b)
            } else {
                let mask = ctx.regs.save_mask(&[a, b]);
                ctx.emit.mul_int_call(a, a, b, mask);
            }
        }
        OperatorId::Div => {
            let mask = ctx.regs.save_mask(&[a, b]);
            if float {
                ctx.emit.div_float_call(a, a, b, mask);
            } else {
                ctx.emit.div_int_call(a, a, b, mask);
            }
        }
        _ => unreachable!("not an arithmetic operator"),
    }
    ctx.regs.free_s(b);
    Ok(OperatorArgument::Calculation { reg: a, ty: result })
}

/// `**` with a small constant positive integer exponent unrolls into
/// repeated multiplication; anything else runs through the library `pow`
/// on floating operands, converting the result back for integer bases.
fn apply_power(
    ctx: &mut Compiler,
    result: BaseType,
    left: OperatorArgument,
    right: OperatorArgument,
) -> Result<OperatorArgument, CompileError> {
    if let OperatorArgument::Constant(DataValue::Int(k)) = &right {
        let k = *k;
        if (2..=4).contains(&k) {
            let float = result.is_floating();
            let base = materialize(ctx, left, result)?;
            let acc = ctx.regs.alloc_s()?;
            ctx.emit.move_s(acc, base);
            for _ in 1..k {
                if float {
                    ctx.emit.mul_float(acc, acc, base);
                } else {
                    let mask = ctx.regs.save_mask(&[acc, base]);
                    ctx.emit.mul_int_call(acc, acc, base, mask);
                }
            }
            ctx.regs.free_s(base);
            return Ok(OperatorArgument::Calculation {
                reg: acc,
                ty: result,
            });
        }
    }

    let float_domain = if result == BaseType::Double {
        BaseType::Double
    } else {
        BaseType::Real
    };
    let a = materialize(ctx, left, float_domain)?;
    let b = materialize(ctx, right, float_domain)?;
    let mask = ctx.regs.save_mask(&[a, b]);
    ctx.emit.pow_call(a, a, b, mask);
    ctx.regs.free_s(b);
    if result == BaseType::Integer {
        let mask = ctx.regs.save_mask(&[a]);
        ctx.emit.real_to_int(a, a, mask);
    }
    Ok(OperatorArgument::Calculation {
        reg: a,
        ty: result,
    })
}

fn concat_strings(
    ctx: &mut Compiler,
    left: OperatorArgument,
    right: OperatorArgument,
) -> Result<OperatorArgument, CompileError> {
    let a = descriptor_of(ctx, left)?;
    let b = descriptor_of(ctx, right)?;
    let mask = ctx.regs.save_mask(&[a, b]);
    ctx.emit.concat_str(a, a, b, mask);
    ctx.regs.free_s(b);
    Ok(OperatorArgument::Calculation {
        reg: a,
        ty: BaseType::Character,
    })
}

fn compare_strings(
    ctx: &mut Compiler,
    op: OperatorId,
    left: OperatorArgument,
    right: OperatorArgument,
) -> Result<OperatorArgument, CompileError> {
    let a = descriptor_of(ctx, left)?;
    let b = descriptor_of(ctx, right)?;
    let mask = ctx.regs.save_mask(&[a, b]);
    ctx.emit.compare_str(a, a, b, mask);
    ctx.regs.free_s(b);
    let skip = ctx.labels.generate();
    ctx.emit.compare_with_zero(a, a, op, &skip);
    Ok(OperatorArgument::Calculation {
        reg: a,
        ty: BaseType::Logical,
    })
}

// --- materialisation ------------------------------------------------

fn constant_literal(v: &DataValue) -> String {
    match v {
        DataValue::Log(true) => "<64".to_string(),
        DataValue::Log(false) => "0".to_string(),
        other => other.to_string(),
    }
}

fn coerce_constant(v: &DataValue, want: BaseType) -> Result<DataValue, CompileError> {
    use BaseType::*;
    let out = match (v, want) {
        (DataValue::Int(i), Integer) | (DataValue::Int(i), Pointer) => DataValue::Int(*i),
        (DataValue::Int(i), Real) => DataValue::Real(*i as f64),
        (DataValue::Int(i), Double) => DataValue::Double(*i as f64),
        (DataValue::Real(r), Real) => DataValue::Real(*r),
        (DataValue::Real(r), Double) => DataValue::Double(*r),
        (DataValue::Real(r), Integer) => DataValue::Int(r.trunc() as i64),
        (DataValue::Double(d), Double) => DataValue::Double(*d),
        (DataValue::Double(d), Real) => DataValue::Real(*d),
        (DataValue::Double(d), Integer) => DataValue::Int(d.trunc() as i64),
        (DataValue::Log(b), Logical) => DataValue::Log(*b),
        (DataValue::Log(b), Integer) => DataValue::Int(if *b { -1 } else { 0 }),
        (DataValue::Char(s), Character) => DataValue::Char(s.clone()),
        (DataValue::Complex(re, im), Complex) => DataValue::Complex(*re, *im),
        _ => {
            return Err(CompileError::TypeMismatch {
                op: "=",
                left: v.base_type().to_string(),
                right: want.to_string(),
            })
        }
    };
    Ok(out)
}

/// Converts a register-held value between numeric domains in place.
fn convert_reg(
    ctx: &mut Compiler,
    r: SReg,
    from: BaseType,
    to: BaseType,
) -> Result<(), CompileError> {
    use BaseType::*;
    match (from, to) {
        (a, b) if a == b => {}
        (Real, Double) | (Double, Real) => {}
        (Integer, Pointer) | (Pointer, Integer) => {}
        (Logical, Integer) | (Integer, Logical) => {}
        (Integer, Real) | (Integer, Double) | (Logical, Real) => {
            let mask = ctx.regs.save_mask(&[r]);
            ctx.emit.int_to_real(r, r, mask);
        }
        (Real, Integer) | (Double, Integer) => {
            let mask = ctx.regs.save_mask(&[r]);
            ctx.emit.real_to_int(r, r, mask);
        }
        (a, b) => {
            return Err(CompileError::TypeMismatch {
                op: "=",
                left: a.to_string(),
                right: b.to_string(),
            })
        }
    }
    Ok(())
}

/// Loads an argument into a freshly owned register of the wanted type,
/// consuming the argument. Constants coerce for free; register and
/// storage operands get an explicit conversion when the domains differ.
pub fn materialize(
    ctx: &mut Compiler,
    arg: OperatorArgument,
    want: BaseType,
) -> Result<SReg, CompileError> {
    let from = base_type_of(ctx, &arg);
    match arg {
        OperatorArgument::Constant(v) => {
            let v = coerce_constant(&v, want)?;
            if let DataValue::Char(_) = v {
                return descriptor_of(ctx, OperatorArgument::Constant(v));
            }
            let r = ctx.regs.alloc_s()?;
            ctx.emit.load_imm(r, &constant_literal(&v));
            Ok(r)
        }
        OperatorArgument::Calculation { reg, ty } => {
            convert_reg(ctx, reg, ty, want)?;
            Ok(reg)
        }
        arg @ OperatorArgument::Reference { .. } => {
            if from == BaseType::Character {
                let name = match &arg {
                    OperatorArgument::Reference { name, .. } => name.clone(),
                    _ => unreachable!(),
                };
                free_argument(ctx, &arg);
                return Err(CompileError::InvalidReference(name));
            }
            let place = place_of_argument(ctx, &arg)?;
            let r = ctx.regs.alloc_s()?;
            load_place(ctx, &place, r)?;
            free_place(ctx, place);
            convert_reg(ctx, r, from, want)?;
            Ok(r)
        }
        OperatorArgument::ProcedureRef(name) => Err(CompileError::InvalidReference(name)),
    }
}

// --- storage references ---------------------------------------------

/// A resolved storage location: either a direct base the load/store
/// families handle, or a runtime word address held in a register
/// (adjustable arrays and pointees).
pub enum Place {
    Direct {
        base: Base,
        chr: Option<CharRef>,
        index: Option<SReg>,
    },
    Indirect {
        addr: SReg,
        chr: Option<CharRef>,
        /// The address is already in bytes (a character index was folded
        /// in); word addresses still need the shift.
        in_bytes: bool,
    },
}

pub fn free_place(ctx: &mut Compiler, place: Place) {
    match place {
        Place::Direct { index: Some(r), .. } => ctx.regs.free_s(r),
        Place::Indirect { addr, .. } => ctx.regs.free_s(addr),
        Place::Direct { index: None, .. } => {}
    }
}

fn place_of_argument(ctx: &mut Compiler, arg: &OperatorArgument) -> Result<Place, CompileError> {
    match arg {
        OperatorArgument::Reference { name, offset } => {
            let off = match offset {
                ArgOffset::None => ArgOffset::None,
                ArgOffset::Constant(c) => ArgOffset::Constant(*c),
                ArgOffset::Register(r) => ArgOffset::Register(*r),
            };
            place_of(ctx, name, off)
        }
        _ => Err(CompileError::ExpressionSyntax("reference expected")),
    }
}

/// Resolves a named reference plus element offset into a `Place`,
/// scaling element offsets into words (or bytes for characters) along
/// the way.
pub fn place_of(ctx: &mut Compiler, name: &str, offset: ArgOffset) -> Result<Place, CompileError> {
    let v = view(ctx, name).ok_or_else(|| CompileError::InvalidReference(name.to_string()))?;
    let is_char = v.dtype.base == BaseType::Character;
    let elem_words = v.dtype.base.words_per_element() as i64;
    let len = v.dtype.len.bytes() as i64;

    let const_elems = match offset {
        ArgOffset::Constant(c) => c,
        _ => 0,
    };
    let index = match offset {
        ArgOffset::Register(r) => {
            // scale the element offset into words or bytes
            let k = if is_char { len } else { elem_words };
            mul_const(ctx, r, k)?;
            Some(r)
        }
        _ => None,
    };

    let chr = if is_char {
        Some(CharRef {
            len: len as u32,
            byte_off: v.dtype.first_chr_offset as i64 + const_elems * len,
        })
    } else {
        None
    };
    let word_disp = if is_char { 0 } else { const_elems * elem_words };

    match v.class {
        SymbolClass::Auto | SymbolClass::Function => Ok(Place::Direct {
            base: Base::Frame(v.offset + word_disp),
            chr,
            index,
        }),
        SymbolClass::Static => Ok(Place::Direct {
            base: Base::Label(ctx.unit.static_label.clone(), v.offset + word_disp),
            chr,
            index,
        }),
        SymbolClass::Global => {
            let block = v
                .common
                .as_ref()
                .and_then(|b| ctx.commons.get(b))
                .ok_or_else(|| CompileError::InvalidReference(name.to_string()))?;
            Ok(Place::Direct {
                base: Base::Label(block.label.clone(), v.offset + word_disp),
                chr,
                index,
            })
        }
        SymbolClass::Argument => Ok(Place::Direct {
            base: Base::ArgSlot(v.offset, word_disp),
            chr,
            index,
        }),
        SymbolClass::Adjustable => {
            // the dope vector's first word holds the data's word address
            let addr = ctx.regs.alloc_s()?;
            ctx.emit
                .load_word(&mut ctx.regs, addr, &Base::Frame(v.offset), None)?;
            let in_bytes = combine_address(ctx, addr, word_disp, index, is_char)?;
            Ok(Place::Indirect {
                addr,
                chr,
                in_bytes,
            })
        }
        SymbolClass::Pointee => {
            let ptr = v
                .pointer
                .clone()
                .ok_or_else(|| CompileError::InvalidReference(name.to_string()))?;
            let ptr_place = place_of(ctx, &ptr, ArgOffset::None)?;
            let addr = ctx.regs.alloc_s()?;
            load_place(ctx, &ptr_place, addr)?;
            free_place(ctx, ptr_place);
            let in_bytes = combine_address(ctx, addr, word_disp, index, is_char)?;
            Ok(Place::Indirect {
                addr,
                chr,
                in_bytes,
            })
        }
        _ => Err(CompileError::InvalidReference(name.to_string())),
    }
}

/// Adds a constant word displacement and a register offset onto a word
/// address held in `addr`. A character index is a byte offset, so the
/// address converts to bytes first; the return value says whether that
/// happened.
fn combine_address(
    ctx: &mut Compiler,
    addr: SReg,
    word_disp: i64,
    index: Option<SReg>,
    is_char: bool,
) -> Result<bool, CompileError> {
    if word_disp != 0 {
        let t = materialize_const_int(ctx, word_disp)?;
        ctx.emit.add_int(addr, addr, t);
        ctx.regs.free_s(t);
    }
    if let Some(x) = index {
        if is_char {
            ctx.emit.shift_left(addr, addr, 3);
            ctx.emit.add_int(addr, addr, x);
            ctx.regs.free_s(x);
            return Ok(true);
        }
        ctx.emit.add_int(addr, addr, x);
        ctx.regs.free_s(x);
    }
    Ok(false)
}

pub fn load_place(ctx: &mut Compiler, place: &Place, d: SReg) -> Result<(), CompileError> {
    match place {
        Place::Direct { base, index, .. } => {
            ctx.emit.load_word(&mut ctx.regs, d, base, *index)
        }
        Place::Indirect { addr, .. } => ctx.emit.load_indirect(&mut ctx.regs, d, *addr),
    }
}

pub fn store_place(ctx: &mut Compiler, place: &Place, s: SReg) -> Result<(), CompileError> {
    match place {
        Place::Direct { base, index, .. } => {
            ctx.emit.store_word(&mut ctx.regs, s, base, *index)
        }
        Place::Indirect { addr, .. } => ctx.emit.store_indirect(&mut ctx.regs, s, *addr),
    }
}

/// Materialises the character descriptor (byte address | length<<32) of
/// an argument, consuming it. Character constants go to the literal pool.
pub fn descriptor_of(
    ctx: &mut Compiler,
    arg: OperatorArgument,
) -> Result<SReg, CompileError> {
    match arg {
        OperatorArgument::Constant(DataValue::Char(s)) => {
            let label = ctx.labels.generate();
            ctx.emit.data_string(Some(&label), &s);
            let d = ctx.regs.alloc_s()?;
            let mr = MemRef {
                base: Base::Label(label, 0),
                chr: Some(CharRef {
                    len: s.len() as u32,
                    byte_off: 0,
                }),
            };
            ctx.emit.char_descriptor(&mut ctx.regs, d, &mr, None)?;
            Ok(d)
        }
        OperatorArgument::Calculation { reg, ty } if ty == BaseType::Character => Ok(reg),
        arg @ OperatorArgument::Reference { .. } => {
            let place = place_of_argument(ctx, &arg)?;
            descriptor_of_place(ctx, place)
        }
        other => {
            let ty = base_type_of(ctx, &other);
            free_argument(ctx, &other);
            Err(CompileError::TypeMismatch {
                op: "//",
                left: ty.to_string(),
                right: BaseType::Character.to_string(),
            })
        }
    }
}

pub fn descriptor_of_place(ctx: &mut Compiler, place: Place) -> Result<SReg, CompileError> {
    match place {
        Place::Direct { base, chr, index } => {
            let chr = chr.ok_or(CompileError::ExpressionSyntax("character reference expected"))?;
            let d = ctx.regs.alloc_s()?;
            let mr = MemRef {
                base,
                chr: Some(chr),
            };
            ctx.emit.char_descriptor(&mut ctx.regs, d, &mr, index)?;
            if let Some(x) = index {
                ctx.regs.free_s(x);
            }
            Ok(d)
        }
        Place::Indirect {
            addr,
            chr,
            in_bytes,
        } => {
            let chr = chr.ok_or(CompileError::ExpressionSyntax("character reference expected"))?;
            if !in_bytes {
                ctx.emit.shift_left(addr, addr, 3);
            }
            if chr.byte_off != 0 {
                let t = materialize_const_int(ctx, chr.byte_off)?;
                ctx.emit.add_int(addr, addr, t);
                ctx.regs.free_s(t);
            }
            let t = ctx.regs.alloc_s()?;
            ctx.emit.load_imm(t, &chr.len.to_string());
            ctx.emit.shift_left(t, t, 32);
            ctx.emit.or(addr, addr, t);
            ctx.regs.free_s(t);
            Ok(addr)
        }
    }
}

/// Pure compile-time evaluation of an expression tree, without touching
/// the emitter: constants, named constants, and foldable operators only.
/// Used by the declaration handlers for dimension bounds, EQUIVALENCE
/// subscripts, and DATA repeat counts.
pub fn const_eval(ctx: &Compiler, node: &ExprNode) -> Option<DataValue> {
    match node {
        ExprNode::Const(v) => Some(v.clone()),
        ExprNode::Paren(inner) => const_eval(ctx, inner),
        ExprNode::Unary { op, arg } => {
            let v = const_eval(ctx, arg)?;
            fold::fold_unary(*op, &v).ok()
        }
        ExprNode::Binary { op, left, right } => {
            let l = const_eval(ctx, left)?;
            let r = const_eval(ctx, right)?;
            let result = binary_result_type(*op, l.base_type(), r.base_type()).ok()?;
            fold::fold_binary(*op, result, &l, &r).ok()
        }
        ExprNode::Ref { name, args } if args.is_empty() => {
            let sym = ctx.symbols.find(name)?;
            if sym.class == SymbolClass::Parameter {
                sym.value.clone()
            } else {
                None
            }
        }
        ExprNode::Ref { .. } => None,
    }
}

pub fn const_eval_int(ctx: &Compiler, node: &ExprNode) -> Option<i64> {
    const_eval(ctx, node).and_then(|v| v.as_i64())
}

fn materialize_const_int(ctx: &mut Compiler, v: i64) -> Result<SReg, CompileError> {
    let r = ctx.regs.alloc_s()?;
    ctx.emit.load_imm(r, &v.to_string());
    Ok(r)
}

/// Multiplies a register by a small constant in place: nothing for one,
/// a shift for powers of two, a `%mli` call otherwise.
fn mul_const(ctx: &mut Compiler, r: SReg, k: i64) -> Result<(), CompileError> {
    if k == 1 {
        return Ok(());
    }
    if k > 0 && (k & (k - 1)) == 0 {
        ctx.emit.shift_left(r, r, k.trailing_zeros());
        return Ok(());
    }
    let t = materialize_const_int(ctx, k)?;
    let mask = ctx.regs.save_mask(&[r, t]);
    ctx.emit.mul_int_call(r, r, t, mask);
    ctx.regs.free_s(t);
    Ok(())
}

// --- references, subscripts, calls ----------------------------------

fn implicit_dtype(ctx: &Compiler, name: &str) -> Result<DataType, CompileError> {
    if ctx.implicit_none {
        return Err(CompileError::NoImplicitType(name.to_string()));
    }
    let first = name.as_bytes()[0].to_ascii_uppercase();
    let base = ctx.implicit[(first - b'A') as usize];
    Ok(DataType::scalar(base))
}

fn evaluate_reference(
    ctx: &mut Compiler,
    name: &str,
    args: &[ExprNode],
) -> Result<OperatorArgument, CompileError> {
    // a shadow installed by statement-function expansion wins over the
    // real binding; copy its value so each use owns its own register
    let shadow = ctx.symbols.find(name).and_then(|s| s.shadow.clone());
    if let Some(binding) = shadow {
        if !args.is_empty() {
            return Err(CompileError::InvalidReference(name.to_string()));
        }
        return match binding {
            ShadowBinding::Const(v) => Ok(OperatorArgument::Constant(v)),
            ShadowBinding::Reg(r, ty) => {
                let d = ctx.regs.alloc_s()?;
                ctx.emit.move_s(d, r);
                Ok(OperatorArgument::Calculation { reg: d, ty })
            }
        };
    }

    let existing = view(ctx, name);
    match existing {
        Some(v) => match v.class {
            SymbolClass::Parameter => {
                let value = ctx
                    .symbols
                    .find(name)
                    .and_then(|s| s.value.clone())
                    .ok_or_else(|| CompileError::InvalidReference(name.to_string()))?;
                Ok(OperatorArgument::Constant(value))
            }
            SymbolClass::StmtFunction => expand_stmt_function(ctx, name, args),
            SymbolClass::Intrinsic => {
                let intr = intrinsics::lookup(name)
                    .ok_or_else(|| CompileError::InvalidReference(name.to_string()))?;
                call_intrinsic(ctx, name, intr, args)
            }
            SymbolClass::External | SymbolClass::Subroutine => {
                if args.is_empty() {
                    Ok(OperatorArgument::ProcedureRef(name.to_string()))
                } else {
                    let result = v.dtype.base;
                    call_procedure(ctx, name, args, Some(result))
                        .map(|r| r.expect("function call without result"))
                }
            }
            SymbolClass::Function => {
                if args.is_empty() {
                    // the function's result variable inside its own unit
                    Ok(OperatorArgument::Reference {
                        name: name.to_string(),
                        offset: ArgOffset::None,
                    })
                } else {
                    call_procedure(ctx, name, args, Some(v.dtype.base))
                        .map(|r| r.expect("function call without result"))
                }
            }
            _ if v.class.is_storage() || v.class == SymbolClass::Pointee => {
                if args.is_empty() {
                    Ok(OperatorArgument::Reference {
                        name: name.to_string(),
                        offset: ArgOffset::None,
                    })
                } else if v.dtype.is_array() || v.class == SymbolClass::Adjustable {
                    let offset = subscript_offset(ctx, name, &v, args)?;
                    Ok(OperatorArgument::Reference {
                        name: name.to_string(),
                        offset,
                    })
                } else {
                    Err(CompileError::NotAnArray(name.to_string()))
                }
            }
            _ => Err(CompileError::InvalidReference(name.to_string())),
        },
        None => {
            if !args.is_empty() {
                if let Some(intr) = intrinsics::lookup(name) {
                    return call_intrinsic(ctx, name, intr, args);
                }
                // an undeclared called name acquires external linkage
                let dtype = implicit_dtype(ctx, name)?;
                let result = dtype.base;
                ctx.symbols.register(name, SymbolClass::External, dtype);
                call_procedure(ctx, name, args, Some(result))
                    .map(|r| r.expect("function call without result"))
            } else {
                let dtype = implicit_dtype(ctx, name)?;
                let class = if ctx.static_locals {
                    SymbolClass::Static
                } else {
                    SymbolClass::Auto
                };
                ctx.symbols.register(name, class, dtype);
                // first executable reference after layout: place it late
                if ctx.layout_done {
                    crate::compile::layout::place_late_symbol(ctx, name)?;
                }
                Ok(OperatorArgument::Reference {
                    name: name.to_string(),
                    offset: ArgOffset::None,
                })
            }
        }
    }
}

/// Linear element offset of a subscripted reference. All-constant
/// subscripts fold, get range-checked at compile time, and yield a
/// constant offset; anything else computes into a register with a runtime
/// bounds check against the element count.
fn subscript_offset(
    ctx: &mut Compiler,
    name: &str,
    v: &SymView,
    args: &[ExprNode],
) -> Result<ArgOffset, CompileError> {
    if v.class == SymbolClass::Adjustable {
        return subscript_adjustable(ctx, v, args);
    }

    if args.len() != v.dtype.rank() {
        return Err(CompileError::SubscriptCount(name.to_string()));
    }

    let mut strides = Vec::with_capacity(args.len());
    let mut stride: i64 = 1;
    for &(lo, hi) in &v.dtype.bounds {
        strides.push(stride);
        stride *= hi - lo + 1;
    }

    let mut subs = Vec::with_capacity(args.len());
    for a in args {
        subs.push(evaluate(ctx, a)?);
    }

    if subs.iter().all(|s| s.as_constant().is_some()) {
        let mut off: i64 = 0;
        for (i, s) in subs.iter().enumerate() {
            let idx = s
                .as_constant()
                .and_then(|v| v.as_i64())
                .ok_or(CompileError::ExpressionSyntax("integer subscript expected"))?;
            let (lo, hi) = v.dtype.bounds[i];
            if idx < lo || idx > hi {
                return Err(CompileError::SubscriptRange(idx, name.to_string()));
            }
            off += (idx - lo) * strides[i];
        }
        return Ok(ArgOffset::Constant(off));
    }

    let mut acc: Option<SReg> = None;
    for (i, s) in subs.into_iter().enumerate() {
        let t = materialize(ctx, s, BaseType::Integer)?;
        let (lo, _) = v.dtype.bounds[i];
        if lo != 0 {
            let l = materialize_const_int(ctx, lo)?;
            ctx.emit.sub_int(t, t, l);
            ctx.regs.free_s(l);
        }
        mul_const(ctx, t, strides[i])?;
        match acc {
            None => acc = Some(t),
            Some(a) => {
                ctx.emit.add_int(a, a, t);
                ctx.regs.free_s(t);
            }
        }
    }
    let acc = acc.expect("subscript list cannot be empty");

    let extent = materialize_const_int(ctx, v.dtype.element_count() as i64)?;
    let err_label = ctx.labels.generate();
    let ok_label = ctx.labels.generate();
    ctx.emit.bounds_check(acc, extent, &err_label, &ok_label);
    ctx.regs.free_s(extent);

    Ok(ArgOffset::Register(acc))
}

/// Subscript arithmetic for an adjustable array reads the per-dimension
/// bounds out of the dope vector at run time.
fn subscript_adjustable(
    ctx: &mut Compiler,
    v: &SymView,
    args: &[ExprNode],
) -> Result<ArgOffset, CompileError> {
    let rank = v.dtype.rank();
    if args.len() != rank {
        return Err(CompileError::SubscriptCount("adjustable array".to_string()));
    }

    let mut acc: Option<SReg> = None;
    let mut stride: Option<SReg> = None;
    for (i, a) in args.iter().enumerate() {
        let t = evaluate_into(ctx, a, BaseType::Integer)?;
        let lo = ctx.regs.alloc_s()?;
        ctx.emit.load_word(
            &mut ctx.regs,
            lo,
            &Base::Frame(v.offset + 1 + 2 * i as i64),
            None,
        )?;
        ctx.emit.sub_int(t, t, lo);
        if let Some(s) = stride {
            let mask = ctx.regs.save_mask(&[t, s]);
            ctx.emit.mul_int_call(t, t, s, mask);
        }
        match acc {
            None => acc = Some(t),
            Some(a) => {
                ctx.emit.add_int(a, a, t);
                ctx.regs.free_s(t);
            }
        }
        if i + 1 < rank {
            // extent = upper - lower + 1 feeds the next stride
            let up = ctx.regs.alloc_s()?;
            ctx.emit.load_word(
                &mut ctx.regs,
                up,
                &Base::Frame(v.offset + 2 + 2 * i as i64),
                None,
            )?;
            ctx.emit.sub_int(up, up, lo);
            let one = materialize_const_int(ctx, 1)?;
            ctx.emit.add_int(up, up, one);
            ctx.regs.free_s(one);
            match stride {
                None => stride = Some(up),
                Some(s) => {
                    let mask = ctx.regs.save_mask(&[s, up]);
                    ctx.emit.mul_int_call(s, s, up, mask);
                    ctx.regs.free_s(up);
                }
            }
        }
        ctx.regs.free_s(lo);
    }
    if let Some(s) = stride {
        ctx.regs.free_s(s);
    }
    Ok(ArgOffset::Register(acc.expect("rank checked above")))
}

fn expand_stmt_function(
    ctx: &mut Compiler,
    name: &str,
    args: &[ExprNode],
) -> Result<OperatorArgument, CompileError> {
    if ctx.expand_depth >= MAX_EXPANSION_DEPTH {
        return Err(CompileError::StackOverflow("statement-function expansion"));
    }
    let def = ctx
        .symbols
        .find(name)
        .and_then(|s| s.stmt_func.clone())
        .ok_or_else(|| CompileError::InvalidReference(name.to_string()))?;
    if args.len() != def.formals.len() {
        return Err(CompileError::ArgumentCount(name.to_string()));
    }
    let result_ty = ctx
        .symbols
        .find(name)
        .map(|s| s.dtype.base)
        .unwrap_or(BaseType::Real);

    // bind each actual to its formal's shadow
    let mut owned = Vec::new();
    let mut bound = Vec::new();
    for (formal, actual) in def.formals.iter().zip(args) {
        let arg = evaluate(ctx, actual)?;
        let binding = match arg {
            OperatorArgument::Constant(v) => ShadowBinding::Const(v),
            other => {
                let ty = base_type_of(ctx, &other);
                let r = materialize(ctx, other, ty)?;
                owned.push(r);
                ShadowBinding::Reg(r, ty)
            }
        };
        bound.push(formal.clone());
        let saved = ctx.symbols.qualifier().to_string();
        ctx.symbols.set_qualifier(name);
        let res = ctx.symbols.shadow(formal, binding);
        ctx.symbols.set_qualifier(&saved);
        res?;
    }

    let saved = ctx.symbols.qualifier().to_string();
    ctx.symbols.set_qualifier(name);
    ctx.expand_depth += 1;
    let result = evaluate(ctx, &def.body);
    ctx.expand_depth -= 1;
    for formal in &bound {
        ctx.symbols.remove_shadow(formal);
    }
    ctx.symbols.set_qualifier(&saved);
    for r in owned {
        ctx.regs.free_s(r);
    }

    let result = result?;
    if let OperatorArgument::Constant(v) = &result {
        return Ok(OperatorArgument::Constant(coerce_constant(v, result_ty)?));
    }
    let r = materialize(ctx, result, result_ty)?;
    Ok(OperatorArgument::Calculation {
        reg: r,
        ty: result_ty,
    })
}

/// Emits a call to an external procedure. Arguments pass by reference:
/// plain references pass their address (characters their descriptor);
/// value expressions are pushed to stack temporaries whose addresses are
/// passed instead. Returns the result for function calls.
pub fn call_procedure(
    ctx: &mut Compiler,
    name: &str,
    args: &[ExprNode],
    result: Option<BaseType>,
) -> Result<Option<OperatorArgument>, CompileError> {
    let mut arg_regs: Vec<SReg> = Vec::with_capacity(args.len());
    let mut temp_words: u64 = 0;

    for a in args {
        let arg = evaluate(ctx, a)?;
        let ty = base_type_of(ctx, &arg);
        let r = match arg {
            arg @ OperatorArgument::Reference { .. } if ty == BaseType::Character => {
                descriptor_of(ctx, arg)?
            }
            arg @ OperatorArgument::Constant(DataValue::Char(_)) => descriptor_of(ctx, arg)?,
            OperatorArgument::Reference { ref name, ref offset } => {
                let off = match offset {
                    ArgOffset::None => ArgOffset::None,
                    ArgOffset::Constant(c) => ArgOffset::Constant(*c),
                    ArgOffset::Register(r) => ArgOffset::Register(*r),
                };
                let name = name.clone();
                let place = place_of(ctx, &name, off)?;
                address_of_place(ctx, place)?
            }
            OperatorArgument::ProcedureRef(p) => {
                let d = ctx.regs.alloc_s()?;
                ctx.emit
                    .load_imm(d, &crate::compile::emit::external_name(&p));
                d
            }
            other => {
                // a value expression: spill to a stack temporary and pass
                // the temporary's address
                let v = materialize(ctx, other, ty)?;
                ctx.emit.push_s(v);
                ctx.regs.free_s(v);
                temp_words += 1;
                let d = ctx.regs.alloc_s()?;
                ctx.emit.instr(&d.to_string(), "A7");
                d
            }
        };
        arg_regs.push(r);
    }

    let mask = ctx.regs.save_mask(&arg_regs);
    ctx.emit.save_regs(mask);
    for &r in arg_regs.iter().rev() {
        ctx.emit.push_s(r);
    }
    ctx.emit.call(&crate::compile::emit::external_name(name));
    ctx.emit.drop_stack(arg_regs.len() as u64);
    ctx.emit.restore_regs(mask);
    for r in arg_regs {
        ctx.regs.free_s(r);
    }
    ctx.emit.drop_stack(temp_words);

    match result {
        Some(ty) => {
            let d = ctx.regs.alloc_s()?;
            ctx.emit.move_s(d, S_RESULT);
            Ok(Some(OperatorArgument::Calculation { reg: d, ty }))
        }
        None => Ok(None),
    }
}

/// Word address (or descriptor for characters) of a place, for passing by
/// reference.
pub fn address_of_place(ctx: &mut Compiler, place: Place) -> Result<SReg, CompileError> {
    match place {
        Place::Direct { base, chr, index } => {
            if chr.is_some() {
                return descriptor_of_place(ctx, Place::Direct { base, chr, index });
            }
            let d = ctx.regs.alloc_s()?;
            ctx.emit.load_addr(&mut ctx.regs, d, &base, index)?;
            if let Some(x) = index {
                ctx.regs.free_s(x);
            }
            Ok(d)
        }
        Place::Indirect {
            addr,
            chr,
            in_bytes,
        } => {
            if chr.is_some() {
                return descriptor_of_place(
                    ctx,
                    Place::Indirect {
                        addr,
                        chr,
                        in_bytes,
                    },
                );
            }
            Ok(addr)
        }
    }
}

// --- intrinsics ------------------------------------------------------

fn call_intrinsic(
    ctx: &mut Compiler,
    name: &str,
    intr: &'static Intrinsic,
    args: &[ExprNode],
) -> Result<OperatorArgument, CompileError> {
    if args.len() < intr.min_args as usize || args.len() > intr.max_args as usize {
        return Err(CompileError::ArgumentCount(name.to_string()));
    }

    let mut evaluated = Vec::with_capacity(args.len());
    for a in args {
        evaluated.push(evaluate(ctx, a)?);
    }

    let arg_ty = base_type_of(ctx, &evaluated[0]);
    let result_ty = match intr.result {
        IntrinsicResult::Fixed(b) => b,
        IntrinsicResult::SameAsArg => arg_ty,
    };

    if evaluated.iter().all(|a| a.as_constant().is_some()) {
        if let Some(v) = fold_intrinsic(intr, result_ty, &evaluated) {
            return Ok(OperatorArgument::Constant(v?));
        }
    }

    match intr.kind {
        IntrinsicKind::ToReal => {
            let mut it = evaluated.into_iter();
            let r = materialize(ctx, it.next().unwrap(), BaseType::Real)?;
            Ok(OperatorArgument::Calculation {
                reg: r,
                ty: BaseType::Real,
            })
        }
        IntrinsicKind::ToDouble => {
            let mut it = evaluated.into_iter();
            let r = materialize(ctx, it.next().unwrap(), BaseType::Double)?;
            Ok(OperatorArgument::Calculation {
                reg: r,
                ty: BaseType::Double,
            })
        }
        IntrinsicKind::ToInt => {
            let mut it = evaluated.into_iter();
            let r = materialize(ctx, it.next().unwrap(), BaseType::Integer)?;
            Ok(OperatorArgument::Calculation {
                reg: r,
                ty: BaseType::Integer,
            })
        }
        IntrinsicKind::Abs => {
            let mut it = evaluated.into_iter();
            let r = materialize(ctx, it.next().unwrap(), result_ty)?;
            let skip = ctx.labels.generate();
            ctx.emit.instr("S0", &r.to_string());
            ctx.emit.branch(crate::compile::emit::Cond::Plus, &skip);
            if result_ty.is_floating() {
                ctx.emit.neg_float(r, r);
            } else {
                ctx.emit.neg_int(r, r);
            }
            ctx.emit.place_label(&skip);
            Ok(OperatorArgument::Calculation {
                reg: r,
                ty: result_ty,
            })
        }
        IntrinsicKind::Mod => {
            let mut it = evaluated.into_iter();
            let a = materialize(ctx, it.next().unwrap(), BaseType::Integer)?;
            let b = materialize(ctx, it.next().unwrap(), BaseType::Integer)?;
            let q = ctx.regs.alloc_s()?;
            ctx.emit.move_s(q, a);
            let mask = ctx.regs.save_mask(&[q, b]);
            ctx.emit.div_int_call(q, q, b, mask);
            ctx.emit.mul_int_call(q, q, b, mask);
            ctx.emit.sub_int(a, a, q);
            ctx.regs.free_s(q);
            ctx.regs.free_s(b);
            Ok(OperatorArgument::Calculation {
                reg: a,
                ty: BaseType::Integer,
            })
        }
        IntrinsicKind::Max | IntrinsicKind::Min => {
            let is_max = intr.kind == IntrinsicKind::Max;
            let float = result_ty.is_floating();
            let mut it = evaluated.into_iter();
            let acc = materialize(ctx, it.next().unwrap(), result_ty)?;
            for next in it {
                let b = materialize(ctx, next, result_ty)?;
                let skip = ctx.labels.generate();
                if float {
                    ctx.emit.instr("S0", &format!("{}-F{}", acc, b));
                } else {
                    ctx.emit.instr("S0", &format!("{}-{}", acc, b));
                }
                let keep = if is_max {
                    crate::compile::emit::Cond::Plus
                } else {
                    crate::compile::emit::Cond::Minus
                };
                ctx.emit.branch(keep, &skip);
                ctx.emit.move_s(acc, b);
                ctx.emit.place_label(&skip);
                ctx.regs.free_s(b);
            }
            Ok(OperatorArgument::Calculation {
                reg: acc,
                ty: result_ty,
            })
        }
        IntrinsicKind::Len => {
            let mut it = evaluated.into_iter();
            let arg = it.next().unwrap();
            let known = char_len_of(ctx, &arg);
            if known > 0 {
                free_argument(ctx, &arg);
                return Ok(OperatorArgument::Constant(DataValue::Int(known as i64)));
            }
            let d = descriptor_of(ctx, arg)?;
            ctx.emit.shift_right(d, d, 32);
            Ok(OperatorArgument::Calculation {
                reg: d,
                ty: BaseType::Integer,
            })
        }
        IntrinsicKind::Runtime(target) => {
            let mut regs = Vec::with_capacity(evaluated.len());
            for arg in evaluated {
                let ty = base_type_of(ctx, &arg);
                let r = if ty == BaseType::Character {
                    descriptor_of(ctx, arg)?
                } else if result_ty == BaseType::Character {
                    // CHAR takes its integer argument as a value
                    materialize(ctx, arg, BaseType::Integer)?
                } else if result_ty.is_floating() {
                    materialize(ctx, arg, BaseType::Real)?
                } else {
                    materialize(ctx, arg, ty)?
                };
                regs.push(r);
            }
            let mask = ctx.regs.save_mask(&regs);
            ctx.emit.primitive_call(target, &regs, mask);
            for r in &regs {
                ctx.regs.free_s(*r);
            }
            let d = ctx.regs.alloc_s()?;
            ctx.emit.move_s(d, S_RESULT);
            Ok(OperatorArgument::Calculation {
                reg: d,
                ty: result_ty,
            })
        }
    }
}

/// Constant folding for intrinsic references; `None` means this intrinsic
/// does not fold and must emit.
fn fold_intrinsic(
    intr: &Intrinsic,
    result_ty: BaseType,
    args: &[OperatorArgument],
) -> Option<Result<DataValue, CompileError>> {
    let c = |i: usize| args[i].as_constant().unwrap();
    let f = |i: usize| c(i).as_f64();
    let n = |i: usize| c(i).as_i64();

    let wrap = |v: f64| match result_ty {
        BaseType::Integer => DataValue::Int(v.trunc() as i64),
        BaseType::Double => DataValue::Double(v),
        _ => DataValue::Real(v),
    };

    let out = match intr.kind {
        IntrinsicKind::ToReal => DataValue::Real(f(0)?),
        IntrinsicKind::ToDouble => DataValue::Double(f(0)?),
        IntrinsicKind::ToInt => DataValue::Int(f(0)?.trunc() as i64),
        IntrinsicKind::Abs => match result_ty {
            BaseType::Integer => DataValue::Int(n(0)?.wrapping_abs()),
            _ => wrap(f(0)?.abs()),
        },
        IntrinsicKind::Mod => {
            let (a, b) = (n(0)?, n(1)?);
            if b == 0 {
                return Some(Err(CompileError::ConstantDivZero));
            }
            DataValue::Int(a - (a / b) * b)
        }
        IntrinsicKind::Max | IntrinsicKind::Min => {
            let is_max = intr.kind == IntrinsicKind::Max;
            if result_ty == BaseType::Integer {
                let mut acc = n(0)?;
                for i in 1..args.len() {
                    let v = n(i)?;
                    acc = if is_max { acc.max(v) } else { acc.min(v) };
                }
                DataValue::Int(acc)
            } else {
                let mut acc = f(0)?;
                for i in 1..args.len() {
                    let v = f(i)?;
                    acc = if is_max { acc.max(v) } else { acc.min(v) };
                }
                wrap(acc)
            }
        }
        IntrinsicKind::Len => match c(0) {
            DataValue::Char(s) => DataValue::Int(s.len() as i64),
            _ => return None,
        },
        IntrinsicKind::Runtime(target) => {
            let v = match target {
                "@%sqrt" => f(0)?.sqrt(),
                "@%exp" => f(0)?.exp(),
                "@%log" => f(0)?.ln(),
                "@%log10" => f(0)?.log10(),
                "@%sin" => f(0)?.sin(),
                "@%cos" => f(0)?.cos(),
                "@%tan" => f(0)?.tan(),
                "@%atan" => f(0)?.atan(),
                "@%amod" => {
                    let (a, b) = (f(0)?, f(1)?);
                    if b == 0.0 {
                        return Some(Err(CompileError::ConstantDivZero));
                    }
                    a - (a / b).trunc() * b
                }
                "@%ichar" => match c(0) {
                    DataValue::Char(s) if !s.is_empty() => {
                        return Some(Ok(DataValue::Int(s.as_bytes()[0] as i64)))
                    }
                    _ => return None,
                },
                "@%char" => {
                    let v = n(0)?;
                    if (0..=255).contains(&v) {
                        return Some(Ok(DataValue::Char((v as u8 as char).to_string())));
                    }
                    return None;
                }
                _ => return None,
            };
            wrap(v)
        }
    };
    Some(Ok(out))
}
