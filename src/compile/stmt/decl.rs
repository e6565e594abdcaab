use crate::compile::classify::match_keyword;
use crate::compile::emit::{external_name, Base};
use crate::compile::expr::eval::{const_eval, const_eval_int, evaluate_into};
use crate::compile::expr::parse::{parse_expression, ExprNode};
use crate::compile::symbol::{StmtFuncDef, SymbolClass};
use crate::compile::token::Scanner;
use crate::compile::types::{BaseType, CharLength, DataType, DataValue};
use crate::compile::{Compiler, PendingData, UnitClass, UnitState};
use crate::error::CompileError;

/// Opens a program unit: registers its head symbol and dummy arguments,
/// generates the frame-size and static-area anchors, and emits the
/// prologue (BLOCK DATA units produce no code).
pub fn begin_unit(
    ctx: &mut Compiler,
    class: UnitClass,
    name: &str,
    args: &[String],
    result: Option<DataType>,
) -> Result<(), CompileError> {
    ctx.unit_open = true;
    ctx.unit.name = name.to_string();
    ctx.unit.class = class;
    ctx.unit.frame_label = ctx.labels.generate();
    ctx.unit.static_label = ctx.labels.generate();

    let sym_class = match class {
        UnitClass::Program => SymbolClass::Program,
        UnitClass::Subroutine => SymbolClass::Subroutine,
        UnitClass::Function => SymbolClass::Function,
        UnitClass::BlockData => SymbolClass::BlockData,
    };
    let dtype = match (&result, class) {
        (Some(t), _) => t.clone(),
        (None, UnitClass::Function) => implicit_dtype_for(ctx, name),
        _ => DataType::scalar(BaseType::Undefined),
    };
    if ctx.symbols.register(name, sym_class, dtype).is_none() {
        return Err(CompileError::DoubleDefinition(name.to_string()));
    }

    for (i, arg) in args.iter().enumerate() {
        let dtype = implicit_dtype_for(ctx, arg);
        match ctx.symbols.register(arg, SymbolClass::Argument, dtype) {
            Some(sym) => {
                sym.offset = 2 + i as i64;
                sym.laid_out = true;
            }
            None => return Err(CompileError::DoubleDefinition(arg.clone())),
        }
    }

    if class != UnitClass::BlockData {
        let entry = external_name(name);
        let frame_label = ctx.unit.frame_label.clone();
        ctx.emit
            .prolog(&entry, &frame_label, class == UnitClass::Program);
    }
    ctx.state = UnitState::Implicit;
    log::trace!("unit {} opened", name);
    Ok(())
}

/// Implicit type for a name, never failing: IMPLICIT NONE is diagnosed at
/// reference time, not declaration time.
fn implicit_dtype_for(ctx: &Compiler, name: &str) -> DataType {
    let first = name.as_bytes()[0].to_ascii_uppercase();
    DataType::scalar(ctx.implicit[(first - b'A') as usize])
}

fn take_name(s: &mut Scanner<'_>) -> Result<String, CompileError> {
    s.take_identifier()
        .ok_or(CompileError::ExpressionSyntax("name expected"))
}

fn take_arg_list(s: &mut Scanner<'_>) -> Result<Vec<String>, CompileError> {
    let mut args = Vec::new();
    if s.eat(b'(') {
        if !s.eat(b')') {
            loop {
                args.push(take_name(s)?);
                if s.eat(b',') {
                    continue;
                }
                s.expect(b')', "closing parenthesis")?;
                break;
            }
        }
    }
    Ok(args)
}

pub fn handle_program(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    let name = s.take_identifier().unwrap_or_else(|| "MAIN".to_string());
    begin_unit(ctx, UnitClass::Program, &name, &[], None)
}

pub fn handle_subroutine(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    let name = take_name(s)?;
    let args = take_arg_list(s)?;
    begin_unit(ctx, UnitClass::Subroutine, &name, &args, None)
}

pub fn handle_function(
    ctx: &mut Compiler,
    s: &mut Scanner<'_>,
    base: Option<BaseType>,
    char_len: Option<CharLength>,
) -> Result<(), CompileError> {
    let name = take_name(s)?;
    let args = take_arg_list(s)?;
    let result = base.map(|b| {
        let mut t = DataType::scalar(b);
        if b == BaseType::Character {
            t.len = char_len.unwrap_or(CharLength::Default);
        }
        t
    });
    begin_unit(ctx, UnitClass::Function, &name, &args, result)
}

pub fn handle_block_data(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    let name = s.take_identifier().unwrap_or_else(|| "BLKDAT".to_string());
    begin_unit(ctx, UnitClass::BlockData, &name, &[], None)
}

/// ENTRY emits a second externally visible prologue sharing the unit's
/// frame; the argument list is accepted and recorded only when the names
/// are new.
pub fn handle_entry(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    let name = take_name(s)?;
    let args = take_arg_list(s)?;
    for (i, arg) in args.iter().enumerate() {
        let dtype = implicit_dtype_for(ctx, arg);
        if let Some(sym) = ctx.symbols.register(arg, SymbolClass::Argument, dtype) {
            sym.offset = 2 + i as i64;
            sym.laid_out = true;
        }
    }
    let entry = external_name(&name);
    let frame_label = ctx.unit.frame_label.clone();
    ctx.emit.prolog(&entry, &frame_label, false);
    Ok(())
}

fn letter_index(s: &mut Scanner<'_>) -> Result<usize, CompileError> {
    match s.take_identifier() {
        Some(l) if l.len() == 1 => Ok((l.as_bytes()[0] - b'A') as usize),
        _ => Err(CompileError::ExpressionSyntax("letter expected")),
    }
}

pub fn handle_implicit(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    if match_keyword(s.rest(), "NONE").is_some() {
        ctx.implicit_none = true;
        return Ok(());
    }
    loop {
        let (base, _len, pos) = parse_type_keyword(s.rest())
            .ok_or(CompileError::ExpressionSyntax("type keyword expected"))?;
        s.advance(pos);
        s.expect(b'(', "letter range")?;
        loop {
            let lo = letter_index(s)?;
            let hi = if s.eat(b'-') { letter_index(s)? } else { lo };
            for i in lo..=hi.max(lo) {
                ctx.implicit[i] = base;
            }
            if s.eat(b',') {
                continue;
            }
            s.expect(b')', "closing parenthesis")?;
            break;
        }
        if s.eat(b',') {
            continue;
        }
        break;
    }
    if !s.at_end() {
        return Err(CompileError::UnexpectedToken(s.rest().trim().to_string()));
    }
    Ok(())
}

/// Recognises a type keyword with an optional `*len` at the head of a
/// statement fragment; returns the base type, the character length, and
/// the byte position past what it consumed.
fn parse_type_keyword(text: &str) -> Option<(BaseType, Option<CharLength>, usize)> {
    let table: &[(&str, BaseType)] = &[
        ("DOUBLEPRECISION", BaseType::Double),
        ("INTEGER", BaseType::Integer),
        ("REAL", BaseType::Real),
        ("COMPLEX", BaseType::Complex),
        ("LOGICAL", BaseType::Logical),
        ("CHARACTER", BaseType::Character),
    ];
    for &(kw, base) in table {
        if let Some(pos) = match_keyword(text, kw) {
            let mut s = Scanner::new(&text[pos..]);
            let mut len = None;
            let mut base = base;
            if s.eat(b'*') {
                if s.eat(b'(') {
                    if s.eat(b'*') {
                        len = Some(CharLength::Assumed);
                    }
                    let _ = s.expect(b')', "closing parenthesis");
                } else if let Some(n) = s.take_unsigned() {
                    if base == BaseType::Character {
                        len = Some(CharLength::Literal(n));
                    } else if base == BaseType::Real && n == 8 {
                        base = BaseType::Double;
                    }
                    // other width suffixes describe the one word size the
                    // hardware has anyway
                }
            }
            let consumed = text.len() - s.rest().len();
            return Some((base, len, consumed));
        }
    }
    None
}

/// Dimension bound specification for one name.
enum BoundsSpec {
    None,
    Constant(Vec<(i64, i64)>),
    Adjustable(Vec<(Option<ExprNode>, Option<ExprNode>)>),
}

/// Parses `( d1, d2, ... )` where each `d` is `[lo:]hi`, `hi` possibly
/// `*`. Bounds that do not fold to constants make the array adjustable.
fn parse_bounds(ctx: &Compiler, s: &mut Scanner<'_>) -> Result<BoundsSpec, CompileError> {
    if !s.eat(b'(') {
        return Ok(BoundsSpec::None);
    }
    let mut dims: Vec<(Option<ExprNode>, Option<ExprNode>)> = Vec::new();
    loop {
        let first = if s.eat(b'*') {
            None
        } else {
            Some(parse_expression(s)?)
        };
        if s.eat(b':') {
            let second = if s.eat(b'*') {
                None
            } else {
                Some(parse_expression(s)?)
            };
            dims.push((first, second));
        } else {
            dims.push((None, first));
        }
        if s.eat(b',') {
            continue;
        }
        s.expect(b')', "closing parenthesis")?;
        break;
    }

    let mut constant = Vec::with_capacity(dims.len());
    let mut all_const = true;
    for (lo, hi) in &dims {
        let lo_v = match lo {
            None => Some(1),
            Some(e) => const_eval_int(ctx, e),
        };
        let hi_v = match hi {
            None => None,
            Some(e) => const_eval_int(ctx, e),
        };
        match (lo_v, hi_v) {
            (Some(l), Some(h)) => constant.push((l, h)),
            _ => {
                all_const = false;
                break;
            }
        }
    }
    if all_const {
        Ok(BoundsSpec::Constant(constant))
    } else {
        // normalise: a missing lower bound is the constant one
        let dims = dims
            .into_iter()
            .map(|(lo, hi)| {
                (
                    lo.or_else(|| Some(ExprNode::Const(DataValue::Int(1)))),
                    hi,
                )
            })
            .collect();
        Ok(BoundsSpec::Adjustable(dims))
    }
}

/// Applies a declaration to a (possibly new) symbol: base type, character
/// length, and dimensions. Non-constant dimensions turn a dummy argument
/// into an adjustable array with a dope vector.
fn apply_declaration(
    ctx: &mut Compiler,
    name: &str,
    base: Option<BaseType>,
    len: Option<CharLength>,
    bounds: BoundsSpec,
) -> Result<(), CompileError> {
    if ctx.symbols.find(name).is_none() {
        let dtype = match base {
            Some(b) => DataType::scalar(b),
            None => implicit_dtype_for(ctx, name),
        };
        let class = if ctx.static_locals {
            SymbolClass::Static
        } else {
            SymbolClass::Auto
        };
        ctx.symbols.register(name, class, dtype);
    }

    let arg_offset = {
        let sym = ctx.symbols.find(name).expect("registered above");
        if sym.class == SymbolClass::Argument {
            Some(sym.offset)
        } else {
            None
        }
    };

    let sym = ctx.symbols.find_mut(name).expect("registered above");
    if let Some(b) = base {
        sym.dtype.base = b;
    }
    if let Some(l) = len {
        sym.dtype.len = l;
    }
    match bounds {
        BoundsSpec::None => {}
        BoundsSpec::Constant(b) => {
            for &(lo, hi) in &b {
                if lo > hi {
                    return Err(CompileError::ExpressionSyntax(
                        "lower bound exceeds upper bound",
                    ));
                }
            }
            sym.dtype.bounds = b;
        }
        BoundsSpec::Adjustable(dims) => {
            if arg_offset.is_none() {
                return Err(CompileError::InvalidReference(name.to_string()));
            }
            sym.dtype.bounds = vec![(1, 1); dims.len()];
            sym.adj_bounds = dims;
            sym.arg_slot = arg_offset;
            sym.class = SymbolClass::Adjustable;
            sym.laid_out = false;
        }
    }
    Ok(())
}

pub fn handle_type_decl(
    ctx: &mut Compiler,
    s: &mut Scanner<'_>,
    base: BaseType,
) -> Result<(), CompileError> {
    // optional statement-wide *len (CHARACTER*8 S, T) or width suffix
    let mut base = base;
    let mut default_len = None;
    if s.eat(b'*') {
        if s.eat(b'(') {
            if s.eat(b'*') {
                default_len = Some(CharLength::Assumed);
            }
            s.expect(b')', "closing parenthesis")?;
        } else if let Some(n) = s.take_unsigned() {
            if base == BaseType::Character {
                default_len = Some(CharLength::Literal(n));
            } else if base == BaseType::Real && n == 8 {
                base = BaseType::Double;
            }
        }
    }

    loop {
        let name = take_name(s)?;
        let mut len = default_len;
        if s.eat(b'*') {
            if let Some(n) = s.take_unsigned() {
                len = Some(CharLength::Literal(n));
            } else if s.eat(b'(') {
                if s.eat(b'*') {
                    len = Some(CharLength::Assumed);
                }
                s.expect(b')', "closing parenthesis")?;
            }
        }
        let bounds = parse_bounds(ctx, s)?;
        apply_declaration(ctx, &name, Some(base), len, bounds)?;
        if s.eat(b',') {
            continue;
        }
        break;
    }
    if !s.at_end() {
        return Err(CompileError::UnexpectedToken(s.rest().trim().to_string()));
    }
    Ok(())
}

pub fn handle_dimension(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    loop {
        let name = take_name(s)?;
        let bounds = parse_bounds(ctx, s)?;
        if matches!(bounds, BoundsSpec::None) {
            return Err(CompileError::MissingPunctuation("array bounds"));
        }
        apply_declaration(ctx, &name, None, None, bounds)?;
        if s.eat(b',') {
            continue;
        }
        break;
    }
    Ok(())
}

pub fn handle_common(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    let mut block = String::new();
    loop {
        if s.eat(b'/') {
            block = s.take_identifier().unwrap_or_default();
            s.expect(b'/', "closing slash")?;
        }
        let label = if block.is_empty() {
            external_name("_BLNK")
        } else {
            external_name(&block)
        };
        ctx.commons.declare(&block, label);

        loop {
            let name = take_name(s)?;
            let bounds = parse_bounds(ctx, s)?;
            apply_declaration(ctx, &name, None, None, bounds)?;
            let sym = ctx.symbols.find_mut(&name).expect("declared above");
            if sym.in_common_decl {
                return Err(CompileError::DoubleDefinition(name));
            }
            sym.class = SymbolClass::Global;
            sym.common = Some(block.clone());
            sym.in_common_decl = true;
            if !s.eat(b',') {
                break;
            }
            // a slash after the comma opens the next block
            if s.peek() == Some(b'/') {
                break;
            }
        }
        if s.at_end() {
            return Ok(());
        }
        if s.peek() != Some(b'/') {
            return Err(CompileError::UnexpectedToken(s.rest().trim().to_string()));
        }
    }
}

/// One EQUIVALENCE member: the name plus its element's byte offset from
/// the variable's own start.
fn equivalence_member(
    ctx: &mut Compiler,
    s: &mut Scanner<'_>,
) -> Result<(String, i64), CompileError> {
    let name = take_name(s)?;
    if ctx.symbols.find(&name).is_none() {
        let dtype = implicit_dtype_for(ctx, &name);
        let class = if ctx.static_locals {
            SymbolClass::Static
        } else {
            SymbolClass::Auto
        };
        ctx.symbols.register(&name, class, dtype);
    }

    let mut elem: i64 = 0;
    if s.eat(b'(') {
        let mut subs = Vec::new();
        loop {
            let e = parse_expression(s)?;
            subs.push(
                const_eval_int(ctx, &e)
                    .ok_or(CompileError::ExpressionSyntax("constant subscript expected"))?,
            );
            if s.eat(b',') {
                continue;
            }
            s.expect(b')', "closing parenthesis")?;
            break;
        }
        let sym = ctx.symbols.find(&name).expect("registered above");
        let bounds = sym.dtype.bounds.clone();
        if subs.len() == bounds.len() && !bounds.is_empty() {
            let mut stride = 1i64;
            for (i, &idx) in subs.iter().enumerate() {
                elem += (idx - bounds[i].0) * stride;
                stride *= bounds[i].1 - bounds[i].0 + 1;
            }
        } else if subs.len() == 1 {
            // a single subscript names the element position linearly
            elem = subs[0] - bounds.first().map(|b| b.0).unwrap_or(1);
        } else {
            return Err(CompileError::SubscriptCount(name));
        }
    }

    let sym = ctx.symbols.find(&name).expect("registered above");
    let elem_bytes = if sym.dtype.base == BaseType::Character {
        sym.dtype.len.bytes() as i64
    } else {
        (sym.dtype.base.words_per_element() * 8) as i64
    };
    Ok((name, elem * elem_bytes))
}

pub fn handle_equivalence(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    loop {
        s.expect(b'(', "equivalence group")?;
        let (first, first_off) = equivalence_member(ctx, s)?;
        let mut any = false;
        while s.eat(b',') {
            any = true;
            let (other, other_off) = equivalence_member(ctx, s)?;
            ctx.symbols
                .link_equivalence(&first, first_off, &other, other_off)?;
        }
        s.expect(b')', "closing parenthesis")?;
        if !any {
            return Err(CompileError::InvalidEquivalence(
                "a group needs at least two members",
            ));
        }
        if s.eat(b',') {
            continue;
        }
        break;
    }
    Ok(())
}

fn reclass_list(
    ctx: &mut Compiler,
    s: &mut Scanner<'_>,
    class: SymbolClass,
) -> Result<(), CompileError> {
    loop {
        let name = take_name(s)?;
        match ctx.symbols.find_mut(&name) {
            Some(sym) => sym.class = class,
            None => {
                let dtype = implicit_dtype_for(ctx, &name);
                ctx.symbols.register(&name, class, dtype);
            }
        }
        if s.eat(b',') {
            continue;
        }
        break;
    }
    Ok(())
}

pub fn handle_external(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    reclass_list(ctx, s, SymbolClass::External)
}

pub fn handle_intrinsic(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    reclass_list(ctx, s, SymbolClass::Intrinsic)
}

pub fn handle_parameter(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    s.expect(b'(', "parameter list")?;
    loop {
        let name = take_name(s)?;
        s.expect(b'=', "equals sign")?;
        let expr = parse_expression(s)?;
        let value = const_eval(ctx, &expr)
            .ok_or(CompileError::ExpressionSyntax("constant expression expected"))?;

        let declared = ctx
            .symbols
            .find(&name)
            .map(|sym| sym.dtype.clone())
            .unwrap_or_else(|| implicit_dtype_for(ctx, &name));
        let value = coerce_parameter(&value, declared.base)?;
        match ctx.symbols.find_mut(&name) {
            Some(sym) => {
                sym.class = SymbolClass::Parameter;
                sym.value = Some(value);
            }
            None => {
                let sym = ctx
                    .symbols
                    .register(&name, SymbolClass::Parameter, declared)
                    .expect("fresh name");
                sym.value = Some(value);
            }
        }
        if s.eat(b',') {
            continue;
        }
        s.expect(b')', "closing parenthesis")?;
        break;
    }
    Ok(())
}

fn coerce_parameter(v: &DataValue, want: BaseType) -> Result<DataValue, CompileError> {
    let out = match (v, want) {
        (DataValue::Int(i), BaseType::Real) => DataValue::Real(*i as f64),
        (DataValue::Int(i), BaseType::Double) => DataValue::Double(*i as f64),
        (DataValue::Real(r), BaseType::Integer) => DataValue::Int(r.trunc() as i64),
        (DataValue::Real(r), BaseType::Double) => DataValue::Double(*r),
        (DataValue::Double(d), BaseType::Real) => DataValue::Real(*d),
        _ if v.base_type() == want => v.clone(),
        _ => {
            return Err(CompileError::TypeMismatch {
                op: "PARAMETER",
                left: v.base_type().to_string(),
                right: want.to_string(),
            })
        }
    };
    Ok(out)
}

pub fn handle_pointer(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    loop {
        s.expect(b'(', "pointer pair")?;
        let ptr = take_name(s)?;
        s.expect(b',', "comma")?;
        let pointee = take_name(s)?;
        s.expect(b')', "closing parenthesis")?;

        let class = if ctx.static_locals {
            SymbolClass::Static
        } else {
            SymbolClass::Auto
        };
        match ctx.symbols.find_mut(&ptr) {
            Some(sym) => sym.dtype.base = BaseType::Pointer,
            None => {
                ctx.symbols
                    .register(&ptr, class, DataType::scalar(BaseType::Pointer));
            }
        }
        match ctx.symbols.find_mut(&pointee) {
            Some(sym) => {
                sym.class = SymbolClass::Pointee;
                sym.pointer = Some(ptr.clone());
            }
            None => {
                let dtype = implicit_dtype_for(ctx, &pointee);
                let sym = ctx
                    .symbols
                    .register(&pointee, SymbolClass::Pointee, dtype)
                    .expect("fresh name");
                sym.pointer = Some(ptr.clone());
            }
        }
        if s.eat(b',') {
            continue;
        }
        break;
    }
    Ok(())
}

pub fn handle_save(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    if s.at_end() {
        // blanket SAVE: locals become static from here on, and the ones
        // already declared move over
        ctx.static_locals = true;
        let names = ctx.symbols.names_in_order();
        for name in names {
            if let Some(sym) = ctx.symbols.find_mut(&name) {
                if sym.class == SymbolClass::Auto {
                    sym.class = SymbolClass::Static;
                }
            }
        }
        return Ok(());
    }
    loop {
        if s.eat(b'/') {
            // COMMON blocks are statically allocated already
            let _ = s.take_identifier();
            s.expect(b'/', "closing slash")?;
        } else {
            let name = take_name(s)?;
            match ctx.symbols.find_mut(&name) {
                Some(sym) => {
                    if sym.class == SymbolClass::Auto {
                        sym.class = SymbolClass::Static;
                    }
                    sym.saved = true;
                }
                None => {
                    let dtype = implicit_dtype_for(ctx, &name);
                    let sym = ctx
                        .symbols
                        .register(&name, SymbolClass::Static, dtype)
                        .expect("fresh name");
                    sym.saved = true;
                }
            }
        }
        if s.eat(b',') {
            continue;
        }
        break;
    }
    Ok(())
}

/// A DATA constant: an optionally signed number, logical, character, or
/// named constant.
fn data_constant(ctx: &Compiler, s: &mut Scanner<'_>) -> Result<DataValue, CompileError> {
    let negative = if s.eat(b'-') {
        true
    } else {
        let _ = s.eat(b'+');
        false
    };
    let v = if let Some(v) = s.take_logical_constant() {
        DataValue::Log(v)
    } else if let Some(v) = s.take_number()? {
        v
    } else if let Some(text) = s.take_string()? {
        DataValue::Char(text)
    } else if let Some(name) = s.take_identifier() {
        match ctx.symbols.find(&name).and_then(|sym| sym.value.clone()) {
            Some(v) => v,
            None => return Err(CompileError::InvalidReference(name)),
        }
    } else {
        return Err(CompileError::ExpressionSyntax("constant expected"));
    };
    if negative {
        crate::compile::expr::fold::fold_unary(crate::compile::token::OperatorId::Neg, &v)
    } else {
        Ok(v)
    }
}

/// DATA: records initial values for resolution at END, once the layout
/// passes have produced offsets. Initialising a frame local forces it
/// static.
pub fn handle_data(
    ctx: &mut Compiler,
    s: &mut Scanner<'_>,
    line: u32,
) -> Result<(), CompileError> {
    loop {
        // target list up to the first slash
        let mut targets: Vec<(String, i64, u64)> = Vec::new();
        loop {
            let name = take_name(s)?;
            if ctx.symbols.find(&name).is_none() {
                let dtype = implicit_dtype_for(ctx, &name);
                ctx.symbols.register(&name, SymbolClass::Static, dtype);
            }
            let mut elem: i64 = 0;
            let mut count: u64 = 1;
            if s.eat(b'(') {
                let mut subs = Vec::new();
                loop {
                    let e = parse_expression(s)?;
                    subs.push(const_eval_int(ctx, &e).ok_or(
                        CompileError::ExpressionSyntax("constant subscript expected"),
                    )?);
                    if s.eat(b',') {
                        continue;
                    }
                    s.expect(b')', "closing parenthesis")?;
                    break;
                }
                let sym = ctx.symbols.find(&name).expect("registered above");
                let bounds = sym.dtype.bounds.clone();
                if subs.len() != bounds.len() {
                    return Err(CompileError::SubscriptCount(name));
                }
                let mut stride = 1i64;
                for (i, &idx) in subs.iter().enumerate() {
                    elem += (idx - bounds[i].0) * stride;
                    stride *= bounds[i].1 - bounds[i].0 + 1;
                }
            } else {
                let sym = ctx.symbols.find(&name).expect("registered above");
                count = sym.dtype.element_count();
            }
            {
                let sym = ctx.symbols.find_mut(&name).expect("registered above");
                if sym.class == SymbolClass::Auto {
                    sym.class = SymbolClass::Static;
                }
            }
            targets.push((name, elem, count));
            if s.eat(b',') {
                continue;
            }
            break;
        }

        s.expect(b'/', "value list")?;
        let mut values: Vec<DataValue> = Vec::new();
        loop {
            let first = data_constant(ctx, s)?;
            if s.eat(b'*') {
                let repeat = first
                    .as_i64()
                    .filter(|&r| r > 0)
                    .ok_or(CompileError::ExpressionSyntax("repeat count expected"))?;
                let v = data_constant(ctx, s)?;
                for _ in 0..repeat {
                    values.push(v.clone());
                }
            } else {
                values.push(first);
            }
            if s.eat(b',') {
                continue;
            }
            s.expect(b'/', "closing slash")?;
            break;
        }

        let mut vi = values.into_iter();
        for (name, elem, count) in targets {
            for k in 0..count {
                match vi.next() {
                    Some(value) => ctx.pending_data.push(PendingData {
                        name: name.clone(),
                        elem: elem + k as i64,
                        value,
                        line,
                    }),
                    None => {
                        return Err(CompileError::ExpressionSyntax(
                            "fewer values than list items",
                        ))
                    }
                }
            }
        }
        if vi.next().is_some() {
            return Err(CompileError::ExpressionSyntax("more values than list items"));
        }

        if s.eat(b',') {
            continue;
        }
        break;
    }
    Ok(())
}

/// Defines a statement function captured from an assignment-shaped
/// statement in the specification section.
pub fn define_stmt_function(
    ctx: &mut Compiler,
    name: &str,
    formals: Vec<String>,
    body: ExprNode,
) -> Result<(), CompileError> {
    let dtype = match ctx.symbols.find(name) {
        Some(sym) => sym.dtype.clone(),
        None => implicit_dtype_for(ctx, name),
    };
    for formal in &formals {
        let ftype = match ctx.symbols.find(formal) {
            Some(sym) => sym.dtype.clone(),
            None => implicit_dtype_for(ctx, formal),
        };
        ctx.symbols
            .register_qualified(name, formal, SymbolClass::Argument, ftype);
    }
    let def = StmtFuncDef { formals, body };
    match ctx.symbols.find_mut(name) {
        Some(sym) => {
            sym.class = SymbolClass::StmtFunction;
            sym.stmt_func = Some(def);
            sym.dtype = dtype;
        }
        None => {
            let sym = ctx
                .symbols
                .register(name, SymbolClass::StmtFunction, dtype)
                .expect("fresh name");
            sym.stmt_func = Some(def);
        }
    }
    Ok(())
}

/// At the specification/executable boundary each adjustable array's dope
/// vector is filled: word zero takes the actual argument's address, then
/// one (lower, upper) pair per dimension from the declared bound
/// expressions.
pub fn fill_dope_vectors(ctx: &mut Compiler) -> Result<(), CompileError> {
    let names = ctx.symbols.names_in_order();
    for name in names {
        let (offset, slot, dims) = match ctx.symbols.find(&name) {
            Some(sym) if sym.class == SymbolClass::Adjustable => (
                sym.offset,
                sym.arg_slot
                    .ok_or_else(|| CompileError::InvalidReference(name.clone()))?,
                sym.adj_bounds.clone(),
            ),
            _ => continue,
        };

        let addr = ctx.regs.alloc_s()?;
        ctx.emit
            .load_addr(&mut ctx.regs, addr, &Base::ArgSlot(slot, 0), None)?;
        ctx.emit
            .store_word(&mut ctx.regs, addr, &Base::Frame(offset), None)?;
        ctx.regs.free_s(addr);

        for (i, (lo, hi)) in dims.iter().enumerate() {
            let lo_reg = match lo {
                Some(e) => evaluate_into(ctx, e, BaseType::Integer)?,
                None => evaluate_into(
                    ctx,
                    &ExprNode::Const(DataValue::Int(1)),
                    BaseType::Integer,
                )?,
            };
            ctx.emit.store_word(
                &mut ctx.regs,
                lo_reg,
                &Base::Frame(offset + 1 + 2 * i as i64),
                None,
            )?;
            match hi {
                Some(e) => {
                    let hi_reg = evaluate_into(ctx, e, BaseType::Integer)?;
                    ctx.emit.store_word(
                        &mut ctx.regs,
                        hi_reg,
                        &Base::Frame(offset + 2 + 2 * i as i64),
                        None,
                    )?;
                    ctx.regs.free_s(hi_reg);
                }
                None => {
                    // assumed upper bound: record the lower bound so the
                    // extent reads as one
                    ctx.emit.store_word(
                        &mut ctx.regs,
                        lo_reg,
                        &Base::Frame(offset + 2 + 2 * i as i64),
                        None,
                    )?;
                }
            }
            ctx.regs.free_s(lo_reg);
        }
    }
    Ok(())
}
