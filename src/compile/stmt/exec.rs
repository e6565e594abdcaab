use crate::compile::expr::eval::{
    self, descriptor_of, evaluate, free_argument, materialize, place_of, ArgOffset,
    OperatorArgument,
};
use crate::compile::expr::parse::{parse_expression, ExprNode};
use crate::compile::regs::{SReg, S_RESULT};
use crate::compile::symbol::SymbolClass;
use crate::compile::token::Scanner;
use crate::compile::types::{BaseType, DataValue};
use crate::compile::{ensure_executable, Compiler, UnitClass, UnitState};
use crate::error::CompileError;

/// An assignment-shaped statement. In the specification section a
/// left-hand side of the form `name(i1, i2, ...)` over bare identifiers
/// defines a statement function; everything else closes the
/// specification section and assigns.
pub fn handle_assignment(ctx: &mut Compiler, text: &str) -> Result<(), CompileError> {
    let mut s = Scanner::new(text);
    let name = s
        .take_identifier()
        .ok_or(CompileError::ExpressionSyntax("assignment target expected"))?;

    let mut args: Vec<ExprNode> = Vec::new();
    if s.eat(b'(') {
        loop {
            args.push(parse_expression(&mut s)?);
            if s.eat(b',') {
                continue;
            }
            s.expect(b')', "closing parenthesis")?;
            break;
        }
    }
    s.expect(b'=', "equals sign")?;

    if ctx.state < UnitState::Executable && is_stmt_func_head(ctx, &name, &args) {
        let formals = args
            .iter()
            .map(|a| match a {
                ExprNode::Ref { name, args } if args.is_empty() => Ok(name.clone()),
                _ => Err(CompileError::ExpressionSyntax("formal name expected")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let body = parse_expression(&mut s)?;
        if !s.at_end() {
            return Err(CompileError::UnexpectedToken(s.rest().trim().to_string()));
        }
        return super::decl::define_stmt_function(ctx, &name, formals, body);
    }

    ensure_executable(ctx)?;

    let rhs_tree = parse_expression(&mut s)?;
    if !s.at_end() {
        return Err(CompileError::UnexpectedToken(s.rest().trim().to_string()));
    }

    let target = evaluate(ctx, &ExprNode::Ref {
        name: name.clone(),
        args,
    })?;
    let rhs = evaluate(ctx, &rhs_tree)?;
    assign(ctx, target, rhs)
}

/// A statement-function head needs parenthesised bare identifiers and a
/// name that is not already an array or a dummy argument.
fn is_stmt_func_head(ctx: &Compiler, name: &str, args: &[ExprNode]) -> bool {
    if args.is_empty() {
        return false;
    }
    if !args
        .iter()
        .all(|a| matches!(a, ExprNode::Ref { name: _, args } if args.is_empty()))
    {
        return false;
    }
    match ctx.symbols.find(name) {
        None => true,
        Some(sym) => {
            !sym.dtype.is_array()
                && matches!(
                    sym.class,
                    SymbolClass::Auto | SymbolClass::Static | SymbolClass::StmtFunction
                )
        }
    }
}

/// Stores an evaluated value into an evaluated target reference.
/// Character targets copy through `@_cpystr`; numeric targets get a
/// converted register store; complex targets take constant values only.
pub fn assign(
    ctx: &mut Compiler,
    target: OperatorArgument,
    rhs: OperatorArgument,
) -> Result<(), CompileError> {
    let (name, offset) = match target {
        OperatorArgument::Reference { name, offset } => (name, offset),
        other => {
            free_argument(ctx, &other);
            free_argument(ctx, &rhs);
            return Err(CompileError::ExpressionSyntax("assignment target expected"));
        }
    };
    let tbase = ctx
        .symbols
        .find(&name)
        .map(|sym| sym.dtype.base)
        .unwrap_or(BaseType::Undefined);

    if tbase == BaseType::Character {
        let rbase = eval::base_type_of(ctx, &rhs);
        if rbase != BaseType::Character {
            free_argument(ctx, &rhs);
            return Err(CompileError::TypeMismatch {
                op: "=",
                left: BaseType::Character.to_string(),
                right: rbase.to_string(),
            });
        }
        let place = place_of(ctx, &name, offset)?;
        let dst = eval::descriptor_of_place(ctx, place)?;
        let src = descriptor_of(ctx, rhs)?;
        let mask = ctx.regs.save_mask(&[dst, src]);
        ctx.emit.copy_str(dst, src, mask);
        ctx.regs.free_s(src);
        ctx.regs.free_s(dst);
        return Ok(());
    }

    if tbase == BaseType::Complex {
        return assign_complex(ctx, &name, offset, rhs);
    }

    let value = materialize(ctx, rhs, tbase)?;
    let place = place_of(ctx, &name, offset)?;
    eval::store_place(ctx, &place, value)?;
    eval::free_place(ctx, place);
    ctx.regs.free_s(value);
    Ok(())
}

/// A complex value is two words; only constant right-hand sides and
/// direct places are expressible without runtime help.
fn assign_complex(
    ctx: &mut Compiler,
    name: &str,
    offset: ArgOffset,
    rhs: OperatorArgument,
) -> Result<(), CompileError> {
    let (re, im) = match &rhs {
        OperatorArgument::Constant(DataValue::Complex(re, im)) => (*re, *im),
        OperatorArgument::Constant(v) => match v.as_f64() {
            Some(f) => (f, 0.0),
            None => {
                return Err(CompileError::TypeMismatch {
                    op: "=",
                    left: BaseType::Complex.to_string(),
                    right: v.base_type().to_string(),
                })
            }
        },
        other => {
            free_argument(ctx, other);
            return Err(CompileError::TypeMismatch {
                op: "=",
                left: BaseType::Complex.to_string(),
                right: "COMPLEX expression".to_string(),
            });
        }
    };
    let elem = match offset {
        ArgOffset::None => 0,
        ArgOffset::Constant(c) => c,
        ArgOffset::Register(r) => {
            ctx.regs.free_s(r);
            return Err(CompileError::ExpressionSyntax(
                "complex element needs a constant subscript",
            ));
        }
    };
    for (half, v) in [(0i64, re), (1i64, im)] {
        let r = ctx.regs.alloc_s()?;
        ctx.emit
            .load_imm(r, &DataValue::Real(v).to_string());
        let place = place_of(ctx, name, ArgOffset::Constant(elem))?;
        match place {
            eval::Place::Direct { base, index, .. } => {
                let base = offset_base(base, half);
                ctx.emit.store_word(&mut ctx.regs, r, &base, index)?;
            }
            other => {
                eval::free_place(ctx, other);
                ctx.regs.free_s(r);
                return Err(CompileError::ExpressionSyntax(
                    "complex store needs direct storage",
                ));
            }
        }
        ctx.regs.free_s(r);
    }
    Ok(())
}

fn offset_base(base: crate::compile::emit::Base, words: i64) -> crate::compile::emit::Base {
    use crate::compile::emit::Base;
    match base {
        Base::Frame(d) => Base::Frame(d + words),
        Base::Label(l, d) => Base::Label(l, d + words),
        Base::ArgSlot(s, d) => Base::ArgSlot(s, d + words),
    }
}

pub fn handle_call(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    let name = s
        .take_identifier()
        .ok_or(CompileError::ExpressionSyntax("subroutine name expected"))?;
    let mut args = Vec::new();
    if s.eat(b'(') {
        if !s.eat(b')') {
            loop {
                args.push(parse_expression(s)?);
                if s.eat(b',') {
                    continue;
                }
                s.expect(b')', "closing parenthesis")?;
                break;
            }
        }
    }
    if ctx.symbols.find(&name).is_none() {
        ctx.symbols.register(
            &name,
            SymbolClass::External,
            crate::compile::types::DataType::scalar(BaseType::Undefined),
        );
    }
    eval::call_procedure(ctx, &name, &args, None)?;
    Ok(())
}

/// The epilogue path shared by RETURN and END. FUNCTION units load S7
/// from the result slot first; character-valued functions return the
/// result descriptor.
pub fn emit_return(ctx: &mut Compiler) -> Result<(), CompileError> {
    if ctx.unit.class == UnitClass::Function {
        let name = ctx.unit.name.clone();
        let is_char = ctx
            .symbols
            .find(&name)
            .map_or(false, |sym| sym.dtype.base == BaseType::Character);
        let place = place_of(ctx, &name, ArgOffset::None)?;
        if is_char {
            let d = eval::descriptor_of_place(ctx, place)?;
            ctx.emit.move_s(S_RESULT, d);
            ctx.regs.free_s(d);
        } else {
            eval::load_place(ctx, &place, S_RESULT)?;
            eval::free_place(ctx, place);
        }
    }
    ctx.emit.epilog();
    Ok(())
}

pub fn handle_return(ctx: &mut Compiler) -> Result<(), CompileError> {
    emit_return(ctx)
}

/// STOP and PAUSE push an optional code (integer or character
/// descriptor, zero by default) and call the runtime.
pub fn handle_stop(
    ctx: &mut Compiler,
    s: &mut Scanner<'_>,
    target: &str,
) -> Result<(), CompileError> {
    let code: SReg = if s.at_end() {
        let r = ctx.regs.alloc_s()?;
        ctx.emit.load_imm(r, "0");
        r
    } else if let Some(text) = s.take_string()? {
        descriptor_of(ctx, OperatorArgument::Constant(DataValue::Char(text)))?
    } else {
        let e = parse_expression(s)?;
        let v = evaluate(ctx, &e)?;
        materialize(ctx, v, BaseType::Integer)?
    };
    let mask = ctx.regs.save_mask(&[code]);
    ctx.emit.primitive_call(target, &[code], mask);
    ctx.regs.free_s(code);
    Ok(())
}
