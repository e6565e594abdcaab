use crate::compile::emit::Base;
use crate::compile::expr::eval::{
    self, descriptor_of, evaluate, materialize, place_of, ArgOffset, OperatorArgument,
};
use crate::compile::expr::parse::{parse_expression, ExprNode};
use crate::compile::regs::SReg;
use crate::compile::source::Statement;
use crate::compile::token::Scanner;
use crate::compile::types::BaseType;
use crate::compile::Compiler;
use crate::error::CompileError;

/// FORMAT: the specification text is emitted literally as a labelled
/// string in the data section; the statement's own line label names it.
pub fn handle_format(
    ctx: &mut Compiler,
    statement: &Statement,
    spec: &str,
) -> Result<(), CompileError> {
    let label = statement
        .label
        .ok_or(CompileError::ExpressionSyntax("FORMAT needs a statement label"))?;
    let cal = ctx.labels.define(label)?;
    ctx.emit.data_string(Some(&cal), spec.trim());
    Ok(())
}

/// The format specifier of an I/O statement: a statement-label reference
/// (the format string's address), `*` for list-directed formatting, or a
/// character expression whose descriptor is passed through.
fn format_specifier(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<SReg, CompileError> {
    if s.eat(b'*') {
        let r = ctx.regs.alloc_s()?;
        ctx.emit.load_imm(r, "0");
        return Ok(r);
    }
    if s.peek().map_or(false, |c| c.is_ascii_digit()) {
        let label = s
            .take_unsigned()
            .ok_or(CompileError::ExpressionSyntax("format label expected"))?;
        let target = ctx.labels.reference(label);
        let r = ctx.regs.alloc_s()?;
        ctx.emit.load_imm(r, &target);
        return Ok(r);
    }
    let e = parse_expression(s)?;
    let v = evaluate(ctx, &e)?;
    if eval::base_type_of(ctx, &v) != BaseType::Character {
        // an integer variable may hold an ASSIGNed format label
        return materialize(ctx, v, BaseType::Integer);
    }
    descriptor_of(ctx, v)
}

/// READ (unit, fmt) list / WRITE (unit, fmt) list. The prologue stores
/// the format specifier and unit into the four-word I/O frame; each list
/// element becomes one formatter call with its ordinal and address;
/// `@_endfmt` closes the frame.
pub fn handle_io(ctx: &mut Compiler, s: &mut Scanner<'_>, input: bool) -> Result<(), CompileError> {
    if input && s.peek() != Some(b'(') {
        // READ fmt [, list] on the default input unit
        let fmt = format_specifier(ctx, s)?;
        let unit = ctx.regs.alloc_s()?;
        ctx.emit.load_imm(unit, "5");
        ctx.emit.io_begin(fmt, unit);
        ctx.regs.free_s(fmt);
        ctx.regs.free_s(unit);
        let mut ordinal: i64 = 1;
        if s.eat(b',') {
            io_list(ctx, s, true, &mut ordinal)?;
        }
        let mask = ctx.regs.save_mask(&[]);
        ctx.emit.io_end(mask);
        return Ok(());
    }

    s.expect(b'(', "I/O control list")?;
    let unit = if s.eat(b'*') {
        let r = ctx.regs.alloc_s()?;
        ctx.emit.load_imm(r, if input { "5" } else { "6" });
        r
    } else {
        let e = parse_expression(s)?;
        let v = evaluate(ctx, &e)?;
        materialize(ctx, v, BaseType::Integer)?
    };
    s.expect(b',', "format specifier")?;
    let fmt = format_specifier(ctx, s)?;
    s.expect(b')', "closing parenthesis")?;

    ctx.emit.io_begin(fmt, unit);
    ctx.regs.free_s(fmt);
    ctx.regs.free_s(unit);

    let mut ordinal: i64 = 1;
    if !s.at_end() {
        io_list(ctx, s, input, &mut ordinal)?;
    }

    let mask = ctx.regs.save_mask(&[]);
    ctx.emit.io_end(mask);
    Ok(())
}

/// PRINT fmt [, list]: WRITE on the default output unit.
pub fn handle_print(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    let fmt = format_specifier(ctx, s)?;
    let unit = ctx.regs.alloc_s()?;
    ctx.emit.load_imm(unit, "6");
    ctx.emit.io_begin(fmt, unit);
    ctx.regs.free_s(fmt);
    ctx.regs.free_s(unit);

    let mut ordinal: i64 = 1;
    if s.eat(b',') {
        io_list(ctx, s, false, &mut ordinal)?;
    }

    let mask = ctx.regs.save_mask(&[]);
    ctx.emit.io_end(mask);
    Ok(())
}

/// One I/O list: elements separated by commas, with implied-DO groups
/// `( items, var = init, limit [, incr] )` unrolled as a runtime loop.
fn io_list(
    ctx: &mut Compiler,
    s: &mut Scanner<'_>,
    input: bool,
    ordinal: &mut i64,
) -> Result<(), CompileError> {
    loop {
        io_list_item(ctx, s, input, ordinal)?;
        if s.eat(b',') {
            continue;
        }
        break;
    }
    Ok(())
}

fn io_list_item(
    ctx: &mut Compiler,
    s: &mut Scanner<'_>,
    input: bool,
    ordinal: &mut i64,
) -> Result<(), CompileError> {
    if s.peek() == Some(b'(') && implied_do_ahead(s) {
        return implied_do(ctx, s, input, ordinal);
    }
    let e = parse_expression(s)?;
    emit_io_element(ctx, &e, input, ordinal)
}

/// Looks ahead for the `, var = ` signature that separates an implied-DO
/// group from a parenthesised expression.
fn implied_do_ahead(s: &Scanner<'_>) -> bool {
    let text = s.rest().as_bytes();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut saw_equals_at_one = false;
    for &c in text {
        match c {
            b'\'' => in_quote = !in_quote,
            _ if in_quote => {}
            b'(' => depth += 1,
            b')' => {
                if depth <= 1 {
                    break;
                }
                depth -= 1;
            }
            b'=' if depth == 1 => saw_equals_at_one = true,
            _ => {}
        }
    }
    saw_equals_at_one
}

/// An implied-DO group loops its nested items over a control variable
/// with constant-positive step, re-running the formatter call for every
/// iteration.
fn implied_do(
    ctx: &mut Compiler,
    s: &mut Scanner<'_>,
    input: bool,
    ordinal: &mut i64,
) -> Result<(), CompileError> {
    s.expect(b'(', "implied DO")?;
    let mut items: Vec<ExprNode> = Vec::new();
    let (var, init_tree, limit_tree) = loop {
        // each element parses as an expression until one turns out to be
        // the control assignment
        let e = parse_expression(s)?;
        if s.eat(b'=') {
            let var = match e {
                ExprNode::Ref { name, args } if args.is_empty() => name,
                _ => {
                    return Err(CompileError::ExpressionSyntax(
                        "implied-DO control variable expected",
                    ))
                }
            };
            let init = parse_expression(s)?;
            s.expect(b',', "implied-DO limit")?;
            let limit = parse_expression(s)?;
            if s.eat(b',') {
                // only a constant unit step is supported here
                let step = parse_expression(s)?;
                match eval::const_eval_int(ctx, &step) {
                    Some(1) => {}
                    _ => {
                        return Err(CompileError::ExpressionSyntax(
                            "implied-DO increments other than one",
                        ))
                    }
                }
            }
            s.expect(b')', "closing parenthesis")?;
            break (var, init, limit);
        }
        items.push(e);
        s.expect(b',', "implied-DO list")?;
    };

    // var = init; loop: items; var += 1; while var <= limit
    let var_node = ExprNode::Ref {
        name: var.clone(),
        args: Vec::new(),
    };
    let target = evaluate(ctx, &var_node)?;
    let init = evaluate(ctx, &init_tree)?;
    super::exec::assign(ctx, target, init)?;

    let top = ctx.labels.generate();
    ctx.emit.place_label(&top);
    for item in &items {
        emit_io_element(ctx, item, input, ordinal)?;
    }

    // step and test
    let v = evaluate(ctx, &var_node)?;
    let r = materialize(ctx, v, BaseType::Integer)?;
    let one = ctx.regs.alloc_s()?;
    ctx.emit.load_imm(one, "1");
    ctx.emit.add_int(r, r, one);
    ctx.regs.free_s(one);
    let place = place_of(ctx, &var, ArgOffset::None)?;
    eval::store_place(ctx, &place, r)?;
    eval::free_place(ctx, place);
    let limit = evaluate(ctx, &limit_tree)?;
    let l = materialize(ctx, limit, BaseType::Integer)?;
    ctx.emit.instr("S0", &format!("{}-{}", l, r));
    ctx.emit
        .branch(crate::compile::emit::Cond::Plus, &top);
    ctx.regs.free_s(l);
    ctx.regs.free_s(r);
    Ok(())
}

/// One element call: `@_infmt` / `@_outfmt` with (ordinal, address).
/// References pass their own address (characters their descriptor); an
/// output expression is parked in the static scratch pair and its
/// address passed instead.
fn emit_io_element(
    ctx: &mut Compiler,
    e: &ExprNode,
    input: bool,
    ordinal: &mut i64,
) -> Result<(), CompileError> {
    let arg = evaluate(ctx, e)?;
    let ty = eval::base_type_of(ctx, &arg);

    let addr = match arg {
        arg @ OperatorArgument::Reference { .. } => {
            if ty == BaseType::Character {
                descriptor_of(ctx, arg)?
            } else {
                let place = match arg {
                    OperatorArgument::Reference { ref name, ref offset } => {
                        let off = match offset {
                            ArgOffset::None => ArgOffset::None,
                            ArgOffset::Constant(c) => ArgOffset::Constant(*c),
                            ArgOffset::Register(r) => ArgOffset::Register(*r),
                        };
                        let name = name.clone();
                        place_of(ctx, &name, off)?
                    }
                    _ => unreachable!(),
                };
                eval::address_of_place(ctx, place)?
            }
        }
        other => {
            if input {
                eval::free_argument(ctx, &other);
                return Err(CompileError::ExpressionSyntax(
                    "READ list items must be variables",
                ));
            }
            if ty == BaseType::Character {
                descriptor_of(ctx, other)?
            } else {
                // spill through the static scratch word
                let slot = ctx.scratch_slot();
                let v = materialize(ctx, other, ty)?;
                let base = Base::Label(ctx.unit.static_label.clone(), slot);
                ctx.emit.store_word(&mut ctx.regs, v, &base, None)?;
                ctx.regs.free_s(v);
                let r = ctx.regs.alloc_s()?;
                let label = ctx.unit.static_label.clone();
                let expr = if slot == 0 {
                    label
                } else {
                    format!("{}+{}", label, slot)
                };
                ctx.emit.load_imm(r, &expr);
                r
            }
        }
    };

    let ord = ctx.regs.alloc_s()?;
    ctx.emit.load_imm(ord, &ordinal.to_string());
    *ordinal += 1;
    let mask = ctx.regs.save_mask(&[ord, addr]);
    ctx.emit.io_item(input, ord, addr, mask);
    ctx.regs.free_s(ord);
    ctx.regs.free_s(addr);
    Ok(())
}
