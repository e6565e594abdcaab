use crate::compile::classify::match_keyword;
use crate::compile::emit::{Base, Cond};
use crate::compile::expr::eval::{
    self, evaluate, free_argument, materialize, place_of, ArgOffset, OperatorArgument,
};
use crate::compile::expr::parse::parse_expression;
use crate::compile::token::Scanner;
use crate::compile::types::{BaseType, DataValue};
use crate::compile::{Compiler, DoEntry, IfEntry};
use crate::error::CompileError;

const MAX_DO_DEPTH: usize = 32;
const MAX_IF_DEPTH: usize = 32;

/// DO: `DO label var = init, limit [, incr]`. Emits the trip-count
/// computation `(limit - init + incr) / incr` (folded when the bounds
/// are constant), pushes the three-word loop frame of (current,
/// increment, trip), places the back-edge and start labels with the
/// loop-variable load and the end-of-trips test between them, and stacks
/// a DoEntry for the terminating statement.
pub fn handle_do(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    if ctx.do_stack.len() >= MAX_DO_DEPTH {
        return Err(CompileError::StackOverflow("DO"));
    }
    let term_label = s
        .take_unsigned()
        .ok_or(CompileError::ExpressionSyntax("DO termination label expected"))?;
    let var = s
        .take_identifier()
        .ok_or(CompileError::ExpressionSyntax("loop variable expected"))?;
    s.expect(b'=', "equals sign")?;
    let init_tree = parse_expression(s)?;
    s.expect(b',', "loop limit")?;
    let limit_tree = parse_expression(s)?;
    let incr_tree = if s.eat(b',') {
        Some(parse_expression(s)?)
    } else {
        None
    };

    // the loop variable is an ordinary scalar reference
    let var_ref = evaluate(
        ctx,
        &crate::compile::expr::parse::ExprNode::Ref {
            name: var.clone(),
            args: Vec::new(),
        },
    )?;
    free_argument(ctx, &var_ref);
    let var_ty = ctx
        .symbols
        .find(&var)
        .map(|sym| sym.dtype.base)
        .unwrap_or(BaseType::Integer);
    let float = var_ty.is_floating();
    let domain = if float { BaseType::Real } else { BaseType::Integer };

    let init = evaluate(ctx, &init_tree)?;
    let limit = evaluate(ctx, &limit_tree)?;
    let incr = match &incr_tree {
        Some(t) => evaluate(ctx, t)?,
        None => OperatorArgument::Constant(DataValue::Int(1)),
    };

    let all_const = init.as_constant().is_some()
        && limit.as_constant().is_some()
        && incr.as_constant().is_some();

    let (trip_reg, incr_reg, cur_reg) = if all_const {
        let trip = fold_trip(
            init.as_constant().unwrap(),
            limit.as_constant().unwrap(),
            incr.as_constant().unwrap(),
        )?;
        let t = materialize(ctx, OperatorArgument::Constant(DataValue::Int(trip)), BaseType::Integer)?;
        let i = materialize(ctx, incr, domain)?;
        let c = materialize(ctx, init, domain)?;
        (t, i, c)
    } else {
        let c = materialize(ctx, init, domain)?;
        let l = materialize(ctx, limit, domain)?;
        let i = materialize(ctx, incr, domain)?;
        // trip = (limit - init + incr) / incr
        let t = ctx.regs.alloc_s()?;
        if float {
            ctx.emit.sub_float(t, l, c);
            ctx.emit.add_float(t, t, i);
            let mask = ctx.regs.save_mask(&[t, i]);
            ctx.emit.div_float_call(t, t, i, mask);
            let mask = ctx.regs.save_mask(&[t]);
            ctx.emit.real_to_int(t, t, mask);
        } else {
            ctx.emit.sub_int(t, l, c);
            ctx.emit.add_int(t, t, i);
            let mask = ctx.regs.save_mask(&[t, i]);
            ctx.emit.div_int_call(t, t, i, mask);
        }
        ctx.regs.free_s(l);
        (t, i, c)
    };

    // three-word loop frame: trip at 2, increment at 1, current at 0
    ctx.emit.push_s(trip_reg);
    ctx.emit.push_s(incr_reg);
    ctx.emit.push_s(cur_reg);
    ctx.regs.free_s(trip_reg);
    ctx.regs.free_s(incr_reg);
    ctx.regs.free_s(cur_reg);

    let back = ctx.labels.generate();
    let exit = ctx.labels.generate();
    let start = ctx.labels.generate();

    ctx.emit.place_label(&back);
    // refresh the loop variable from the frame's current slot
    let cur = ctx.regs.alloc_s()?;
    ctx.emit.instr(&cur.to_string(), "0,A7");
    let place = place_of(ctx, &var, ArgOffset::None)?;
    eval::store_place(ctx, &place, cur)?;
    eval::free_place(ctx, place);
    ctx.regs.free_s(cur);
    // end-of-trips test: exit at zero or below
    ctx.emit.instr("S0", "2,A7");
    ctx.emit.branch(Cond::Zero, &exit);
    ctx.emit.branch(Cond::Minus, &exit);
    ctx.emit.place_label(&start);

    ctx.do_stack.push(DoEntry {
        term_label,
        back,
        exit,
        var,
    });
    Ok(())
}

/// Compile-time trip count for constant loop bounds.
fn fold_trip(init: &DataValue, limit: &DataValue, incr: &DataValue) -> Result<i64, CompileError> {
    match (init.as_f64(), limit.as_f64(), incr.as_f64()) {
        (Some(i), Some(l), Some(n)) => {
            if n == 0.0 {
                return Err(CompileError::ConstantDivZero);
            }
            if let (Some(ii), Some(ll), Some(nn)) = (init.as_i64(), limit.as_i64(), incr.as_i64())
            {
                if nn == 0 {
                    return Err(CompileError::ConstantDivZero);
                }
                return Ok((ll - ii + nn) / nn);
            }
            Ok(((l - i + n) / n).trunc() as i64)
        }
        _ => Err(CompileError::ExpressionSyntax("numeric loop bounds expected")),
    }
}

/// Runs when a labelled statement matches the innermost DO entry: step
/// the current value, decrement the trip slot, branch back, place the
/// exit label, drop the loop frame.
pub fn terminate_do(ctx: &mut Compiler) -> Result<(), CompileError> {
    let entry = ctx.do_stack.pop().expect("checked by the caller");
    let var_float = ctx
        .symbols
        .find(&entry.var)
        .map_or(false, |sym| sym.dtype.base.is_floating());

    let a = ctx.regs.alloc_s()?;
    let b = ctx.regs.alloc_s()?;
    // current += increment
    ctx.emit.instr(&a.to_string(), "0,A7");
    ctx.emit.instr(&b.to_string(), "1,A7");
    if var_float {
        ctx.emit.add_float(a, a, b);
    } else {
        ctx.emit.add_int(a, a, b);
    }
    ctx.emit.instr("0,A7", &a.to_string());
    // trip -= 1
    ctx.emit.instr(&a.to_string(), "2,A7");
    ctx.emit.load_imm(b, "1");
    ctx.emit.sub_int(a, a, b);
    ctx.emit.instr("2,A7", &a.to_string());
    ctx.regs.free_s(b);
    ctx.regs.free_s(a);

    ctx.emit.jump(&entry.back);
    ctx.emit.place_label(&entry.exit);
    ctx.emit.drop_stack(3);
    Ok(())
}

/// IF: block (`THEN`), arithmetic (three labels), or logical (a nested
/// statement), told apart by what follows the closing parenthesis.
pub fn handle_if(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    s.expect(b'(', "IF condition")?;
    let cond_tree = parse_expression(s)?;
    s.expect(b')', "closing parenthesis")?;

    if match_keyword(s.rest(), "THEN").map_or(false, |pos| {
        s.rest()[pos..].trim().is_empty()
    }) {
        if ctx.if_stack.len() >= MAX_IF_DEPTH {
            return Err(CompileError::StackOverflow("IF"));
        }
        let cond = evaluate(ctx, &cond_tree)?;
        let r = materialize(ctx, cond, BaseType::Logical)?;
        let block_end = ctx.labels.generate();
        let if_end = ctx.labels.generate();
        ctx.emit.branch_false(r, &block_end);
        ctx.regs.free_s(r);
        ctx.if_stack.push(IfEntry { block_end, if_end });
        return Ok(());
    }

    if s.peek().map_or(false, |c| c.is_ascii_digit()) {
        // arithmetic IF: branch three ways on the expression's sign
        let l1 = s
            .take_unsigned()
            .ok_or(CompileError::ExpressionSyntax("label expected"))?;
        s.expect(b',', "label list")?;
        let l2 = s
            .take_unsigned()
            .ok_or(CompileError::ExpressionSyntax("label expected"))?;
        s.expect(b',', "label list")?;
        let l3 = s
            .take_unsigned()
            .ok_or(CompileError::ExpressionSyntax("label expected"))?;
        let cond = evaluate(ctx, &cond_tree)?;
        let ty = eval::base_type_of(ctx, &cond);
        let r = materialize(ctx, cond, ty)?;
        let t1 = ctx.labels.reference(l1);
        let t2 = ctx.labels.reference(l2);
        let t3 = ctx.labels.reference(l3);
        ctx.emit.instr("S0", &r.to_string());
        ctx.emit.branch(Cond::Minus, &t1);
        ctx.emit.branch(Cond::Zero, &t2);
        ctx.emit.jump(&t3);
        ctx.regs.free_s(r);
        return Ok(());
    }

    // logical IF: evaluate, skip the nested statement when false
    let cond = evaluate(ctx, &cond_tree)?;
    let r = materialize(ctx, cond, BaseType::Logical)?;
    let skip = ctx.labels.generate();
    ctx.emit.branch_false(r, &skip);
    ctx.regs.free_s(r);
    let rest = s.rest().to_string();
    super::handle_nested(ctx, &rest)?;
    ctx.emit.place_label(&skip);
    Ok(())
}

pub fn handle_elseif(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    let entry = ctx
        .if_stack
        .last()
        .ok_or(CompileError::MisplacedStatement)?;
    let if_end = entry.if_end.clone();
    let block_end = entry.block_end.clone();

    ctx.emit.jump(&if_end);
    ctx.emit.place_label(&block_end);

    s.expect(b'(', "ELSEIF condition")?;
    let cond_tree = parse_expression(s)?;
    s.expect(b')', "closing parenthesis")?;
    if match_keyword(s.rest(), "THEN").map_or(true, |pos| !s.rest()[pos..].trim().is_empty()) {
        return Err(CompileError::MissingPunctuation("THEN"));
    }

    let cond = evaluate(ctx, &cond_tree)?;
    let r = materialize(ctx, cond, BaseType::Logical)?;
    let fresh = ctx.labels.generate();
    ctx.emit.branch_false(r, &fresh);
    ctx.regs.free_s(r);
    ctx.if_stack.last_mut().expect("checked above").block_end = fresh;
    Ok(())
}

pub fn handle_else(ctx: &mut Compiler) -> Result<(), CompileError> {
    let entry = ctx
        .if_stack
        .last()
        .ok_or(CompileError::MisplacedStatement)?;
    let if_end = entry.if_end.clone();
    let block_end = entry.block_end.clone();
    ctx.emit.jump(&if_end);
    ctx.emit.place_label(&block_end);
    // after ELSE the block simply runs into the end of the construct
    ctx.if_stack.last_mut().expect("checked above").block_end = if_end;
    Ok(())
}

pub fn handle_endif(ctx: &mut Compiler) -> Result<(), CompileError> {
    let entry = ctx
        .if_stack
        .pop()
        .ok_or(CompileError::MisplacedStatement)?;
    if entry.block_end != entry.if_end {
        ctx.emit.place_label(&entry.block_end);
    }
    ctx.emit.place_label(&entry.if_end);
    Ok(())
}

/// GOTO: plain (`GOTO 10`), computed (`GOTO (10,20),I` with a
/// jump table and a range check that falls through when the index is out
/// of bounds), or assigned (`GOTO K` with an optional, ignored label
/// list).
pub fn handle_goto(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    if s.peek().map_or(false, |c| c.is_ascii_digit()) {
        let label = s
            .take_unsigned()
            .ok_or(CompileError::ExpressionSyntax("label expected"))?;
        let target = ctx.labels.reference(label);
        ctx.emit.jump(&target);
        return Ok(());
    }

    if s.eat(b'(') {
        let mut targets = Vec::new();
        loop {
            let label = s
                .take_unsigned()
                .ok_or(CompileError::ExpressionSyntax("label expected"))?;
            targets.push(ctx.labels.reference(label));
            if s.eat(b',') {
                continue;
            }
            s.expect(b')', "closing parenthesis")?;
            break;
        }
        let _ = s.eat(b',');
        let index_tree = parse_expression(s)?;

        // the jump table lives in the data section
        let table = ctx.labels.generate();
        for (i, t) in targets.iter().enumerate() {
            let label = if i == 0 { Some(table.as_str()) } else { None };
            ctx.emit.data_word(label, t);
        }

        let done = ctx.labels.generate();
        let idx = evaluate(ctx, &index_tree)?;
        let r = materialize(ctx, idx, BaseType::Integer)?;
        let one = ctx.regs.alloc_s()?;
        ctx.emit.load_imm(one, "1");
        ctx.emit.sub_int(r, r, one);
        ctx.regs.free_s(one);
        // out-of-range indexes fall through
        ctx.emit.instr("S0", &r.to_string());
        ctx.emit.branch(Cond::Minus, &done);
        let n = ctx.regs.alloc_s()?;
        ctx.emit.load_imm(n, &targets.len().to_string());
        ctx.emit.instr("S0", &format!("{}-{}", r, n));
        ctx.emit.branch(Cond::Plus, &done);
        ctx.regs.free_s(n);
        let target = ctx.regs.alloc_s()?;
        ctx.emit
            .load_word(&mut ctx.regs, target, &Base::Label(table, 0), Some(r))?;
        ctx.regs.free_s(r);
        ctx.emit.jump_register(target);
        ctx.regs.free_s(target);
        ctx.emit.place_label(&done);
        return Ok(());
    }

    // assigned GOTO; the parenthesised label list is syntax only
    let var = s
        .take_identifier()
        .ok_or(CompileError::ExpressionSyntax("variable expected"))?;
    let _ = s.eat(b',');
    if s.eat(b'(') {
        loop {
            let _ = s.take_unsigned();
            if s.eat(b',') {
                continue;
            }
            s.expect(b')', "closing parenthesis")?;
            break;
        }
    }
    let arg = evaluate(
        ctx,
        &crate::compile::expr::parse::ExprNode::Ref {
            name: var,
            args: Vec::new(),
        },
    )?;
    let r = materialize(ctx, arg, BaseType::Integer)?;
    ctx.emit.jump_register(r);
    ctx.regs.free_s(r);
    Ok(())
}

/// ASSIGN label TO variable: stores the generated label's machine
/// address into the variable for a later assigned GOTO.
pub fn handle_assign(ctx: &mut Compiler, s: &mut Scanner<'_>) -> Result<(), CompileError> {
    let label = s
        .take_unsigned()
        .ok_or(CompileError::ExpressionSyntax("label expected"))?;
    if match_keyword(s.rest(), "TO").is_none() {
        return Err(CompileError::MissingPunctuation("TO"));
    }
    let pos = match_keyword(s.rest(), "TO").expect("checked above");
    s.advance(pos);
    let var = s
        .take_identifier()
        .ok_or(CompileError::ExpressionSyntax("variable expected"))?;

    let target = ctx.labels.reference(label);
    let var_ref = evaluate(
        ctx,
        &crate::compile::expr::parse::ExprNode::Ref {
            name: var.clone(),
            args: Vec::new(),
        },
    )?;
    free_argument(ctx, &var_ref);

    let r = ctx.regs.alloc_s()?;
    ctx.emit.load_imm(r, &target);
    let place = place_of(ctx, &var, ArgOffset::None)?;
    eval::store_place(ctx, &place, r)?;
    eval::free_place(ctx, place);
    ctx.regs.free_s(r);
    Ok(())
}
