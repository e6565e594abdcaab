pub mod control;
pub mod decl;
pub mod exec;
pub mod io;

use crate::compile::classify::{Classified, StatementKind};
use crate::compile::source::Statement;
use crate::compile::token::Scanner;
use crate::compile::Compiler;
use crate::error::CompileError;

/// Routes one classified statement to its handler. The scanner starts
/// just past the recognised keyword; assignment statements re-scan from
/// the beginning because the keyword test consumed nothing.
pub fn handle(
    ctx: &mut Compiler,
    statement: &Statement,
    classified: Classified,
) -> Result<(), CompileError> {
    use StatementKind::*;

    let text = statement.text.as_str();
    let mut s = Scanner::new(&text[classified.pos.min(text.len())..]);

    match classified.kind {
        Program => decl::handle_program(ctx, &mut s),
        Subroutine => decl::handle_subroutine(ctx, &mut s),
        Function(base, len) => decl::handle_function(ctx, &mut s, base, len),
        BlockData => decl::handle_block_data(ctx, &mut s),
        Entry => decl::handle_entry(ctx, &mut s),
        Implicit => decl::handle_implicit(ctx, &mut s),
        TypeDecl(base) => decl::handle_type_decl(ctx, &mut s, base),
        Dimension => decl::handle_dimension(ctx, &mut s),
        Common => decl::handle_common(ctx, &mut s),
        Equivalence => decl::handle_equivalence(ctx, &mut s),
        External => decl::handle_external(ctx, &mut s),
        Intrinsic => decl::handle_intrinsic(ctx, &mut s),
        Parameter => decl::handle_parameter(ctx, &mut s),
        Pointer => decl::handle_pointer(ctx, &mut s),
        Save => decl::handle_save(ctx, &mut s),
        Data => decl::handle_data(ctx, &mut s, statement.line),
        Assignment => exec::handle_assignment(ctx, text),
        Format => io::handle_format(ctx, statement, s.rest()),
        Assign => control::handle_assign(ctx, &mut s),
        Goto => control::handle_goto(ctx, &mut s),
        If => control::handle_if(ctx, &mut s),
        ElseIf => control::handle_elseif(ctx, &mut s),
        Else => control::handle_else(ctx),
        EndIf => control::handle_endif(ctx),
        Do => control::handle_do(ctx, &mut s),
        Continue => Ok(()),
        Stop => exec::handle_stop(ctx, &mut s, "@%stop"),
        Pause => exec::handle_stop(ctx, &mut s, "@%pause"),
        Return => exec::handle_return(ctx),
        Call => exec::handle_call(ctx, &mut s),
        Read => io::handle_io(ctx, &mut s, true),
        Write => io::handle_io(ctx, &mut s, false),
        Print => io::handle_print(ctx, &mut s),
        End => Ok(()),
    }
}

/// Statements that may ride on a logical IF. Block constructs and DO
/// loops may not.
pub fn handle_nested(ctx: &mut Compiler, text: &str) -> Result<(), CompileError> {
    use StatementKind::*;
    let classified = crate::compile::classify::classify(text)
        .ok_or_else(|| CompileError::UnexpectedToken(text.trim().to_string()))?;
    match classified.kind {
        Assignment | Assign | Goto | Continue | Stop | Pause | Return | Call | Read | Write
        | Print => {}
        _ => {
            return Err(CompileError::ExpressionSyntax(
                "statement cannot follow a logical IF",
            ))
        }
    }
    let synthetic = Statement {
        label: None,
        text: text.to_string(),
        line: ctx.cur_line,
        raw: Vec::new(),
    };
    handle(ctx, &synthetic, classified)
}
