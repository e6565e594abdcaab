pub mod classify;
pub mod emit;
pub mod expr;
pub mod intrinsics;
pub mod label;
pub mod layout;
pub mod listing;
pub mod regs;
pub mod source;
pub mod stmt;
pub mod symbol;
pub mod symtab;
pub mod token;
pub mod types;

use crate::error::{CompileError, Diagnostics};
use anyhow::Context as _;
use classify::{classify, StatementKind};
use emit::Emitter;
use expr::eval::OperatorArgument;
use label::LabelManager;
use listing::Listing;
use regs::RegFile;
use source::{Reader, Statement};
use std::io::Write;
use symtab::{CommonTable, SymbolTable};
use token::OperatorId;
use types::{BaseType, DataValue};

/// Program-unit states, traversed strictly in this order. A statement
/// that is invalid in the current state advances the machine until a
/// state accepts it; DEFINITION runs exactly once and is where the
/// storage layout passes fire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum UnitState {
    ProgUnit,
    Implicit,
    Specification,
    Definition,
    Executable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnitClass {
    Program,
    Subroutine,
    Function,
    BlockData,
}

/// Identity and layout anchors of the program unit being compiled.
pub struct UnitInfo {
    pub name: String,
    pub class: UnitClass,
    pub frame_label: String,
    pub static_label: String,
}

impl Default for UnitInfo {
    fn default() -> UnitInfo {
        UnitInfo {
            name: "MAIN".to_string(),
            class: UnitClass::Program,
            frame_label: String::new(),
            static_label: String::new(),
        }
    }
}

pub struct DoEntry {
    pub term_label: u32,
    pub back: String,
    pub exit: String,
    pub var: String,
}

pub struct IfEntry {
    pub block_end: String,
    pub if_end: String,
}

/// A DATA initialisation captured during the specification section and
/// resolved against symbol offsets at END.
pub struct PendingData {
    pub name: String,
    pub elem: i64,
    pub value: DataValue,
    pub line: u32,
}

#[derive(Clone, Debug, Default)]
pub struct CompileOptions {
    /// Echo source lines into the object as comment lines.
    pub echo_source: bool,
}

pub struct CompileSummary {
    pub errors: u32,
    pub warnings: u32,
}

/// The whole compiler state, threaded explicitly through every pass so a
/// fresh unit is a reset rather than a scatter of global assignments.
/// COMMON block limits are the only state that survives from one unit to
/// the next; the intrinsic table lives outside and never changes.
pub struct Compiler {
    pub state: UnitState,
    pub unit: UnitInfo,
    pub unit_open: bool,
    pub implicit: [BaseType; 26],
    pub implicit_none: bool,
    pub symbols: SymbolTable,
    pub commons: CommonTable,
    pub labels: LabelManager,
    pub regs: RegFile,
    pub emit: Emitter,
    pub diags: Diagnostics,
    pub arg_stack: Vec<OperatorArgument>,
    pub op_stack: Vec<OperatorId>,
    pub do_stack: Vec<DoEntry>,
    pub if_stack: Vec<IfEntry>,
    pub pending_data: Vec<PendingData>,
    pub static_locals: bool,
    pub layout_done: bool,
    pub frame_size: u64,
    pub static_size: u64,
    pub io_scratch: Option<i64>,
    pub expand_depth: u32,
    pub cur_line: u32,
    pub opts: CompileOptions,
}

impl Compiler {
    pub fn new(opts: CompileOptions) -> Compiler {
        let mut c = Compiler {
            state: UnitState::ProgUnit,
            unit: UnitInfo::default(),
            unit_open: false,
            implicit: [BaseType::Real; 26],
            implicit_none: false,
            symbols: SymbolTable::new(),
            commons: CommonTable::new(),
            labels: LabelManager::new(),
            regs: RegFile::new(),
            emit: Emitter::new(),
            diags: Diagnostics::new(),
            arg_stack: Vec::new(),
            op_stack: Vec::new(),
            do_stack: Vec::new(),
            if_stack: Vec::new(),
            pending_data: Vec::new(),
            static_locals: false,
            layout_done: false,
            frame_size: 0,
            static_size: 0,
            io_scratch: None,
            expand_depth: 0,
            cur_line: 0,
            opts,
        };
        c.reset_unit();
        // unit tests drive layout without a header; give the anchors
        // deterministic labels
        c.unit.frame_label = c.labels.generate();
        c.unit.static_label = c.labels.generate();
        c
    }

    /// Restores all per-unit state; COMMON limits survive.
    pub fn reset_unit(&mut self) {
        self.state = UnitState::ProgUnit;
        self.unit = UnitInfo::default();
        self.unit_open = false;
        self.implicit = default_implicit();
        self.implicit_none = false;
        self.symbols.clear();
        self.labels.reset();
        self.regs.reset();
        self.arg_stack.clear();
        self.op_stack.clear();
        self.do_stack.clear();
        self.if_stack.clear();
        self.pending_data.clear();
        self.static_locals = false;
        self.layout_done = false;
        self.frame_size = 0;
        self.static_size = 0;
        self.io_scratch = None;
        self.expand_depth = 0;
        self.commons.reset_cursors();
    }

    /// Reserves the static scratch word used to pass value expressions in
    /// I/O lists by address.
    pub fn scratch_slot(&mut self) -> i64 {
        match self.io_scratch {
            Some(s) => s,
            None => {
                let s = self.static_size as i64;
                self.static_size += 2;
                self.io_scratch = Some(s);
                s
            }
        }
    }
}

/// The implicit-type vector as it stands at the start of every unit:
/// letters A-H and O-Z type Real, I-N type Integer, until IMPLICIT
/// statements override ranges.
fn default_implicit() -> [BaseType; 26] {
    let mut map = [BaseType::Real; 26];
    for l in b'I'..=b'N' {
        map[(l - b'A') as usize] = BaseType::Integer;
    }
    map
}

fn accepts(state: UnitState, kind: &StatementKind) -> bool {
    use StatementKind::*;
    // FORMAT and ENTRY are welcome anywhere past the unit header
    if matches!(kind, Format | Entry) {
        return state >= UnitState::Implicit;
    }
    match state {
        UnitState::ProgUnit => {
            matches!(kind, Program | Subroutine | Function(..) | BlockData)
        }
        UnitState::Implicit => matches!(kind, Implicit),
        UnitState::Specification => matches!(
            kind,
            TypeDecl(_)
                | Dimension
                | Common
                | Equivalence
                | External
                | Intrinsic
                | Parameter
                | Pointer
                | Save
                | Data
                | Assignment
        ),
        UnitState::Definition => false,
        UnitState::Executable => matches!(
            kind,
            Assignment
                | Assign
                | Goto
                | If
                | ElseIf
                | Else
                | EndIf
                | Do
                | Continue
                | Stop
                | Pause
                | Return
                | Call
                | Read
                | Write
                | Print
        ),
    }
}

/// Advances the state machine until `kind` is acceptable, running the
/// transition actions on the way. Returns `MisplacedStatement` when even
/// EXECUTABLE rejects the statement.
fn advance_for(ctx: &mut Compiler, kind: &StatementKind) -> Result<(), CompileError> {
    loop {
        if accepts(ctx.state, kind) {
            return Ok(());
        }
        match ctx.state {
            UnitState::ProgUnit => {
                // the first statement of an unheaded unit makes it the
                // main program
                stmt::decl::begin_unit(ctx, UnitClass::Program, "MAIN", &[], None)?;
                ctx.state = UnitState::Implicit;
            }
            UnitState::Implicit => ctx.state = UnitState::Specification,
            UnitState::Specification => {
                ctx.state = UnitState::Definition;
                layout::run_layout(ctx)?;
                stmt::decl::fill_dope_vectors(ctx)?;
            }
            UnitState::Definition => ctx.state = UnitState::Executable,
            UnitState::Executable => return Err(CompileError::MisplacedStatement),
        }
    }
}

/// Forces the state machine forward to EXECUTABLE, used by the assignment
/// handler when a statement closes the specification section itself.
pub(crate) fn ensure_executable(ctx: &mut Compiler) -> Result<(), CompileError> {
    advance_for(ctx, &StatementKind::Continue)
}

fn dispatch(ctx: &mut Compiler, statement: &Statement) -> Result<(), CompileError> {
    let classified = match classify(&statement.text) {
        Some(c) => c,
        None => return Err(CompileError::UnexpectedToken(statement.text.trim().to_string())),
    };

    if classified.kind == StatementKind::End {
        return Ok(()); // END handled by the caller
    }

    advance_for(ctx, &classified.kind)?;

    // a statement label names a code location, except on FORMAT where it
    // names the format string in the data section
    if let Some(label) = statement.label {
        if classified.kind != StatementKind::Format {
            let cal = ctx.labels.define(label)?;
            ctx.emit.place_label(&cal);
        }
    }

    stmt::handle(ctx, statement, classified)
}

/// Compiles a whole source file to CAL text on `object`, echoing into the
/// listing when one is given. Fatal compiler errors abort; source errors
/// are counted and compilation continues.
pub fn compile(
    source_text: &str,
    opts: CompileOptions,
    object: &mut dyn Write,
    mut listing: Option<&mut Listing>,
) -> anyhow::Result<CompileSummary> {
    let mut ctx = Compiler::new(opts);
    let reader = Reader::new(source_text);
    let unit_timer = std::time::Instant::now();

    for statement in reader {
        ctx.cur_line = statement.line;
        if let Some(listing) = listing.as_deref_mut() {
            for (no, raw) in &statement.raw {
                listing.source_line(*no, raw).context("listing write failed")?;
            }
        }
        if ctx.opts.echo_source {
            for (_, raw) in &statement.raw {
                ctx.emit.comment(raw);
            }
        }

        let is_end = matches!(
            classify(&statement.text),
            Some(classify::Classified {
                kind: StatementKind::End,
                ..
            })
        );

        match dispatch(&mut ctx, &statement) {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                return Err(err).context(format!("fatal error at line {}", statement.line));
            }
            Err(err) => {
                ctx.diags.error(statement.line, &err);
                expr::eval::reset_stacks(&mut ctx);
                // registers never stay live across statements, so any
                // still held belong to the abandoned one
                ctx.regs.reset();
            }
        }

        // a labelled statement may terminate one or more DO loops
        if let Some(label) = statement.label {
            while ctx
                .do_stack
                .last()
                .map_or(false, |d| d.term_label == label)
            {
                if let Err(err) = stmt::control::terminate_do(&mut ctx) {
                    if err.is_fatal() {
                        return Err(err)
                            .context(format!("fatal error at line {}", statement.line));
                    }
                    ctx.diags.error(statement.line, &err);
                    break;
                }
            }
        }

        if is_end {
            end_unit(&mut ctx, object, listing.as_deref_mut())
                .context("failed to finish program unit")?;
            log::debug!(
                "compiled through line {} in {}",
                statement.line,
                crate::util::DurationDisplay(unit_timer.elapsed())
            );
        }
    }

    if ctx.unit_open {
        ctx.diags
            .warning(ctx.cur_line, "missing END statement".to_string());
        end_unit(&mut ctx, object, listing.as_deref_mut())
            .context("failed to finish program unit")?;
    }

    if let Some(listing) = listing.as_deref_mut() {
        listing.summary(&ctx.diags.summary())?;
        listing.flush()?;
    }
    log::info!("{}", ctx.diags.summary());

    Ok(CompileSummary {
        errors: ctx.diags.error_count(),
        warnings: ctx.diags.warning_count(),
    })
}

/// END: close control stacks, report unresolved labels, emit the epilogue
/// and the data areas, flush the module, and reset for the next unit.
fn end_unit(
    ctx: &mut Compiler,
    object: &mut dyn Write,
    listing: Option<&mut Listing>,
) -> anyhow::Result<()> {
    if !ctx.unit_open {
        // an END with no unit around it opens and closes an empty main
        stmt::decl::begin_unit(ctx, UnitClass::Program, "MAIN", &[], None)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    }
    if ctx.state < UnitState::Executable {
        // units with no executable statements still get their layout
        if !ctx.layout_done {
            if let Err(err) = layout::run_layout(ctx) {
                ctx.diags.error(ctx.cur_line, &err);
            }
        }
    }

    if !ctx.do_stack.is_empty() {
        let err = CompileError::UndefinedLabel(ctx.do_stack[0].term_label);
        ctx.diags.error(ctx.cur_line, &err);
        ctx.do_stack.clear();
    }
    if !ctx.if_stack.is_empty() {
        let err = CompileError::MissingPunctuation("ENDIF");
        ctx.diags.error(ctx.cur_line, &err);
        ctx.if_stack.clear();
    }
    let unresolved: Vec<u32> = ctx.labels.unresolved().collect();
    for label in unresolved {
        let err = CompileError::UndefinedLabel(label);
        ctx.diags.error(ctx.cur_line, &err);
    }

    if ctx.unit.class != UnitClass::BlockData {
        stmt::exec::emit_return(ctx).unwrap_or_else(|err| {
            ctx.diags.error(ctx.cur_line, &err);
        });
        let frame_label = ctx.unit.frame_label.clone();
        ctx.emit.equate(&frame_label, ctx.frame_size as i64);
    }

    emit_data_areas(ctx);

    let unit_name = ctx.unit.name.clone();
    ctx.emit.flush(&unit_name, object)?;

    if let Some(listing) = listing {
        listing.symbol_table(&unit_name, &ctx.symbols)?;
        for diag in ctx.diags.drain_unit() {
            listing.annotation(&diag)?;
        }
        listing.summary(&ctx.diags.summary())?;
    } else {
        ctx.diags.drain_unit();
    }

    ctx.reset_unit();
    Ok(())
}

/// Lowers the pending DATA items into the static area and the COMMON
/// sections: initialised words as CON/DATA items, gaps and tails as BSS
/// reservations. COMMON sections are emitted per declared block and
/// coalesced by the linker.
fn emit_data_areas(ctx: &mut Compiler) {
    use crate::compile::symbol::SymbolClass;

    let mut static_inits: Vec<(i64, DataItem)> = Vec::new();
    let mut block_inits: std::collections::BTreeMap<String, Vec<(i64, DataItem)>> =
        std::collections::BTreeMap::new();

    let pending = std::mem::take(&mut ctx.pending_data);
    for p in pending {
        match resolve_data_item(ctx, &p) {
            Ok(Some((SymbolClass::Static, word, item))) => static_inits.push((word, item)),
            Ok(Some((SymbolClass::Global, word, item))) => {
                if let Some(block) = ctx.symbols.find(&p.name).and_then(|s| s.common.clone()) {
                    block_inits.entry(block).or_default().push((word, item));
                }
            }
            Ok(_) => {}
            Err(err) => ctx.diags.error(p.line, &err),
        }
    }

    if ctx.static_size > 0 {
        let label = ctx.unit.static_label.clone();
        let size = ctx.static_size;
        emit_area(ctx, &label, size, static_inits);
    }

    let declared: Vec<(String, String, u64)> = ctx
        .commons
        .iter()
        .filter(|(_, b)| b.cursor > 0)
        .map(|(n, b)| (n.clone(), b.label.clone(), b.limit))
        .collect();
    for (name, label, limit) in declared {
        let inits = block_inits.remove(&name).unwrap_or_default();
        ctx.emit.begin_common_section(&name);
        emit_area(ctx, &label, limit, inits);
        ctx.emit.end_common_section();
    }
}

/// Emits one data area of `size` words under `label`: sorted initialised
/// items separated by BSS gaps, with a BSS tail.
fn emit_area(ctx: &mut Compiler, label: &str, size: u64, mut inits: Vec<(i64, DataItem)>) {
    inits.sort_by_key(|(w, _)| *w);
    let mut cursor: i64 = 0;
    let mut first = true;
    for (word, item) in &inits {
        if *word > cursor {
            ctx.emit
                .data_reserve(if first { Some(label) } else { None }, (*word - cursor) as u64);
            first = false;
            cursor = *word;
        }
        if *word < cursor {
            continue; // overlapping initialisation already diagnosed
        }
        let l = if first { Some(label) } else { None };
        match item {
            DataItem::Con(text) => ctx.emit.data_word(l, text),
            DataItem::Str(text) => ctx.emit.data_string(l, text),
        }
        first = false;
        cursor += item.words() as i64;
    }
    if cursor < size as i64 {
        ctx.emit
            .data_reserve(if first { Some(label) } else { None }, (size as i64 - cursor) as u64);
    }
}

/// One resolved data-section item.
pub enum DataItem {
    Con(String),
    Str(String),
}

impl DataItem {
    pub fn words(&self) -> u64 {
        match self {
            DataItem::Con(_) => 1,
            DataItem::Str(s) => ((s.len() as u64) + 7) / 8,
        }
    }
}

fn resolve_data_item(
    ctx: &Compiler,
    p: &PendingData,
) -> Result<Option<(crate::compile::symbol::SymbolClass, i64, DataItem)>, CompileError> {
    use crate::compile::symbol::SymbolClass;

    let sym = match ctx.symbols.find(&p.name) {
        Some(s) => s,
        None => return Err(CompileError::InvalidReference(p.name.clone())),
    };
    if !matches!(sym.class, SymbolClass::Static | SymbolClass::Global) {
        return Err(CompileError::InvalidReference(p.name.clone()));
    }

    if sym.dtype.base == BaseType::Character {
        let len = sym.dtype.len.bytes() as i64;
        let byte = sym.offset * 8 + sym.dtype.first_chr_offset as i64 + p.elem * len;
        if byte % 8 != 0 {
            // mid-word character initialisation cannot be expressed as a
            // whole data item
            return Err(CompileError::InvalidEquivalence(
                "DATA value is not word-aligned",
            ));
        }
        let text = match &p.value {
            DataValue::Char(s) => {
                let mut t = s.clone();
                let padded = ((len.max(1) as usize) + 7) / 8 * 8;
                while t.len() < padded {
                    t.push(' ');
                }
                t.truncate(padded);
                t
            }
            other => return Err(CompileError::TypeMismatch {
                op: "DATA",
                left: other.base_type().to_string(),
                right: BaseType::Character.to_string(),
            }),
        };
        return Ok(Some((sym.class, byte / 8, DataItem::Str(text))));
    }

    let word = sym.offset + p.elem * sym.dtype.base.words_per_element() as i64;
    let text = match &p.value {
        DataValue::Log(true) => "-1".to_string(),
        DataValue::Log(false) => "0".to_string(),
        other => other.to_string(),
    };
    Ok(Some((sym.class, word, DataItem::Con(text))))
}
