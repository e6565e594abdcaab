use crate::compile::symbol::SymbolClass;
use crate::compile::types::BaseType;
use crate::compile::Compiler;
use crate::error::CompileError;

/// Runs the three placement passes at the specification/executable
/// boundary, in this order: COMMON blocks, the static area, then the
/// frame (AUTO) area whose total becomes the prologue's frame size.
/// Equivalence chains are resolved to a single storage class first.
pub fn run_layout(ctx: &mut Compiler) -> Result<(), CompileError> {
    reconcile_chains(ctx)?;
    layout_common(ctx)?;
    layout_static(ctx)?;
    layout_auto(ctx)?;
    ctx.layout_done = true;
    log::debug!(
        "unit {}: frame {} words, static {} words",
        ctx.unit.name,
        ctx.frame_size,
        ctx.static_size
    );
    Ok(())
}

/// Every member of an equivalence chain ends up with one storage class: a
/// Global member drags the chain into its COMMON block, otherwise one
/// Static member promotes the whole chain to Static. Dummy arguments and
/// adjustable arrays cannot share storage. Non-character members must sit
/// word-aligned against the representative.
fn reconcile_chains(ctx: &mut Compiler) -> Result<(), CompileError> {
    for idx in 0..ctx.symbols.chains().len() {
        let members: Vec<(String, i64)> = ctx.symbols.chain(idx).members.clone();

        let mut block: Option<String> = None;
        let mut promote = SymbolClass::Auto;
        for (name, off) in &members {
            let sym = ctx
                .symbols
                .find(name)
                .ok_or_else(|| CompileError::InvalidReference(name.clone()))?;
            match sym.class {
                SymbolClass::Global => {
                    let b = sym.common.clone().unwrap_or_default();
                    if let Some(prev) = &block {
                        if *prev != b {
                            return Err(CompileError::InvalidEquivalence(
                                "members belong to different COMMON blocks",
                            ));
                        }
                    }
                    block = Some(b);
                    promote = SymbolClass::Global;
                }
                SymbolClass::Static if promote != SymbolClass::Global => {
                    promote = SymbolClass::Static;
                }
                SymbolClass::Auto | SymbolClass::Function => {}
                SymbolClass::Argument | SymbolClass::Adjustable => {
                    return Err(CompileError::InvalidEquivalence(
                        "dummy arguments cannot share storage",
                    ));
                }
                _ => {
                    return Err(CompileError::InvalidEquivalence(
                        "member has no storage",
                    ));
                }
            }
            if sym.dtype.base != BaseType::Character && off % 8 != 0 {
                return Err(CompileError::InvalidEquivalence(
                    "non-character member is not word-aligned",
                ));
            }
        }

        if promote != SymbolClass::Auto {
            for (name, _) in &members {
                if let Some(sym) = ctx.symbols.find_mut(name) {
                    if sym.class != SymbolClass::Global || promote != SymbolClass::Global {
                        sym.class = promote;
                    }
                    if promote == SymbolClass::Global && sym.common.is_none() {
                        sym.common = block.clone();
                    }
                }
            }
        }
    }
    Ok(())
}

/// Byte extent of a whole chain, measured from the representative.
fn chain_extent_words(ctx: &Compiler, idx: usize) -> u64 {
    let mut end_bytes: i64 = 0;
    for (name, off) in &ctx.symbols.chain(idx).members {
        if let Some(sym) = ctx.symbols.find(name) {
            let size_bytes = (sym.size_words() * 8) as i64;
            end_bytes = end_bytes.max(off + size_bytes);
        }
    }
    ((end_bytes + 7) / 8) as u64
}

fn is_chain_representative(ctx: &Compiler, name: &str) -> bool {
    match ctx.symbols.find(name).and_then(|s| s.equiv) {
        Some(idx) => ctx.symbols.chain(idx).members.first().map(|(n, _)| n.as_str()) == Some(name),
        None => true,
    }
}

/// Places every chain member at the representative's base plus its chain
/// offset; characters may land mid-word and record the byte position.
fn place_chain(ctx: &mut Compiler, idx: usize, rep_base_words: i64) -> Result<(), CompileError> {
    let members: Vec<(String, i64)> = ctx.symbols.chain(idx).members.clone();
    for (name, off) in members {
        let byte = rep_base_words * 8 + off;
        let word = byte.div_euclid(8);
        let rem = byte.rem_euclid(8) as u8;
        let sym = ctx
            .symbols
            .find_mut(&name)
            .ok_or_else(|| CompileError::InvalidReference(name.clone()))?;
        if sym.laid_out {
            if sym.offset != word {
                return Err(CompileError::InvalidEquivalence(
                    "conflicting placement within a COMMON block",
                ));
            }
            continue;
        }
        if rem != 0 && sym.dtype.base != BaseType::Character {
            return Err(CompileError::InvalidEquivalence(
                "non-character member is not word-aligned",
            ));
        }
        sym.offset = word;
        sym.dtype.first_chr_offset = rem;
        sym.laid_out = true;
    }
    Ok(())
}

/// COMMON placement. The first sub-pass walks the declaration order and
/// assigns each COMMON-declared symbol the block's cursor; the second
/// overlays equivalence chains and pushes the block's high-water mark.
fn layout_common(ctx: &mut Compiler) -> Result<(), CompileError> {
    let names = ctx.symbols.names_in_order();

    for name in &names {
        let (size, block_name) = match ctx.symbols.find(name) {
            Some(s)
                if s.class == SymbolClass::Global && s.in_common_decl && !s.laid_out =>
            {
                (s.size_words(), s.common.clone().unwrap_or_default())
            }
            _ => continue,
        };
        let block = ctx
            .commons
            .get_mut(&block_name)
            .ok_or_else(|| CompileError::InvalidReference(block_name.clone()))?;
        let offset = block.cursor as i64;
        block.cursor += size;
        block.limit = block.limit.max(block.cursor);
        let sym = ctx.symbols.find_mut(name).expect("symbol just seen");
        sym.offset = offset;
        sym.laid_out = true;
    }

    // overlay chains anchored by a declared member
    for name in &names {
        let (idx, anchor_off, anchor_chain_off, block_name) = match ctx.symbols.find(name) {
            Some(s) if s.class == SymbolClass::Global && s.laid_out => match s.equiv {
                Some(idx) => {
                    let chain_off = ctx
                        .symbols
                        .chain(idx)
                        .offset_of(name)
                        .expect("member listed in its own chain");
                    (idx, s.offset, chain_off, s.common.clone().unwrap_or_default())
                }
                None => continue,
            },
            _ => continue,
        };
        let rep_base_bytes = anchor_off * 8 - anchor_chain_off;
        if rep_base_bytes < 0 {
            return Err(CompileError::InvalidEquivalence(
                "chain extends a COMMON block backwards",
            ));
        }
        place_chain(ctx, idx, rep_base_bytes / 8)?;
        let extent = chain_extent_words(ctx, idx);
        let base_words = (rep_base_bytes / 8) as u64;
        let block = ctx
            .commons
            .get_mut(&block_name)
            .ok_or_else(|| CompileError::InvalidReference(block_name.clone()))?;
        block.limit = block.limit.max(base_words + extent);
    }
    Ok(())
}

/// Static placement against the module's single static cursor; the final
/// cursor is the size of the static data block emitted at END.
fn layout_static(ctx: &mut Compiler) -> Result<(), CompileError> {
    let names = ctx.symbols.names_in_order();
    let mut cursor: u64 = ctx.static_size;

    for name in &names {
        let (idx, size) = match ctx.symbols.find(name) {
            Some(s) if s.class == SymbolClass::Static && !s.laid_out => (s.equiv, s.size_words()),
            _ => continue,
        };
        if !is_chain_representative(ctx, name) {
            continue;
        }
        match idx {
            Some(chain) => {
                place_chain(ctx, chain, cursor as i64)?;
                cursor += chain_extent_words(ctx, chain);
            }
            None => {
                let sym = ctx.symbols.find_mut(name).expect("symbol just seen");
                sym.offset = cursor as i64;
                sym.laid_out = true;
                cursor += size;
            }
        }
    }
    ctx.static_size = cursor;
    Ok(())
}

/// Frame placement: adjustable dope vectors first, then scalars and
/// arrays, then a post-pass turning cursor positions into negative
/// displacements from the frame pointer.
fn layout_auto(ctx: &mut Compiler) -> Result<(), CompileError> {
    let names = ctx.symbols.names_in_order();
    let mut cursor: u64 = 0;

    for name in &names {
        let size = match ctx.symbols.find(name) {
            Some(s) if s.class == SymbolClass::Adjustable && !s.laid_out => s.size_words(),
            _ => continue,
        };
        let sym = ctx.symbols.find_mut(name).expect("symbol just seen");
        sym.offset = cursor as i64;
        sym.laid_out = true;
        cursor += size;
    }

    for name in &names {
        let (idx, size) = match ctx.symbols.find(name) {
            Some(s)
                if matches!(s.class, SymbolClass::Auto | SymbolClass::Function)
                    && !s.laid_out =>
            {
                (s.equiv, s.size_words())
            }
            _ => continue,
        };
        if !is_chain_representative(ctx, name) {
            continue;
        }
        match idx {
            Some(chain) => {
                place_chain(ctx, chain, cursor as i64)?;
                cursor += chain_extent_words(ctx, chain);
            }
            None => {
                let sym = ctx.symbols.find_mut(name).expect("symbol just seen");
                sym.offset = cursor as i64;
                sym.laid_out = true;
                cursor += size;
            }
        }
    }

    // negative frame displacements
    let total = cursor as i64;
    for name in &names {
        if let Some(sym) = ctx.symbols.find_mut(name) {
            if matches!(
                sym.class,
                SymbolClass::Auto | SymbolClass::Function | SymbolClass::Adjustable
            ) && sym.laid_out
            {
                sym.offset -= total;
            }
        }
    }
    ctx.frame_size = cursor;
    Ok(())
}

/// A symbol first referenced after the layout passes (created by an
/// executable statement) grows the frame; the frame-size equate is not
/// emitted until END, so the prologue picks the final value up.
pub fn place_late_symbol(ctx: &mut Compiler, name: &str) -> Result<(), CompileError> {
    let (class, size, laid_out) = match ctx.symbols.find(name) {
        Some(sym) => (sym.class, sym.size_words(), sym.laid_out),
        None => return Err(CompileError::InvalidReference(name.to_string())),
    };
    if laid_out {
        return Ok(());
    }
    match class {
        SymbolClass::Auto | SymbolClass::Function => {
            ctx.frame_size += size;
            let offset = -(ctx.frame_size as i64);
            let sym = ctx.symbols.find_mut(name).expect("symbol just seen");
            sym.offset = offset;
            sym.laid_out = true;
        }
        SymbolClass::Static => {
            let offset = ctx.static_size as i64;
            ctx.static_size += size;
            let sym = ctx.symbols.find_mut(name).expect("symbol just seen");
            sym.offset = offset;
            sym.laid_out = true;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::types::{CharLength, DataType};
    use crate::compile::Compiler;

    fn ctx() -> Compiler {
        Compiler::new(Default::default())
    }

    fn add(ctx: &mut Compiler, name: &str, class: SymbolClass, dtype: DataType) {
        ctx.symbols.register(name, class, dtype).unwrap();
    }

    fn int_scalar() -> DataType {
        DataType::scalar(BaseType::Integer)
    }

    fn real_array(n: i64) -> DataType {
        let mut t = DataType::scalar(BaseType::Real);
        t.bounds = vec![(1, n)];
        t
    }

    #[test]
    fn single_auto_local_lands_at_minus_one() {
        let mut c = ctx();
        add(&mut c, "I", SymbolClass::Auto, int_scalar());
        run_layout(&mut c).unwrap();
        assert_eq!(c.symbols.find("I").unwrap().offset, -1);
        assert_eq!(c.frame_size, 1);
    }

    #[test]
    fn autos_stack_downwards_in_declaration_order() {
        let mut c = ctx();
        add(&mut c, "A", SymbolClass::Auto, int_scalar());
        add(&mut c, "B", SymbolClass::Auto, real_array(3));
        add(&mut c, "C", SymbolClass::Auto, int_scalar());
        run_layout(&mut c).unwrap();
        assert_eq!(c.symbols.find("A").unwrap().offset, -5);
        assert_eq!(c.symbols.find("B").unwrap().offset, -4);
        assert_eq!(c.symbols.find("C").unwrap().offset, -1);
        assert_eq!(c.frame_size, 5);
    }

    #[test]
    fn equivalence_overlays_without_extending() {
        // REAL A(10) / INTEGER B / EQUIVALENCE (A,B)
        let mut c = ctx();
        add(&mut c, "A", SymbolClass::Static, real_array(10));
        add(&mut c, "B", SymbolClass::Static, int_scalar());
        c.symbols.link_equivalence("A", 0, "B", 0).unwrap();
        run_layout(&mut c).unwrap();
        let a = c.symbols.find("A").unwrap().offset;
        let b = c.symbols.find("B").unwrap().offset;
        assert_eq!(a, b);
        assert_eq!(c.static_size, 10);
    }

    #[test]
    fn equivalence_promotes_auto_to_static() {
        let mut c = ctx();
        add(&mut c, "X", SymbolClass::Auto, int_scalar());
        add(&mut c, "Y", SymbolClass::Static, int_scalar());
        c.symbols.link_equivalence("X", 0, "Y", 0).unwrap();
        run_layout(&mut c).unwrap();
        assert_eq!(c.symbols.find("X").unwrap().class, SymbolClass::Static);
        assert_eq!(c.frame_size, 0);
    }

    #[test]
    fn character_member_may_sit_mid_word() {
        // CHARACTER*3 S overlays the middle of A's second word
        let mut c = ctx();
        add(&mut c, "A", SymbolClass::Static, real_array(4));
        add(
            &mut c,
            "S",
            SymbolClass::Static,
            DataType::character(CharLength::Literal(3)),
        );
        c.symbols.link_equivalence("A", 10, "S", 0).unwrap();
        run_layout(&mut c).unwrap();
        let s = c.symbols.find("S").unwrap();
        assert_eq!(s.offset, 1);
        assert_eq!(s.dtype.first_chr_offset, 2);
    }

    #[test]
    fn misaligned_numeric_equivalence_is_rejected() {
        let mut c = ctx();
        add(&mut c, "A", SymbolClass::Static, real_array(4));
        add(&mut c, "B", SymbolClass::Static, int_scalar());
        c.symbols.link_equivalence("A", 4, "B", 0).unwrap();
        assert!(run_layout(&mut c).is_err());
    }

    #[test]
    fn common_cursor_places_in_declaration_order() {
        let mut c = ctx();
        c.commons.declare("B", "@B".to_string());
        for (n, t) in &[("X", real_array(100)), ("Y", int_scalar())] {
            let s = c
                .symbols
                .register(n, SymbolClass::Global, t.clone())
                .unwrap();
            s.common = Some("B".to_string());
            s.in_common_decl = true;
        }
        run_layout(&mut c).unwrap();
        assert_eq!(c.symbols.find("X").unwrap().offset, 0);
        assert_eq!(c.symbols.find("Y").unwrap().offset, 100);
        assert_eq!(c.commons.get("B").unwrap().limit, 101);
    }

    #[test]
    fn common_limit_survives_a_second_smaller_unit() {
        let mut c = ctx();
        c.commons.declare("B", "@B".to_string());
        {
            let s = c
                .symbols
                .register("X", SymbolClass::Global, real_array(100))
                .unwrap();
            s.common = Some("B".to_string());
            s.in_common_decl = true;
        }
        run_layout(&mut c).unwrap();
        assert_eq!(c.commons.get("B").unwrap().limit, 100);

        // second unit declares a 50-word prefix of the same block
        c.reset_unit();
        {
            let s = c
                .symbols
                .register("U", SymbolClass::Global, real_array(50))
                .unwrap();
            s.common = Some("B".to_string());
            s.in_common_decl = true;
        }
        run_layout(&mut c).unwrap();
        assert_eq!(c.commons.get("B").unwrap().limit, 100);
    }

    #[test]
    fn adjustable_dope_vectors_come_first() {
        let mut c = ctx();
        let mut adj = real_array(1);
        adj.bounds = vec![(1, 1), (1, 1)];
        add(&mut c, "D", SymbolClass::Adjustable, adj);
        add(&mut c, "I", SymbolClass::Auto, int_scalar());
        run_layout(&mut c).unwrap();
        // dope is rank*2+1 = 5 words; frame is 6
        assert_eq!(c.frame_size, 6);
        assert_eq!(c.symbols.find("D").unwrap().offset, -6);
        assert_eq!(c.symbols.find("I").unwrap().offset, -1);
    }

    #[test]
    fn late_symbols_grow_the_frame() {
        let mut c = ctx();
        add(&mut c, "I", SymbolClass::Auto, int_scalar());
        run_layout(&mut c).unwrap();
        add(&mut c, "J", SymbolClass::Auto, int_scalar());
        place_late_symbol(&mut c, "J").unwrap();
        assert_eq!(c.symbols.find("J").unwrap().offset, -2);
        assert_eq!(c.frame_size, 2);
    }

    #[test]
    fn extents_of_unrelated_symbols_are_disjoint() {
        let mut c = ctx();
        add(&mut c, "A", SymbolClass::Static, real_array(3));
        add(&mut c, "B", SymbolClass::Static, real_array(2));
        add(&mut c, "C", SymbolClass::Static, int_scalar());
        run_layout(&mut c).unwrap();
        let mut extents: Vec<(i64, i64)> = ["A", "B", "C"]
            .iter()
            .map(|n| {
                let s = c.symbols.find(n).unwrap();
                (s.offset * 8, s.offset * 8 + (s.size_words() * 8) as i64)
            })
            .collect();
        extents.sort();
        assert!(extents[0].1 <= extents[1].0);
        assert!(extents[1].1 <= extents[2].0);
    }
}
