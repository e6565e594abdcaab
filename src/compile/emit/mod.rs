mod arith;
mod compare;
mod control;
mod io;
mod memory;
mod string;

pub use control::Cond;
pub use memory::{Base, CharRef, MemRef};

use crate::compile::regs::SReg;
use std::io::{self as stdio, Write};

/// Longest name the linker's name table accepts, `@` prefix included.
const MAX_EXTERNAL_LEN: usize = 8;

/// One CAL line: an optional location-field label (columns 1-8), a result
/// or pseudo-op field starting in column 10, and an operand field. All
/// column alignment lives in `Instr::format`, nowhere else.
#[derive(Clone, Debug)]
pub struct Instr {
    pub label: Option<String>,
    pub op: String,
    pub arg: String,
}

impl Instr {
    pub fn new(label: Option<&str>, op: &str, arg: &str) -> Instr {
        Instr {
            label: label.map(str::to_string),
            op: op.to_string(),
            arg: arg.to_string(),
        }
    }

    pub fn format(&self) -> String {
        let label = self.label.as_deref().unwrap_or("");
        if self.arg.is_empty() {
            format!("{:<9}{}", label, self.op)
        } else {
            format!("{:<9}{:<10}{}", label, self.op, self.arg)
        }
    }
}

/// Collects the code and data streams of one program unit and flushes them
/// as a bracketed CAL module. Data items (constants, format strings, DATA
/// initialisers, jump tables) are deferred to the data section emitted at
/// END.
pub struct Emitter {
    code: Vec<Instr>,
    data: Vec<Instr>,
    commons: Vec<Instr>,
    in_common: bool,
    comments: Vec<(usize, String)>,
}

impl Emitter {
    pub fn new() -> Emitter {
        Emitter {
            code: Vec::new(),
            data: Vec::new(),
            commons: Vec::new(),
            in_common: false,
            comments: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.code.clear();
        self.data.clear();
        self.commons.clear();
        self.in_common = false;
        self.comments.clear();
    }

    pub fn instr(&mut self, op: &str, arg: &str) {
        self.code.push(Instr::new(None, op, arg));
    }

    pub fn instr_labeled(&mut self, label: &str, op: &str, arg: &str) {
        self.code.push(Instr::new(Some(label), op, arg));
    }

    /// Defines `label` at the current code location.
    pub fn place_label(&mut self, label: &str) {
        self.code.push(Instr::new(Some(label), "=", "*"));
    }

    /// An assembly-time equate; used for the frame-size forward reference.
    pub fn equate(&mut self, label: &str, value: i64) {
        self.code.push(Instr::new(Some(label), "=", &value.to_string()));
    }

    /// A `*` comment line ahead of the next instruction; used for the
    /// source echo.
    pub fn comment(&mut self, text: &str) {
        self.comments.push((self.code.len(), format!("*{}", text)));
    }

    fn data_stream(&mut self) -> &mut Vec<Instr> {
        if self.in_common {
            &mut self.commons
        } else {
            &mut self.data
        }
    }

    pub fn data_word(&mut self, label: Option<&str>, text: &str) {
        let instr = Instr::new(label, "CON", text);
        self.data_stream().push(instr);
    }

    pub fn data_string(&mut self, label: Option<&str>, s: &str) {
        let quoted = format!("'{}'", s.replace('\'', "''"));
        let instr = Instr::new(label, "DATA", &quoted);
        self.data_stream().push(instr);
    }

    pub fn data_reserve(&mut self, label: Option<&str>, words: u64) {
        let instr = Instr::new(label, "BSS", &words.to_string());
        self.data_stream().push(instr);
    }

    /// Routes subsequent data items into a named COMMON section until
    /// `end_common_section`. The linker coalesces the sections by name.
    pub fn begin_common_section(&mut self, name: &str) {
        let section = section_name(name);
        self.commons
            .push(Instr::new(Some(&section), "SECTION", "COMMON"));
        self.in_common = true;
    }

    pub fn end_common_section(&mut self) {
        self.commons.push(Instr::new(None, "SECTION", "*"));
        self.in_common = false;
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Formatted code lines; the unit tests inspect these.
    pub fn code_lines(&self) -> Vec<String> {
        self.code.iter().map(Instr::format).collect()
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// Writes the whole unit: `IDENT`, the code section, the data section
    /// when present, `END`. Section directives alternate
    /// `NAME SECTION TYPE` and `SECTION *`.
    pub fn flush(&mut self, unit: &str, out: &mut dyn Write) -> stdio::Result<()> {
        let section = section_name(unit);
        writeln!(out, "{}", Instr::new(None, "IDENT", unit).format())?;
        writeln!(
            out,
            "{}",
            Instr::new(Some(&section), "SECTION", "CODE").format()
        )?;
        let mut next_comment = 0;
        for (i, instr) in self.code.iter().enumerate() {
            while next_comment < self.comments.len() && self.comments[next_comment].0 <= i {
                writeln!(out, "{}", self.comments[next_comment].1)?;
                next_comment += 1;
            }
            writeln!(out, "{}", instr.format())?;
        }
        while next_comment < self.comments.len() {
            writeln!(out, "{}", self.comments[next_comment].1)?;
            next_comment += 1;
        }
        writeln!(out, "{}", Instr::new(None, "SECTION", "*").format())?;
        if !self.data.is_empty() {
            writeln!(
                out,
                "{}",
                Instr::new(Some(&section), "SECTION", "DATA").format()
            )?;
            for instr in &self.data {
                writeln!(out, "{}", instr.format())?;
            }
            writeln!(out, "{}", Instr::new(None, "SECTION", "*").format())?;
        }
        for instr in &self.commons {
            writeln!(out, "{}", instr.format())?;
        }
        writeln!(out, "{}", Instr::new(None, "END", "").format())?;
        self.reset();
        Ok(())
    }

    // --- software stack (A7) ---

    pub fn push_s(&mut self, r: SReg) {
        self.instr("A7", "A7-1");
        self.instr("0,A7", &r.to_string());
    }

    pub fn pop_s(&mut self, r: SReg) {
        self.instr(&r.to_string(), "0,A7");
        self.instr("A7", "A7+1");
    }

    pub fn drop_stack(&mut self, words: u64) {
        if words > 0 {
            self.instr("A7", &format!("A7+{}", words));
        }
    }

    pub fn grow_stack(&mut self, words: u64) {
        if words > 0 {
            self.instr("A7", &format!("A7-{}", words));
        }
    }

    /// Pushes every register in `mask`, low to high.
    pub fn save_regs(&mut self, mask: u8) {
        for r in 0..8u8 {
            if mask & (1 << r) != 0 {
                self.push_s(SReg(r));
            }
        }
    }

    /// Pops every register in `mask`, high to low, mirroring `save_regs`.
    pub fn restore_regs(&mut self, mask: u8) {
        for r in (0..8u8).rev() {
            if mask & (1 << r) != 0 {
                self.pop_s(SReg(r));
            }
        }
    }

    pub fn call(&mut self, target: &str) {
        self.instr("R", target);
    }

    /// The full discipline around a primitive or runtime call: save every
    /// live register except the arguments, push the arguments low-to-high
    /// argument order, call, drop the arguments, restore. The result is in
    /// S7 afterwards.
    pub fn primitive_call(&mut self, target: &str, args: &[SReg], save_mask: u8) {
        self.save_regs(save_mask);
        for &a in args {
            self.push_s(a);
        }
        self.call(target);
        self.drop_stack(args.len() as u64);
        self.restore_regs(save_mask);
    }
}

fn section_name(unit: &str) -> String {
    let mut s: String = unit.chars().take(MAX_EXTERNAL_LEN).collect();
    if s.is_empty() {
        s.push_str("MAIN");
    }
    s
}

/// Maps a FORTRAN identifier to its externally visible CAL name: an `@`
/// prefix, underscores become `%`, and names over the linker's name-table
/// limit keep a short head and carry a 16-bit FNV-1a hash of the original
/// as four hex digits to stay unique.
pub fn external_name(name: &str) -> String {
    let mapped: String = name.chars().map(|c| if c == '_' { '%' } else { c }).collect();
    let full = format!("@{}", mapped);
    if full.len() <= MAX_EXTERNAL_LEN {
        return full;
    }
    let hash = fnv1a_16(name.as_bytes());
    let head: String = full.chars().take(MAX_EXTERNAL_LEN - 4).collect();
    format!("{}{:04X}", head, hash)
}

/// 32-bit FNV-1a folded to 16 bits by xor of the halves.
fn fnv1a_16(bytes: &[u8]) -> u16 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    ((h >> 16) ^ (h & 0xFFFF)) as u16
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn instruction_columns() {
        let i = Instr::new(None, "S1", "14");
        assert_eq!(i.format(), "         S1        14");
        let l = Instr::new(Some("L00001"), "=", "*");
        assert_eq!(l.format(), "L00001   =         *");
    }

    #[test]
    fn external_names_map_underscores() {
        assert_eq!(external_name("_cpystr"), "@%cpystr");
        assert_eq!(external_name("SUB"), "@SUB");
    }

    #[test]
    fn long_external_names_are_hashed() {
        let a = external_name("VERYLONGNAME");
        let b = external_name("VERYLONGNAMB");
        assert_eq!(a.len(), MAX_EXTERNAL_LEN);
        assert_eq!(b.len(), MAX_EXTERNAL_LEN);
        assert!(a.starts_with("@VER"));
        assert_ne!(a, b);
    }

    #[test]
    fn save_restore_order_mirror() {
        let mut em = Emitter::new();
        em.save_regs(0b0000_0110);
        em.restore_regs(0b0000_0110);
        let lines: Vec<String> = em.code.iter().map(|i| i.format()).collect();
        // pushes S1 then S2, pops S2 then S1
        assert!(lines[1].contains("S1"));
        assert!(lines[3].contains("S2"));
        assert!(lines[4].starts_with("         S2"));
        assert!(lines[6].starts_with("         S1"));
    }

    #[test]
    fn flush_brackets_the_module() {
        let mut em = Emitter::new();
        em.instr("S1", "14");
        em.data_word(Some("L00001"), "5");
        let mut out = Vec::new();
        em.flush("MAIN", &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "         IDENT     MAIN");
        assert_eq!(lines[1], "MAIN     SECTION   CODE");
        assert!(lines.contains(&"         SECTION   *"));
        assert!(lines.contains(&"MAIN     SECTION   DATA"));
        assert_eq!(lines.last().unwrap(), &"         END");
    }
}
