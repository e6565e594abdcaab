use super::Emitter;
use crate::compile::regs::{RegFile, SReg};
use crate::error::CompileError;

/// Where a storage reference lives. Frame displacements are words from
/// A6 (negative for locals); labelled bases are the static area or a
/// COMMON block; an argument slot holds the address of the actual
/// argument (or, for character dummies, its descriptor).
#[derive(Clone, Debug)]
pub enum Base {
    Frame(i64),
    Label(String, i64),
    /// (slot, displacement): the slot word holds the base address, the
    /// displacement applies beyond it.
    ArgSlot(i64, i64),
}

/// Character view of a reference: resolved byte length plus the byte
/// displacement from the word base (first-character offset included).
#[derive(Copy, Clone, Debug)]
pub struct CharRef {
    pub len: u32,
    pub byte_off: i64,
}

#[derive(Clone, Debug)]
pub struct MemRef {
    pub base: Base,
    pub chr: Option<CharRef>,
}

fn frame_disp(d: i64) -> String {
    format!("{},A6", d)
}

fn label_expr(l: &str, d: i64) -> String {
    if d == 0 {
        l.to_string()
    } else if d > 0 {
        format!("{}+{}", l, d)
    } else {
        format!("{}-{}", l, -d)
    }
}

fn a_plus_disp(base: &str, d: i64) -> String {
    if d == 0 {
        base.to_string()
    } else if d > 0 {
        format!("{}+{}", base, d)
    } else {
        format!("{}-{}", base, -d)
    }
}

/// Word loads and stores across the five storage classes, each supporting
/// no offset, a compile-time offset (already folded into the base), and a
/// register-held offset.
impl Emitter {
    pub fn load_word(
        &mut self,
        regs: &mut RegFile,
        d: SReg,
        base: &Base,
        index: Option<SReg>,
    ) -> Result<(), CompileError> {
        match (base, index) {
            (Base::Frame(disp), None) => {
                self.instr(&d.to_string(), &frame_disp(*disp));
            }
            (Base::Frame(disp), Some(x)) => {
                let ay = regs.alloc_a()?;
                self.instr(&ay.to_string(), &x.to_string());
                self.instr(&ay.to_string(), &format!("{}+A6", ay));
                self.instr(&d.to_string(), &format!("{},{}", disp, ay));
                regs.free_a(ay);
            }
            (Base::Label(l, disp), None) => {
                self.instr(&d.to_string(), &format!("{},0", label_expr(l, *disp)));
            }
            (Base::Label(l, disp), Some(x)) => {
                let ay = regs.alloc_a()?;
                self.instr(&ay.to_string(), &x.to_string());
                self.instr(&d.to_string(), &format!("{},{}", label_expr(l, *disp), ay));
                regs.free_a(ay);
            }
            (Base::ArgSlot(slot, disp), None) => {
                let ay = regs.alloc_a()?;
                self.instr(&ay.to_string(), &frame_disp(*slot));
                self.instr(&d.to_string(), &format!("{},{}", disp, ay));
                regs.free_a(ay);
            }
            (Base::ArgSlot(slot, disp), Some(x)) => {
                let ay = regs.alloc_a()?;
                let az = regs.alloc_a()?;
                self.instr(&ay.to_string(), &frame_disp(*slot));
                self.instr(&az.to_string(), &x.to_string());
                self.instr(&ay.to_string(), &format!("{}+{}", ay, az));
                self.instr(&d.to_string(), &format!("{},{}", disp, ay));
                regs.free_a(az);
                regs.free_a(ay);
            }
        }
        Ok(())
    }

    pub fn store_word(
        &mut self,
        regs: &mut RegFile,
        s: SReg,
        base: &Base,
        index: Option<SReg>,
    ) -> Result<(), CompileError> {
        match (base, index) {
            (Base::Frame(disp), None) => {
                self.instr(&frame_disp(*disp), &s.to_string());
            }
            (Base::Frame(disp), Some(x)) => {
                let ay = regs.alloc_a()?;
                self.instr(&ay.to_string(), &x.to_string());
                self.instr(&ay.to_string(), &format!("{}+A6", ay));
                self.instr(&format!("{},{}", disp, ay), &s.to_string());
                regs.free_a(ay);
            }
            (Base::Label(l, disp), None) => {
                self.instr(&format!("{},0", label_expr(l, *disp)), &s.to_string());
            }
            (Base::Label(l, disp), Some(x)) => {
                let ay = regs.alloc_a()?;
                self.instr(&ay.to_string(), &x.to_string());
                self.instr(&format!("{},{}", label_expr(l, *disp), ay), &s.to_string());
                regs.free_a(ay);
            }
            (Base::ArgSlot(slot, disp), None) => {
                let ay = regs.alloc_a()?;
                self.instr(&ay.to_string(), &frame_disp(*slot));
                self.instr(&format!("{},{}", disp, ay), &s.to_string());
                regs.free_a(ay);
            }
            (Base::ArgSlot(slot, disp), Some(x)) => {
                let ay = regs.alloc_a()?;
                let az = regs.alloc_a()?;
                self.instr(&ay.to_string(), &frame_disp(*slot));
                self.instr(&az.to_string(), &x.to_string());
                self.instr(&ay.to_string(), &format!("{}+{}", ay, az));
                self.instr(&format!("{},{}", disp, ay), &s.to_string());
                regs.free_a(az);
                regs.free_a(ay);
            }
        }
        Ok(())
    }

    /// Materialises the word address of a reference into an S register;
    /// this is how actual arguments are passed by reference.
    pub fn load_addr(
        &mut self,
        regs: &mut RegFile,
        d: SReg,
        base: &Base,
        index: Option<SReg>,
    ) -> Result<(), CompileError> {
        match base {
            Base::Frame(disp) => {
                let ay = regs.alloc_a()?;
                self.instr(&ay.to_string(), &a_plus_disp("A6", *disp));
                self.instr(&d.to_string(), &ay.to_string());
                regs.free_a(ay);
            }
            Base::Label(l, disp) => {
                self.instr(&d.to_string(), &label_expr(l, *disp));
            }
            Base::ArgSlot(slot, disp) => {
                let ay = regs.alloc_a()?;
                self.instr(&ay.to_string(), &frame_disp(*slot));
                if *disp != 0 {
                    self.instr(&ay.to_string(), &a_plus_disp(&ay.to_string(), *disp));
                }
                self.instr(&d.to_string(), &ay.to_string());
                regs.free_a(ay);
            }
        }
        if let Some(x) = index {
            self.instr(&d.to_string(), &format!("{}+{}", d, x));
        }
        Ok(())
    }

    /// Load through a word address held in an S register.
    pub fn load_indirect(
        &mut self,
        regs: &mut RegFile,
        d: SReg,
        addr: SReg,
    ) -> Result<(), CompileError> {
        let ay = regs.alloc_a()?;
        self.instr(&ay.to_string(), &addr.to_string());
        self.instr(&d.to_string(), &format!("0,{}", ay));
        regs.free_a(ay);
        Ok(())
    }

    pub fn store_indirect(
        &mut self,
        regs: &mut RegFile,
        s: SReg,
        addr: SReg,
    ) -> Result<(), CompileError> {
        let ay = regs.alloc_a()?;
        self.instr(&ay.to_string(), &addr.to_string());
        self.instr(&format!("0,{}", ay), &s.to_string());
        regs.free_a(ay);
        Ok(())
    }

    /// Builds the descriptor of a character reference: the byte address
    /// (word address times eight plus the byte displacement) ORed with the
    /// length in the high 32 bits. A register-held `byte_index` is a byte
    /// offset, pre-scaled by the element length. Character dummy
    /// arguments already arrive as descriptors and are loaded directly.
    pub fn char_descriptor(
        &mut self,
        regs: &mut RegFile,
        d: SReg,
        mr: &MemRef,
        byte_index: Option<SReg>,
    ) -> Result<(), CompileError> {
        let chr = mr.chr.expect("character reference without CharRef");
        let mut need_len = true;
        match &mr.base {
            Base::Label(l, disp) => {
                let byte = disp * 8 + chr.byte_off;
                let expr = if byte == 0 {
                    format!("{}*8", l)
                } else if byte > 0 {
                    format!("{}*8+{}", l, byte)
                } else {
                    format!("{}*8-{}", l, -byte)
                };
                self.load_imm(d, &expr);
            }
            Base::Frame(disp) => {
                let ay = regs.alloc_a()?;
                self.instr(&ay.to_string(), &a_plus_disp("A6", *disp));
                self.instr(&d.to_string(), &ay.to_string());
                regs.free_a(ay);
                self.instr(&d.to_string(), &format!("{}<3", d));
                if chr.byte_off != 0 {
                    let t = regs.alloc_s()?;
                    self.load_imm(t, &chr.byte_off.to_string());
                    self.add_int(d, d, t);
                    regs.free_s(t);
                }
            }
            Base::ArgSlot(slot, disp) => {
                // descriptor is the argument word itself
                self.instr(&d.to_string(), &frame_disp(*slot));
                let byte = disp * 8 + chr.byte_off;
                if byte != 0 {
                    let t = regs.alloc_s()?;
                    self.load_imm(t, &byte.to_string());
                    self.add_int(d, d, t);
                    regs.free_s(t);
                }
                need_len = false;
            }
        }
        if let Some(x) = byte_index {
            self.add_int(d, d, x);
        }
        if need_len {
            let t = regs.alloc_s()?;
            self.load_imm(t, &chr.len.to_string());
            self.instr(&t.to_string(), &format!("{}<32", t));
            self.or(d, d, t);
            regs.free_s(t);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_load_and_store() {
        let mut em = Emitter::new();
        let mut regs = RegFile::new();
        em.load_word(&mut regs, SReg(1), &Base::Frame(-1), None).unwrap();
        em.store_word(&mut regs, SReg(1), &Base::Frame(-1), None).unwrap();
        let l = em.code_lines();
        assert_eq!(l[0], "         S1        -1,A6");
        assert_eq!(l[1], "         -1,A6     S1");
        assert!(regs.a.at_initial());
    }

    #[test]
    fn static_load_uses_the_label() {
        let mut em = Emitter::new();
        let mut regs = RegFile::new();
        let base = Base::Label("L00002".to_string(), 3);
        em.load_word(&mut regs, SReg(2), &base, None).unwrap();
        assert_eq!(em.code_lines()[0], "         S2        L00002+3,0");
    }

    #[test]
    fn register_subscript_goes_through_an_a_register() {
        let mut em = Emitter::new();
        let mut regs = RegFile::new();
        em.load_word(&mut regs, SReg(1), &Base::Frame(-11), Some(SReg(2)))
            .unwrap();
        let l = em.code_lines();
        assert_eq!(l[0], "         A2        S2");
        assert_eq!(l[1], "         A2        A2+A6");
        assert_eq!(l[2], "         S1        -11,A2");
        assert!(regs.a.at_initial());
    }

    #[test]
    fn argument_slot_is_indirect() {
        let mut em = Emitter::new();
        let mut regs = RegFile::new();
        em.load_word(&mut regs, SReg(3), &Base::ArgSlot(2, 0), None)
            .unwrap();
        let l = em.code_lines();
        assert_eq!(l[0], "         A2        2,A6");
        assert_eq!(l[1], "         S3        0,A2");
    }

    #[test]
    fn indirect_load_through_an_s_held_address() {
        let mut em = Emitter::new();
        let mut regs = RegFile::new();
        em.load_indirect(&mut regs, SReg(1), SReg(2)).unwrap();
        let l = em.code_lines();
        assert_eq!(l[0], "         A2        S2");
        assert_eq!(l[1], "         S1        0,A2");
    }

    #[test]
    fn character_descriptor_from_static() {
        let mut em = Emitter::new();
        let mut regs = RegFile::new();
        let mr = MemRef {
            base: Base::Label("L00004".to_string(), 0),
            chr: Some(CharRef { len: 8, byte_off: 0 }),
        };
        let d = regs.alloc_s().unwrap();
        em.char_descriptor(&mut regs, d, &mr, None).unwrap();
        let l = em.code_lines();
        assert_eq!(l[0], "         S1        L00004*8");
        assert_eq!(l[1], "         S2        8");
        assert_eq!(l[2], "         S2        S2<32");
        assert_eq!(l[3], "         S1        S1!S2");
    }
}
