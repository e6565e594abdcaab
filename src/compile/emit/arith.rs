use super::Emitter;
use crate::compile::regs::{SReg, S_RESULT};

/// Integer add and subtract are native S-register operations; real and
/// double use the floating `F` modifier. Multiplication and division go
/// through the `%mli` / `%dvi` / `%dvf` primitives with the caller-save
/// discipline, leaving the result in S7.
impl Emitter {
    pub fn move_s(&mut self, d: SReg, a: SReg) {
        if d != a {
            self.instr(&d.to_string(), &a.to_string());
        }
    }

    pub fn load_imm(&mut self, d: SReg, literal: &str) {
        self.instr(&d.to_string(), literal);
    }

    pub fn add_int(&mut self, d: SReg, a: SReg, b: SReg) {
        self.instr(&d.to_string(), &format!("{}+{}", a, b));
    }

    pub fn sub_int(&mut self, d: SReg, a: SReg, b: SReg) {
        self.instr(&d.to_string(), &format!("{}-{}", a, b));
    }

    pub fn add_float(&mut self, d: SReg, a: SReg, b: SReg) {
        self.instr(&d.to_string(), &format!("{}+F{}", a, b));
    }

    pub fn sub_float(&mut self, d: SReg, a: SReg, b: SReg) {
        self.instr(&d.to_string(), &format!("{}-F{}", a, b));
    }

    /// Floating multiply is native on the multiply unit.
    pub fn mul_float(&mut self, d: SReg, a: SReg, b: SReg) {
        self.instr(&d.to_string(), &format!("{}*F{}", a, b));
    }

    pub fn mul_int_call(&mut self, d: SReg, a: SReg, b: SReg, save_mask: u8) {
        self.primitive_call("%mli", &[a, b], save_mask);
        self.move_s(d, S_RESULT);
    }

    pub fn div_int_call(&mut self, d: SReg, a: SReg, b: SReg, save_mask: u8) {
        self.primitive_call("%dvi", &[a, b], save_mask);
        self.move_s(d, S_RESULT);
    }

    pub fn div_float_call(&mut self, d: SReg, a: SReg, b: SReg, save_mask: u8) {
        self.primitive_call("%dvf", &[a, b], save_mask);
        self.move_s(d, S_RESULT);
    }

    pub fn neg_int(&mut self, d: SReg, a: SReg) {
        self.instr(&d.to_string(), &format!("-{}", a));
    }

    pub fn neg_float(&mut self, d: SReg, a: SReg) {
        self.instr(&d.to_string(), &format!("-F{}", a));
    }

    // --- bitwise forms backing the logical operators; truth is the
    // all-ones word, falsity zero ---

    pub fn and(&mut self, d: SReg, a: SReg, b: SReg) {
        self.instr(&d.to_string(), &format!("{}&{}", a, b));
    }

    pub fn or(&mut self, d: SReg, a: SReg, b: SReg) {
        self.instr(&d.to_string(), &format!("{}!{}", a, b));
    }

    pub fn xor(&mut self, d: SReg, a: SReg, b: SReg) {
        self.instr(&d.to_string(), &format!("{}\\{}", a, b));
    }

    pub fn complement(&mut self, d: SReg, a: SReg) {
        self.instr(&d.to_string(), &format!("#{}", a));
    }

    /// Left shift by a constant count; CAL shifts operate in place.
    pub fn shift_left(&mut self, d: SReg, a: SReg, count: u32) {
        self.move_s(d, a);
        self.instr(&d.to_string(), &format!("{}<{}", d, count));
    }

    pub fn shift_right(&mut self, d: SReg, a: SReg, count: u32) {
        self.move_s(d, a);
        self.instr(&d.to_string(), &format!("{}>{}", d, count));
    }

    // --- type conversions through the convert primitives ---

    pub fn int_to_real(&mut self, d: SReg, a: SReg, save_mask: u8) {
        self.primitive_call("%cif", &[a], save_mask);
        self.move_s(d, S_RESULT);
    }

    pub fn real_to_int(&mut self, d: SReg, a: SReg, save_mask: u8) {
        self.primitive_call("%cfi", &[a], save_mask);
        self.move_s(d, S_RESULT);
    }

    /// `base ** exp` through the runtime library; operands must already be
    /// floating.
    pub fn pow_call(&mut self, d: SReg, base: SReg, exp: SReg, save_mask: u8) {
        self.primitive_call("@%pow", &[base, exp], save_mask);
        self.move_s(d, S_RESULT);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lines(em: &Emitter) -> Vec<String> {
        em.code_lines()
    }

    #[test]
    fn integer_add_is_native() {
        let mut em = Emitter::new();
        em.add_int(SReg(3), SReg(1), SReg(2));
        assert_eq!(lines(&em), vec!["         S3        S1+S2"]);
    }

    #[test]
    fn float_forms_carry_the_f_modifier() {
        let mut em = Emitter::new();
        em.sub_float(SReg(4), SReg(1), SReg(2));
        em.mul_float(SReg(4), SReg(1), SReg(2));
        let l = lines(&em);
        assert_eq!(l[0], "         S4        S1-FS2");
        assert_eq!(l[1], "         S4        S1*FS2");
    }

    #[test]
    fn multiply_goes_through_the_primitive() {
        let mut em = Emitter::new();
        em.mul_int_call(SReg(1), SReg(1), SReg(2), 0);
        let l = lines(&em);
        assert!(l.iter().any(|s| s.contains("R         %mli")));
        assert_eq!(l.last().unwrap(), "         S1        S7");
    }

    #[test]
    fn save_mask_wraps_the_call() {
        let mut em = Emitter::new();
        em.div_int_call(SReg(2), SReg(3), SReg(4), 0b0000_0010);
        let l = lines(&em);
        // S1 saved first, restored last
        assert_eq!(l[1], "         0,A7      S1");
        assert!(l.last().unwrap().contains("S2"));
        assert!(l[l.len() - 3].starts_with("         S1"));
    }
}
