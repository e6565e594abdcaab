use super::Emitter;
use crate::compile::regs::SReg;

/// Conditional branches test S0.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Cond {
    Zero,
    NonZero,
    Plus,
    Minus,
}

impl Cond {
    fn mnemonic(self) -> &'static str {
        match self {
            Cond::Zero => "JSZ",
            Cond::NonZero => "JSN",
            Cond::Plus => "JSP",
            Cond::Minus => "JSM",
        }
    }
}

impl Emitter {
    pub fn jump(&mut self, label: &str) {
        self.instr("J", label);
    }

    pub fn branch(&mut self, cond: Cond, label: &str) {
        self.instr(cond.mnemonic(), label);
    }

    /// Tests a register's sign-bit truth value and branches when false
    /// (zero is false, so JSP falls on the false side).
    pub fn branch_false(&mut self, r: SReg, label: &str) {
        self.instr("S0", &r.to_string());
        self.branch(Cond::Plus, label);
    }

    /// Indirect jump through B01; the word address must already be in an
    /// S register.
    pub fn jump_register(&mut self, addr: SReg) {
        self.instr("A1", &addr.to_string());
        self.instr("B01", "A1");
        self.instr("J", "B01");
    }

    /// Unit entry: push the caller's frame pointer, push the return
    /// address out of B00, establish the new frame, and drop the stack by
    /// the frame size held behind a forward-referenced equate. PROGRAM
    /// units additionally initialise formatted I/O.
    pub fn prolog(&mut self, entry: &str, frame_label: &str, is_program: bool) {
        self.instr_labeled(entry, "A7", "A7-1");
        self.instr("0,A7", "A6");
        self.instr("A1", "B00");
        self.instr("A7", "A7-1");
        self.instr("0,A7", "A1");
        self.instr("A6", "A7");
        self.instr("A1", frame_label);
        self.instr("A7", "A7-A1");
        if is_program {
            self.call("@%inifio");
        }
    }

    /// Unit exit, mirroring `prolog`. The caller loads S7 from the result
    /// slot first for FUNCTION units.
    pub fn epilog(&mut self) {
        self.instr("A7", "A6");
        self.instr("A1", "0,A7");
        self.instr("B00", "A1");
        self.instr("A7", "A7+1");
        self.instr("A6", "0,A7");
        self.instr("A7", "A7+1");
        self.instr("J", "B00");
    }

    /// Bounds check for a register-held zero-based offset against a
    /// constant extent: negative or past the end traps to the runtime.
    pub fn bounds_check(&mut self, offset: SReg, extent: SReg, err_label: &str, ok_label: &str) {
        self.instr("S0", &offset.to_string());
        self.branch(Cond::Minus, err_label);
        self.instr("S0", &format!("{}-{}", offset, extent));
        self.branch(Cond::Minus, ok_label);
        self.place_label(err_label);
        self.call("@%bnderr");
        self.place_label(ok_label);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prolog_shape() {
        let mut em = Emitter::new();
        em.prolog("@MAIN", "L00001", true);
        let l = em.code_lines();
        assert_eq!(l[0], "@MAIN    A7        A7-1");
        assert_eq!(l[1], "         0,A7      A6");
        assert_eq!(l[2], "         A1        B00");
        assert_eq!(l[5], "         A6        A7");
        assert_eq!(l[6], "         A1        L00001");
        assert_eq!(l[7], "         A7        A7-A1");
        assert_eq!(l[8], "         R         @%inifio");
    }

    #[test]
    fn subroutine_prolog_skips_io_init() {
        let mut em = Emitter::new();
        em.prolog("@SUB", "L00002", false);
        assert!(!em.code_lines().iter().any(|s| s.contains("inifio")));
    }

    #[test]
    fn epilog_mirrors_prolog() {
        let mut em = Emitter::new();
        em.epilog();
        let l = em.code_lines();
        assert_eq!(l[0], "         A7        A6");
        assert_eq!(l.last().unwrap(), "         J         B00");
    }

    #[test]
    fn branch_false_tests_the_sign_bit() {
        let mut em = Emitter::new();
        em.branch_false(SReg(2), "L00005");
        let l = em.code_lines();
        assert_eq!(l[0], "         S0        S2");
        assert_eq!(l[1], "         JSP       L00005");
    }
}
