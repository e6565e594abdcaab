use super::control::Cond;
use super::Emitter;
use crate::compile::regs::SReg;
use crate::compile::token::OperatorId;

/// Comparisons subtract into S0, assume truth by loading the all-ones
/// mask `<64` into the destination, branch-skip on the condition, and
/// clear the destination on the fall-through. The sign-bit convention
/// makes the result directly usable by the logical operators.
impl Emitter {
    pub fn compare(
        &mut self,
        d: SReg,
        a: SReg,
        b: SReg,
        op: OperatorId,
        float: bool,
        skip_label: &str,
    ) {
        // Le and Gt reverse the subtraction so only four branch forms
        // are needed.
        let (x, y, cond) = match op {
            OperatorId::Eq => (a, b, Cond::Zero),
            OperatorId::Ne => (a, b, Cond::NonZero),
            OperatorId::Lt => (a, b, Cond::Minus),
            OperatorId::Ge => (a, b, Cond::Plus),
            OperatorId::Le => (b, a, Cond::Plus),
            OperatorId::Gt => (b, a, Cond::Minus),
            _ => unreachable!("not a relational operator"),
        };
        if float {
            self.instr("S0", &format!("{}-F{}", x, y));
        } else {
            self.instr("S0", &format!("{}-{}", x, y));
        }
        self.load_imm(d, "<64");
        self.branch(cond, skip_label);
        self.load_imm(d, "0");
        self.place_label(skip_label);
    }

    /// Compares the sign of a value already in a register; used for the
    /// relational result of `@_cmpstr` (negative, zero, positive).
    pub fn compare_with_zero(&mut self, d: SReg, a: SReg, op: OperatorId, skip_label: &str) {
        let cond = match op {
            OperatorId::Eq => Cond::Zero,
            OperatorId::Ne => Cond::NonZero,
            OperatorId::Lt => Cond::Minus,
            OperatorId::Ge => Cond::Plus,
            // Le / Gt need the complement conditions, so test the negated
            // value instead.
            OperatorId::Le | OperatorId::Gt => {
                self.instr("S0", &format!("-{}", a));
                let cond = if op == OperatorId::Le {
                    Cond::Plus
                } else {
                    Cond::Minus
                };
                self.load_imm(d, "<64");
                self.branch(cond, skip_label);
                self.load_imm(d, "0");
                self.place_label(skip_label);
                return;
            }
            _ => unreachable!("not a relational operator"),
        };
        self.instr("S0", &a.to_string());
        self.load_imm(d, "<64");
        self.branch(cond, skip_label);
        self.load_imm(d, "0");
        self.place_label(skip_label);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn less_than_uses_jsm() {
        let mut em = Emitter::new();
        em.compare(SReg(3), SReg(1), SReg(2), OperatorId::Lt, false, "L00001");
        let l = em.code_lines();
        assert_eq!(l[0], "         S0        S1-S2");
        assert_eq!(l[1], "         S3        <64");
        assert_eq!(l[2], "         JSM       L00001");
        assert_eq!(l[3], "         S3        0");
        assert_eq!(l[4], "L00001   =         *");
    }

    #[test]
    fn greater_than_reverses_the_subtract() {
        let mut em = Emitter::new();
        em.compare(SReg(3), SReg(1), SReg(2), OperatorId::Gt, true, "L00001");
        let l = em.code_lines();
        assert_eq!(l[0], "         S0        S2-FS1");
        assert_eq!(l[2], "         JSM       L00001");
    }

    #[test]
    fn equality_uses_jsz() {
        let mut em = Emitter::new();
        em.compare(SReg(4), SReg(5), SReg(6), OperatorId::Eq, false, "L00009");
        assert_eq!(em.code_lines()[2], "         JSZ       L00009");
    }
}
