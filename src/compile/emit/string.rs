use super::Emitter;
use crate::compile::regs::{SReg, S_RESULT};

/// Character operations run in the runtime library on a two-word stack
/// frame of descriptors. `@_cmpstr` returns the comparison sign in S7;
/// `@_catstr` returns the descriptor of the concatenation; `@_cpystr`
/// copies right into left, honouring both lengths with blank padding.
impl Emitter {
    pub fn copy_str(&mut self, dst_desc: SReg, src_desc: SReg, save_mask: u8) {
        self.primitive_call("@%cpystr", &[dst_desc, src_desc], save_mask);
    }

    pub fn compare_str(&mut self, d: SReg, a_desc: SReg, b_desc: SReg, save_mask: u8) {
        self.primitive_call("@%cmpstr", &[a_desc, b_desc], save_mask);
        self.move_s(d, S_RESULT);
    }

    pub fn concat_str(&mut self, d: SReg, a_desc: SReg, b_desc: SReg, save_mask: u8) {
        self.primitive_call("@%catstr", &[a_desc, b_desc], save_mask);
        self.move_s(d, S_RESULT);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn copy_pushes_two_descriptors() {
        let mut em = Emitter::new();
        em.copy_str(SReg(1), SReg(2), 0);
        let l = em.code_lines();
        assert_eq!(l[1], "         0,A7      S1");
        assert_eq!(l[3], "         0,A7      S2");
        assert_eq!(l[4], "         R         @%cpystr");
        assert_eq!(l[5], "         A7        A7+2");
    }
}
