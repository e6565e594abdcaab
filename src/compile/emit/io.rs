use super::Emitter;
use crate::compile::regs::SReg;

/// Words in the formatted-I/O frame: the format descriptor, the unit
/// number, and two words the runtime owns.
pub const IO_FRAME_WORDS: u64 = 4;

/// Formatted I/O brackets a four-word frame: the prologue stores the
/// format specifier (a format-label word address or the descriptor of a
/// character expression) and the unit; each list element is one
/// `@_infmt` / `@_outfmt` call taking the list ordinal and the element's
/// address; `@_endfmt` drains the frame.
impl Emitter {
    pub fn io_begin(&mut self, fmt: SReg, unit: SReg) {
        self.grow_stack(IO_FRAME_WORDS);
        self.instr("0,A7", &fmt.to_string());
        self.instr("1,A7", &unit.to_string());
    }

    pub fn io_item(&mut self, input: bool, ordinal: SReg, addr: SReg, save_mask: u8) {
        let target = if input { "@%infmt" } else { "@%outfmt" };
        self.primitive_call(target, &[ordinal, addr], save_mask);
    }

    pub fn io_end(&mut self, save_mask: u8) {
        self.primitive_call("@%endfmt", &[], save_mask);
        self.drop_stack(IO_FRAME_WORDS);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_bracket() {
        let mut em = Emitter::new();
        em.io_begin(SReg(1), SReg(2));
        em.io_end(0);
        let l = em.code_lines();
        assert_eq!(l[0], "         A7        A7-4");
        assert_eq!(l[1], "         0,A7      S1");
        assert_eq!(l[2], "         1,A7      S2");
        assert_eq!(l[3], "         R         @%endfmt");
        assert_eq!(l[4], "         A7        A7+4");
    }

    #[test]
    fn output_item_calls_outfmt() {
        let mut em = Emitter::new();
        em.io_item(false, SReg(1), SReg(2), 0);
        assert!(em
            .code_lines()
            .iter()
            .any(|s| s.contains("R         @%outfmt")));
    }
}
