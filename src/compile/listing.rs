use crate::compile::symtab::SymbolTable;
use crate::error::{Diagnostic, Severity};
use chrono::{DateTime, Local};
use std::io::{self, Write};

const PAGE_BODY_LINES: u32 = 55;
const CPU_LABEL: &str = "CRAY X-MP";

/// Paginated compilation listing: source echo with line numbers, inline
/// error annotations, and the end-of-unit symbol table. Every page opens
/// with a header carrying the CPU label, compiler name and version, date,
/// time, and page number.
pub struct Listing {
    out: Box<dyn Write>,
    page: u32,
    lines_on_page: u32,
    stamp: DateTime<Local>,
}

impl Listing {
    pub fn new(out: Box<dyn Write>) -> Listing {
        Listing {
            out,
            page: 0,
            lines_on_page: PAGE_BODY_LINES,
            stamp: Local::now(),
        }
    }

    fn line(&mut self, text: &str) -> io::Result<()> {
        if self.lines_on_page >= PAGE_BODY_LINES {
            self.page += 1;
            self.lines_on_page = 0;
            if self.page > 1 {
                writeln!(self.out, "\u{c}")?;
            }
            writeln!(
                self.out,
                "{:<12}{} {:<10}{}  {}  PAGE {:>4}",
                CPU_LABEL,
                env!("CARGO_PKG_NAME").to_uppercase(),
                env!("CARGO_PKG_VERSION"),
                self.stamp.format("%m/%d/%y"),
                self.stamp.format("%H:%M:%S"),
                self.page
            )?;
            writeln!(self.out)?;
            self.lines_on_page = 2;
        }
        writeln!(self.out, "{}", text)?;
        self.lines_on_page += 1;
        Ok(())
    }

    pub fn source_line(&mut self, no: u32, text: &str) -> io::Result<()> {
        let line = format!("{:>6}  {}", no, text);
        self.line(&line)
    }

    pub fn annotation(&mut self, diag: &Diagnostic) -> io::Result<()> {
        let tag = match diag.severity {
            Severity::Error => "*ERROR*",
            Severity::Warning => "*WARNING*",
        };
        let line = format!("        {:<9} line {}: {}", tag, diag.line, diag.message);
        self.line(&line)
    }

    pub fn blank(&mut self) -> io::Result<()> {
        self.line("")
    }

    /// The symbol table appended at the END of each program unit.
    pub fn symbol_table(&mut self, unit: &str, symbols: &SymbolTable) -> io::Result<()> {
        self.blank()?;
        self.line(&format!("  SYMBOL TABLE FOR {}", unit))?;
        self.line("  NAME      CLASS       TYPE              OFFSET")?;
        for sym in symbols.iter_in_order() {
            let line = format!(
                "  {:<10}{:<12}{:<18}{:>6}",
                sym.name,
                sym.class.to_string(),
                sym.dtype.base.to_string(),
                sym.offset
            );
            self.line(&line)?;
        }
        Ok(())
    }

    pub fn summary(&mut self, text: &str) -> io::Result<()> {
        self.blank()?;
        self.line(&format!("  {}", text))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Shared(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture() -> (Listing, std::rc::Rc<std::cell::RefCell<Vec<u8>>>) {
        let buf = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        (Listing::new(Box::new(Shared(buf.clone()))), buf)
    }

    #[test]
    fn first_line_emits_the_page_header() {
        let (mut listing, buf) = capture();
        listing.source_line(1, "      PROGRAM P").unwrap();
        let text = String::from_utf8(buf.borrow().clone()).unwrap();
        assert!(text.starts_with("CRAY X-MP"));
        assert!(text.contains("PAGE    1"));
        assert!(text.contains("     1        PROGRAM P"));
    }

    #[test]
    fn pagination_breaks_after_a_full_page() {
        let (mut listing, buf) = capture();
        for i in 0..120 {
            listing.source_line(i + 1, "      CONTINUE").unwrap();
        }
        let text = String::from_utf8(buf.borrow().clone()).unwrap();
        assert!(text.contains("PAGE    2"));
        assert!(text.contains("PAGE    3"));
    }

    #[test]
    fn annotations_carry_the_severity_tag() {
        let (mut listing, buf) = capture();
        listing
            .annotation(&Diagnostic {
                line: 3,
                severity: Severity::Error,
                message: "division by zero in constant expression".into(),
            })
            .unwrap();
        let text = String::from_utf8(buf.borrow().clone()).unwrap();
        assert!(text.contains("*ERROR*"));
        assert!(text.contains("line 3"));
    }
}
