/// One assembled statement: the label from columns 1-5, the statement
/// text joined across continuation lines (columns 7-72 each), and the
/// raw source lines it came from for the listing echo.
#[derive(Debug)]
pub struct Statement {
    pub label: Option<u32>,
    pub text: String,
    pub line: u32,
    pub raw: Vec<(u32, String)>,
}

/// The longest statement buffer accepted: an initial line plus 19
/// continuations. Anything longer is silently truncated.
const STMT_BUFFER_LIMIT: usize = 20 * 66;

/// Fixed-form reader. Columns 1-5 carry the statement label, column 6 a
/// continuation indicator (blank or `0` opens a new statement), columns
/// 7-72 the statement text. `C`, `c`, `*`, or `!` in column 1 marks a
/// comment line. Text is upper-cased outside character constants, with
/// the quote state carried across continuations.
pub struct Reader<'a> {
    lines: std::vec::IntoIter<(u32, &'a str)>,
    pending: Option<(u32, &'a str)>,
}

impl<'a> Reader<'a> {
    pub fn new(source: &'a str) -> Reader<'a> {
        let lines: Vec<(u32, &str)> = source
            .lines()
            .enumerate()
            .map(|(i, l)| (i as u32 + 1, l))
            .collect();
        Reader {
            lines: lines.into_iter(),
            pending: None,
        }
    }

    fn next_line(&mut self) -> Option<(u32, &'a str)> {
        self.pending.take().or_else(|| self.lines.next())
    }

    fn is_comment(line: &str) -> bool {
        matches!(
            line.as_bytes().first().copied(),
            Some(b'C') | Some(b'c') | Some(b'*') | Some(b'!')
        )
    }

    fn is_continuation(line: &str) -> bool {
        if Self::is_comment(line) {
            return false;
        }
        match line.as_bytes().get(5) {
            Some(&c) => c != b' ' && c != b'0',
            None => false,
        }
    }
}

/// Columns 7-72 of a line, right-padded conceptually (short lines just
/// contribute nothing) and truncated at column 72.
fn body_field(line: &str) -> &str {
    let bytes = line.as_bytes();
    if bytes.len() <= 6 {
        return "";
    }
    let end = bytes.len().min(72);
    &line[6..end]
}

fn label_field(line: &str) -> Option<u32> {
    let bytes = line.as_bytes();
    let mut value: u32 = 0;
    let mut any = false;
    for &c in bytes.iter().take(5) {
        if c == b' ' {
            continue;
        }
        if !c.is_ascii_digit() {
            return None;
        }
        any = true;
        value = value * 10 + (c - b'0') as u32;
    }
    if any {
        Some(value)
    } else {
        None
    }
}

/// Appends `body` to the statement buffer, upper-casing outside character
/// constants. Returns the updated quote state.
fn append_upcased(buf: &mut String, body: &str, mut in_quote: bool) -> bool {
    for c in body.chars() {
        if buf.len() >= STMT_BUFFER_LIMIT {
            break;
        }
        if c == '\'' {
            in_quote = !in_quote;
            buf.push(c);
        } else if in_quote {
            buf.push(c);
        } else {
            buf.push(c.to_ascii_uppercase());
        }
    }
    in_quote
}

impl<'a> Iterator for Reader<'a> {
    type Item = Statement;

    fn next(&mut self) -> Option<Statement> {
        let mut raw: Vec<(u32, String)> = Vec::new();

        // skip (but keep for the listing) leading comments and blanks
        let (first_no, first) = loop {
            let (no, line) = self.next_line()?;
            if Reader::is_comment(line) || line.trim().is_empty() {
                raw.push((no, line.to_string()));
                continue;
            }
            break (no, line);
        };

        raw.push((first_no, first.to_string()));
        let label = label_field(first);
        let mut text = String::new();
        let mut in_quote = append_upcased(&mut text, body_field(first), false);

        // pull continuations, letting interleaved comments through
        loop {
            match self.next_line() {
                None => break,
                Some((no, line)) => {
                    if Reader::is_comment(line) {
                        raw.push((no, line.to_string()));
                        continue;
                    }
                    if Reader::is_continuation(line) {
                        raw.push((no, line.to_string()));
                        in_quote = append_upcased(&mut text, body_field(line), in_quote);
                    } else {
                        self.pending = Some((no, line));
                        break;
                    }
                }
            }
        }

        Some(Statement {
            label,
            text,
            line: first_no,
            raw,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn statements(src: &str) -> Vec<Statement> {
        Reader::new(src).collect()
    }

    #[test]
    fn labels_and_bodies() {
        let src = "\
      PROGRAM P
   10 CONTINUE
      END
";
        let s = statements(src);
        assert_eq!(s.len(), 3);
        assert_eq!(s[0].label, None);
        assert_eq!(s[0].text, "PROGRAM P");
        assert_eq!(s[1].label, Some(10));
        assert_eq!(s[1].text, "CONTINUE");
    }

    #[test]
    fn continuation_lines_join() {
        let src = "\
      X = 1 +
     &    2 +
     1    3
";
        let s = statements(src);
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].text.replace(' ', ""), "X=1+2+3");
        assert_eq!(s[0].raw.len(), 3);
    }

    #[test]
    fn comments_are_skipped_but_kept_for_the_listing() {
        let src = "\
C     HEADER COMMENT
* ANOTHER
      X = 1
!     TRAILING STYLE
      Y = 2
";
        let s = statements(src);
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].raw.len(), 3);
        assert_eq!(s[0].text.replace(' ', ""), "X=1");
    }

    #[test]
    fn text_uppercases_outside_quotes() {
        let src = "      s = 'Hello'\n";
        let s = statements(src);
        assert_eq!(s[0].text.trim(), "S = 'Hello'");
    }

    #[test]
    fn long_lines_truncate_at_column_72() {
        let mut line = String::from("      X = 1");
        line.push_str(&" ".repeat(80));
        line.push_str("IGNORED");
        let s = statements(&line);
        assert!(!s[0].text.contains("IGNORED"));
    }

    #[test]
    fn column_six_zero_opens_a_new_statement() {
        let src = "\
      X = 1
     0Y = 2
";
        let s = statements(src);
        assert_eq!(s.len(), 2);
    }
}
