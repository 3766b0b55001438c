//! Reader for the serialized bias-flag column.
//!
//! The bias stage writes a Python-style list such as `['ninja', 'rockstar']`. Its contents
//! derive from candidate documents, so the column is treated as untrusted: only a flat list
//! of scalars is accepted and anything else counts as zero flags.

const KEYWORDS: &[&str] = &["True", "False", "None", "true", "false", "null"];

/// Number of entries in a serialized flag list, or `None` if it is not a flat scalar list.
pub fn parse_flag_list(raw: &str) -> Option<usize> {
    let mut parser = ListParser {
        chars: raw.chars().collect(),
        pos: 0,
    };
    parser.list()
}

/// Flag count with malformed input treated as no flags.
pub fn flag_count(raw: &str) -> usize {
    parse_flag_list(raw).unwrap_or(0)
}

struct ListParser {
    chars: Vec<char>,
    pos: usize,
}

impl ListParser {
    fn list(&mut self) -> Option<usize> {
        self.skip_whitespace();
        self.expect('[')?;
        self.skip_whitespace();

        let mut count = 0;
        if self.eat(']') {
            return self.finish(count);
        }

        loop {
            self.scalar()?;
            count += 1;
            self.skip_whitespace();

            if self.eat(']') {
                return self.finish(count);
            }
            self.expect(',')?;
            self.skip_whitespace();
            if self.eat(']') {
                return self.finish(count);
            }
        }
    }

    fn finish(&mut self, count: usize) -> Option<usize> {
        self.skip_whitespace();
        (self.pos == self.chars.len()).then_some(count)
    }

    fn scalar(&mut self) -> Option<()> {
        match self.peek()? {
            quote @ ('\'' | '"') => self.quoted(quote),
            '-' | '+' | '0'..='9' | '.' => self.number(),
            c if c.is_ascii_alphabetic() => self.keyword(),
            _ => None,
        }
    }

    fn quoted(&mut self, quote: char) -> Option<()> {
        self.pos += 1;
        loop {
            match self.next()? {
                '\\' => {
                    self.next()?;
                }
                c if c == quote => return Some(()),
                _ => {}
            }
        }
    }

    fn number(&mut self) -> Option<()> {
        if matches!(self.peek(), Some('-' | '+')) {
            self.pos += 1;
        }
        let mut digits = self.digits();
        if self.eat('.') {
            digits += self.digits();
        }
        if digits == 0 {
            return None;
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some('-' | '+')) {
                self.pos += 1;
            }
            if self.digits() == 0 {
                return None;
            }
        }
        Some(())
    }

    fn keyword(&mut self) -> Option<()> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        KEYWORDS.contains(&word.as_str()).then_some(())
    }

    fn digits(&mut self) -> usize {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        self.pos - start
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Option<()> {
        self.eat(expected).then_some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_python_style_lists() {
        assert_eq!(parse_flag_list("[]"), Some(0));
        assert_eq!(parse_flag_list("['ninja']"), Some(1));
        assert_eq!(parse_flag_list("['ninja', 'rockstar', \"guru\"]"), Some(3));
        assert_eq!(parse_flag_list("  [ 'alpha' , 'dominant' , ]  "), Some(2));
    }

    #[test]
    fn accepts_numbers_and_keywords() {
        assert_eq!(parse_flag_list("[1, -2.5, 3e4, .5, True, None]"), Some(6));
    }

    #[test]
    fn quoted_strings_may_contain_delimiters() {
        assert_eq!(parse_flag_list(r#"['a, b', "]", 'it\'s']"#), Some(3));
    }

    #[test]
    fn rejects_anything_but_a_flat_scalar_list() {
        for raw in [
            "",
            "ninja",
            "['ninja'",
            "['ninja'] + ['guru']",
            "[['nested']]",
            "[{'a': 1}]",
            "[__import__('os').system('rm -rf /')]",
            "[open]",
            "['a' 'b']",
            "[,]",
            "[-]",
            "['unterminated]",
        ] {
            assert_eq!(parse_flag_list(raw), None, "{raw:?}");
        }
    }

    #[test]
    fn flag_count_fails_closed() {
        assert_eq!(flag_count("not a list"), 0);
        assert_eq!(flag_count("['x', 'y']"), 2);
    }
}
