//! Arithmetic used by pass `WIDTH`/`HEIGHT` descriptors.
//!
//! Supports numbers, `$WIDTH`, `$HEIGHT`, `+ - * /`, parentheses, and the
//! helpers `floor`, `ceil`, `round`, `min`, `max`.

/// Evaluates `expression`; `None` when it does not parse.
pub fn evaluate(expression: &str, width: f64, height: f64) -> Option<f64> {
    let mut parser = Parser {
        input: expression.as_bytes(),
        pos: 0,
        width,
        height,
    };
    let value = parser.expression()?;
    parser.skip_whitespace();
    if parser.pos != parser.input.len() {
        return None;
    }
    Some(value)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    width: f64,
    height: f64,
}

impl Parser<'_> {
    fn expression(&mut self) -> Option<f64> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(b'-') => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Some(value),
            }
        }
    }

    fn term(&mut self) -> Option<f64> {
        let mut value = self.factor()?;
        loop {
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Some(b'/') => {
                    self.pos += 1;
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return None;
                    }
                    value /= divisor;
                }
                _ => return Some(value),
            }
        }
    }

    fn factor(&mut self) -> Option<f64> {
        match self.peek()? {
            b'-' => {
                self.pos += 1;
                Some(-self.factor()?)
            }
            b'+' => {
                self.pos += 1;
                self.factor()
            }
            b'(' => {
                self.pos += 1;
                let value = self.expression()?;
                self.expect(b')')?;
                Some(value)
            }
            b'$' => {
                self.pos += 1;
                match self.identifier()?.as_str() {
                    "WIDTH" => Some(self.width),
                    "HEIGHT" => Some(self.height),
                    _ => None,
                }
            }
            ch if ch.is_ascii_digit() || ch == b'.' => self.number(),
            ch if ch.is_ascii_alphabetic() => self.call(),
            _ => None,
        }
    }

    fn call(&mut self) -> Option<f64> {
        let name = self.identifier()?;
        self.expect(b'(')?;
        let first = self.expression()?;
        let value = match name.as_str() {
            "floor" => first.floor(),
            "ceil" => first.ceil(),
            "round" => first.round(),
            "min" | "max" => {
                self.expect(b',')?;
                let second = self.expression()?;
                if name == "min" {
                    first.min(second)
                } else {
                    first.max(second)
                }
            }
            _ => return None,
        };
        self.expect(b')')?;
        Some(value)
    }

    fn number(&mut self) -> Option<f64> {
        let start = self.pos;
        while self
            .input
            .get(self.pos)
            .is_some_and(|ch| ch.is_ascii_digit() || *ch == b'.')
        {
            self.pos += 1;
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()?
            .parse()
            .ok()
    }

    fn identifier(&mut self) -> Option<String> {
        let start = self.pos;
        while self
            .input
            .get(self.pos)
            .is_some_and(|ch| ch.is_ascii_alphanumeric() || *ch == b'_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .map(str::to_owned)
    }

    fn expect(&mut self, ch: u8) -> Option<()> {
        if self.peek()? == ch {
            self.pos += 1;
            Some(())
        } else {
            None
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self
            .input
            .get(self.pos)
            .is_some_and(|ch| ch.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }
}
