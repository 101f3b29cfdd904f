//! Text IR parser implementation.

use crate::core::ir::{IrBlock, IrInst, IrOp};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

pub fn parse_blocks(text: &str) -> Result<Vec<IrBlock>, ParseError> {
    let mut parser = Parser::new(text);
    parser.parse().map_err(|message| ParseError {
        line: parser.line(),
        message,
    })
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn parse(&mut self) -> Result<Vec<IrBlock>, String> {
        let mut blocks = Vec::new();
        self.skip_whitespace(true);
        while !self.is_eof() {
            blocks.push(self.parse_block()?);
            self.skip_whitespace(true);
        }
        Ok(blocks)
    }

    fn line(&self) -> usize {
        self.text[..self.pos.min(self.text.len())].matches('\n').count() + 1
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Comment runs to the end of the line; the newline stays.
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), String> {
        if !self.try_read(ch) {
            return Err(format!("Expected '{}' but found {:?}", ch, self.current_char()));
        }
        Ok(())
    }

    fn is_at_line_end(&mut self) -> bool {
        self.skip_whitespace(false);
        matches!(self.current_char(), None | Some('\n'))
    }

    fn read_identifier(&mut self) -> Result<&'a str, String> {
        self.skip_whitespace(false);
        let start = self.pos;
        match self.current_char() {
            Some(ch) if ch.is_ascii_alphabetic() => {}
            Some(ch) => return Err(format!("Expected identifier but found '{ch}'")),
            None => return Err("Expected identifier but found EOF".to_string()),
        }
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_number(&mut self) -> Result<u32, String> {
        self.skip_whitespace(false);
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        let token = self.text[start..self.pos].replace('_', "");
        let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => token.parse::<u32>(),
        };
        parsed.map_err(|_| format!("Invalid number '{token}'"))
    }

    /// `rN` or `fN`, depending on `prefix`.
    fn read_register(&mut self, prefix: char) -> Result<u8, String> {
        let name = self.read_identifier()?;
        let index = name
            .strip_prefix(prefix)
            .and_then(|digits| digits.parse::<u8>().ok())
            .ok_or_else(|| format!("Expected register {prefix}N but found '{name}'"))?;
        if index >= 32 {
            return Err(format!("Register '{name}' out of range"));
        }
        Ok(index)
    }

    fn parse_block(&mut self) -> Result<IrBlock, String> {
        let keyword = self.read_identifier()?;
        if keyword != "block" {
            return Err(format!("Expected 'block' but found '{keyword}'"));
        }
        let start = self.read_number()?;
        self.expect('{')?;

        let mut instructions = Vec::new();
        loop {
            self.skip_whitespace(true);
            match self.current_char() {
                Some('}') => {
                    self.advance();
                    break;
                }
                None => return Err(format!("Unterminated block {start:#x}")),
                _ => instructions.push(self.parse_instruction()?),
            }
        }
        Ok(IrBlock::new(start, instructions))
    }

    fn parse_instruction(&mut self) -> Result<IrInst, String> {
        let name = self.read_identifier()?;
        let op = IrOp::from_name(name).ok_or_else(|| format!("Unknown opcode '{name}'"))?;

        let mut slots = [0u8; 3];
        let mut slot = 0;
        let mut constant = 0;
        let mut first = true;
        for ty in op.meta().types.chars() {
            if ty == '_' {
                slot += 1;
                continue;
            }
            if !first {
                self.expect(',')?;
            }
            first = false;
            match ty {
                'C' => constant = self.read_number()?,
                'I' => {
                    let value = self.read_number()?;
                    slots[slot] = u8::try_from(value).map_err(|_| format!("Immediate {value} out of range"))?;
                    slot += 1;
                }
                'F' => {
                    slots[slot] = self.read_register('f')?;
                    slot += 1;
                }
                _ => {
                    slots[slot] = self.read_register('r')?;
                    slot += 1;
                }
            }
        }
        if !self.is_at_line_end() {
            return Err(format!("Unexpected operand after {name}"));
        }
        Ok(IrInst::new(op, slots[0], slots[1], slots[2], constant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_block() {
        let blocks = parse_blocks(
            "; two blocks\n\
             block 0x1000 {\n\
                 SetConst r1, 16 ; sixteen\n\
                 Add r3, r1, r2\n\
                 ExitToConst 0x1010\n\
             }\n\
             block 0x1010 {\n\
                 ExitToReg r3\n\
             }\n",
        )
        .unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].original_start(), 0x1000);
        assert_eq!(
            blocks[0].instructions(),
            &[
                IrInst::new(IrOp::SetConst, 1, 0, 0, 16),
                IrInst::new(IrOp::Add, 3, 1, 2, 0),
                IrInst::with_constant(IrOp::ExitToConst, 0x1010),
            ]
        );
        assert_eq!(blocks[1].instructions(), &[IrInst::new(IrOp::ExitToReg, 0, 3, 0, 0)]);
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = parse_blocks("block 0x10 {\n  Nop\n  Frobnicate r1\n}\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("Frobnicate"));

        let err = parse_blocks("block 0x10 {\n  Mov r1, r99\n}\n").unwrap_err();
        assert!(err.message.contains("out of range"));

        let err = parse_blocks("block 0x10 {\n  Nop\n").unwrap_err();
        assert!(err.message.contains("Unterminated"));
    }

    #[test]
    fn test_operand_count_is_checked() {
        assert!(parse_blocks("block 0 {\n Add r1, r2\n}\n").is_err());
        assert!(parse_blocks("block 0 {\n Nop r1\n}\n").is_err());
    }
}
