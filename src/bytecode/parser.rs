//! Textual bytecode assembler.
//!
//! Builds a [`CompilationUnit`], [`CodeItem`] and [`MethodTable`] from a
//! small listing format:
//!
//! ```text
//! .method LMath;->sum(II)I
//! .static
//! .shorty III
//! .registers 3
//! .callee 7 V
//! loop:
//!     add-int v0, v1, v2
//!     if-eq v0, v1, :loop
//!     invoke-static {v0, v1}, method@7
//!     return v0
//! ```
//!
//! Directives: `.method NAME`, `.shorty SHORTY`, `.static`, `.instance`,
//! `.registers N`, `.ins N`, `.outs N`, `.tries N`, `.callee IDX DESCRIPTOR`.
//! Operands: `vN` registers, `#N` literals, `:label` or `+N`/`-N` branch
//! targets (relative code units), `kind@N` indices, `{vA, vB}` argument
//! lists and `{vA .. vB}` ranges. `//` starts a comment.
//!
//! Labels are resolved in a second pass, once every instruction's offset
//! is known.

use super::{
    BytecodeError, CodeItem, CompilationUnit, Format, Instruction, MethodTable, Opcode, Operands,
    VReg,
};
use hashbrown::HashMap;
use smallvec::SmallVec;
use thiserror::Error;

/// Error raised by the assembler, with the 1-based source line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: {source}")]
    Bytecode {
        line: usize,
        #[source]
        source: BytecodeError,
    },
}

impl ParseError {
    fn syntax(line: usize, message: impl Into<String>) -> Self {
        ParseError::Syntax {
            line,
            message: message.into(),
        }
    }

    pub fn line(&self) -> usize {
        match self {
            ParseError::Syntax { line, .. } | ParseError::Bytecode { line, .. } => *line,
        }
    }
}

/// Everything the assembler produces for one method.
#[derive(Debug, Clone)]
pub struct ParsedMethod {
    pub unit: CompilationUnit,
    pub code: CodeItem,
    pub methods: MethodTable,
}

/// Assemble a single method listing.
pub fn parse_method(text: &str) -> Result<ParsedMethod, ParseError> {
    Parser::new(text).parse()
}

/// An instruction line whose operands are still unparsed.
#[derive(Debug)]
struct PendingInsn<'a> {
    line: usize,
    opcode: Opcode,
    operands: &'a str,
    dex_pc: u32,
}

struct Parser<'a> {
    text: &'a str,
    name: Option<String>,
    shorty: Option<String>,
    is_static: bool,
    registers: Option<u16>,
    ins: Option<u16>,
    outs: Option<u16>,
    tries: u16,
    methods: MethodTable,
    labels: HashMap<&'a str, u32>,
    pending: Vec<PendingInsn<'a>>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            name: None,
            shorty: None,
            is_static: true,
            registers: None,
            ins: None,
            outs: None,
            tries: 0,
            methods: MethodTable::new(),
            labels: HashMap::new(),
            pending: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<ParsedMethod, ParseError> {
        // Pass 1: directives, labels and instruction offsets.
        let text = self.text;
        let mut dex_pc = 0u32;
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = strip_comment(raw).trim();
            if content.is_empty() {
                continue;
            }

            if let Some(directive) = content.strip_prefix('.') {
                self.parse_directive(line, directive)?;
                continue;
            }

            if let Some(label) = content.strip_suffix(':') {
                let label = label.trim();
                if label.is_empty() || label.contains(char::is_whitespace) {
                    return Err(ParseError::syntax(line, format!("bad label '{label}'")));
                }
                if self.labels.insert(label, dex_pc).is_some() {
                    return Err(ParseError::syntax(line, format!("duplicate label '{label}'")));
                }
                continue;
            }

            let (mnemonic, operands) = match content.split_once(char::is_whitespace) {
                Some((m, rest)) => (m, rest.trim()),
                None => (content, ""),
            };
            let opcode = Opcode::from_name(mnemonic)
                .ok_or_else(|| ParseError::syntax(line, format!("unknown opcode '{mnemonic}'")))?;

            self.pending.push(PendingInsn {
                line,
                opcode,
                operands,
                dex_pc,
            });
            dex_pc += opcode.format().size_in_code_units();
        }

        // Pass 2: operands, with labels resolved.
        let mut insns = Vec::with_capacity(self.pending.len());
        for pending in &self.pending {
            let operands = self.parse_operands(pending)?;
            let insn = Instruction::new(pending.opcode, operands).map_err(|source| {
                ParseError::Bytecode {
                    line: pending.line,
                    source,
                }
            })?;
            insns.push(insn);
        }

        let shorty = self.shorty.clone().unwrap_or_else(|| "V".to_string());
        let ins = match self.ins {
            Some(ins) => ins,
            None => implied_ins_size(&shorty, self.is_static),
        };
        let max_reg = insns.iter().filter_map(Instruction::max_register).max();
        let registers = match self.registers {
            Some(registers) => registers,
            None => {
                let used = max_reg.map_or(0, |r| r + 1);
                used.max(ins as u32) as u16
            }
        };
        let outs = match self.outs {
            Some(outs) => outs,
            None => insns.iter().map(argument_count).max().unwrap_or(0),
        };

        let unit = CompilationUnit::new(
            self.name.clone().unwrap_or_else(|| "<anonymous>".to_string()),
            shorty,
            self.is_static,
        );
        let code = CodeItem::new(registers, ins, outs, self.tries, insns);

        Ok(ParsedMethod {
            unit,
            code,
            methods: self.methods,
        })
    }

    fn parse_directive(&mut self, line: usize, directive: &str) -> Result<(), ParseError> {
        let (name, arg) = match directive.split_once(char::is_whitespace) {
            Some((n, rest)) => (n, rest.trim()),
            None => (directive, ""),
        };

        match name {
            "method" => self.name = Some(require(line, name, arg)?.to_string()),
            "shorty" => self.shorty = Some(require(line, name, arg)?.to_string()),
            "static" => self.is_static = true,
            "instance" => self.is_static = false,
            "registers" => self.registers = Some(parse_u16(line, require(line, name, arg)?)?),
            "ins" => self.ins = Some(parse_u16(line, require(line, name, arg)?)?),
            "outs" => self.outs = Some(parse_u16(line, require(line, name, arg)?)?),
            "tries" => self.tries = parse_u16(line, require(line, name, arg)?)?,
            "callee" => {
                let (idx, descriptor) = require(line, name, arg)?
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| ParseError::syntax(line, ".callee expects INDEX DESCRIPTOR"))?;
                let idx = parse_int(line, idx)?;
                let idx = u32::try_from(idx)
                    .map_err(|_| ParseError::syntax(line, format!("bad method index {idx}")))?;
                self.methods.insert(idx, descriptor.trim());
            }
            _ => return Err(ParseError::syntax(line, format!("unknown directive '.{name}'"))),
        }
        Ok(())
    }

    fn parse_operands(&self, pending: &PendingInsn<'a>) -> Result<Operands, ParseError> {
        let line = pending.line;
        let parts = split_operands(line, pending.operands)?;
        let expect = |n: usize| -> Result<(), ParseError> {
            if parts.len() != n {
                return Err(ParseError::syntax(
                    line,
                    format!(
                        "{} takes {} operand(s), found {}",
                        pending.opcode,
                        n,
                        parts.len()
                    ),
                ));
            }
            Ok(())
        };

        let operands = match pending.opcode.format() {
            Format::K10x => {
                expect(0)?;
                Operands::None
            }
            Format::K11x => {
                expect(1)?;
                Operands::Reg {
                    a: parse_reg(line, parts[0])?,
                }
            }
            Format::K12x => {
                expect(2)?;
                Operands::RegReg {
                    a: parse_reg(line, parts[0])?,
                    b: parse_reg(line, parts[1])?,
                }
            }
            Format::K11n | Format::K21s | Format::K31i => {
                expect(2)?;
                Operands::RegLiteral {
                    a: parse_reg(line, parts[0])?,
                    literal: parse_literal(line, parts[1])?,
                }
            }
            Format::K21c => {
                expect(2)?;
                Operands::RegIndex {
                    a: parse_reg(line, parts[0])?,
                    index: parse_index(line, parts[1])?,
                }
            }
            Format::K10t | Format::K20t | Format::K30t => {
                expect(1)?;
                Operands::Branch {
                    offset: self.parse_target(pending, parts[0])?,
                }
            }
            Format::K31t => {
                expect(2)?;
                Operands::RegBranch {
                    a: parse_reg(line, parts[0])?,
                    offset: self.parse_target(pending, parts[1])?,
                }
            }
            Format::K22t => {
                expect(3)?;
                Operands::RegRegBranch {
                    a: parse_reg(line, parts[0])?,
                    b: parse_reg(line, parts[1])?,
                    offset: self.parse_target(pending, parts[2])?,
                }
            }
            Format::K23x => {
                expect(3)?;
                Operands::RegRegReg {
                    a: parse_reg(line, parts[0])?,
                    b: parse_reg(line, parts[1])?,
                    c: parse_reg(line, parts[2])?,
                }
            }
            Format::K22s | Format::K22b => {
                expect(3)?;
                Operands::RegRegLiteral {
                    a: parse_reg(line, parts[0])?,
                    b: parse_reg(line, parts[1])?,
                    literal: parse_literal(line, parts[2])?,
                }
            }
            Format::K35c => {
                expect(2)?;
                let list = braced(line, parts[0])?;
                let mut args = SmallVec::new();
                for reg in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    args.push(parse_reg(line, reg)?);
                }
                Operands::Invoke {
                    method_idx: parse_index(line, parts[1])?,
                    args,
                }
            }
            Format::K3rc => {
                expect(2)?;
                let list = braced(line, parts[0])?;
                let (first, count) = if list.trim().is_empty() {
                    (0, 0)
                } else {
                    let (lo, hi) = list.split_once("..").ok_or_else(|| {
                        ParseError::syntax(line, format!("expected '{{vA .. vB}}', found '{list}'"))
                    })?;
                    let lo = parse_reg(line, lo.trim())?;
                    let hi = parse_reg(line, hi.trim())?;
                    if hi < lo {
                        return Err(ParseError::syntax(line, "register range runs backwards"));
                    }
                    (lo, hi - lo + 1)
                };
                Operands::InvokeRange {
                    method_idx: parse_index(line, parts[1])?,
                    first,
                    count,
                }
            }
        };
        Ok(operands)
    }

    fn parse_target(&self, pending: &PendingInsn<'a>, text: &str) -> Result<i32, ParseError> {
        let line = pending.line;
        if let Some(label) = text.strip_prefix(':') {
            let target = self
                .labels
                .get(label)
                .ok_or_else(|| ParseError::syntax(line, format!("undefined label '{label}'")))?;
            return Ok(*target as i32 - pending.dex_pc as i32);
        }
        if text.starts_with('+') || text.starts_with('-') {
            let offset = parse_int(line, text.trim_start_matches('+'))?;
            return i32::try_from(offset)
                .map_err(|_| ParseError::syntax(line, format!("offset {offset} out of range")));
        }
        Err(ParseError::syntax(
            line,
            format!("expected ':label' or relative offset, found '{text}'"),
        ))
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn require<'t>(line: usize, directive: &str, arg: &'t str) -> Result<&'t str, ParseError> {
    if arg.is_empty() {
        return Err(ParseError::syntax(line, format!(".{directive} needs an argument")));
    }
    Ok(arg)
}

/// Split on commas that are not inside braces.
fn split_operands(line: usize, text: &str) -> Result<SmallVec<[&str; 4]>, ParseError> {
    let mut parts = SmallVec::new();
    if text.trim().is_empty() {
        return Ok(parts);
    }

    let mut depth = 0i32;
    let mut start = 0;
    for (pos, ch) in text.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(text[start..pos].trim());
                start = pos + 1;
            }
            _ => {}
        }
        if depth < 0 {
            return Err(ParseError::syntax(line, "unbalanced '}'"));
        }
    }
    if depth != 0 {
        return Err(ParseError::syntax(line, "unbalanced '{'"));
    }
    parts.push(text[start..].trim());
    Ok(parts)
}

fn braced(line: usize, text: &str) -> Result<&str, ParseError> {
    text.strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or_else(|| ParseError::syntax(line, format!("expected '{{...}}', found '{text}'")))
}

fn parse_int(line: usize, text: &str) -> Result<i64, ParseError> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x") {
        i64::from_str_radix(hex, 16)
    } else {
        digits.parse::<i64>()
    }
    .map_err(|_| ParseError::syntax(line, format!("bad integer '{text}'")))?;
    Ok(if negative { -value } else { value })
}

fn parse_u16(line: usize, text: &str) -> Result<u16, ParseError> {
    let value = parse_int(line, text)?;
    u16::try_from(value).map_err(|_| ParseError::syntax(line, format!("{value} out of range")))
}

fn parse_reg(line: usize, text: &str) -> Result<VReg, ParseError> {
    let digits = text
        .strip_prefix('v')
        .ok_or_else(|| ParseError::syntax(line, format!("expected register, found '{text}'")))?;
    digits
        .parse::<VReg>()
        .map_err(|_| ParseError::syntax(line, format!("bad register '{text}'")))
}

fn parse_literal(line: usize, text: &str) -> Result<i32, ParseError> {
    let digits = text
        .strip_prefix('#')
        .ok_or_else(|| ParseError::syntax(line, format!("expected literal, found '{text}'")))?;
    let value = parse_int(line, digits)?;
    // 32-bit literals may be written as unsigned hex.
    if let Ok(v) = i32::try_from(value) {
        return Ok(v);
    }
    u32::try_from(value)
        .map(|v| v as i32)
        .map_err(|_| ParseError::syntax(line, format!("literal {value} out of range")))
}

fn parse_index(line: usize, text: &str) -> Result<u32, ParseError> {
    let (_, digits) = text
        .split_once('@')
        .ok_or_else(|| ParseError::syntax(line, format!("expected 'kind@N', found '{text}'")))?;
    let value = parse_int(line, digits)?;
    u32::try_from(value).map_err(|_| ParseError::syntax(line, format!("bad index {value}")))
}

/// Parameter words implied by a shorty, receiver included.
fn implied_ins_size(shorty: &str, is_static: bool) -> u16 {
    let params: u16 = shorty
        .chars()
        .skip(1)
        .map(|c| if c == 'J' || c == 'D' { 2 } else { 1 })
        .sum();
    params + u16::from(!is_static)
}

fn argument_count(insn: &Instruction) -> u16 {
    match insn.operands() {
        Operands::Invoke { args, .. } => args.len() as u16,
        Operands::InvokeRange { count, .. } => *count,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_method() {
        let parsed = parse_method(
            r#"
            .method LMath;->one()I
            .shorty I
                const/4 v0, #0
                const/4 v1, #1
                add-int v2, v0, v1   // sum
                return v2
            "#,
        )
        .unwrap();

        assert_eq!(parsed.unit.name, "LMath;->one()I");
        assert!(parsed.unit.is_static);
        assert_eq!(parsed.code.registers_size, 3);
        assert_eq!(parsed.code.ins_size, 0);
        assert_eq!(parsed.code.len(), 4);
        assert_eq!(parsed.code.size_in_code_units(), 5);
    }

    #[test]
    fn test_labels_resolve_relative() {
        let parsed = parse_method(
            r#"
            top:
                if-eq v0, v1, :done
                goto :top
            done:
                return-void
            "#,
        )
        .unwrap();

        let insns: Vec<_> = parsed.code.instructions().collect();
        assert_eq!(insns[0].1.branch_offset(), Some(3));
        assert_eq!(insns[1].0, 2);
        assert_eq!(insns[1].1.branch_offset(), Some(-2));
    }

    #[test]
    fn test_invokes_and_callees() {
        let parsed = parse_method(
            r#"
            .instance
            .shorty VI
            .registers 4
            .callee 9 V
                invoke-static {v2, v3}, method@9
                invoke-direct/range {v0 .. v2}, method@9
                new-instance v1, type@4
                return-void
            "#,
        )
        .unwrap();

        assert!(!parsed.unit.is_static);
        assert_eq!(parsed.code.ins_size, 2);
        assert_eq!(parsed.code.outs_size, 3);
        assert_eq!(parsed.methods.len(), 1);
        assert_eq!(
            parsed.code.instruction_at(3).map(|i| i.operands().clone()),
            Some(Operands::InvokeRange {
                method_idx: 9,
                first: 0,
                count: 3
            })
        );
    }

    #[test]
    fn test_errors_carry_line() {
        let err = parse_method("nop\nfrobnicate v0\n").unwrap_err();
        assert_eq!(err.line(), 2);

        let err = parse_method("goto :nowhere").unwrap_err();
        assert!(err.to_string().contains("undefined label"));

        let err = parse_method("const/4 v0, #9").unwrap_err();
        assert!(matches!(err, ParseError::Bytecode { line: 1, .. }));
    }
}
