//! Parses GNU linker scripts. Two very different kinds of script reach us:
//! the tiny scripts distributions put in place of `.so` files to pull in
//! several inputs (`GROUP`, `INPUT`, `AS_NEEDED`), and scripts passed with
//! `-T` that can also set the entry point, add search directories, define
//! symbols with `PROVIDE` and place sections with a `SECTIONS` clause. We
//! support the subset of `SECTIONS` that assigns addresses and maps input
//! section patterns to output sections; `PHDRS`, `MEMORY` and `OVERLAY` are
//! rejected with a clear error.

use crate::args::Input;
use crate::args::InputSpec;
use crate::args::Modifiers;
use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use anyhow::anyhow;
use std::path::Path;

#[derive(Debug, Default)]
pub(crate) struct LinkerScript<'data> {
    pub(crate) commands: Vec<Command<'data>>,
}

#[derive(Debug)]
pub(crate) enum Command<'data> {
    Arg(&'data str),
    Group(Vec<Command<'data>>),
    AsNeeded(Vec<Command<'data>>),
    Entry(&'data str),
    SearchDir(&'data str),
    Output(&'data str),
    Provide {
        name: &'data str,
        expression: Expression<'data>,
    },
    Assert {
        expression: Expression<'data>,
        message: &'data str,
    },
    Sections(Vec<SectionRule<'data>>),
    Ignored,
}

/// One output-section rule from a `SECTIONS` clause, e.g.
/// `.text 0x1000 : { *(.text*) KEEP(*(.init)) }`.
#[derive(Debug)]
pub(crate) struct SectionRule<'data> {
    pub(crate) output_name: &'data str,
    pub(crate) address: Option<Expression<'data>>,

    /// Input-section patterns in file-pattern(section-pattern) form. We only
    /// support `*` file patterns, so just the section patterns are kept.
    pub(crate) input_patterns: Vec<SectionPattern<'data>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SectionPattern<'data> {
    pub(crate) pattern: &'data str,

    /// Marked with KEEP(...): the matched sections are GC roots.
    pub(crate) keep: bool,
}

impl SectionPattern<'_> {
    pub(crate) fn matches(&self, section_name: &[u8]) -> bool {
        match_star_pattern(self.pattern.as_bytes(), section_name)
    }
}

/// Matches a pattern that may contain `*` wildcards against a name.
pub(crate) fn match_star_pattern(pattern: &[u8], name: &[u8]) -> bool {
    match memchr::memchr(b'*', pattern) {
        None => pattern == name,
        Some(star) => {
            let (prefix, rest) = pattern.split_at(star);
            let rest = &rest[1..];
            if name.len() < prefix.len() || !name.starts_with(prefix) {
                return false;
            }
            // Try every split point for the remainder. Patterns in practice
            // have at most a couple of stars, so this is fine.
            (prefix.len()..=name.len()).any(|i| match_star_pattern(rest, &name[i..]))
        }
    }
}

/// A linker script arithmetic expression, stored structurally and evaluated
/// during layout when `.` is known.
#[derive(Debug, Clone)]
pub(crate) enum Expression<'data> {
    Number(u64),
    Dot,
    Symbol(&'data str),
    Align(Box<Expression<'data>>),
    BinaryOp {
        op: u8,
        left: Box<Expression<'data>>,
        right: Box<Expression<'data>>,
    },
}

pub(crate) struct EvalContext<'a> {
    pub(crate) dot: u64,
    pub(crate) lookup_symbol: &'a dyn Fn(&str) -> Option<u64>,
}

impl Expression<'_> {
    pub(crate) fn evaluate(&self, ctx: &EvalContext) -> Result<u64> {
        Ok(match self {
            Expression::Number(n) => *n,
            Expression::Dot => ctx.dot,
            Expression::Symbol(name) => (ctx.lookup_symbol)(name)
                .ok_or_else(|| anyhow!("Undefined symbol `{name}` in linker script"))?,
            Expression::Align(inner) => {
                let alignment = inner.evaluate(ctx)?;
                if !alignment.is_power_of_two() {
                    bail!("ALIGN argument 0x{alignment:x} is not a power of two");
                }
                ctx.dot.next_multiple_of(alignment)
            }
            Expression::BinaryOp { op, left, right } => {
                let left = left.evaluate(ctx)?;
                let right = right.evaluate(ctx)?;
                match op {
                    b'+' => left.wrapping_add(right),
                    b'-' => left.wrapping_sub(right),
                    b'*' => left.wrapping_mul(right),
                    b'/' => left
                        .checked_div(right)
                        .ok_or_else(|| anyhow!("Division by zero in linker script"))?,
                    b'&' => left & right,
                    b'|' => left | right,
                    _ => bail!("Unsupported operator `{}`", *op as char),
                }
            }
        })
    }
}

impl<'data> LinkerScript<'data> {
    pub(crate) fn parse(text: &'data str, path: &Path) -> Result<LinkerScript<'data>> {
        let mut tokens = Tokeniser::new(text);
        let commands = parse_commands_up_to(&mut tokens, None)
            .with_context(|| format!("Failed to parse linker script `{}`", path.display()))?;
        Ok(LinkerScript { commands })
    }

    /// The input files requested by INPUT/GROUP commands, with sysroot
    /// handling applied relative to the script's own location.
    pub(crate) fn inputs(
        &self,
        modifiers: Modifiers,
        script_path: &Path,
        sysroot: Option<&Path>,
    ) -> Vec<Input> {
        let mut inputs = Vec::new();
        collect_inputs(&self.commands, &mut inputs, modifiers);
        let script_is_in_sysroot =
            sysroot.is_some_and(|sysroot| script_path.starts_with(sysroot));
        for input in &mut inputs {
            input.search_first = script_path.parent().map(|dir| dir.to_owned());
            if let (Some(sysroot), InputSpec::File(file)) = (sysroot, &mut input.spec) {
                if let Some(new_file) = maybe_forced_sysroot(file, sysroot) {
                    *file = new_file;
                } else if script_is_in_sysroot && file.is_absolute() {
                    if let Ok(relative) = file.strip_prefix("/") {
                        *file = Box::from(sysroot.join(relative));
                    }
                }
            }
        }
        inputs
    }

    pub(crate) fn entry(&self) -> Option<&'data str> {
        self.commands.iter().find_map(|command| match command {
            Command::Entry(name) => Some(*name),
            _ => None,
        })
    }

    pub(crate) fn search_dirs(&self) -> impl Iterator<Item = &'data str> + '_ {
        self.commands.iter().filter_map(|command| match command {
            Command::SearchDir(dir) => Some(*dir),
            _ => None,
        })
    }

    pub(crate) fn output(&self) -> Option<&'data str> {
        self.commands.iter().find_map(|command| match command {
            Command::Output(name) => Some(*name),
            _ => None,
        })
    }

    pub(crate) fn provides(&self) -> impl Iterator<Item = (&'data str, &Expression<'data>)> + '_ {
        self.commands.iter().filter_map(|command| match command {
            Command::Provide { name, expression } => Some((*name, expression)),
            _ => None,
        })
    }

    pub(crate) fn section_rules(&self) -> Option<&[SectionRule<'data>]> {
        self.commands.iter().find_map(|command| match command {
            Command::Sections(rules) => Some(rules.as_slice()),
            _ => None,
        })
    }

    /// All KEEP patterns from the SECTIONS clause. Sections matching any of
    /// these are garbage-collection roots.
    pub(crate) fn keep_patterns(&self) -> Vec<SectionPattern<'data>> {
        self.section_rules()
            .into_iter()
            .flatten()
            .flat_map(|rule| rule.input_patterns.iter())
            .filter(|pattern| pattern.keep)
            .copied()
            .collect()
    }
}

/// Applies `=` / `$SYSROOT` prefixes that force a path to be looked up in the
/// sysroot.
pub(crate) fn maybe_forced_sysroot(path: &Path, sysroot: &Path) -> Option<Box<Path>> {
    path.strip_prefix("=")
        .or_else(|_| path.strip_prefix("$SYSROOT"))
        .ok()
        .map(|stripped| Box::from(sysroot.join(stripped)))
}

fn collect_inputs<'data>(
    commands: &[Command<'data>],
    inputs: &mut Vec<Input>,
    modifiers: Modifiers,
) {
    for command in commands {
        match command {
            Command::Arg(arg) => {
                let spec = if let Some(lib_name) = arg.strip_prefix("-l") {
                    InputSpec::Lib(Box::from(lib_name))
                } else {
                    InputSpec::File(Box::from(Path::new(arg)))
                };
                inputs.push(Input {
                    spec,
                    search_first: None,
                    modifiers,
                });
            }
            Command::Group(subs) => collect_inputs(subs, inputs, modifiers),
            Command::AsNeeded(subs) => {
                let sub_modifiers = Modifiers {
                    as_needed: true,
                    ..modifiers
                };
                collect_inputs(subs, inputs, sub_modifiers);
            }
            _ => {}
        }
    }
}

struct Tokeniser<'a> {
    text: &'a str,
}

impl<'a> Tokeniser<'a> {
    fn new(text: &'a str) -> Self {
        Tokeniser { text }
    }

    fn next(&mut self) -> Option<&'a str> {
        loop {
            self.text = self.text.trim_start();
            if try_take(&mut self.text, "/*") {
                if take_up_to(&mut self.text, "*/").is_err() {
                    self.text = "";
                }
                continue;
            }
            if self.text.starts_with('#') {
                if take_up_to(&mut self.text, "\n").is_err() {
                    self.text = "";
                }
                continue;
            }
            if self.text.is_empty() {
                return None;
            }
            let bytes = self.text.as_bytes();
            let mut len = 0;
            // Note: arithmetic operators are not break characters (they
            // occur in file names), so expressions need to be
            // whitespace-separated, which is how the GNU tools emit them.
            for byte in bytes {
                if b" \n\t(){};=,".contains(byte) {
                    break;
                }
                len += 1;
            }
            if len == 0 {
                len = 1;
            }
            let token = &self.text[..len];
            self.text = &self.text[len..];
            return Some(token);
        }
    }

    fn peek(&mut self) -> Option<&'a str> {
        let saved = self.text;
        let token = self.next();
        self.text = saved;
        token
    }

    fn expect(&mut self, expected: &str) -> Result {
        let token = self
            .next()
            .ok_or_else(|| anyhow!("Expected token '{expected}', got end of input"))?;
        if token != expected {
            bail!("Expected token '{expected}', got '{token}'");
        }
        Ok(())
    }
}

fn try_take(input: &mut &str, pattern: &str) -> bool {
    if let Some(rest) = input.strip_prefix(pattern) {
        *input = rest;
        true
    } else {
        false
    }
}

fn take_up_to<'a>(input: &mut &'a str, pattern: &str) -> Result<&'a str> {
    let end = input
        .find(pattern)
        .ok_or_else(|| anyhow!("Missing expected '{pattern}'"))?;
    let content = &input[..end];
    *input = &input[end + pattern.len()..];
    Ok(content)
}

fn parse_commands_up_to<'a>(
    tokens: &mut Tokeniser<'a>,
    end: Option<&str>,
) -> Result<Vec<Command<'a>>> {
    let mut out = Vec::new();
    while let Some(token) = tokens.next() {
        if end == Some(token) {
            return Ok(out);
        }
        if token == ";" || token == "," {
            continue;
        }
        if token
            .chars()
            .all(|ch| ch.is_ascii_uppercase() || ch == '_')
            && token.len() > 1
        {
            out.push(parse_command(tokens, token)?);
        } else {
            out.push(Command::Arg(token));
        }
    }
    if let Some(expected) = end {
        bail!("Got end of script, expected '{expected}'");
    }
    Ok(out)
}

fn parse_command<'a>(tokens: &mut Tokeniser<'a>, token: &str) -> Result<Command<'a>> {
    match token {
        "GROUP" | "INPUT" => {
            tokens.expect("(")?;
            Ok(Command::Group(parse_commands_up_to(tokens, Some(")"))?))
        }
        "AS_NEEDED" => {
            tokens.expect("(")?;
            Ok(Command::AsNeeded(parse_commands_up_to(tokens, Some(")"))?))
        }
        "ENTRY" => {
            tokens.expect("(")?;
            let name = tokens.next().context("Missing ENTRY argument")?;
            tokens.expect(")")?;
            Ok(Command::Entry(name))
        }
        "SEARCH_DIR" => {
            tokens.expect("(")?;
            let dir = tokens.next().context("Missing SEARCH_DIR argument")?;
            tokens.expect(")")?;
            Ok(Command::SearchDir(dir.trim_matches('"')))
        }
        "OUTPUT" => {
            tokens.expect("(")?;
            let name = tokens.next().context("Missing OUTPUT argument")?;
            tokens.expect(")")?;
            Ok(Command::Output(name))
        }
        "OUTPUT_FORMAT" | "OUTPUT_ARCH" | "TARGET" => {
            tokens.expect("(")?;
            parse_commands_up_to(tokens, Some(")"))?;
            Ok(Command::Ignored)
        }
        "PROVIDE" | "PROVIDE_HIDDEN" => {
            tokens.expect("(")?;
            let name = tokens.next().context("Missing PROVIDE symbol")?;
            tokens.expect("=")?;
            let expression = parse_expression(tokens, &[")"])?;
            tokens.expect(")")?;
            Ok(Command::Provide { name, expression })
        }
        "ASSERT" => {
            tokens.expect("(")?;
            let expression = parse_expression(tokens, &[","])?;
            tokens.expect(",")?;
            let message = tokens.next().context("Missing ASSERT message")?;
            tokens.expect(")")?;
            Ok(Command::Assert {
                expression,
                message: message.trim_matches('"'),
            })
        }
        "VERSION" => {
            bail!("VERSION commands inside linker scripts are not supported; use --version-script")
        }
        "SECTIONS" => {
            tokens.expect("{")?;
            parse_sections(tokens).map(Command::Sections)
        }
        "PHDRS" | "MEMORY" | "OVERLAY" => {
            bail!("Unsupported linker script command `{token}`")
        }
        _ => bail!("Unsupported linker script command `{token}`"),
    }
}

fn parse_expression<'a>(
    tokens: &mut Tokeniser<'a>,
    terminators: &[&str],
) -> Result<Expression<'a>> {
    let mut left = parse_primary(tokens)?;
    while let Some(next) = tokens.peek() {
        if terminators.contains(&next) || next == ";" {
            break;
        }
        let op = match next {
            "+" | "-" | "*" | "/" | "&" | "|" => next.as_bytes()[0],
            _ => break,
        };
        tokens.next();
        let right = parse_primary(tokens)?;
        left = Expression::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn parse_primary<'a>(tokens: &mut Tokeniser<'a>) -> Result<Expression<'a>> {
    let token = tokens.next().context("Unexpected end of expression")?;
    match token {
        "." => Ok(Expression::Dot),
        "ALIGN" => {
            tokens.expect("(")?;
            let inner = parse_expression(tokens, &[")"])?;
            tokens.expect(")")?;
            Ok(Expression::Align(Box::new(inner)))
        }
        "(" => {
            let inner = parse_expression(tokens, &[")"])?;
            tokens.expect(")")?;
            Ok(inner)
        }
        _ => {
            if let Ok(number) = parse_script_number(token) {
                Ok(Expression::Number(number))
            } else {
                Ok(Expression::Symbol(token))
            }
        }
    }
}

/// Linker script numbers accept 0x prefixes and K/M suffixes.
fn parse_script_number(token: &str) -> Result<u64> {
    let (token, multiplier) = if let Some(rest) = token.strip_suffix(['K', 'k']) {
        (rest, 1024)
    } else if let Some(rest) = token.strip_suffix(['M', 'm']) {
        (rest, 1024 * 1024)
    } else {
        (token, 1)
    };
    Ok(crate::args::parse_number(token)? * multiplier)
}

fn parse_sections<'a>(tokens: &mut Tokeniser<'a>) -> Result<Vec<SectionRule<'a>>> {
    let mut rules = Vec::new();
    loop {
        let token = tokens.next().context("Unterminated SECTIONS clause")?;
        match token {
            "}" => return Ok(rules),
            "." => {
                // `. = expr;` adjusts the location counter. We model it as an
                // anonymous rule carrying only an address.
                tokens.expect("=")?;
                let expression = parse_expression(tokens, &[";"])?;
                tokens.expect(";")?;
                rules.push(SectionRule {
                    output_name: "",
                    address: Some(expression),
                    input_patterns: Vec::new(),
                });
            }
            ";" => {}
            name => {
                let mut address = None;
                loop {
                    let next = tokens.next().context("Unterminated output section")?;
                    match next {
                        ":" => break,
                        "ALIGN" => {
                            tokens.expect("(")?;
                            let inner = parse_expression(tokens, &[")"])?;
                            tokens.expect(")")?;
                            address = Some(Expression::Align(Box::new(inner)));
                        }
                        token => {
                            address = Some(
                                parse_script_number(token)
                                    .map(Expression::Number)
                                    .with_context(|| {
                                        format!("Invalid output section attribute `{token}`")
                                    })?,
                            );
                        }
                    }
                }
                tokens.expect("{")?;
                let input_patterns = parse_input_patterns(tokens)?;
                rules.push(SectionRule {
                    output_name: name,
                    address,
                    input_patterns,
                });
            }
        }
    }
}

fn parse_input_patterns<'a>(tokens: &mut Tokeniser<'a>) -> Result<Vec<SectionPattern<'a>>> {
    let mut patterns = Vec::new();
    loop {
        let token = tokens.next().context("Unterminated input section list")?;
        match token {
            "}" => return Ok(patterns),
            "KEEP" => {
                tokens.expect("(")?;
                parse_file_pattern(tokens, &mut patterns, true)?;
                tokens.expect(")")?;
            }
            ";" => {}
            _ => parse_file_pattern_tail(tokens, token, &mut patterns, false)?,
        }
    }
}

fn parse_file_pattern<'a>(
    tokens: &mut Tokeniser<'a>,
    patterns: &mut Vec<SectionPattern<'a>>,
    keep: bool,
) -> Result {
    let file_pattern = tokens.next().context("Missing file pattern")?;
    parse_file_pattern_tail(tokens, file_pattern, patterns, keep)
}

fn parse_file_pattern_tail<'a>(
    tokens: &mut Tokeniser<'a>,
    file_pattern: &'a str,
    patterns: &mut Vec<SectionPattern<'a>>,
    keep: bool,
) -> Result {
    if file_pattern != "*" {
        bail!("Only `*` file patterns are supported, got `{file_pattern}`");
    }
    tokens.expect("(")?;
    loop {
        let token = tokens.next().context("Unterminated section pattern list")?;
        if token == ")" {
            return Ok(());
        }
        patterns.push(SectionPattern {
            pattern: token,
            keep,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools as _;

    fn parse(text: &str) -> LinkerScript<'_> {
        LinkerScript::parse(text, Path::new("test.ld")).unwrap()
    }

    #[test]
    fn test_group_with_as_needed() {
        let script = parse(
            r#"/* GNU ld script */
            GROUP ( libgcc_s.so.1 -lgcc AS_NEEDED ( /lib/ld-linux.so.2 ) )"#,
        );
        let inputs = script.inputs(Modifiers::default(), Path::new("/usr/lib/libgcc_s.so"), None);
        let specs = inputs.iter().map(|i| &i.spec).collect_vec();
        assert!(matches!(specs[0], InputSpec::File(p) if p.as_ref() == Path::new("libgcc_s.so.1")));
        assert!(matches!(specs[1], InputSpec::Lib(l) if &**l == "gcc"));
        assert!(matches!(specs[2], InputSpec::File(_)));
        assert!(!inputs[1].modifiers.as_needed);
        assert!(inputs[2].modifiers.as_needed);
    }

    #[test]
    fn test_entry_and_search_dir() {
        let script = parse(r#"ENTRY(my_start) SEARCH_DIR("/opt/lib") OUTPUT(a.out)"#);
        assert_eq!(script.entry(), Some("my_start"));
        assert_eq!(script.search_dirs().collect_vec(), vec!["/opt/lib"]);
        assert_eq!(script.output(), Some("a.out"));
    }

    #[test]
    fn test_provide() {
        let script = parse("PROVIDE(etext = . + 0x10);");
        let (name, expression) = script.provides().next().unwrap();
        assert_eq!(name, "etext");
        let value = expression
            .evaluate(&EvalContext {
                dot: 0x1000,
                lookup_symbol: &|_| None,
            })
            .unwrap();
        assert_eq!(value, 0x1010);
    }

    #[test]
    fn test_sections_subset() {
        let script = parse(
            r#"SECTIONS {
                . = 0x10000;
                .text : { *(.text*) KEEP(*(.init)) }
                .data ALIGN(0x1000) : { *(.data*) }
            }"#,
        );
        let rules = script.section_rules().unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].output_name, "");
        assert_eq!(rules[1].output_name, ".text");
        assert!(rules[1].input_patterns[0].matches(b".text.foo"));
        assert!(rules[1].input_patterns[1].keep);
        assert_eq!(rules[2].output_name, ".data");

        let keeps = script.keep_patterns();
        assert_eq!(keeps.len(), 1);
        assert!(keeps[0].matches(b".init"));
        assert!(!keeps[0].matches(b".init_array"));
    }

    #[test]
    fn test_sysroot_prefixes() {
        let sysroot = Path::new("/usr/aarch64-linux-gnu");
        assert_eq!(
            maybe_forced_sysroot(Path::new("=/lib/libc.so.6"), sysroot),
            Some(Box::from(sysroot.join("lib/libc.so.6")))
        );
        assert_eq!(
            maybe_forced_sysroot(Path::new("$SYSROOT/lib/libc.so.6"), sysroot),
            Some(Box::from(sysroot.join("lib/libc.so.6")))
        );
        assert_eq!(maybe_forced_sysroot(Path::new("/lib/libc.so.6"), sysroot), None);
    }

    #[test]
    fn test_star_pattern_matching() {
        assert!(match_star_pattern(b".text*", b".text"));
        assert!(match_star_pattern(b".text*", b".text.foo"));
        assert!(!match_star_pattern(b".text*", b".data"));
        assert!(match_star_pattern(b"*", b"anything"));
        assert!(match_star_pattern(b".rodata.*.str", b".rodata.x.str"));
        assert!(!match_star_pattern(b".rodata.*.str", b".rodata.x.other"));
    }

    #[test]
    fn test_phdrs_rejected() {
        assert!(LinkerScript::parse("PHDRS { }", Path::new("t.ld")).is_err());
    }
}
