//! Support for version scripts. Version scripts attach versions to symbols
//! when producing shared objects and control which symbols get exported.
//! They're technically linker script syntax (the VERSION command), but are
//! almost always passed via --version-script and can be large, so they get
//! their own parser.

use crate::bail;
use crate::error::Result;
use crate::hash::PassThroughHashSet;
use crate::hash::PreHashed;
use crate::symbol::SymbolName;
use glob::Pattern;
use winnow::BStr;
use winnow::Parser;
use winnow::error::ContextError;
use winnow::token::take_until;
use winnow::token::take_while;

/// A version script. See https://sourceware.org/binutils/docs/ld/VERSION.html
#[derive(Debug, Default)]
pub(crate) struct VersionScript<'data> {
    /// Named versions, in declaration order. Empty for an anonymous script.
    versions: Vec<Version<'data>>,

    /// Rules of the anonymous version block, if the script is just
    /// `{ global: ...; local: ...; };`.
    anonymous: Option<VersionBody<'data>>,
}

#[derive(Debug, Default)]
pub(crate) struct Version<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) parent_index: Option<u16>,
    body: VersionBody<'data>,
}

#[derive(Debug, Default)]
struct VersionBody<'data> {
    globals: MatchRules<'data>,
    locals: MatchRules<'data>,
}

#[derive(Debug, Default)]
struct MatchRules<'data> {
    exact: PassThroughHashSet<SymbolName<'data>>,
    nonstar_globs: Vec<Pattern>,
    star_globs: Vec<Pattern>,
    matches_all: bool,
}

/// Where a name matched within a version body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VersionRuleSection {
    Global,
    Local,
}

/// The outcome of looking a symbol up in the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VersionClass {
    /// Index in the `.gnu.version` numbering: 1 is the base/global version,
    /// named versions start at 2.
    pub(crate) version_index: u16,
    pub(crate) is_local: bool,
}

impl<'data> MatchRules<'data> {
    fn push(&mut self, pattern: SymbolMatcher<'data>) {
        match pattern {
            SymbolMatcher::MatchesAll => self.matches_all = true,
            SymbolMatcher::StarGlob(glob) => self.star_globs.push(glob),
            SymbolMatcher::NonstarGlob(glob) => self.nonstar_globs.push(glob),
            SymbolMatcher::Exact(exact) => {
                self.exact.insert(SymbolName::prehashed(exact));
            }
        }
    }

    fn matches_exact(&self, name: &PreHashed<SymbolName>) -> bool {
        self.exact.contains(name)
    }

    fn matches_glob(&self, name: &PreHashed<SymbolName>, non_star: bool) -> bool {
        let globs = if non_star {
            &self.nonstar_globs
        } else {
            &self.star_globs
        };
        if globs.is_empty() {
            return false;
        }
        let Ok(name) = str::from_utf8(name.bytes()) else {
            return false;
        };
        globs.iter().any(|pattern| pattern.matches(name))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
enum SymbolMatcher<'data> {
    /// Exact name.
    Exact(&'data [u8]),
    /// A glob pattern containing a `*`.
    StarGlob(Pattern),
    /// A glob pattern with only `?`/`[]` wildcards.
    NonstarGlob(Pattern),
    /// The pattern `*`.
    MatchesAll,
}

impl<'data> SymbolMatcher<'data> {
    fn from_pattern(token: &'data [u8]) -> Result<SymbolMatcher<'data>> {
        if token == b"*" {
            return Ok(SymbolMatcher::MatchesAll);
        }
        if token.iter().any(|b| b"*?[".contains(b)) {
            let text = str::from_utf8(token)?;
            let pattern = Pattern::new(text)?;
            return Ok(if token.contains(&b'*') {
                SymbolMatcher::StarGlob(pattern)
            } else {
                SymbolMatcher::NonstarGlob(pattern)
            });
        }
        Ok(SymbolMatcher::Exact(token))
    }
}

impl<'data> VersionScript<'data> {
    pub(crate) fn parse(raw: &'data [u8]) -> Result<VersionScript<'data>> {
        let mut input = BStr::new(raw);
        parse_version_script(&mut input)
            .map_err(|error| anyhow::anyhow!("Invalid version script: {error}"))
    }

    /// Parses a --dynamic-list file. The format is an anonymous brace block
    /// whose entries are symbols to export.
    pub(crate) fn parse_dynamic_list(raw: &'data [u8]) -> Result<VersionScript<'data>> {
        let script = Self::parse(raw)?;
        if !script.versions.is_empty() {
            bail!("Dynamic lists cannot contain named versions");
        }
        Ok(script)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.versions.is_empty() && self.anonymous.is_none()
    }

    /// Number of named versions.
    pub(crate) fn version_count(&self) -> usize {
        self.versions.len()
    }

    pub(crate) fn versions(&self) -> impl Iterator<Item = (u16, &Version<'data>)> {
        self.versions
            .iter()
            .enumerate()
            .map(|(i, version)| (named_version_index(i), version))
    }

    /// Classifies a symbol name. Returns `None` if the script says nothing
    /// about the symbol. Lookup follows the rules the other linkers use: the
    /// first version with an exact match wins, otherwise the last version
    /// with a non-star glob match, otherwise the last with a star match.
    pub(crate) fn classify(&self, name: &PreHashed<SymbolName>) -> Option<VersionClass> {
        if let Some(body) = &self.anonymous {
            return body.classify(name).map(|section| VersionClass {
                version_index: object::elf::VER_NDX_GLOBAL,
                is_local: section == VersionRuleSection::Local,
            });
        }

        for (index, version) in self.versions() {
            if version.body.globals.matches_exact(name) {
                return Some(VersionClass {
                    version_index: index,
                    is_local: false,
                });
            }
            if version.body.locals.matches_exact(name) {
                return Some(VersionClass {
                    version_index: index,
                    is_local: true,
                });
            }
        }

        for &non_star in &[true, false] {
            for (index, version) in self.versions().collect::<Vec<_>>().into_iter().rev() {
                if version.body.globals.matches_glob(name, non_star) {
                    return Some(VersionClass {
                        version_index: index,
                        is_local: false,
                    });
                }
                if version.body.locals.matches_glob(name, non_star) {
                    return Some(VersionClass {
                        version_index: index,
                        is_local: true,
                    });
                }
            }
        }

        for (index, version) in self.versions().collect::<Vec<_>>().into_iter().rev() {
            if version.body.globals.matches_all {
                return Some(VersionClass {
                    version_index: index,
                    is_local: false,
                });
            }
            if version.body.locals.matches_all {
                return Some(VersionClass {
                    version_index: index,
                    is_local: true,
                });
            }
        }

        None
    }
}

impl<'data> Version<'data> {
    pub(crate) fn name(&self) -> &'data [u8] {
        self.name
    }
}

impl VersionBody<'_> {
    fn classify(&self, name: &PreHashed<SymbolName>) -> Option<VersionRuleSection> {
        if self.globals.matches_exact(name) {
            return Some(VersionRuleSection::Global);
        }
        if self.locals.matches_exact(name) {
            return Some(VersionRuleSection::Local);
        }
        for &non_star in &[true, false] {
            if self.globals.matches_glob(name, non_star) {
                return Some(VersionRuleSection::Global);
            }
            if self.locals.matches_glob(name, non_star) {
                return Some(VersionRuleSection::Local);
            }
        }
        if self.globals.matches_all {
            return Some(VersionRuleSection::Global);
        }
        if self.locals.matches_all {
            return Some(VersionRuleSection::Local);
        }
        None
    }
}

fn named_version_index(i: usize) -> u16 {
    i as u16 + object::elf::VER_NDX_GLOBAL + 1
}

pub(crate) fn skip_comments_and_whitespace(input: &mut &BStr) -> winnow::Result<()> {
    loop {
        take_while(0.., |b: u8| b.is_ascii_whitespace()).parse_next(input)?;
        if input.starts_with(b"/*") {
            "/*".parse_next(input)?;
            take_until(0.., "*/").parse_next(input)?;
            "*/".parse_next(input)?;
        } else if input.starts_with(b"#") {
            take_while(0.., |b| b != b'\n').parse_next(input)?;
        } else {
            return Ok(());
        }
    }
}

fn parse_token<'input>(input: &mut &'input BStr) -> winnow::Result<&'input [u8]> {
    take_while(1.., |b: u8| {
        !b.is_ascii_whitespace() && !b"{};:\"".contains(&b)
    })
    .parse_next(input)
}

/// Parses a pattern, which may be double-quoted.
fn parse_pattern<'input>(input: &mut &'input BStr) -> winnow::Result<&'input [u8]> {
    if input.starts_with(b"\"") {
        "\"".parse_next(input)?;
        let pattern = take_while(0.., |b| b != b'"').parse_next(input)?;
        "\"".parse_next(input)?;
        Ok(pattern)
    } else {
        parse_token(input)
    }
}

fn parse_error() -> ContextError {
    ContextError::new()
}

fn parse_version_body<'input>(input: &mut &'input BStr) -> winnow::Result<VersionBody<'input>> {
    let mut body = VersionBody::default();
    let mut section = VersionRuleSection::Global;

    "{".parse_next(input)?;
    loop {
        skip_comments_and_whitespace(input)?;
        if input.starts_with(b"}") {
            "}".parse_next(input)?;
            return Ok(body);
        }
        if input.starts_with(b"global") {
            "global".parse_next(input)?;
            skip_comments_and_whitespace(input)?;
            ":".parse_next(input)?;
            section = VersionRuleSection::Global;
            continue;
        }
        if input.starts_with(b"local") {
            "local".parse_next(input)?;
            skip_comments_and_whitespace(input)?;
            ":".parse_next(input)?;
            section = VersionRuleSection::Local;
            continue;
        }
        if input.starts_with(b"extern") {
            // extern "C++" blocks need demangled matching, which we don't do.
            return Err(parse_error());
        }

        let pattern = parse_pattern(input)?;
        skip_comments_and_whitespace(input)?;
        ";".parse_next(input)?;

        let matcher = SymbolMatcher::from_pattern(pattern).map_err(|_| parse_error())?;
        match section {
            VersionRuleSection::Global => body.globals.push(matcher),
            VersionRuleSection::Local => body.locals.push(matcher),
        }
    }
}

fn parse_version_script<'input>(
    input: &mut &'input BStr,
) -> winnow::Result<VersionScript<'input>> {
    skip_comments_and_whitespace(input)?;

    // Anonymous script: a single unnamed block.
    if input.starts_with(b"{") {
        let body = parse_version_body(input)?;
        skip_comments_and_whitespace(input)?;
        ";".parse_next(input)?;
        skip_comments_and_whitespace(input)?;
        return Ok(VersionScript {
            versions: Vec::new(),
            anonymous: Some(body),
        });
    }

    let mut script = VersionScript::default();
    loop {
        skip_comments_and_whitespace(input)?;
        if input.is_empty() {
            return Ok(script);
        }
        let name = parse_token(input)?;
        skip_comments_and_whitespace(input)?;
        let body = parse_version_body(input)?;
        skip_comments_and_whitespace(input)?;

        let mut parent_index = None;
        if !input.starts_with(b";") {
            let parent = parse_token(input)?;
            skip_comments_and_whitespace(input)?;
            parent_index = script
                .versions
                .iter()
                .position(|v| v.name == parent)
                .map(named_version_index);
            if parent_index.is_none() {
                return Err(parse_error());
            }
        }
        ";".parse_next(input)?;

        script.versions.push(Version {
            name,
            parent_index,
            body,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify<'a>(script: &VersionScript<'a>, name: &str) -> Option<VersionClass> {
        script.classify(&SymbolName::prehashed(name.as_bytes()))
    }

    #[test]
    fn test_anonymous_script() {
        let script = VersionScript::parse(
            br#"
            # A comment
            {global:
                /* An inline comment */
                foo;
                bar*;
            local:
                *;
            };"#,
        )
        .unwrap();
        assert_eq!(script.version_count(), 0);

        let foo = classify(&script, "foo").unwrap();
        assert!(!foo.is_local);
        assert_eq!(foo.version_index, object::elf::VER_NDX_GLOBAL);

        assert!(!classify(&script, "barbaz").unwrap().is_local);
        assert!(classify(&script, "baz").unwrap().is_local);
    }

    #[test]
    fn test_named_versions_with_parent() {
        let script = VersionScript::parse(
            br#"
            VERS_1.1 {
                global:
                    foo1;
                local:
                    old*;
            };

            VERS_1.2 {
                foo2;
            } VERS_1.1;
            "#,
        )
        .unwrap();
        assert_eq!(script.version_count(), 2);

        let versions: Vec<_> = script.versions().collect();
        assert_eq!(versions[0].1.name(), b"VERS_1.1");
        assert_eq!(versions[0].0, 2);
        assert_eq!(versions[1].1.name(), b"VERS_1.2");
        assert_eq!(versions[1].1.parent_index, Some(2));

        assert_eq!(classify(&script, "foo1").unwrap().version_index, 2);
        assert_eq!(classify(&script, "foo2").unwrap().version_index, 3);
        assert!(classify(&script, "old_thing").unwrap().is_local);
        assert_eq!(classify(&script, "unrelated"), None);
    }

    #[test]
    fn test_exact_beats_glob_and_first_version_wins() {
        let script = VersionScript::parse(
            br#"
            V1 { global: f*; };
            V2 { global: foo; };
            V3 { global: f*; };
            "#,
        )
        .unwrap();
        // Exact match in V2 wins over the globs.
        assert_eq!(classify(&script, "foo").unwrap().version_index, 3);
        // For glob-only matches, the last version wins.
        assert_eq!(classify(&script, "fab").unwrap().version_index, 4);
    }

    #[test]
    fn test_spec_scenario_local_prefix() {
        // VER_X1 { global: *; local: b*; };  with foo, bar, baz defined:
        // only foo is exported.
        let script = VersionScript::parse(b"VER_X1 { global: *; local: b*; };").unwrap();
        assert!(classify(&script, "bar").unwrap().is_local);
        assert!(classify(&script, "baz").unwrap().is_local);
        let foo = classify(&script, "foo").unwrap();
        assert!(!foo.is_local);
        assert_eq!(foo.version_index, 2);
    }

    #[test]
    fn test_extern_cxx_rejected() {
        assert!(
            VersionScript::parse(br#"{ global: extern "C++" { foo }; };"#).is_err()
        );
    }

    #[test]
    fn test_dynamic_list() {
        let script = VersionScript::parse_dynamic_list(b"{ exported_fn; other*; };").unwrap();
        assert!(!classify(&script, "exported_fn").unwrap().is_local);
        assert!(!classify(&script, "other_thing").unwrap().is_local);
        assert_eq!(classify(&script, "hidden_fn"), None);
    }
}
