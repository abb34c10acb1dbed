//! Preprocessor
//!
//! Consumes a raw token stream (with `start_of_line` flags from the lexer)
//! and produces the expanded stream the parser sees. Implements `#include`
//! with search paths, object-like / function-like / variadic macros,
//! conditionals with 64-bit signed/unsigned arithmetic, `#pragma once`,
//! `#pragma pack`, `#error`, `#warning` and `#line`.
//!
//! Expansion contracts:
//! - arguments not adjacent to `#`/`##` are fully expanded before
//!   substitution; adjacent ones are substituted unexpanded
//! - `a ## b` pastes the adjacent tokens and rescans the result
//! - `#a` stringizes the unexpanded argument spellings with single-space
//!   normalization (comments already collapsed to spaces by the lexer)
//! - a macro under expansion is blue-painted and cannot re-expand itself

use crate::config::{CompilerConfig, TargetAbi};
use crate::diag::{Diagnostic, SourceLoc};
use crate::lexer::{Lexer, Punct, Token, TokenKind};
use crate::strings::{StrId, StringTable};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const MAX_INCLUDE_DEPTH: usize = 64;

/// A stored macro definition.
#[derive(Debug, Clone)]
struct MacroDef {
    /// `None` for object-like macros.
    params: Option<Vec<String>>,
    variadic: bool,
    body: Vec<Token>,
    loc: SourceLoc,
}

impl MacroDef {
    /// Redefinition is allowed only when the token spellings match exactly.
    fn same_definition(&self, other: &MacroDef) -> bool {
        self.params == other.params
            && self.variadic == other.variadic
            && self.body.len() == other.body.len()
            && self
                .body
                .iter()
                .zip(&other.body)
                .all(|(a, b)| a.text == b.text)
    }
}

/// Token plus its blue-paint set: macros this token may no longer expand.
#[derive(Debug, Clone)]
struct PTok {
    tok: Token,
    blue: Vec<StrId>,
}

impl PTok {
    fn plain(tok: Token) -> Self {
        PTok {
            tok,
            blue: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CondState {
    /// Tokens in this region reach the output.
    active: bool,
    /// Some branch of this `#if` chain has already been taken.
    taken: bool,
    seen_else: bool,
}

pub struct Preprocessor<'cfg> {
    config: &'cfg CompilerConfig,
    macros: HashMap<StrId, MacroDef>,
    pragma_once: HashSet<PathBuf>,
    /// `#pragma pack` stack; last entry is the active packing, if any.
    pack_stack: Vec<u32>,
    pub warnings: Vec<Diagnostic>,
    include_depth: usize,
}

impl<'cfg> Preprocessor<'cfg> {
    pub fn new(config: &'cfg CompilerConfig, strings: &mut StringTable) -> Self {
        let mut pp = Preprocessor {
            config,
            macros: HashMap::new(),
            pragma_once: HashSet::new(),
            pack_stack: Vec::new(),
            warnings: Vec::new(),
            include_depth: 0,
        };
        pp.define_builtin_macros(strings);
        pp
    }

    /// Current `#pragma pack` alignment override, if any.
    pub fn current_pack(&self) -> Option<u32> {
        self.pack_stack.last().copied()
    }

    fn define_builtin_macros(&mut self, strings: &mut StringTable) {
        let mut define = |pp: &mut Self, strings: &mut StringTable, name: &str, body: &str| {
            let id = strings.intern(name);
            let file = strings.intern("<built-in>");
            let toks = Lexer::new(body, file)
                .lex()
                .expect("builtin macro bodies lex cleanly");
            let body: Vec<Token> = toks
                .into_iter()
                .filter(|t| t.kind != TokenKind::Eof)
                .collect();
            pp.macros.insert(
                id,
                MacroDef {
                    params: None,
                    variadic: false,
                    body,
                    loc: SourceLoc::unknown(),
                },
            );
        };
        define(self, strings, "__cplusplus", "202002L");
        define(self, strings, "__cpp_lib_type_trait_variable_templates", "201510L");
        define(self, strings, "__cpp_lib_addressof_constexpr", "201603L");
        define(self, strings, "__cpp_lib_integral_constant_callable", "201304L");
        define(self, strings, "__cpp_lib_is_aggregate", "201703L");
        define(self, strings, "__cpp_lib_void_t", "201411L");
        define(self, strings, "__cpp_lib_bool_constant", "201505L");
        let size_type = match self.config.target {
            TargetAbi::LinuxElf => "unsigned long",
            TargetAbi::WindowsCoff => "unsigned long long",
        };
        define(self, strings, "__SIZE_TYPE__", size_type);
        for (name, value) in &self.config.defines {
            let body = value.clone().unwrap_or_else(|| "1".to_string());
            define(self, strings, name, &body);
        }
    }

    /// Preprocess a lexed file into the parser-ready token stream.
    pub fn preprocess(
        &mut self,
        tokens: Vec<Token>,
        source_path: &Path,
        strings: &mut StringTable,
    ) -> Result<Vec<Token>, Diagnostic> {
        let mut out = Vec::with_capacity(tokens.len());
        let mut conds: Vec<CondState> = Vec::new();
        let mut i = 0;
        let toks = tokens;
        while i < toks.len() {
            let tok = &toks[i];
            if tok.kind == TokenKind::Eof {
                break;
            }
            if tok.is_punct(Punct::Hash) && tok.start_of_line {
                let line_end = line_extent(&toks, i);
                let directive = &toks[i + 1..line_end];
                self.handle_directive(directive, tok.loc, &mut conds, &mut out, source_path, strings)?;
                i = line_end;
                continue;
            }
            let active = conds.iter().all(|c| c.active);
            if !active {
                i += 1;
                continue;
            }
            // Expand a maximal run of non-directive tokens at once so that a
            // function-like macro call spanning lines is seen whole.
            let mut run_end = i;
            while run_end < toks.len()
                && toks[run_end].kind != TokenKind::Eof
                && !(toks[run_end].is_punct(Punct::Hash) && toks[run_end].start_of_line)
            {
                run_end += 1;
            }
            let run: Vec<PTok> = toks[i..run_end].iter().cloned().map(PTok::plain).collect();
            let expanded = self.expand(&run, strings)?;
            out.extend(expanded.into_iter().map(|p| p.tok));
            i = run_end;
        }
        if let Some(open) = conds.last() {
            let _ = open;
            return Err(Diagnostic::error(
                toks.last().map(|t| t.loc).unwrap_or_else(SourceLoc::unknown),
                "unterminated conditional directive",
            ));
        }
        out.push(Token::eof(
            toks.last().map(|t| t.loc).unwrap_or_else(SourceLoc::unknown),
        ));
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_directive(
        &mut self,
        directive: &[Token],
        hash_loc: SourceLoc,
        conds: &mut Vec<CondState>,
        out: &mut Vec<Token>,
        source_path: &Path,
        strings: &mut StringTable,
    ) -> Result<(), Diagnostic> {
        let active = conds.iter().all(|c| c.active);
        let Some(name_tok) = directive.first() else {
            return Ok(()); // null directive `#`
        };
        let name = name_tok.text.as_str();
        let rest = &directive[1..];
        match name {
            "if" | "ifdef" | "ifndef" => {
                let value = if !active {
                    false // inside a skipped region only track nesting
                } else {
                    match name {
                        "ifdef" => self.defined_first(rest, strings)?,
                        "ifndef" => !self.defined_first(rest, strings)?,
                        _ => self.eval_condition(rest, strings)? != 0,
                    }
                };
                conds.push(CondState {
                    active: active && value,
                    taken: value,
                    seen_else: false,
                });
            }
            "elif" => {
                let Some(state) = conds.last_mut() else {
                    return Err(Diagnostic::error(hash_loc, "#elif without matching #if"));
                };
                if state.seen_else {
                    return Err(Diagnostic::error(hash_loc, "#elif after #else"));
                }
                let outer_active = conds[..conds.len() - 1].iter().all(|c| c.active);
                let state = conds.last_mut().unwrap();
                if state.taken || !outer_active {
                    state.active = false;
                } else {
                    let v = self.eval_condition(rest, strings)? != 0;
                    state.active = v;
                    state.taken = v;
                }
            }
            "else" => {
                let Some(state) = conds.last_mut() else {
                    return Err(Diagnostic::error(hash_loc, "#else without matching #if"));
                };
                if state.seen_else {
                    return Err(Diagnostic::error(hash_loc, "duplicate #else"));
                }
                state.seen_else = true;
                let outer_active = conds[..conds.len() - 1].iter().all(|c| c.active);
                let state = conds.last_mut().unwrap();
                state.active = outer_active && !state.taken;
                state.taken = true;
            }
            "endif" => {
                if conds.pop().is_none() {
                    return Err(Diagnostic::error(hash_loc, "#endif without matching #if"));
                }
            }
            _ if !active => {}
            "define" => self.handle_define(rest, hash_loc, strings)?,
            "undef" => {
                let Some(n) = rest.first().filter(|t| t.kind == TokenKind::Ident) else {
                    return Err(Diagnostic::error(hash_loc, "expected macro name after #undef"));
                };
                let id = strings.intern(&n.text);
                self.macros.remove(&id);
            }
            "include" => self.handle_include(rest, hash_loc, out, source_path, strings)?,
            "pragma" => self.handle_pragma(rest, source_path)?,
            "error" => {
                return Err(Diagnostic::error(hash_loc, format!("#error: {}", spell(rest))));
            }
            "warning" => {
                self.warnings
                    .push(Diagnostic::warning(hash_loc, format!("#warning: {}", spell(rest))));
            }
            "line" => {
                // Recorded for diagnostics only; token locations already
                // carry the physical position.
                if rest.is_empty() {
                    return Err(Diagnostic::error(hash_loc, "expected line number after #line"));
                }
            }
            other => {
                return Err(Diagnostic::error(
                    hash_loc,
                    format!("unknown preprocessor directive '#{}'", other),
                ));
            }
        }
        Ok(())
    }

    fn defined_first(&self, rest: &[Token], strings: &mut StringTable) -> Result<bool, Diagnostic> {
        let Some(t) = rest.first().filter(|t| t.kind == TokenKind::Ident) else {
            return Err(Diagnostic::error(
                rest.first().map(|t| t.loc).unwrap_or_else(SourceLoc::unknown),
                "expected macro name",
            ));
        };
        let id = strings.intern(&t.text);
        Ok(self.macros.contains_key(&id))
    }

    fn handle_define(
        &mut self,
        rest: &[Token],
        loc: SourceLoc,
        strings: &mut StringTable,
    ) -> Result<(), Diagnostic> {
        let Some(name_tok) = rest.first().filter(|t| t.kind == TokenKind::Ident) else {
            return Err(Diagnostic::error(loc, "expected macro name after #define"));
        };
        let name = strings.intern(&name_tok.text);
        let mut body_start = 1;
        // Function-like only when '(' hugs the name with no whitespace.
        let params = if rest.len() > 1 && rest[1].is_punct(Punct::LParen) && !rest[1].space_before {
            let mut params = Vec::new();
            let mut variadic = false;
            let mut j = 2;
            loop {
                match rest.get(j) {
                    Some(t) if t.is_punct(Punct::RParen) => {
                        j += 1;
                        break;
                    }
                    Some(t) if t.is_punct(Punct::Ellipsis) => {
                        variadic = true;
                        j += 1;
                    }
                    Some(t) if t.kind == TokenKind::Ident => {
                        params.push(t.text.clone());
                        j += 1;
                    }
                    Some(t) if t.is_punct(Punct::Comma) => {
                        j += 1;
                    }
                    _ => {
                        return Err(Diagnostic::error(loc, "malformed macro parameter list"));
                    }
                }
            }
            body_start = j;
            Some((params, variadic))
        } else {
            None
        };
        let (params, variadic) = match params {
            Some((p, v)) => (Some(p), v),
            None => (None, false),
        };
        let def = MacroDef {
            params,
            variadic,
            body: rest[body_start..].to_vec(),
            loc,
        };
        if let Some(existing) = self.macros.get(&name)
            && !existing.same_definition(&def)
        {
            return Err(Diagnostic::error(
                loc,
                format!("macro '{}' redefined with a different body", name_tok.text),
            ));
        }
        self.macros.insert(name, def);
        Ok(())
    }

    fn handle_pragma(&mut self, rest: &[Token], source_path: &Path) -> Result<(), Diagnostic> {
        match rest.first().map(|t| t.text.as_str()) {
            Some("once") => {
                if let Ok(canon) = source_path.canonicalize() {
                    self.pragma_once.insert(canon);
                } else {
                    self.pragma_once.insert(source_path.to_path_buf());
                }
            }
            Some("pack") => {
                // #pragma pack(push, N) / #pragma pack(pop) / #pragma pack(N)
                let inner: Vec<&Token> = rest[1..]
                    .iter()
                    .filter(|t| !t.is_punct(Punct::LParen) && !t.is_punct(Punct::RParen))
                    .collect();
                match inner.first().map(|t| t.text.as_str()) {
                    Some("push") => {
                        let n = inner.iter().find_map(|t| match t.kind {
                            TokenKind::Int { value, .. } => Some(value as u32),
                            _ => None,
                        });
                        self.pack_stack.push(n.unwrap_or(8));
                    }
                    Some("pop") => {
                        self.pack_stack.pop();
                    }
                    _ => {
                        if let Some(TokenKind::Int { value, .. }) = inner.first().map(|t| &t.kind) {
                            self.pack_stack.push(*value as u32);
                        }
                    }
                }
            }
            _ => {
                // Unknown pragmas are ignored, as every real compiler does.
                tracing::debug!(target: "pp", "ignoring #pragma {}", spell(rest));
            }
        }
        Ok(())
    }

    fn handle_include(
        &mut self,
        rest: &[Token],
        loc: SourceLoc,
        out: &mut Vec<Token>,
        source_path: &Path,
        strings: &mut StringTable,
    ) -> Result<(), Diagnostic> {
        if self.include_depth >= MAX_INCLUDE_DEPTH {
            return Err(Diagnostic::error(loc, "include nesting too deep"));
        }
        // The header name may itself come from a macro.
        let expanded;
        let rest = if rest.first().is_some_and(|t| t.kind == TokenKind::Ident) {
            let run: Vec<PTok> = rest.iter().cloned().map(PTok::plain).collect();
            expanded = self.expand(&run, strings)?;
            expanded.iter().map(|p| p.tok.clone()).collect::<Vec<_>>()
        } else {
            rest.to_vec()
        };
        let (path_str, angled) = parse_header_name(&rest, loc)?;
        let Some(resolved) = self.resolve_include(&path_str, angled, source_path) else {
            return Err(Diagnostic::error(
                loc,
                format!("include file not found: '{}'", path_str),
            ));
        };
        let canon = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
        if self.pragma_once.contains(&canon) {
            return Ok(());
        }
        let text = std::fs::read_to_string(&resolved)
            .map_err(|e| Diagnostic::error(loc, format!("cannot read '{}': {}", path_str, e)))?;
        let file_id = strings.intern(&resolved.display().to_string());
        let toks = Lexer::new(&text, file_id).lex()?;
        self.include_depth += 1;
        let result = self.preprocess(toks, &resolved, strings);
        self.include_depth -= 1;
        let mut inner = result?;
        inner.pop(); // strip the inner Eof
        out.extend(inner);
        Ok(())
    }

    fn resolve_include(&self, name: &str, angled: bool, source_path: &Path) -> Option<PathBuf> {
        if !angled
            && let Some(dir) = source_path.parent()
        {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        for dir in &self.config.include_paths {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    // ---------------------------------------------------------------
    // Macro expansion
    // ---------------------------------------------------------------

    fn expand(&mut self, input: &[PTok], strings: &mut StringTable) -> Result<Vec<PTok>, Diagnostic> {
        let mut out = Vec::with_capacity(input.len());
        let mut i = 0;
        while i < input.len() {
            let pt = &input[i];
            if pt.tok.kind != TokenKind::Ident {
                out.push(pt.clone());
                i += 1;
                continue;
            }
            let id = strings.intern(&pt.tok.text);
            if pt.blue.contains(&id) {
                out.push(pt.clone());
                i += 1;
                continue;
            }
            let Some(def) = self.macros.get(&id).cloned() else {
                out.push(pt.clone());
                i += 1;
                continue;
            };
            match &def.params {
                None => {
                    let replaced = self.substitute(&def, &[], pt, id, strings)?;
                    let rescanned = self.expand(&replaced, strings)?;
                    out.extend(rescanned);
                    i += 1;
                }
                Some(params) => {
                    // Function-like macro needs a following '('; otherwise the
                    // name is left alone.
                    let Some(next) = input.get(i + 1) else {
                        out.push(pt.clone());
                        i += 1;
                        continue;
                    };
                    if !next.tok.is_punct(Punct::LParen) {
                        out.push(pt.clone());
                        i += 1;
                        continue;
                    }
                    let (args, after) =
                        collect_macro_args(input, i + 1, pt.tok.loc, params.len(), def.variadic)?;
                    let replaced = self.substitute(&def, &args, pt, id, strings)?;
                    let rescanned = self.expand(&replaced, strings)?;
                    out.extend(rescanned);
                    i = after;
                }
            }
        }
        Ok(out)
    }

    /// Substitute parameters into a macro body, handling `#`, `##` and
    /// argument pre-expansion, and blue-paint the result.
    fn substitute(
        &mut self,
        def: &MacroDef,
        args: &[Vec<PTok>],
        invocation: &PTok,
        macro_id: StrId,
        strings: &mut StringTable,
    ) -> Result<Vec<PTok>, Diagnostic> {
        let params: &[String] = def.params.as_deref().unwrap_or(&[]);
        let param_index = |name: &str| -> Option<usize> {
            if name == "__VA_ARGS__" && def.variadic {
                return Some(params.len());
            }
            params.iter().position(|p| p == name)
        };
        let arg_for = |idx: usize| -> Vec<PTok> {
            if idx < params.len() {
                args.get(idx).cloned().unwrap_or_default()
            } else {
                // __VA_ARGS__: everything after the named parameters,
                // re-joined with commas.
                let mut joined = Vec::new();
                for (n, extra) in args.iter().enumerate().skip(params.len()) {
                    if n > params.len() {
                        joined.push(PTok::plain(Token {
                            kind: TokenKind::Punct(Punct::Comma),
                            text: ",".into(),
                            loc: invocation.tok.loc,
                            start_of_line: false,
                            space_before: false,
                        }));
                    }
                    joined.extend(extra.iter().cloned());
                }
                joined
            }
        };

        let mut out: Vec<PTok> = Vec::new();
        let body = &def.body;
        let mut i = 0;
        while i < body.len() {
            let t = &body[i];
            // Stringize: # param
            if t.is_punct(Punct::Hash)
                && let Some(p) = body.get(i + 1)
                && p.kind == TokenKind::Ident
                && let Some(idx) = param_index(&p.text)
            {
                let arg = arg_for(idx);
                let value = stringize(&arg);
                out.push(PTok::plain(Token {
                    kind: TokenKind::Str {
                        value: value.clone(),
                        prefix: crate::lexer::EncodingPrefix::None,
                    },
                    text: format!("\"{}\"", value.escape_default()),
                    loc: invocation.tok.loc,
                    start_of_line: false,
                    space_before: t.space_before,
                }));
                i += 2;
                continue;
            }
            // Paste: <left> ## <right>
            if body.get(i + 1).is_some_and(|n| n.is_punct(Punct::HashHash)) {
                // Collect left tokens (unexpanded argument or the literal token).
                let mut left: Vec<PTok> = match param_index(&t.text) {
                    Some(idx) if t.kind == TokenKind::Ident => arg_for(idx),
                    _ => vec![PTok::plain(t.clone())],
                };
                let mut j = i + 1;
                while body.get(j).is_some_and(|n| n.is_punct(Punct::HashHash)) {
                    let Some(rt) = body.get(j + 1) else {
                        return Err(Diagnostic::error(def.loc, "'##' at end of macro body"));
                    };
                    let right: Vec<PTok> = match param_index(&rt.text) {
                        Some(idx) if rt.kind == TokenKind::Ident => arg_for(idx),
                        _ => vec![PTok::plain(rt.clone())],
                    };
                    left = paste(left, right, invocation.tok.loc, strings)?;
                    j += 2;
                }
                out.extend(left);
                i = j;
                continue;
            }
            // Plain parameter: fully pre-expand the argument first.
            if t.kind == TokenKind::Ident
                && let Some(idx) = param_index(&t.text)
            {
                let arg = arg_for(idx);
                let expanded = self.expand(&arg, strings)?;
                out.extend(expanded);
                i += 1;
                continue;
            }
            out.push(PTok::plain(t.clone()));
            i += 1;
        }

        // Blue-paint: the macro may not re-expand itself in its own
        // replacement. Inherit the invocation's paint as well.
        for pt in &mut out {
            pt.blue.extend_from_slice(&invocation.blue);
            pt.blue.push(macro_id);
            pt.tok.loc = invocation.tok.loc;
        }
        Ok(out)
    }

    // ---------------------------------------------------------------
    // #if expression evaluation
    // ---------------------------------------------------------------

    /// Evaluate a conditional expression over signed/unsigned 64-bit
    /// arithmetic. `defined`, `__has_include` and `__has_cpp_attribute`
    /// are resolved before macro expansion.
    fn eval_condition(&mut self, rest: &[Token], strings: &mut StringTable) -> Result<i64, Diagnostic> {
        let loc = rest.first().map(|t| t.loc).unwrap_or_else(SourceLoc::unknown);
        let mut pre = Vec::with_capacity(rest.len());
        let mut i = 0;
        while i < rest.len() {
            let t = &rest[i];
            match t.text.as_str() {
                "defined" => {
                    let (name, next) = parse_defined_operand(rest, i + 1, loc)?;
                    let id = strings.intern(&name);
                    pre.push(int_token(self.macros.contains_key(&id) as u64, t.loc));
                    i = next;
                }
                "__has_cpp_attribute" => {
                    let (name, next) = parse_paren_name(rest, i + 1, loc)?;
                    pre.push(int_token(has_cpp_attribute(&name), t.loc));
                    i = next;
                }
                "__has_include" => {
                    let (inner, next) = parse_paren_group(rest, i + 1, loc)?;
                    let (path, angled) = parse_header_name(&inner, loc)?;
                    let found = self
                        .resolve_include(&path, angled, Path::new("."))
                        .is_some();
                    pre.push(int_token(found as u64, t.loc));
                    i = next;
                }
                _ => {
                    pre.push(t.clone());
                    i += 1;
                }
            }
        }
        let run: Vec<PTok> = pre.into_iter().map(PTok::plain).collect();
        let expanded = self.expand(&run, strings)?;
        // Remaining identifiers (including true/false keywords) fold to 1/0.
        let mut toks: Vec<Token> = Vec::with_capacity(expanded.len());
        for p in expanded {
            let t = p.tok;
            match &t.kind {
                TokenKind::Ident => toks.push(int_token(0, t.loc)),
                TokenKind::Keyword(crate::lexer::Keyword::True) => toks.push(int_token(1, t.loc)),
                TokenKind::Keyword(crate::lexer::Keyword::False) => toks.push(int_token(0, t.loc)),
                _ => toks.push(t),
            }
        }
        let mut ev = CondEval { toks: &toks, pos: 0 };
        let v = ev.ternary()?;
        Ok(v.as_i64())
    }
}

/// Signed/unsigned 64-bit value in a `#if` expression. Any unsigned operand
/// makes the operation unsigned, per the usual conversions at the
/// preprocessor's single rank.
#[derive(Debug, Clone, Copy)]
struct PpVal {
    bits: u64,
    unsigned: bool,
}

impl PpVal {
    fn signed(v: i64) -> Self {
        PpVal {
            bits: v as u64,
            unsigned: false,
        }
    }
    fn as_i64(self) -> i64 {
        self.bits as i64
    }
    fn truthy(self) -> bool {
        self.bits != 0
    }
}

struct CondEval<'a> {
    toks: &'a [Token],
    pos: usize,
}

impl<'a> CondEval<'a> {
    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos)
    }

    fn eat(&mut self, p: Punct) -> bool {
        if self.peek().is_some_and(|t| t.is_punct(p)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn loc(&self) -> SourceLoc {
        self.peek().map(|t| t.loc).unwrap_or_else(SourceLoc::unknown)
    }

    fn ternary(&mut self) -> Result<PpVal, Diagnostic> {
        let cond = self.logical_or()?;
        if self.eat(Punct::Question) {
            let then = self.ternary()?;
            if !self.eat(Punct::Colon) {
                return Err(Diagnostic::error(self.loc(), "expected ':' in conditional"));
            }
            let els = self.ternary()?;
            return Ok(if cond.truthy() { then } else { els });
        }
        Ok(cond)
    }

    fn logical_or(&mut self) -> Result<PpVal, Diagnostic> {
        let mut v = self.logical_and()?;
        while self.eat(Punct::PipePipe) {
            let r = self.logical_and()?;
            v = PpVal::signed((v.truthy() || r.truthy()) as i64);
        }
        Ok(v)
    }

    fn logical_and(&mut self) -> Result<PpVal, Diagnostic> {
        let mut v = self.bit_or()?;
        while self.eat(Punct::AmpAmp) {
            let r = self.bit_or()?;
            v = PpVal::signed((v.truthy() && r.truthy()) as i64);
        }
        Ok(v)
    }

    fn bit_or(&mut self) -> Result<PpVal, Diagnostic> {
        let mut v = self.bit_xor()?;
        while self.eat(Punct::Pipe) {
            let r = self.bit_xor()?;
            v = PpVal {
                bits: v.bits | r.bits,
                unsigned: v.unsigned || r.unsigned,
            };
        }
        Ok(v)
    }

    fn bit_xor(&mut self) -> Result<PpVal, Diagnostic> {
        let mut v = self.bit_and()?;
        while self.eat(Punct::Caret) {
            let r = self.bit_and()?;
            v = PpVal {
                bits: v.bits ^ r.bits,
                unsigned: v.unsigned || r.unsigned,
            };
        }
        Ok(v)
    }

    fn bit_and(&mut self) -> Result<PpVal, Diagnostic> {
        let mut v = self.equality()?;
        while self.peek().is_some_and(|t| t.is_punct(Punct::Amp)) {
            self.pos += 1;
            let r = self.equality()?;
            v = PpVal {
                bits: v.bits & r.bits,
                unsigned: v.unsigned || r.unsigned,
            };
        }
        Ok(v)
    }

    fn equality(&mut self) -> Result<PpVal, Diagnostic> {
        let mut v = self.relational()?;
        loop {
            if self.eat(Punct::EqEq) {
                let r = self.relational()?;
                v = PpVal::signed((v.bits == r.bits) as i64);
            } else if self.eat(Punct::NotEq) {
                let r = self.relational()?;
                v = PpVal::signed((v.bits != r.bits) as i64);
            } else {
                return Ok(v);
            }
        }
    }

    fn relational(&mut self) -> Result<PpVal, Diagnostic> {
        let mut v = self.shift()?;
        loop {
            let cmp: fn(PpVal, PpVal, bool) -> bool = if self.eat(Punct::Lt) {
                |a: PpVal, b: PpVal, u: bool| {
                    if u { a.bits < b.bits } else { a.as_i64() < b.as_i64() }
                }
            } else if self.eat(Punct::Gt) {
                |a: PpVal, b: PpVal, u: bool| {
                    if u { a.bits > b.bits } else { a.as_i64() > b.as_i64() }
                }
            } else if self.eat(Punct::LtEq) {
                |a: PpVal, b: PpVal, u: bool| {
                    if u { a.bits <= b.bits } else { a.as_i64() <= b.as_i64() }
                }
            } else if self.eat(Punct::GtEq) {
                |a: PpVal, b: PpVal, u: bool| {
                    if u { a.bits >= b.bits } else { a.as_i64() >= b.as_i64() }
                }
            } else {
                return Ok(v);
            };
            let r = self.shift()?;
            let u = v.unsigned || r.unsigned;
            v = PpVal::signed(cmp(v, r, u) as i64);
        }
    }

    fn shift(&mut self) -> Result<PpVal, Diagnostic> {
        let mut v = self.additive()?;
        loop {
            if self.eat(Punct::Shl) {
                let r = self.additive()?;
                v = PpVal {
                    bits: v.bits.wrapping_shl(r.bits as u32),
                    unsigned: v.unsigned,
                };
            } else if self.eat(Punct::Shr) {
                let r = self.additive()?;
                let bits = if v.unsigned {
                    v.bits.wrapping_shr(r.bits as u32)
                } else {
                    (v.as_i64().wrapping_shr(r.bits as u32)) as u64
                };
                v = PpVal {
                    bits,
                    unsigned: v.unsigned,
                };
            } else {
                return Ok(v);
            }
        }
    }

    fn additive(&mut self) -> Result<PpVal, Diagnostic> {
        let mut v = self.multiplicative()?;
        loop {
            if self.eat(Punct::Plus) {
                let r = self.multiplicative()?;
                v = PpVal {
                    bits: v.bits.wrapping_add(r.bits),
                    unsigned: v.unsigned || r.unsigned,
                };
            } else if self.eat(Punct::Minus) {
                let r = self.multiplicative()?;
                v = PpVal {
                    bits: v.bits.wrapping_sub(r.bits),
                    unsigned: v.unsigned || r.unsigned,
                };
            } else {
                return Ok(v);
            }
        }
    }

    fn multiplicative(&mut self) -> Result<PpVal, Diagnostic> {
        let mut v = self.unary()?;
        loop {
            if self.eat(Punct::Star) {
                let r = self.unary()?;
                v = PpVal {
                    bits: v.bits.wrapping_mul(r.bits),
                    unsigned: v.unsigned || r.unsigned,
                };
            } else if self.peek().is_some_and(|t| t.is_punct(Punct::Slash)) {
                let loc = self.loc();
                self.pos += 1;
                let r = self.unary()?;
                if r.bits == 0 {
                    return Err(Diagnostic::error(loc, "division by zero in preprocessor expression"));
                }
                let u = v.unsigned || r.unsigned;
                let bits = if u {
                    v.bits / r.bits
                } else {
                    (v.as_i64() / r.as_i64()) as u64
                };
                v = PpVal { bits, unsigned: u };
            } else if self.peek().is_some_and(|t| t.is_punct(Punct::Percent)) {
                let loc = self.loc();
                self.pos += 1;
                let r = self.unary()?;
                if r.bits == 0 {
                    return Err(Diagnostic::error(loc, "division by zero in preprocessor expression"));
                }
                let u = v.unsigned || r.unsigned;
                let bits = if u {
                    v.bits % r.bits
                } else {
                    (v.as_i64() % r.as_i64()) as u64
                };
                v = PpVal { bits, unsigned: u };
            } else {
                return Ok(v);
            }
        }
    }

    fn unary(&mut self) -> Result<PpVal, Diagnostic> {
        if self.eat(Punct::Minus) {
            let v = self.unary()?;
            return Ok(PpVal {
                bits: v.bits.wrapping_neg(),
                unsigned: v.unsigned,
            });
        }
        if self.eat(Punct::Plus) {
            return self.unary();
        }
        if self.eat(Punct::Bang) {
            let v = self.unary()?;
            return Ok(PpVal::signed(!v.truthy() as i64));
        }
        if self.eat(Punct::Tilde) {
            let v = self.unary()?;
            return Ok(PpVal {
                bits: !v.bits,
                unsigned: v.unsigned,
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<PpVal, Diagnostic> {
        if self.eat(Punct::LParen) {
            let v = self.ternary()?;
            if !self.eat(Punct::RParen) {
                return Err(Diagnostic::error(self.loc(), "expected ')'"));
            }
            return Ok(v);
        }
        let loc = self.loc();
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Int { value, suffix, .. }) => {
                self.pos += 1;
                Ok(PpVal {
                    bits: value,
                    unsigned: suffix.is_unsigned(),
                })
            }
            Some(TokenKind::Char { value, .. }) => {
                self.pos += 1;
                Ok(PpVal::signed(value as i64))
            }
            _ => Err(Diagnostic::error(
                loc,
                "expected integer in preprocessor expression",
            )),
        }
    }
}

// ---------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------

/// Index one past the last token on the same logical line as `toks[start]`.
fn line_extent(toks: &[Token], start: usize) -> usize {
    let mut end = start + 1;
    while end < toks.len() && !toks[end].start_of_line && toks[end].kind != TokenKind::Eof {
        end += 1;
    }
    end
}

fn spell(toks: &[Token]) -> String {
    let mut s = String::new();
    for (i, t) in toks.iter().enumerate() {
        if i > 0 && t.space_before {
            s.push(' ');
        }
        s.push_str(&t.text);
    }
    s
}

fn stringize(arg: &[PTok]) -> String {
    let mut s = String::new();
    for (i, p) in arg.iter().enumerate() {
        if i > 0 && p.tok.space_before {
            s.push(' ');
        }
        s.push_str(&p.tok.text);
    }
    s
}

fn int_token(v: u64, loc: SourceLoc) -> Token {
    Token {
        kind: TokenKind::Int {
            value: v,
            suffix: crate::lexer::IntSuffix::None,
            base: 10,
        },
        text: v.to_string(),
        loc,
        start_of_line: false,
        space_before: true,
    }
}

/// Concatenate the last token of `left` with the first of `right`, re-lex
/// the joined spelling, and rescan-eligible result replaces both.
fn paste(
    mut left: Vec<PTok>,
    mut right: Vec<PTok>,
    loc: SourceLoc,
    strings: &mut StringTable,
) -> Result<Vec<PTok>, Diagnostic> {
    let l = left.pop();
    let r = if right.is_empty() {
        None
    } else {
        Some(right.remove(0))
    };
    let joined = format!(
        "{}{}",
        l.as_ref().map(|p| p.tok.text.as_str()).unwrap_or(""),
        r.as_ref().map(|p| p.tok.text.as_str()).unwrap_or("")
    );
    if joined.is_empty() {
        left.extend(right);
        return Ok(left);
    }
    let file = strings.intern("<paste>");
    let lexed = Lexer::new(&joined, file)
        .lex()
        .map_err(|_| Diagnostic::error(loc, format!("'##' produced invalid token '{}'", joined)))?;
    let real: Vec<&Token> = lexed.iter().filter(|t| t.kind != TokenKind::Eof).collect();
    if real.len() != 1 {
        return Err(Diagnostic::error(
            loc,
            format!("'##' produced invalid token '{}'", joined),
        ));
    }
    let mut tok = real[0].clone();
    tok.loc = loc;
    left.push(PTok::plain(tok));
    left.extend(right);
    Ok(left)
}

/// Collect arguments of a function-like macro call. `open` indexes the '('.
/// Returns the args and the index one past the ')'.
fn collect_macro_args(
    input: &[PTok],
    open: usize,
    loc: SourceLoc,
    n_params: usize,
    variadic: bool,
) -> Result<(Vec<Vec<PTok>>, usize), Diagnostic> {
    let mut args: Vec<Vec<PTok>> = vec![Vec::new()];
    let mut depth = 1usize;
    let mut i = open + 1;
    loop {
        let Some(pt) = input.get(i) else {
            return Err(Diagnostic::error(loc, "unterminated macro argument list"));
        };
        match &pt.tok.kind {
            TokenKind::Punct(Punct::LParen) => {
                depth += 1;
                args.last_mut().unwrap().push(pt.clone());
            }
            TokenKind::Punct(Punct::RParen) => {
                depth -= 1;
                if depth == 0 {
                    i += 1;
                    break;
                }
                args.last_mut().unwrap().push(pt.clone());
            }
            TokenKind::Punct(Punct::Comma) if depth == 1 => {
                // Commas beyond the fixed parameters belong to __VA_ARGS__
                // positions, which we keep as separate argument slots.
                args.push(Vec::new());
            }
            _ => args.last_mut().unwrap().push(pt.clone()),
        }
        i += 1;
    }
    // An empty call `M()` to a zero-parameter macro means zero args.
    if args.len() == 1 && args[0].is_empty() && n_params == 0 && !variadic {
        args.clear();
    }
    if args.len() < n_params {
        return Err(Diagnostic::error(
            loc,
            format!("macro expects {} arguments, got {}", n_params, args.len()),
        ));
    }
    Ok((args, i))
}

fn parse_defined_operand(
    toks: &[Token],
    at: usize,
    loc: SourceLoc,
) -> Result<(String, usize), Diagnostic> {
    match toks.get(at) {
        Some(t) if t.is_punct(Punct::LParen) => {
            let name = toks
                .get(at + 1)
                .filter(|t| t.kind == TokenKind::Ident)
                .ok_or_else(|| Diagnostic::error(loc, "expected name after 'defined('"))?;
            if !toks.get(at + 2).is_some_and(|t| t.is_punct(Punct::RParen)) {
                return Err(Diagnostic::error(loc, "expected ')' after 'defined(name'"));
            }
            Ok((name.text.clone(), at + 3))
        }
        Some(t) if t.kind == TokenKind::Ident => Ok((t.text.clone(), at + 1)),
        _ => Err(Diagnostic::error(loc, "expected name after 'defined'")),
    }
}

fn parse_paren_name(toks: &[Token], at: usize, loc: SourceLoc) -> Result<(String, usize), Diagnostic> {
    if !toks.get(at).is_some_and(|t| t.is_punct(Punct::LParen)) {
        return Err(Diagnostic::error(loc, "expected '('"));
    }
    let name = toks
        .get(at + 1)
        .filter(|t| t.kind == TokenKind::Ident)
        .ok_or_else(|| Diagnostic::error(loc, "expected attribute name"))?;
    if !toks.get(at + 2).is_some_and(|t| t.is_punct(Punct::RParen)) {
        return Err(Diagnostic::error(loc, "expected ')'"));
    }
    Ok((name.text.clone(), at + 3))
}

fn parse_paren_group(toks: &[Token], at: usize, loc: SourceLoc) -> Result<(Vec<Token>, usize), Diagnostic> {
    if !toks.get(at).is_some_and(|t| t.is_punct(Punct::LParen)) {
        return Err(Diagnostic::error(loc, "expected '('"));
    }
    let mut depth = 1;
    let mut i = at + 1;
    let mut inner = Vec::new();
    while let Some(t) = toks.get(i) {
        if t.is_punct(Punct::LParen) {
            depth += 1;
        } else if t.is_punct(Punct::RParen) {
            depth -= 1;
            if depth == 0 {
                return Ok((inner, i + 1));
            }
        }
        inner.push(t.clone());
        i += 1;
    }
    Err(Diagnostic::error(loc, "unterminated '(' group"))
}

/// Parse `<path>` or `"path"` from directive tokens.
fn parse_header_name(toks: &[Token], loc: SourceLoc) -> Result<(String, bool), Diagnostic> {
    match toks.first() {
        Some(t) if matches!(t.kind, TokenKind::Str { .. }) => {
            if let TokenKind::Str { value, .. } = &t.kind {
                Ok((value.clone(), false))
            } else {
                unreachable!()
            }
        }
        Some(t) if t.is_punct(Punct::Lt) => {
            let mut path = String::new();
            for t in &toks[1..] {
                if t.is_punct(Punct::Gt) {
                    return Ok((path, true));
                }
                path.push_str(&t.text);
            }
            Err(Diagnostic::error(loc, "unterminated '<' header name"))
        }
        _ => Err(Diagnostic::error(loc, "expected header name")),
    }
}

fn has_cpp_attribute(name: &str) -> u64 {
    match name {
        "nodiscard" => 201907,
        "maybe_unused" => 201603,
        "deprecated" => 201309,
        "fallthrough" => 201603,
        "likely" | "unlikely" => 201803,
        "noreturn" | "carries_dependency" => 200809,
        "no_unique_address" => 201803,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::lexer::Lexer;
    use std::io::Write;

    fn pp(src: &str) -> Vec<Token> {
        let config = CompilerConfig::default();
        let mut strings = StringTable::new();
        let file = strings.intern("test.cpp");
        let toks = Lexer::new(src, file).lex().unwrap();
        let mut pp = Preprocessor::new(&config, &mut strings);
        pp.preprocess(toks, Path::new("test.cpp"), &mut strings)
            .unwrap()
    }

    fn pp_err(src: &str) -> Diagnostic {
        let config = CompilerConfig::default();
        let mut strings = StringTable::new();
        let file = strings.intern("test.cpp");
        let toks = Lexer::new(src, file).lex().unwrap();
        let mut pp = Preprocessor::new(&config, &mut strings);
        pp.preprocess(toks, Path::new("test.cpp"), &mut strings)
            .unwrap_err()
    }

    fn spellings(toks: &[Token]) -> Vec<String> {
        toks.iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .map(|t| t.text.clone())
            .collect()
    }

    #[test]
    fn test_object_macro_expansion() {
        let toks = pp("#define N 42\nint x = N;");
        assert_eq!(spellings(&toks), vec!["int", "x", "=", "42", ";"]);
    }

    #[test]
    fn test_function_macro_with_args() {
        let toks = pp("#define ADD(a, b) ((a) + (b))\nint x = ADD(1, 2);");
        let s = spellings(&toks).join("");
        assert_eq!(s, "intx=((1)+(2));");
    }

    #[test]
    fn test_argument_pre_expansion() {
        let toks = pp("#define ONE 1\n#define ID(x) x\nint y = ID(ONE);");
        assert!(spellings(&toks).contains(&"1".to_string()));
    }

    #[test]
    fn test_stringize_is_unexpanded() {
        let toks = pp("#define ONE 1\n#define STR(x) #x\nconst char* s = STR(ONE);");
        let strs: Vec<_> = toks
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Str { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(strs, vec!["ONE"]);
    }

    #[test]
    fn test_token_pasting_rescans() {
        let toks = pp("#define AB 99\n#define GLUE(a, b) a ## b\nint x = GLUE(A, B);");
        assert!(spellings(&toks).contains(&"99".to_string()));
    }

    #[test]
    fn test_self_reference_blue_paint() {
        // `REC` expands once; the inner REC is painted and stays.
        let toks = pp("#define REC REC + 1\nint x = REC;");
        let s = spellings(&toks);
        assert!(s.contains(&"REC".to_string()));
        assert!(s.contains(&"1".to_string()));
    }

    #[test]
    fn test_conditional_chain() {
        let toks = pp("#define V 2\n#if V == 1\nint a;\n#elif V == 2\nint b;\n#else\nint c;\n#endif");
        assert_eq!(spellings(&toks), vec!["int", "b", ";"]);
    }

    #[test]
    fn test_ifdef_ifndef() {
        let toks = pp("#define X\n#ifdef X\nint a;\n#endif\n#ifndef X\nint b;\n#endif");
        assert_eq!(spellings(&toks), vec!["int", "a", ";"]);
    }

    #[test]
    fn test_division_by_zero_diagnosed() {
        let err = pp_err("#if 1 / 0\n#endif");
        assert!(err.message.contains("division by zero"));
    }

    #[test]
    fn test_unterminated_conditional() {
        let err = pp_err("#if 1\nint x;");
        assert!(err.message.contains("unterminated conditional"));
    }

    #[test]
    fn test_error_directive() {
        let err = pp_err("#error bad build config");
        assert!(err.message.contains("bad build config"));
    }

    #[test]
    fn test_macro_redefinition_mismatch() {
        let err = pp_err("#define A 1\n#define A 2");
        assert!(err.message.contains("redefined"));
    }

    #[test]
    fn test_benign_redefinition_ok() {
        let toks = pp("#define A 1\n#define A 1\nint x = A;");
        assert!(spellings(&toks).contains(&"1".to_string()));
    }

    #[test]
    fn test_cplusplus_predefined() {
        let toks = pp("long v = __cplusplus;");
        assert!(spellings(&toks).contains(&"202002L".to_string()));
    }

    #[test]
    fn test_has_cpp_attribute() {
        let toks = pp("#if __has_cpp_attribute(nodiscard)\nint yes;\n#endif");
        assert_eq!(spellings(&toks), vec!["int", "yes", ";"]);
    }

    #[test]
    fn test_variadic_macro() {
        let toks = pp("#define CALL(f, ...) f(__VA_ARGS__)\nint x = CALL(g, 1, 2);");
        let s = spellings(&toks).join("");
        assert_eq!(s, "intx=g(1,2);");
    }

    #[test]
    fn test_include_with_pragma_once() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("once.h");
        let mut f = std::fs::File::create(&header).unwrap();
        writeln!(f, "#pragma once\nint from_header;").unwrap();

        let main = dir.path().join("main.cpp");
        let src = "#include \"once.h\"\n#include \"once.h\"\nint x;";
        std::fs::write(&main, src).unwrap();

        let config = CompilerConfig::default();
        let mut strings = StringTable::new();
        let file = strings.intern("main.cpp");
        let toks = Lexer::new(src, file).lex().unwrap();
        let mut pp = Preprocessor::new(&config, &mut strings);
        let out = pp.preprocess(toks, &main, &mut strings).unwrap();
        let count = spellings(&out)
            .iter()
            .filter(|s| s.as_str() == "from_header")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_include_search_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.h"), "int from_lib;").unwrap();

        let mut config = CompilerConfig::default();
        config.include_paths.push(dir.path().to_path_buf());
        let mut strings = StringTable::new();
        let file = strings.intern("main.cpp");
        let src = "#include <lib.h>\n";
        let toks = Lexer::new(src, file).lex().unwrap();
        let mut pp = Preprocessor::new(&config, &mut strings);
        let out = pp.preprocess(toks, Path::new("main.cpp"), &mut strings).unwrap();
        assert!(spellings(&out).contains(&"from_lib".to_string()));
    }

    #[test]
    fn test_pragma_pack_stack() {
        let config = CompilerConfig::default();
        let mut strings = StringTable::new();
        let file = strings.intern("t.cpp");
        let src = "#pragma pack(push, 1)\nint x;\n";
        let toks = Lexer::new(src, file).lex().unwrap();
        let mut pp = Preprocessor::new(&config, &mut strings);
        pp.preprocess(toks, Path::new("t.cpp"), &mut strings).unwrap();
        assert_eq!(pp.current_pack(), Some(1));
    }
}
