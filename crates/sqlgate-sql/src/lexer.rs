//! Tolerant SQL tokenizer
//!
//! Quote, bracket and parenthesis tracking is an explicit state machine, so
//! clause keywords are only recognised outside literals. Every token records
//! the parenthesis depth it sits at; a `(` and its matching `)` share the
//! depth of the surrounding tokens.

/// Lexer state while scanning characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexState {
    Normal,
    InSingleQuote,
    InDoubleQuote,
    InBracket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    /// `"ident"` or `[ident]`
    QuotedIdent,
    StringLit,
    Number,
    LParen,
    RParen,
    Comma,
    Dot,
    Star,
    Operator,
    Semicolon,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw source slice, quotes included
    pub text: String,
    pub depth: usize,
    pub start: usize,
    pub end: usize,
}

impl Token {
    /// True for a bare word equal to `keyword` (case-insensitive)
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    /// Identifier value with surrounding quotes or brackets removed
    pub fn ident(&self) -> String {
        match self.kind {
            TokenKind::QuotedIdent => {
                let inner = &self.text[1..self.text.len() - 1];
                if self.text.starts_with('[') {
                    inner.replace("]]", "]")
                } else {
                    inner.replace("\"\"", "\"")
                }
            }
            _ => self.text.clone(),
        }
    }

    pub fn is_identifier_like(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
    }
}

/// Output of [`tokenize`]
#[derive(Debug, Clone)]
pub struct Lexed {
    pub tokens: Vec<Token>,
    /// State at end of input; anything but `Normal` means an unterminated literal
    pub final_state: LexState,
    /// False when a `)` had no opener or a `(` was never closed
    pub balanced: bool,
}

impl Lexed {
    pub fn is_well_formed(&self) -> bool {
        self.final_state == LexState::Normal && self.balanced
    }
}

const OPERATOR_CHARS: &str = "<>=!|:+-/%^~&";

/// Replace `--` line comments and `/* */` block comments with a single space.
///
/// Quotes and brackets are tracked so comment markers inside literals survive.
pub fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut state = LexState::Normal;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            LexState::Normal => match c {
                '-' if chars.peek() == Some(&'-') => {
                    for next in chars.by_ref() {
                        if next == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                    out.push(' ');
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    let mut prev = '\0';
                    for next in chars.by_ref() {
                        if prev == '*' && next == '/' {
                            break;
                        }
                        prev = next;
                    }
                    out.push(' ');
                }
                '\'' => {
                    state = LexState::InSingleQuote;
                    out.push(c);
                }
                '"' => {
                    state = LexState::InDoubleQuote;
                    out.push(c);
                }
                '[' => {
                    state = LexState::InBracket;
                    out.push(c);
                }
                _ => out.push(c),
            },
            LexState::InSingleQuote => {
                out.push(c);
                if c == '\'' {
                    state = LexState::Normal;
                }
            }
            LexState::InDoubleQuote => {
                out.push(c);
                if c == '"' {
                    state = LexState::Normal;
                }
            }
            LexState::InBracket => {
                out.push(c);
                if c == ']' {
                    state = LexState::Normal;
                }
            }
        }
    }

    out
}

/// Tokenize SQL text. Never fails; malformed input is reported through
/// [`Lexed::final_state`] and [`Lexed::balanced`].
pub fn tokenize(sql: &str) -> Lexed {
    let mut tokens = Vec::new();
    let mut state = LexState::Normal;
    let mut depth = 0usize;
    let mut balanced = true;
    let mut literal_start = 0usize;
    let mut chars = sql.char_indices().peekable();

    let push = |tokens: &mut Vec<Token>, kind: TokenKind, start: usize, end: usize, depth: usize| {
        tokens.push(Token {
            kind,
            text: sql[start..end].to_string(),
            depth,
            start,
            end,
        });
    };

    while let Some((i, c)) = chars.next() {
        match state {
            LexState::Normal => match c {
                '\'' => {
                    state = LexState::InSingleQuote;
                    literal_start = i;
                }
                '"' => {
                    state = LexState::InDoubleQuote;
                    literal_start = i;
                }
                '[' => {
                    state = LexState::InBracket;
                    literal_start = i;
                }
                '(' => {
                    push(&mut tokens, TokenKind::LParen, i, i + 1, depth);
                    depth += 1;
                }
                ')' => {
                    if depth == 0 {
                        balanced = false;
                    } else {
                        depth -= 1;
                    }
                    push(&mut tokens, TokenKind::RParen, i, i + 1, depth);
                }
                ',' => push(&mut tokens, TokenKind::Comma, i, i + 1, depth),
                ';' => push(&mut tokens, TokenKind::Semicolon, i, i + 1, depth),
                '.' => push(&mut tokens, TokenKind::Dot, i, i + 1, depth),
                '*' => push(&mut tokens, TokenKind::Star, i, i + 1, depth),
                c if c.is_whitespace() => {}
                c if c.is_ascii_digit() => {
                    let mut end = i + c.len_utf8();
                    while let Some(&(j, next)) = chars.peek() {
                        if next.is_ascii_alphanumeric() || next == '.' || next == '_' {
                            end = j + next.len_utf8();
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    push(&mut tokens, TokenKind::Number, i, end, depth);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut end = i + c.len_utf8();
                    while let Some(&(j, next)) = chars.peek() {
                        if next.is_alphanumeric() || next == '_' || next == '$' {
                            end = j + next.len_utf8();
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    push(&mut tokens, TokenKind::Word, i, end, depth);
                }
                c if OPERATOR_CHARS.contains(c) => {
                    let mut end = i + 1;
                    while let Some(&(j, next)) = chars.peek() {
                        if "<>=!|:".contains(next) && "<>=!|:".contains(c) {
                            end = j + 1;
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    push(&mut tokens, TokenKind::Operator, i, end, depth);
                }
                _ => push(&mut tokens, TokenKind::Other, i, i + c.len_utf8(), depth),
            },
            LexState::InSingleQuote => {
                if c == '\'' {
                    if matches!(chars.peek(), Some(&(_, '\''))) {
                        chars.next();
                    } else {
                        push(&mut tokens, TokenKind::StringLit, literal_start, i + 1, depth);
                        state = LexState::Normal;
                    }
                }
            }
            LexState::InDoubleQuote => {
                if c == '"' {
                    if matches!(chars.peek(), Some(&(_, '"'))) {
                        chars.next();
                    } else {
                        push(&mut tokens, TokenKind::QuotedIdent, literal_start, i + 1, depth);
                        state = LexState::Normal;
                    }
                }
            }
            LexState::InBracket => {
                if c == ']' {
                    if matches!(chars.peek(), Some(&(_, ']'))) {
                        chars.next();
                    } else {
                        push(&mut tokens, TokenKind::QuotedIdent, literal_start, i + 1, depth);
                        state = LexState::Normal;
                    }
                }
            }
        }
    }

    Lexed {
        tokens,
        final_state: state,
        balanced: balanced && depth == 0,
    }
}
