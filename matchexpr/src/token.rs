// Tokenizer for matcher expressions.
//
// The token stream is public API: the matcher compiler in the engine walks it
// to find top-level logical operators and renders token slices back to source
// with `render_tokens`. Rendering must therefore round-trip through
// `tokenize` without changing meaning, though not necessarily byte-for-byte
// (whitespace is normalized).

use crate::error::Error;

// ============================================================================
// Token types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier, resolved as a parameter at evaluation time.
    Ident,
    /// Identifier directly followed by an opening parenthesis.
    Function,
    /// Dotted identifier chain, e.g. `r_sub.Age`.
    Accessor,
    Number,
    Str,
    Bool,
    /// `(`
    Clause,
    /// `)`
    ClauseClose,
    /// `&&` or `||`
    LogicalOp,
    /// `==` `!=` `<` `<=` `>` `>=`
    Comparator,
    /// `+` `-` `*` `/` `%`
    Arithmetic,
    /// Unary `!` or `-`
    Prefix,
    /// `,`
    Separator,
    /// `?`
    TernaryIf,
    /// `:`
    TernaryElse,
}

/// A single lexed token. `text` holds the raw lexeme (unquoted for strings);
/// accessor tokens additionally carry their dot-separated parts.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub parts: Vec<String>,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Token {
            kind,
            text: text.into(),
            parts: Vec::new(),
        }
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `-` is a prefix operator when nothing on its left can produce a value.
fn prefix_position(prev: Option<&Token>) -> bool {
    match prev {
        None => true,
        Some(t) => matches!(
            t.kind,
            TokenKind::Clause
                | TokenKind::LogicalOp
                | TokenKind::Comparator
                | TokenKind::Arithmetic
                | TokenKind::Prefix
                | TokenKind::Separator
                | TokenKind::TernaryIf
                | TokenKind::TernaryElse
        ),
    }
}

/// Splits an expression source string into tokens.
pub fn tokenize(src: &str) -> Result<Vec<Token>, Error> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if is_ident_start(c) {
            let mut j = i;
            while j < chars.len() && is_ident_char(chars[j]) {
                j += 1;
            }
            let mut parts = vec![chars[i..j].iter().collect::<String>()];

            // accessor chain
            while j < chars.len()
                && chars[j] == '.'
                && j + 1 < chars.len()
                && is_ident_start(chars[j + 1])
            {
                let mut k = j + 1;
                while k < chars.len() && is_ident_char(chars[k]) {
                    k += 1;
                }
                parts.push(chars[j + 1..k].iter().collect::<String>());
                j = k;
            }

            let text = parts.join(".");
            let mut token = if parts.len() > 1 {
                let mut t = Token::new(TokenKind::Accessor, text);
                t.parts = parts;
                t
            } else if text == "true" || text == "false" {
                Token::new(TokenKind::Bool, text)
            } else {
                Token::new(TokenKind::Ident, text)
            };

            // look ahead for a call
            let mut k = j;
            while k < chars.len() && chars[k].is_whitespace() {
                k += 1;
            }
            if token.kind == TokenKind::Ident && k < chars.len() && chars[k] == '(' {
                token.kind = TokenKind::Function;
            }

            tokens.push(token);
            i = j;
            continue;
        }

        if c.is_ascii_digit() {
            let mut j = i;
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            if j < chars.len()
                && chars[j] == '.'
                && j + 1 < chars.len()
                && chars[j + 1].is_ascii_digit()
            {
                j += 1;
                while j < chars.len() && chars[j].is_ascii_digit() {
                    j += 1;
                }
            }
            let text: String = chars[i..j].iter().collect();
            text.parse::<f64>()
                .map_err(|_| Error::Parse(format!("invalid number '{}'", text)))?;
            tokens.push(Token::new(TokenKind::Number, text));
            i = j;
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut j = i + 1;
            let mut text = String::new();
            let mut closed = false;
            while j < chars.len() {
                let ch = chars[j];
                if ch == '\\' && j + 1 < chars.len() {
                    let esc = chars[j + 1];
                    text.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    j += 2;
                    continue;
                }
                if ch == quote {
                    closed = true;
                    j += 1;
                    break;
                }
                text.push(ch);
                j += 1;
            }
            if !closed {
                return Err(Error::Parse(format!("unterminated string in '{}'", src)));
            }
            tokens.push(Token::new(TokenKind::Str, text));
            i = j;
            continue;
        }

        let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match two.as_str() {
            "&&" | "||" => {
                tokens.push(Token::new(TokenKind::LogicalOp, two));
                i += 2;
                continue;
            }
            "==" | "!=" | "<=" | ">=" => {
                tokens.push(Token::new(TokenKind::Comparator, two));
                i += 2;
                continue;
            }
            _ => {}
        }

        let token = match c {
            '(' => Token::new(TokenKind::Clause, "("),
            ')' => Token::new(TokenKind::ClauseClose, ")"),
            ',' => Token::new(TokenKind::Separator, ","),
            '?' => Token::new(TokenKind::TernaryIf, "?"),
            ':' => Token::new(TokenKind::TernaryElse, ":"),
            '<' | '>' => Token::new(TokenKind::Comparator, c.to_string()),
            '!' => Token::new(TokenKind::Prefix, "!"),
            '+' | '*' | '/' | '%' => Token::new(TokenKind::Arithmetic, c.to_string()),
            '-' => {
                if prefix_position(tokens.last()) {
                    Token::new(TokenKind::Prefix, "-")
                } else {
                    Token::new(TokenKind::Arithmetic, "-")
                }
            }
            other => {
                return Err(Error::Parse(format!(
                    "unexpected character '{}' in '{}'",
                    other, src
                )))
            }
        };
        tokens.push(token);
        i += 1;
    }

    Ok(tokens)
}

// ============================================================================
// Rendering
// ============================================================================

/// Renders a token slice back to an expression string.
///
/// Spacing is normalized: no space after an opening parenthesis, a function
/// name or a prefix operator, and none before a closing parenthesis or a
/// separator.
pub fn render_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();

    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::Str => {
                out.push('\'');
                out.push_str(&token.text);
                out.push('\'');
            }
            _ => out.push_str(&token.text),
        }

        let next = tokens.get(i + 1).map(|t| t.kind);
        let suppress = matches!(
            token.kind,
            TokenKind::Prefix | TokenKind::Clause | TokenKind::Function
        ) || i == tokens.len() - 1
            || matches!(next, Some(TokenKind::ClauseClose) | Some(TokenKind::Separator));

        if !suppress {
            out.push(' ');
        }
    }

    out
}
