//! Tokenizer for the kernel statement language.

use crate::error::CompileError;

/// One lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    /// Identifier or keyword.
    Ident(String),
    /// Numeric literal.
    Num(f64),
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `{`
    LBrace,
    /// `}`
    RBrace,
    /// `,`
    Comma,
    /// `;`
    Semi,
    /// `:`
    Colon,
    /// `=`
    Assign,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
    /// `&&`
    AndAnd,
    /// `||`
    OrOr,
    /// `!`
    Not,
}

/// A token plus the source line it started on.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedTok {
    /// The token.
    pub tok: Tok,
    /// 1-based line number.
    pub line: u32,
}

/// Tokenizes kernel source. `//` line comments and `/* */` block comments
/// are skipped; both appear in emitted kernel text.
pub fn lex(src: &str) -> Result<Vec<SpannedTok>, CompileError> {
    let mut out = Vec::new();
    let mut chars = src.chars().peekable();
    let mut line: u32 = 1;
    let mut col: u32 = 1;

    macro_rules! push {
        ($tok:expr) => {
            out.push(SpannedTok { tok: $tok, line })
        };
    }

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                chars.next();
                line += 1;
                col = 1;
            }
            c if c.is_whitespace() => {
                chars.next();
                col += 1;
            }
            '/' => {
                chars.next();
                match chars.peek() {
                    Some('/') => {
                        for c in chars.by_ref() {
                            if c == '\n' {
                                line += 1;
                                break;
                            }
                        }
                    }
                    Some('*') => {
                        chars.next();
                        let mut prev = '\0';
                        for c in chars.by_ref() {
                            if c == '\n' {
                                line += 1;
                            }
                            if prev == '*' && c == '/' {
                                break;
                            }
                            prev = c;
                        }
                    }
                    _ => push!(Tok::Slash),
                }
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    // Accept scientific notation including a sign after e/E.
                    if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' {
                        text.push(d);
                        chars.next();
                        if (d == 'e' || d == 'E')
                            && matches!(chars.peek(), Some('+') | Some('-'))
                        {
                            // Sign belongs to the exponent, not a binary op.
                            if let Some(s) = chars.next() {
                                text.push(s);
                            }
                        }
                    } else {
                        break;
                    }
                }
                let value: f64 = text
                    .parse()
                    .map_err(|_| CompileError::BadNumber {
                        text: text.clone(),
                        line,
                    })?;
                push!(Tok::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                push!(Tok::Ident(text));
            }
            '(' => {
                chars.next();
                push!(Tok::LParen);
            }
            ')' => {
                chars.next();
                push!(Tok::RParen);
            }
            '{' => {
                chars.next();
                push!(Tok::LBrace);
            }
            '}' => {
                chars.next();
                push!(Tok::RBrace);
            }
            ',' => {
                chars.next();
                push!(Tok::Comma);
            }
            ';' => {
                chars.next();
                push!(Tok::Semi);
            }
            ':' => {
                chars.next();
                push!(Tok::Colon);
            }
            '+' => {
                chars.next();
                push!(Tok::Plus);
            }
            '-' => {
                chars.next();
                push!(Tok::Minus);
            }
            '*' => {
                chars.next();
                push!(Tok::Star);
            }
            '%' => {
                chars.next();
                push!(Tok::Percent);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(Tok::Eq);
                } else {
                    push!(Tok::Assign);
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(Tok::Ne);
                } else {
                    push!(Tok::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(Tok::Le);
                } else {
                    push!(Tok::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(Tok::Ge);
                } else {
                    push!(Tok::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    push!(Tok::AndAnd);
                } else {
                    return Err(CompileError::UnexpectedChar { ch: '&', line, col });
                }
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    push!(Tok::OrOr);
                } else {
                    return Err(CompileError::UnexpectedChar { ch: '|', line, col });
                }
            }
            other => {
                return Err(CompileError::UnexpectedChar {
                    ch: other,
                    line,
                    col,
                });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_assignment_and_comparison() {
        let toks = lex("vX = -sin(t) * 2.5e-1; z <= 0.05").unwrap();
        assert!(toks.iter().any(|t| t.tok == Tok::Assign));
        assert!(toks.iter().any(|t| t.tok == Tok::Le));
        assert!(toks.iter().any(|t| matches!(t.tok, Tok::Num(n) if (n - 0.25).abs() < 1e-12)));
    }

    #[test]
    fn skips_comments_and_tracks_lines() {
        let toks = lex("// a comment\nx = 1;\n/* block\ncomment */ y = 2;").unwrap();
        let y = toks
            .iter()
            .find(|t| t.tok == Tok::Ident("y".into()))
            .unwrap();
        assert_eq!(y.line, 4);
    }

    #[test]
    fn rejects_stray_characters() {
        assert!(matches!(
            lex("x = #"),
            Err(CompileError::UnexpectedChar { ch: '#', .. })
        ));
    }
}
