//! Whitespace/quote-aware splitting of configuration option values.
//!
//! Rules, in the spirit of a POSIX shell word splitter:
//! - unquoted whitespace separates tokens;
//! - `'...'` is literal;
//! - `"..."` allows `\"` and `\\` escapes;
//! - outside quotes, `\` escapes the next character;
//! - adjacent quoted and unquoted pieces join into one token, and `""`
//!   produces an empty token.

/// Failure returned when a value opens a quote it never closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnterminatedQuote(pub char);

/// Split `input` into tokens.
pub fn split(input: &str) -> Result<Vec<String>, UnterminatedQuote> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(next @ ('"' | '\\')) => current.push(next),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(UnterminatedQuote('"')),
                        },
                        Some(c) => current.push(c),
                        None => return Err(UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(next) => current.push(next),
                    None => current.push('\\'),
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Quote `token` so that [`split`] yields it back unchanged.
pub fn quote(token: &str) -> String {
    let needs_quotes = token.is_empty()
        || token
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'));
    if !needs_quotes {
        return token.to_string();
    }

    let mut quoted = String::with_capacity(token.len() + 2);
    quoted.push('"');
    for c in token.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(input: &str) -> Vec<String> {
        split(input).expect("split")
    }

    #[test]
    fn splits_on_runs_of_whitespace() {
        assert_eq!(words("  -a   b\tc \n"), vec!["-a", "b", "c"]);
        assert!(words("   ").is_empty());
    }

    #[test]
    fn quotes_group_words() {
        assert_eq!(
            words(r#"--msg "hello world" 'it is' x"#),
            vec!["--msg", "hello world", "it is", "x"]
        );
    }

    #[test]
    fn adjacent_pieces_join_and_empty_quotes_survive() {
        assert_eq!(words(r#"--name="a b"c"#), vec!["--name=a bc"]);
        assert_eq!(words(r#"x "" y"#), vec!["x", "", "y"]);
    }

    #[test]
    fn escapes_inside_and_outside_quotes() {
        assert_eq!(words(r#""say \"hi\"" a\ b"#), vec![r#"say "hi""#, "a b"]);
        assert_eq!(words(r#"'no \escape'"#), vec![r"no \escape"]);
        assert_eq!(words(r#""C:\path""#), vec![r"C:\path"]);
    }

    #[test]
    fn unterminated_quote_is_reported() {
        assert_eq!(split("a 'b"), Err(UnterminatedQuote('\'')));
        assert_eq!(split(r#"a "b"#), Err(UnterminatedQuote('"')));
    }

    #[test]
    fn quote_is_inverse_of_split() {
        for token in ["plain", "two words", "", r#"with "quotes""#, r"back\slash", "it's"] {
            assert_eq!(words(&quote(token)), vec![token.to_string()]);
        }
    }
}
