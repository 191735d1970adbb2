//! Argument Tokenizer (§4.2): splits a single flag string into an argv the
//! way a shell would, without invoking a shell.
//!
//! Honors double and single quotes (a quoted span may contain the other
//! quote literally), backslash escapes both inside and outside quotes, and
//! treats a trailing unterminated quote as literal rather than erroring.

/// Splits `input` into an argv. Returns the empty vector for whitespace-only
/// input.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else if c == '\\' {
                    match chars.peek().copied() {
                        Some(next) => {
                            current.push(next);
                            chars.next();
                        }
                        None => {
                            // Trailing unterminated escape: keep the backslash literally.
                            current.push(c);
                        }
                    }
                } else {
                    current.push(c);
                }
            }
            None => {
                if c.is_whitespace() {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                } else if c == '\'' || c == '"' {
                    quote = Some(c);
                    in_token = true;
                } else if c == '\\' {
                    in_token = true;
                    match chars.peek().copied() {
                        Some(next) => {
                            current.push(next);
                            chars.next();
                        }
                        None => current.push(c),
                    }
                } else {
                    in_token = true;
                    current.push(c);
                }
            }
        }
    }

    // An unterminated quote at end-of-input: the characters already consumed
    // into `current` are kept as literal text, matching the spec's "trailing
    // unterminated quote treats remaining characters as literal" rule.
    if in_token || quote.is_some() {
        tokens.push(current);
    }

    tokens
}

/// Quotes `arg` for inclusion in a tokenizer-compatible command string,
/// preferring no quoting when the argument contains no shell metacharacters.
pub fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '\'' | '"' | '\\'))
    {
        return arg.to_string();
    }
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Joins an argv into a single string using [`quote`].
pub fn join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|a| quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_whitespace_only() {
        assert_eq!(tokenize(""), Vec::<String>::new());
        assert_eq!(tokenize("   \t  "), Vec::<String>::new());
    }

    #[test]
    fn simple_split() {
        assert_eq!(tokenize("docker create --name x"), vec!["docker", "create", "--name", "x"]);
    }

    #[test]
    fn double_quotes_contain_single_literally() {
        assert_eq!(tokenize(r#"echo "it's fine""#), vec!["echo", "it's fine"]);
    }

    #[test]
    fn single_quotes_contain_double_literally() {
        assert_eq!(tokenize(r#"echo 'say "hi"'"#), vec!["echo", "say \"hi\""]);
    }

    #[test]
    fn backslash_escapes_outside_quotes() {
        assert_eq!(tokenize(r"echo a\ b"), vec!["echo", "a b"]);
    }

    #[test]
    fn backslash_escapes_inside_quotes() {
        assert_eq!(tokenize(r#""a\"b""#), vec!["a\"b"]);
    }

    #[test]
    fn trailing_unterminated_quote_is_literal() {
        assert_eq!(tokenize(r#"echo "unterminated"#), vec!["echo", "unterminated"]);
    }

    #[test]
    fn round_trip_through_quote_and_join() {
        let original = vec!["docker", "run", "it's ok", "plain", "has space"];
        let joined = join(&original);
        let reparsed = tokenize(&joined);
        assert_eq!(reparsed, original);
    }
}
