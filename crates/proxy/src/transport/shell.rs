//! POSIX shell-style word splitting for argument strings

use crate::mcp::error::ShellSplitError;

/// Split `input` into words the way `sh` would, without expansion.
///
/// Single quotes are literal. Inside double quotes a backslash only escapes
/// `$`, `` ` ``, `"`, `\` and newline. Outside quotes a backslash escapes the
/// next character and a backslash-newline pair is removed.
pub fn split_args(input: &str) -> Result<Vec<String>, ShellSplitError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(ShellSplitError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('\n') => {}
                            Some(c @ ('$' | '`' | '"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(ShellSplitError::UnterminatedQuote('"')),
                        },
                        Some(c) => current.push(c),
                        None => return Err(ShellSplitError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => match chars.next() {
                Some('\n') => {}
                Some(c) => {
                    in_word = true;
                    current.push(c);
                }
                None => return Err(ShellSplitError::TrailingBackslash),
            },
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}
