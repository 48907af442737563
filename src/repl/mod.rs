//! Interactive command loop and its shell-style line tokenizer

use crate::registry::SessionRegistry;
use crate::types::MirrorError;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Split one command line into tokens.
///
/// Rules: whitespace separates tokens; single quotes preserve everything
/// literally; inside double quotes a backslash escapes `"` and `\` and is
/// kept verbatim otherwise; outside quotes a backslash escapes the next
/// character; an unquoted `#` starts a comment running to end of line.
pub fn tokenize(line: &str) -> Result<Vec<String>, MirrorError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '#' => break,
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => {
                            return Err(MirrorError::Tokenize(
                                "unterminated single quote".to_string(),
                            ))
                        }
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => {
                                return Err(MirrorError::Tokenize(
                                    "unterminated double quote".to_string(),
                                ))
                            }
                        },
                        Some(c) => current.push(c),
                        None => {
                            return Err(MirrorError::Tokenize(
                                "unterminated double quote".to_string(),
                            ))
                        }
                    }
                }
            }
            '\\' => match chars.next() {
                Some(c) => {
                    in_token = true;
                    current.push(c);
                }
                None => {
                    return Err(MirrorError::Tokenize(
                        "trailing backslash".to_string(),
                    ))
                }
            },
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

/// Whether the loop should keep reading after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Exit,
}

/// Read commands from stdin until `exit` or end of input.
pub async fn run(registry: Arc<SessionRegistry>) -> Result<(), MirrorError> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    prompt();
    while let Some(line) = lines.next_line().await? {
        match tokenize(&line) {
            Err(err) => eprintln!("error: {err}"),
            Ok(tokens) if tokens.is_empty() => {}
            Ok(tokens) => {
                if dispatch(&registry, &tokens).await == Outcome::Exit {
                    return Ok(());
                }
            }
        }
        prompt();
    }
    Ok(())
}

fn prompt() {
    print!("mirra> ");
    let _ = std::io::stdout().flush();
}

/// Execute one tokenized command against the registry.
pub async fn dispatch(registry: &Arc<SessionRegistry>, tokens: &[String]) -> Outcome {
    let Some(command) = tokens.first() else {
        return Outcome::Continue;
    };
    match command.as_str() {
        "add" => {
            if tokens.len() < 3 {
                eprintln!("usage: add <source> <target>...");
                return Outcome::Continue;
            }
            let targets: Vec<PathBuf> = tokens[2..].iter().map(PathBuf::from).collect();
            match registry.add(&PathBuf::from(&tokens[1]), &targets).await {
                Ok(count) => println!("registered {count} target(s)"),
                Err(err) => eprintln!("error: {err}"),
            }
        }
        "end" => {
            if tokens.len() < 3 {
                eprintln!("usage: end <source> <target>...");
                return Outcome::Continue;
            }
            let targets: Vec<PathBuf> = tokens[2..].iter().map(PathBuf::from).collect();
            match registry.end(&PathBuf::from(&tokens[1]), &targets).await {
                Ok(count) => println!("removed {count} target(s)"),
                Err(err) => eprintln!("error: {err}"),
            }
        }
        "restore" => {
            if tokens.len() != 3 {
                eprintln!("usage: restore <source> <target>");
                return Outcome::Continue;
            }
            match registry
                .restore(&PathBuf::from(&tokens[1]), &PathBuf::from(&tokens[2]))
                .await
            {
                Ok(()) => println!("restored {} from {}", tokens[1], tokens[2]),
                Err(err) => eprintln!("error: {err}"),
            }
        }
        "list" => {
            let sessions = registry.list().await;
            if sessions.is_empty() {
                println!("no active sessions");
            }
            for info in sessions {
                let state = if info.watching { "watching" } else { "initial sync" };
                println!(
                    "{} ({state}, since {})",
                    info.source.display(),
                    info.started_at.format("%Y-%m-%d %H:%M:%S")
                );
                for target in info.targets {
                    println!("  -> {}", target.display());
                }
            }
        }
        "help" => {
            println!("commands:");
            println!("  add <source> <target>...     mirror source into each target");
            println!("  end <source> <target>...     stop mirroring into the targets");
            println!("  restore <source> <target>    rebuild source from a target");
            println!("  list                         show active sessions");
            println!("  exit                         quit");
        }
        "exit" => return Outcome::Exit,
        unknown => eprintln!("unknown command: {unknown} (try 'help')"),
    }
    Outcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_plain_words() {
        let tokens = tokenize("add /src /dst").expect("tokenize");
        assert_eq!(tokens, vec!["add", "/src", "/dst"]);
    }

    #[test]
    fn test_tokenize_collapses_whitespace() {
        let tokens = tokenize("  list\t\t ").expect("tokenize");
        assert_eq!(tokens, vec!["list"]);
    }

    #[test]
    fn test_tokenize_single_quotes_literal() {
        let tokens = tokenize(r#"add '/pa th/with "quotes"' /dst"#).expect("tokenize");
        assert_eq!(tokens, vec!["add", r#"/pa th/with "quotes""#, "/dst"]);
    }

    #[test]
    fn test_tokenize_double_quote_escapes() {
        let tokens = tokenize(r#"add "/a \"b\" \\c" x"#).expect("tokenize");
        assert_eq!(tokens, vec!["add", r#"/a "b" \c"#, "x"]);
    }

    #[test]
    fn test_tokenize_backslash_in_double_quotes_kept_otherwise() {
        let tokens = tokenize(r#""a\nb""#).expect("tokenize");
        assert_eq!(tokens, vec![r"a\nb"]);
    }

    #[test]
    fn test_tokenize_backslash_escapes_outside_quotes() {
        let tokens = tokenize(r"add /spa\ ce \#notcomment").expect("tokenize");
        assert_eq!(tokens, vec!["add", "/spa ce", "#notcomment"]);
    }

    #[test]
    fn test_tokenize_comment_strips_rest_of_line() {
        let tokens = tokenize("list # everything after is ignored").expect("tokenize");
        assert_eq!(tokens, vec!["list"]);
    }

    #[test]
    fn test_tokenize_hash_inside_quotes_is_literal() {
        let tokens = tokenize(r##"add "/dir/#1" '/dir/#2'"##).expect("tokenize");
        assert_eq!(tokens, vec!["add", "/dir/#1", "/dir/#2"]);
    }

    #[test]
    fn test_tokenize_adjacent_quoted_pieces_join() {
        let tokens = tokenize(r#"'/a'"/b"/c"#).expect("tokenize");
        assert_eq!(tokens, vec!["/a/b/c"]);
    }

    #[test]
    fn test_tokenize_empty_quotes_make_empty_token() {
        let tokens = tokenize("add '' x").expect("tokenize");
        assert_eq!(tokens, vec!["add", "", "x"]);
    }

    #[test]
    fn test_tokenize_empty_and_comment_only_lines() {
        assert!(tokenize("").expect("tokenize").is_empty());
        assert!(tokenize("   # just a comment").expect("tokenize").is_empty());
    }

    #[test]
    fn test_tokenize_unterminated_quote_errors() {
        assert!(matches!(tokenize("add '/unclosed"), Err(MirrorError::Tokenize(_))));
        assert!(matches!(tokenize(r#"add "/unclosed"#), Err(MirrorError::Tokenize(_))));
    }

    #[test]
    fn test_tokenize_trailing_backslash_errors() {
        assert!(matches!(tokenize(r"add \"), Err(MirrorError::Tokenize(_))));
    }
}
