//! Cheesebase CLI.
//!
//! Usage: cheesebase <db-file>
//!
//! Reads commands from stdin, one per line:
//!
//!   insert <path> <json>
//!   update <path> <json>
//!   upsert <path> <json>
//!   get <path>
//!   getall
//!   remove <path>
//!   append <path> <json>
//!   quit
//!
//! Paths are dotted field names with `[n]` for array indices, e.g.
//! `users[3].name`.

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::Path;
use std::process::ExitCode;

use cheesebase::{Cheesebase, PathSegment};

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let db_path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("Usage: cheesebase <db-file>");
            return ExitCode::from(1);
        }
    };

    let db = match Cheesebase::open(Path::new(&db_path)) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::from(1);
        }
    };

    let interactive = io::stdin().is_terminal();
    let stdin = io::stdin();
    loop {
        if interactive {
            print!("> ");
            let _ = io::stdout().flush();
        }
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return ExitCode::SUCCESS,
            Ok(_) => {}
            Err(err) => {
                eprintln!("Error: {err}");
                return ExitCode::from(1);
            }
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        match command.to_ascii_lowercase().as_str() {
            "quit" | "exit" | "q" | ":q" => return ExitCode::SUCCESS,
            "getall" => run(|| {
                let value = db.get(&[])?;
                match value {
                    Some(v) => println!("{}", v.to_json_pretty()),
                    None => println!("null"),
                }
                Ok(())
            }),
            "get" => run(|| {
                let path = parse_path(rest)?;
                match db.get(&path)? {
                    Some(v) => println!("{}", v.to_json_pretty()),
                    None => println!("not found"),
                }
                Ok(())
            }),
            "remove" => run(|| {
                let path = parse_path(rest)?;
                if !db.remove(&path)? {
                    println!("not found");
                }
                Ok(())
            }),
            "insert" | "update" | "upsert" => run(|| {
                let (path, json) = parse_path_and_json(rest)?;
                let stored = match command.to_ascii_lowercase().as_str() {
                    "insert" => db.insert(&path, json)?,
                    "update" => db.update(&path, json)?,
                    _ => db.upsert(&path, json)?,
                };
                if !stored {
                    println!("failed");
                }
                Ok(())
            }),
            "append" => run(|| {
                let (path, json) = parse_path_and_json(rest)?;
                match db.append(&path, json)? {
                    Some(index) => println!("{index}"),
                    None => println!("failed"),
                }
                Ok(())
            }),
            other => eprintln!("Unknown command: {other}"),
        }
    }
}

fn run(op: impl FnOnce() -> cheesebase::Result<()>) {
    if let Err(err) = op() {
        eprintln!("Error: {err}");
    }
}

/// Split `"a.b[3].c {json...}"` at the first whitespace.
fn parse_path_and_json(input: &str) -> cheesebase::Result<(Vec<PathSegment>, &str)> {
    let (path_text, json) = match input.split_once(char::is_whitespace) {
        Some((p, j)) => (p, j.trim()),
        None => (input, ""),
    };
    Ok((parse_path(path_text)?, json))
}

/// Parse a dotted path with `[n]` array indices.
fn parse_path(text: &str) -> cheesebase::Result<Vec<PathSegment>> {
    let invalid = || {
        cheesebase::Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid path",
        ))
    };

    let mut segments = Vec::new();
    let mut chars = text.chars().peekable();
    let mut expect_field = true;
    while let Some(&c) = chars.peek() {
        if c == '[' {
            chars.next();
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    digits.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            if chars.next() != Some(']') || digits.is_empty() {
                return Err(invalid());
            }
            let index = digits.parse().map_err(|_| invalid())?;
            segments.push(PathSegment::Index(index));
            expect_field = false;
        } else if c == '.' {
            chars.next();
            expect_field = true;
        } else {
            if !expect_field {
                return Err(invalid());
            }
            let mut field = String::new();
            while let Some(&d) = chars.peek() {
                if d == '.' || d == '[' {
                    break;
                }
                field.push(d);
                chars.next();
            }
            if field.is_empty() {
                return Err(invalid());
            }
            segments.push(PathSegment::Field(field));
            expect_field = false;
        }
    }
    if segments.is_empty() {
        return Err(invalid());
    }
    Ok(segments)
}
