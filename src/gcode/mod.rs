// src/gcode/mod.rs - G-code line cleaning and word lexing
pub mod toolpath;

use serde::{Deserialize, Serialize};

/// Machine position in millimeters, regardless of the program's unit mode.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// One lexed G-code word: an address letter and its numeric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Word {
    pub letter: char,
    pub value: f64,
}

/// Strips comments from a single line of G-code.
///
/// `;` and `#` start a comment that runs to the end of the line;
/// parenthesized `(...)` comments are removed in place. The result is
/// trimmed of surrounding whitespace.
pub fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_parens = false;
    for c in line.chars() {
        match c {
            ';' | '#' if !in_parens => break,
            '(' => in_parens = true,
            ')' if in_parens => in_parens = false,
            _ if in_parens => {}
            _ => out.push(c),
        }
    }
    out.trim().to_string()
}

/// Lexes a cleaned line into words. Fragments that do not form a
/// letter-plus-number word are skipped; lexing is best-effort and never
/// fails.
pub fn parse_words(line: &str) -> Vec<Word> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if !c.is_ascii_alphabetic() {
            continue;
        }
        // `*nn` checksums and `%` markers never reach here; digits, sign
        // and decimal point form the value.
        let mut number = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_ascii_digit() || n == '.' || n == '-' || n == '+' {
                number.push(n);
                chars.next();
            } else {
                break;
            }
        }
        match number.parse::<f64>() {
            Ok(value) => words.push(Word {
                letter: c.to_ascii_uppercase(),
                value,
            }),
            Err(_) => {
                tracing::debug!("skipping unlexable fragment {:?}{:?}", c, number);
            }
        }
    }
    words
}

/// Cleans a whole program into interpretable lines: comments stripped,
/// whitespace trimmed, blank lines and `%` program markers dropped.
pub fn clean_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(strip_comments)
        .filter(|line| !line.is_empty() && !line.starts_with('%'))
        .collect()
}
