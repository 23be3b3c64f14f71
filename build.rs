use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directories holding the crate's own Rust sources.
const SOURCE_DIRS: [&str; 4] = ["psf", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

/// One source hygiene rule.
#[derive(Clone, Copy, PartialEq)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWord,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> String {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::ForbiddenWord => format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::UppercaseComment => r"(//|/\*).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => {
                "Underscore-prefixed names are not allowed. Use the binding or remove it."
            }
            Rule::ForbiddenWord => {
                "Comments narrating edits (FIX, NEW, CHANGED, UPDATE and similar) are not allowed."
            }
            Rule::StarsInComment => "The '**' pattern is only allowed in doc comments.",
            Rule::UppercaseComment => "Comments written entirely in uppercase are not allowed.",
            Rule::AllowDeadCode => "#[allow(dead_code)] is not allowed. Use the code or remove it.",
        }
    }
}

// Collects the offending lines of one file for one rule.
struct Violations {
    rule: Rule,
    file_path: PathBuf,
    lines: Vec<String>,
}

impl Violations {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            lines: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        let mut msg = format!(
            "\nERROR: {} hygiene violation(s) in {}:\n",
            self.lines.len(),
            self.file_path.display()
        );
        for line in &self.lines {
            msg.push_str(&format!("   {line}\n"));
        }
        msg.push_str(&format!("\n   {}\n", self.rule.explanation()));
        Some(msg)
    }

    fn is_violation(&self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self.rule {
            Rule::UnderscorePrefix => {
                if trimmed.starts_with("//") {
                    return false;
                }
                // Only the part outside string literals counts.
                let code: String = line
                    .split('"')
                    .step_by(2)
                    .collect::<Vec<_>>()
                    .join(" ");
                let code = code.split("//").next().unwrap_or("");
                code.split(|c: char| !(c.is_alphanumeric() || c == '_'))
                    .any(|word| word.len() > 1 && word.starts_with('_'))
            }
            Rule::ForbiddenWord => comment_text(line).is_some_and(|text| {
                text.split(|c: char| !c.is_alphabetic())
                    .any(|word| FORBIDDEN_WORDS.contains(&word))
            }),
            Rule::StarsInComment => {
                !trimmed.starts_with("///")
                    && !trimmed.starts_with("//!")
                    && comment_text(line).is_some_and(|text| text.contains("**"))
            }
            Rule::UppercaseComment => comment_text(line).is_some_and(|text| {
                let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }),
            Rule::AllowDeadCode => true,
        }
    }
}

impl Sink for Violations {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.is_violation(line) {
            self.lines.push(format!("{line_number}:{line}"));
        }
        Ok(true)
    }
}

/// Text of a line comment, without its marker; `None` for code lines.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim_start_matches(['/', '!']).trim());
    }
    let start = line.find("/*")?;
    let body = &line[start + 2..];
    Some(body.split("*/").next().unwrap_or(body).trim())
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn scan(rule: Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut violations = Violations::new(rule, path);
        searcher.search_path(&matcher, path, &mut violations)?;
        if let Some(msg) = violations.error_message() {
            return Err(msg.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let files = source_files();
    let rules = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::UppercaseComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = scan(rule, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
