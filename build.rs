use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directories holding the crate's own Rust sources.
const SCANNED_DIRS: [&str; 4] = ["fisher", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// One source-policy rule: a line regex plus a per-line filter applied to its matches.
#[derive(Clone, Copy)]
enum Rule {
    UnderscoreBinding,
    ForbiddenWords,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    const ALL: [Rule; 5] = [
        Rule::UnderscoreBinding,
        Rule::ForbiddenWords,
        Rule::StarsInComment,
        Rule::UppercaseComment,
        Rule::AllowDeadCode,
    ];

    fn pattern(self) -> String {
        match self {
            // Also catches underscore bindings in match arms and destructuring.
            Rule::UnderscoreBinding => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::ForbiddenWords => format!(r"(//|/\*|///).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::UppercaseComment => r"(//|/\*|///).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    /// Whether a matched line really violates the rule.
    fn violated_by(self, line: &str) -> bool {
        match self {
            Rule::UnderscoreBinding => !is_comment_line(line) && !underscore_only_in_string(line),
            Rule::ForbiddenWords | Rule::AllowDeadCode => true,
            // Doc comments may use `**` for emphasis.
            Rule::StarsInComment => !is_doc_comment(line),
            Rule::UppercaseComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => "underscore-prefixed variables",
            Rule::ForbiddenWords => "forbidden comment markers",
            Rule::StarsInComment => "'**' patterns in regular comments",
            Rule::UppercaseComment => "comments with all uppercase alphabetic characters",
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> String {
        match self {
            Rule::UnderscoreBinding => {
                "Either use the variable (removing the underscore) or remove it completely."
                    .to_string()
            }
            Rule::ForbiddenWords => format!(
                "Comments containing {} are not allowed. Remove them rather than commenting them out.",
                FORBIDDEN_WORDS.join(", ")
            ),
            Rule::StarsInComment => {
                "Use '**' only in doc comments.".to_string()
            }
            Rule::UppercaseComment => "Strongly consider deleting the comment.".to_string(),
            Rule::AllowDeadCode => {
                "Either use the code or remove it completely.".to_string()
            }
        }
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//")
        || (line.contains("/*") && !line.contains("*/match") && !line.contains("*/let"))
}

/// True when some quoted segment of the line holds an underscore.
fn underscore_only_in_string(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

/// The text of a comment-only line, without its `//`, `///` or `/* */` markers.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        Some(rest.trim())
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        Some(rest.trim())
    } else if let Some(idx) = line.find("/*") {
        let body = &line[idx + 2..];
        Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
    } else {
        None
    }
}

/// Collects the violating lines of one file for one rule.
struct PolicyCollector {
    rule: Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl PolicyCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let mut msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.describe(),
            self.file_path.display()
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str(&format!(
            "\n⚠️ These are STRICTLY FORBIDDEN in this project.\n   {}\n",
            self.rule.advice()
        ));
        Some(msg)
    }
}

impl Sink for PolicyCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.rule.violated_by(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

/// Every `.rs` file under the scanned directories.
fn rust_sources() -> Vec<PathBuf> {
    SCANNED_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn enforce(rule: Rule, sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();

    for path in sources {
        let mut collector = PolicyCollector::new(rule, path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(message) = collector.error_message() {
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SCANNED_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let sources = rust_sources();
    for rule in Rule::ALL {
        if let Err(e) = enforce(rule, &sources) {
            // `eprintln!` is what shows the message in cargo's output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
