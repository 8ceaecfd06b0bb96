use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own sources. Anything else under the
// manifest directory (reference material, build output) is never scanned.
const SOURCE_DIRS: [&str; 6] = ["analysis", "mixed", "regress", "cli", "tests", "benches"];

// Which policy a collector enforces; selects the wording of the failure report.
#[derive(Clone, Copy)]
enum Policy {
    UnderscorePrefix,
    ForbiddenComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Policy {
    fn headline(self) -> &'static str {
        match self {
            Policy::UnderscorePrefix => "underscore-prefixed variables",
            Policy::ForbiddenComment => "forbidden comment patterns",
            Policy::UppercaseComment => "comments with all uppercase alphabetic characters",
            Policy::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn guidance(self) -> &'static str {
        match self {
            Policy::UnderscorePrefix => {
                "Underscore-prefixed variable names are not allowed in this project.\n   Either use the variable (removing the underscore) or remove it completely."
            }
            Policy::ForbiddenComment => {
                "Change-log words (FIXED, CORRECTED, FIX, NEW, CHANGED, MODIFIED, UPDATED, ...) are not allowed in comments.\n   The '**' pattern is not allowed in regular comments (doc comments may use it)."
            }
            Policy::UppercaseComment => {
                "Comments where all alphabetic characters are uppercase are not allowed.\n   Strongly consider deleting the comment completely."
            }
            Policy::AllowDeadCode => {
                "#[allow(dead_code)] attributes are not allowed in this project.\n   Either use the code or remove it completely."
            }
        }
    }
}

// Collects the offending lines of a single file for one policy.
struct Collector {
    policy: Policy,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl Collector {
    fn new(policy: Policy, file_path: &Path) -> Self {
        Self {
            policy,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.policy.headline(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.policy.guidance()));
        Some(error_msg)
    }

    fn accepts(&self, line_text: &str) -> bool {
        match self.policy {
            Policy::UnderscorePrefix => {
                let is_pure_comment = line_text.trim_start().starts_with("//")
                    || (line_text.contains("/*")
                        && !line_text.contains("*/match")
                        && !line_text.contains("*/let"));
                // A match between a pair of quotes sits inside a string literal.
                let is_in_string = line_text.contains('"')
                    && line_text
                        .split('"')
                        .enumerate()
                        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
                !(is_pure_comment || is_in_string)
            }
            Policy::ForbiddenComment => {
                // '**' is markdown emphasis inside doc comments and allowed there.
                let is_doc = line_text.trim_start().starts_with("///");
                !(is_doc && line_text.contains("**") && !contains_change_word(line_text))
            }
            Policy::UppercaseComment => {
                let trimmed = line_text.trim_start();
                let comment_text = if let Some(rest) = trimmed.strip_prefix("///") {
                    rest.trim()
                } else if let Some(rest) = trimmed.strip_prefix("//") {
                    rest.trim_start_matches('!').trim()
                } else {
                    return false;
                };
                let alpha: Vec<char> = comment_text.chars().filter(|c| c.is_alphabetic()).collect();
                !alpha.is_empty() && alpha.iter().all(|c| c.is_uppercase())
            }
            Policy::AllowDeadCode => true,
        }
    }
}

impl Sink for Collector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.accepts(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn contains_change_word(line: &str) -> bool {
    [
        "FIXED", "CORRECTED", "FIX", "NEW", "CHANGE", "MODIFIED", "MODIFIES", "MODIFY", "UPDATE",
    ]
    .iter()
    .any(|word| line.contains(word))
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| {
            WalkDir::new(dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.path().to_path_buf())
        })
        .collect()
}

fn scan(policy: Policy, pattern: &str, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut collector = Collector::new(policy, path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
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
    let checks = [
        (Policy::UnderscorePrefix, r"\b(_[a-zA-Z0-9_]+)\b"),
        (
            Policy::ForbiddenComment,
            r"(//|/\*).*(?:FIXED|CORRECTED|FIX|NEW|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATE)",
        ),
        (Policy::ForbiddenComment, r"(//|/\*).*\*\*"),
        (Policy::UppercaseComment, r"//.*"),
        (Policy::AllowDeadCode, r"#\[allow\(dead_code\)\]"),
    ];

    for (policy, pattern) in checks {
        if let Err(e) = scan(policy, pattern, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
