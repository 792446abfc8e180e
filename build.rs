use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own sources. Everything else in the tree
// (target output, vendored reference material) is never scanned.
const SOURCE_DIRS: [&str; 3] = ["gram", "tests", "benches"];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Rule {
    UnderscoreBinding,
    ForbiddenWord,
    StarsInComment,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => r"\b(_[a-zA-Z0-9_]+)\b",
            Rule::ForbiddenWord => {
                r"(//|/\*).*(?:FIXED|CORRECTED|FIX|NEW|CHANGED|CHANGE|MODIFIED|MODIFY|UPDATED|UPDATE)"
            }
            Rule::StarsInComment => r"(//|/\*).*\*\*",
            Rule::AllCapsComment => r"(//|/\*).*",
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => {
                "Underscore-prefixed names are not allowed. Use the binding or remove it."
            }
            Rule::ForbiddenWord => {
                "Comments narrating edits (FIXED, CHANGED, UPDATE, ...) are not allowed. Delete them."
            }
            Rule::StarsInComment => "The '**' pattern is only allowed in doc comments.",
            Rule::AllCapsComment => "Comments written entirely in capitals are not allowed.",
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] is not allowed. Use the code or remove it."
            }
        }
    }

    /// Whether a line matched by `pattern` really violates the rule.
    fn violated_by(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Rule::UnderscoreBinding => {
                let is_comment = trimmed.starts_with("//") || line.contains("/*");
                let in_string = line
                    .split('"')
                    .enumerate()
                    .any(|(i, part)| i % 2 == 1 && part.contains('_'));
                !is_comment && !in_string
            }
            Rule::StarsInComment => !trimmed.starts_with("///") && !trimmed.starts_with("//!"),
            Rule::AllCapsComment => {
                let Some(idx) = line.find("//").or_else(|| line.find("/*")) else {
                    return false;
                };
                let text = line[idx + 2..].trim_start_matches(['/', '!', '*']);
                // Code spans name identifiers and constants, not prose.
                let letters: Vec<char> = text
                    .split('`')
                    .step_by(2)
                    .flat_map(str::chars)
                    .filter(|c| c.is_alphabetic())
                    .collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }
            Rule::ForbiddenWord | Rule::AllowDeadCode => true,
        }
    }
}

struct Collector {
    rule: Rule,
    violations: Vec<String>,
}

impl Sink for Collector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.violated_by(line) {
            self.violations.push(format!("{line_number}:{line}"));
        }
        Ok(true)
    }
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
    let matcher = RegexMatcher::new_line_matcher(rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut collector = Collector {
            rule,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if !collector.violations.is_empty() {
            return Err(report(rule, path, &collector.violations).into());
        }
    }
    Ok(())
}

fn report(rule: Rule, path: &Path, violations: &[String]) -> String {
    let mut msg = format!(
        "\n❌ ERROR: {} source policy violation(s) in {}:\n",
        violations.len(),
        path.display()
    );
    for v in violations {
        msg.push_str(&format!("   {v}\n"));
    }
    msg.push_str(&format!("\n⚠️ {}\n", rule.explanation()));
    msg
}

// Lines every rule must judge the same way on every build.
const RULE_CASES: [(Rule, &str, bool); 7] = [
    (Rule::AllCapsComment, "// SHOUTING IS NOT A COMMENT", true),
    (Rule::AllCapsComment, "/// `GRAMCHOL_MIN_TASK_SIZE`.", false),
    (Rule::AllCapsComment, "/// Defaults overridden by `GRAMCHOL_BLOCK_SIZE`.", false),
    (Rule::AllCapsComment, "// SAFETY: `ptr` outlives the scope.", false),
    (Rule::StarsInComment, "/// **bold** in docs", false),
    (Rule::StarsInComment, "// a ** b", true),
    (Rule::UnderscoreBinding, "let name = \"GRAMCHOL_BLOCK_SIZE\";", false),
];

fn check_rules() -> Result<(), String> {
    for (rule, line, expected) in RULE_CASES {
        if rule.violated_by(line) != expected {
            return Err(format!(
                "\n❌ ERROR: source policy rule misjudges `{line}` (expected violation: {expected})\n"
            ));
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    if let Err(e) = check_rules() {
        eprintln!("{e}");
        std::process::exit(1);
    }
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let files = source_files();
    for rule in [
        Rule::UnderscoreBinding,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::AllCapsComment,
        Rule::AllowDeadCode,
    ] {
        if let Err(e) = scan(rule, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
