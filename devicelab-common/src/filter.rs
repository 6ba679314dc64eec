//! Driver log filtering
//!
//! Driver servers are extremely chatty; this filter reduces their
//! stdout/stderr to the lines worth keeping. The pipeline is: strip terminal
//! control sequences, redact stack traces embedded in JSON-ish text, drop
//! known noise, then retain lines that match an important-pattern family or
//! are short. The pipeline is idempotent: running a retained line through
//! again yields the same line.

use regex::Regex;
use tracing::debug;

/// Maximum length for a line retained by the short-line fallback
const SHORT_LINE_LIMIT: usize = 200;

/// Replacement for redacted stack-trace values
const STACKTRACE_PLACEHOLDER: &str = "[stacktrace omitted]";

/// Filter applied to every driver server output line
#[derive(Debug)]
pub struct DriverLogFilter {
    ansi: Regex,
    stacktrace_string: Regex,
    stacktrace_object: Regex,
    drop_patterns: Vec<Regex>,
    important_patterns: Vec<Regex>,
}

impl DriverLogFilter {
    pub fn new() -> Self {
        // CSI color codes plus extended ANSI escape forms
        let ansi = Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[@-_]").expect("ansi pattern");
        // "stacktrace":"..." and the camelCase variant, string values
        let stacktrace_string =
            Regex::new(r#""stack[tT]race"\s*:\s*"(?:[^"\\]|\\.)*""#).expect("stacktrace pattern");
        // nested object forms are removed outright
        let stacktrace_object =
            Regex::new(r#""stack[tT]race"\s*:\s*\{[^{}]*\}"#).expect("stacktrace object pattern");

        let drop_patterns = compile(&[
            r"^at\s+\S",                        // stack-trace frames
            r"Exception in thread",
            r"(?i)deprecated",
            r"^Verbose\b",
            r"\[debug\]",
            r"Welcome to Appium",
            r"(?i)appium\s+v\d+\.",             // version banner
            r"Non-default server args",
            r"Available drivers",
            r"Available plugins",
            r"(?i)default capabilities",        // capability chatter
            r"^\[HTTP\]",
            r"^\[W3C",
            r"^\[\s*\]$",                       // empty brackets
            r"^[-=*_]{4,}$",                    // rule-lines
        ]);

        let important_patterns = compile(&[
            r"(?i)listener started",
            r"(?i)listening on",
            r"(?i)server (is )?(started|running)",
            r"(?i)session (created|started)",
            r"(?i)creating (a )?new session",
            r"(?i)ready to accept",
            r"(?i)(executing|executed|succeeded|failed)",
            r"(?i)driver.*(init|ready|created)",
            r"(?i)(launch|install)\w*\s+.*\b(app|apk|ipa)\b",
            r"(?i)app (launched|installed)",
            r"(?i)element.*(found|located)",
            r"(?i)\bclick",
            r"(?i)navigat",
            r"(?i)test (started|completed|finished)",
            r"(?i)\b(error|fail|warn)",
        ]);

        Self {
            ansi,
            stacktrace_string,
            stacktrace_object,
            drop_patterns,
            important_patterns,
        }
    }

    /// Strip control sequences and stray control characters, then trim
    pub fn sanitize(&self, line: &str) -> String {
        let without_ansi = self.ansi.replace_all(line, "");
        let cleaned: String = without_ansi
            .chars()
            .filter(|c| {
                let code = *c as u32;
                !matches!(code,
                    0x00..=0x08 | 0x0B..=0x0C | 0x0E..=0x1F | 0x7F)
            })
            .collect();
        cleaned.trim().to_string()
    }

    /// Redact stack-trace values inside JSON-like text
    pub fn redact(&self, line: &str) -> String {
        let replacement = format!("\"stacktrace\":\"{}\"", STACKTRACE_PLACEHOLDER);
        let line = self
            .stacktrace_object
            .replace_all(line, replacement.as_str());
        self.stacktrace_string
            .replace_all(&line, replacement.as_str())
            .into_owned()
    }

    /// Full pipeline: returns the line to retain, or None when dropped
    pub fn apply(&self, raw: &str) -> Option<String> {
        let line = self.sanitize(raw);
        if line.is_empty() {
            return None;
        }
        let line = self.redact(&line);

        if self.drop_patterns.iter().any(|p| p.is_match(&line)) {
            return None;
        }

        if self.important_patterns.iter().any(|p| p.is_match(&line)) {
            return Some(line);
        }

        if line.len() < SHORT_LINE_LIMIT {
            return Some(line);
        }

        debug!("Dropping long uninteresting driver line ({} chars)", line.len());
        None
    }
}

impl Default for DriverLogFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("filter pattern"))
        .collect()
}
