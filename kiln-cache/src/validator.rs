// Copyright 2025 The Kiln Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;

use kiln_config::{Language, ValidationConfig};
use kiln_error::{Error, ResultExt};

/// Patterns that flag a line as worth a warning, without rejecting the file.
const SUSPICIOUS_PATTERNS: &[&str] = &[
    "http://",
    "ftp://",
    "file://",
    "os.Open",
    "os.ReadFile",
    "exec.",
    "syscall.",
    "unsafe.",
    "reflect.",
    "eval(",
    "child_process",
    "subprocess",
];

/// Outcome of validating one source file. `is_valid: false` is a soft
/// failure: the file is rejected, nothing errored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub complexity: f64,
}

impl ValidationResult {
    fn valid() -> Self {
        Self {
            is_valid: true,
            ..Default::default()
        }
    }
}

/// Static checks over untrusted source before it gets near a container.
pub struct CodeValidator {
    config: ValidationConfig,
}

impl CodeValidator {
    pub const fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Validates size, extension and content of the file at `path`.
    pub async fn validate_file(&self, path: &Path) -> Result<ValidationResult, Error> {
        let mut result = ValidationResult::valid();

        let metadata = tokio::fs::metadata(path)
            .await
            .err_tip(|| format!("Failed to stat {path:?} for validation"))?;
        if metadata.len() > self.config.max_file_size {
            result.is_valid = false;
            result
                .errors
                .push(format!("file size exceeds limit: {} bytes", metadata.len()));
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        if !self.config.allowed_extensions.contains(&ext) {
            result.is_valid = false;
            result
                .errors
                .push(format!("file extension not allowed: {ext}"));
        }

        let content = tokio::fs::read(path)
            .await
            .err_tip(|| format!("Failed to read {path:?} for validation"))?;
        let language = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Language::from_extension);
        self.check_content(&content, language, &mut result);
        Ok(result)
    }

    /// Validates raw content without a backing file.
    pub fn validate_content(&self, content: &[u8], language: Option<Language>) -> ValidationResult {
        let mut result = ValidationResult::valid();
        if content.len() as u64 > self.config.max_file_size {
            result.is_valid = false;
            result
                .errors
                .push(format!("file size exceeds limit: {} bytes", content.len()));
            return result;
        }
        self.check_content(content, language, &mut result);
        result
    }

    fn check_content(
        &self,
        content: &[u8],
        language: Option<Language>,
        result: &mut ValidationResult,
    ) {
        result.complexity = calculate_complexity(content, language);
        if !self.config.enable_code_validation {
            return;
        }
        let text = String::from_utf8_lossy(content);
        for (index, line) in text.lines().enumerate() {
            let line_number = index + 1;
            for pattern in &self.config.blocked_patterns {
                if line_matches_pattern(line, pattern) {
                    result.is_valid = false;
                    result.errors.push(format!(
                        "dangerous pattern found at line {line_number}: {pattern}"
                    ));
                }
            }
            for pattern in SUSPICIOUS_PATTERNS {
                if line.contains(pattern) {
                    result.warnings.push(format!(
                        "suspicious pattern at line {line_number}: {pattern}"
                    ));
                }
            }
        }
    }
}

/// A line matches when it contains the pattern verbatim, or, for multi-word
/// patterns, when every whitespace-separated token of the pattern appears
/// somewhere on the line. The latter catches reformatted variants such as
/// `exec . Command` for `exec.Command` style patterns spelled with spaces.
fn line_matches_pattern(line: &str, pattern: &str) -> bool {
    if line.contains(pattern) {
        return true;
    }
    if !pattern.contains(char::is_whitespace) {
        return false;
    }
    pattern.split_whitespace().all(|token| line.contains(token))
}

struct ComplexityMarkers {
    functions: &'static [&'static str],
    imports: &'static [&'static str],
    loops: &'static [&'static str],
    conditionals: &'static [&'static str],
}

const GO_MARKERS: ComplexityMarkers = ComplexityMarkers {
    functions: &["func "],
    imports: &["import "],
    loops: &["for ", "range "],
    conditionals: &["if ", "switch "],
};

const PYTHON_MARKERS: ComplexityMarkers = ComplexityMarkers {
    functions: &["def ", "lambda "],
    imports: &["import "],
    loops: &["for ", "while "],
    conditionals: &["if ", "elif "],
};

const JS_MARKERS: ComplexityMarkers = ComplexityMarkers {
    functions: &["function ", "=> "],
    imports: &["import ", "require("],
    loops: &["for ", "while "],
    conditionals: &["if ", "switch "],
};

/// Heuristic complexity score: weighted size, line count and counts of
/// language markers. Empty content scores 0.
pub fn calculate_complexity(content: &[u8], language: Option<Language>) -> f64 {
    if content.is_empty() {
        return 0.0;
    }
    let markers = match language {
        Some(Language::Python) => &PYTHON_MARKERS,
        Some(Language::JavaScript | Language::TypeScript | Language::Node) => &JS_MARKERS,
        // The original target platform ran Go keeper jobs, so Go markers are
        // the fallback for unknown sources.
        Some(Language::Go) | None => &GO_MARKERS,
    };

    let text = String::from_utf8_lossy(content);
    let count = |needles: &[&str]| -> f64 {
        needles
            .iter()
            .map(|needle| text.matches(needle).count())
            .sum::<usize>() as f64
    };

    let size_kb = content.len() as f64 / 1024.0;
    let num_lines = text.split('\n').count() as f64;

    size_kb * 0.1
        + num_lines * 0.01
        + count(markers.functions) * 0.5
        + count(markers.imports) * 0.2
        + (count(markers.loops) + count(markers.conditionals)) * 0.3
}
