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

use kiln_cache::CodeValidator;
use kiln_config::{Language, ValidationConfig};
use kiln_error::Error;
use kiln_macro::kiln_test;
use pretty_assertions::assert_eq;

#[kiln_test]
async fn oversized_file_is_rejected() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("big.py");
    tokio::fs::write(&path, vec![b'#'; 64]).await?;

    let validator = CodeValidator::new(ValidationConfig {
        max_file_size: 32,
        ..ValidationConfig::default()
    });
    let result = validator.validate_file(&path).await?;
    assert!(!result.is_valid);
    assert!(
        result.errors.iter().any(|e| e.contains("file size exceeds limit")),
        "{:?}",
        result.errors
    );
    Ok(())
}

#[kiln_test]
async fn unknown_extension_is_rejected() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("code.txt");
    tokio::fs::write(&path, b"hello").await?;

    let validator = CodeValidator::new(ValidationConfig::default());
    let result = validator.validate_file(&path).await?;
    assert!(!result.is_valid);
    assert!(
        result
            .errors
            .iter()
            .any(|e| e.contains("file extension not allowed")),
        "{:?}",
        result.errors
    );
    Ok(())
}

#[kiln_test]
async fn blocked_pattern_is_an_error() -> Result<(), Error> {
    let validator = CodeValidator::new(ValidationConfig::default());
    let result = validator.validate_content(
        b"package main\nfunc main() { exec.Command(\"ls\") }\n",
        Some(Language::Go),
    );
    assert!(!result.is_valid);
    assert!(
        result
            .errors
            .iter()
            .any(|e| e.contains("exec.Command") && e.contains("line 2")),
        "{:?}",
        result.errors
    );
    Ok(())
}

#[kiln_test]
async fn multi_word_pattern_matches_respaced_code() -> Result<(), Error> {
    let validator = CodeValidator::new(ValidationConfig::default());
    // "rm -rf" is configured as a blocked pattern. Extra spacing between
    // the tokens must not defeat it.
    let result =
        validator.validate_content(b"import os\nos.system('rm   -rf  /')\n", Some(Language::Python));
    assert!(!result.is_valid);
    assert!(
        result.errors.iter().any(|e| e.contains("rm -rf")),
        "{:?}",
        result.errors
    );
    Ok(())
}

#[kiln_test]
async fn suspicious_pattern_is_only_a_warning() -> Result<(), Error> {
    let validator = CodeValidator::new(ValidationConfig::default());
    let result = validator.validate_content(
        b"const x = eval('1 + 1');\nconsole.log(x);\n",
        Some(Language::JavaScript),
    );
    assert!(result.is_valid);
    assert!(
        result.warnings.iter().any(|w| w.contains("eval(")),
        "{:?}",
        result.warnings
    );
    assert_eq!(result.errors, Vec::<String>::new());
    Ok(())
}

#[kiln_test]
async fn disabling_validation_skips_pattern_checks() -> Result<(), Error> {
    let validator = CodeValidator::new(ValidationConfig {
        enable_code_validation: false,
        ..ValidationConfig::default()
    });
    let result =
        validator.validate_content(b"os.system('rm -rf /')\n", Some(Language::Python));
    assert!(result.is_valid);
    // Complexity is still computed for fee estimation.
    assert!(result.complexity > 0.0);
    Ok(())
}

#[kiln_test]
async fn complexity_counts_language_markers() -> Result<(), Error> {
    let validator = CodeValidator::new(ValidationConfig::default());
    let code = b"def f():\n    return 1\n";
    let result = validator.validate_content(code, Some(Language::Python));
    // One function, three lines (counting the trailing newline split),
    // 22 bytes: 0.5 + 0.03 + 22/1024*0.1.
    let expected = 0.5 + 0.03 + (22.0 / 1024.0) * 0.1;
    assert!(
        (result.complexity - expected).abs() < 1e-9,
        "complexity {} != {expected}",
        result.complexity
    );
    Ok(())
}

#[kiln_test]
async fn empty_content_scores_zero_complexity() -> Result<(), Error> {
    let validator = CodeValidator::new(ValidationConfig::default());
    let result = validator.validate_content(b"", Some(Language::Go));
    assert!(result.is_valid);
    assert_eq!(result.complexity, 0.0);
    Ok(())
}
