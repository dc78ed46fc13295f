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

//! Shell scripts run inside pooled containers, per language.
//!
//! Every container lives through four script stages: initialization when it
//! is created, setup right before each execution, the execution itself, and
//! a reset when it is returned to the pool.

use kiln_config::Language;

/// Markers the execution scripts print around the user code so the manager
/// can time the code itself, separate from environment overhead.
pub const START_MARKER: &str = "START_EXECUTION";
pub const END_MARKER: &str = "END_EXECUTION";

/// One-time setup of a fresh container: the /code directory and a valid
/// initial source file.
pub fn initialization_script(language: Language) -> &'static str {
    match language {
        Language::Go => {
            r#"#!/bin/sh
set -e
mkdir -p /code
cd /code
echo 'package main; import "fmt"; func main() { fmt.Println("init") }' > code.go
go mod init code
echo "Go container initialized"
"#
        }
        Language::Python => {
            r#"#!/bin/sh
set -e
mkdir -p /code
cd /code
echo 'print("init")' > code.py
echo "Python container initialized"
"#
        }
        Language::JavaScript | Language::Node => {
            r#"#!/bin/sh
set -e
mkdir -p /code
cd /code
echo 'console.log("init");' > code.js
echo "JavaScript container initialized"
"#
        }
        Language::TypeScript => {
            r#"#!/bin/sh
set -e
mkdir -p /code
cd /code
npm install -g typescript
echo 'console.log("init");' > code.ts
echo "TypeScript container initialized"
"#
        }
    }
}

/// Pre-execution warm-up: toolchain caches on first use, then dependency
/// installation when a manifest is present.
pub fn setup_script(language: Language) -> &'static str {
    match language {
        Language::Go => {
            r#"#!/bin/sh
set -e
cd /code
if [ ! -f /code/.warm ]; then
    echo 'package main; func main(){}' > warm.go
    GOFLAGS='-buildvcs=false -trimpath' go build -o /tmp/warm warm.go
    rm warm.go /tmp/warm
    touch /code/.warm
fi
go mod tidy
"#
        }
        Language::Python => {
            r#"#!/bin/sh
set -e
cd /code
if [ ! -f /code/.warm ]; then
    echo 'import json, os, sys, time' > warm.py
    python -m py_compile warm.py
    rm -rf warm.py __pycache__
    touch /code/.warm
fi
if [ -f requirements.txt ]; then
    pip install -r requirements.txt
fi
"#
        }
        Language::JavaScript | Language::Node => {
            r#"#!/bin/sh
set -e
cd /code
if [ ! -f /code/.warm ]; then
    echo "require('fs'); require('path'); require('crypto');" > warm.js
    node warm.js || true
    rm warm.js
    touch /code/.warm
fi
if [ -f package.json ]; then
    npm install
fi
"#
        }
        Language::TypeScript => {
            r#"#!/bin/sh
set -e
cd /code
if [ ! -f /code/.warm ]; then
    echo 'const warm: string = "warm";' > warm.ts
    tsc warm.ts
    rm warm.ts warm.js
    touch /code/.warm
fi
if [ -f package.json ]; then
    npm install
fi
"#
        }
    }
}

/// Runs the staged source file, bracketed by the timing markers. The exit
/// status of the user code is preserved past the end marker.
pub fn execution_script(language: Language) -> &'static str {
    match language {
        Language::Go => {
            r#"#!/bin/sh
cd /code
echo "START_EXECUTION"
GOFLAGS='-buildvcs=false -trimpath' go run code.go 2>&1
status=$?
echo "END_EXECUTION"
exit $status
"#
        }
        Language::Python => {
            r#"#!/bin/sh
cd /code
echo "START_EXECUTION"
python -u -B code.py 2>&1
status=$?
echo "END_EXECUTION"
exit $status
"#
        }
        Language::JavaScript | Language::Node => {
            r#"#!/bin/sh
cd /code
echo "START_EXECUTION"
node code.js 2>&1
status=$?
echo "END_EXECUTION"
exit $status
"#
        }
        Language::TypeScript => {
            r#"#!/bin/sh
cd /code
echo "START_EXECUTION"
tsc code.ts && node code.js 2>&1
status=$?
echo "END_EXECUTION"
exit $status
"#
        }
    }
}

/// Restores a container to a clean, valid state before it goes back to the
/// ready set.
pub fn reset_script(language: Language) -> &'static str {
    match language {
        Language::Go => {
            r#"#!/bin/sh
set -e
cd /code
rm -f code.go
echo 'package main; import "fmt"; func main() { fmt.Println("reset") }' > code.go
echo "Container reset"
"#
        }
        Language::Python => {
            r#"#!/bin/sh
set -e
cd /code
rm -f code.py
echo 'print("reset")' > code.py
echo "Container reset"
"#
        }
        Language::JavaScript | Language::Node => {
            r#"#!/bin/sh
set -e
cd /code
rm -f code.js
echo 'console.log("reset");' > code.js
echo "Container reset"
"#
        }
        Language::TypeScript => {
            r#"#!/bin/sh
set -e
cd /code
rm -f code.ts code.js
echo 'console.log("reset");' > code.ts
echo "Container reset"
"#
        }
    }
}

/// Readiness probe for a freshly initialized container.
pub fn verify_command(language: Language) -> &'static str {
    match language {
        Language::Go => "cd /code && go version",
        Language::Python => "cd /code && python --version",
        Language::JavaScript | Language::Node => "cd /code && node --version",
        Language::TypeScript => "cd /code && tsc --version",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_scripts_carry_both_markers() {
        for &language in Language::all() {
            let script = execution_script(language);
            assert!(script.contains(START_MARKER), "{language} missing start");
            assert!(script.contains(END_MARKER), "{language} missing end");
            assert!(!script.contains("set -e"), "{language} would skip end marker");
        }
    }

    #[test]
    fn reset_scripts_recreate_the_source_file() {
        for &language in Language::all() {
            let script = reset_script(language);
            assert!(script.contains(language.source_file_name()));
        }
    }
}
