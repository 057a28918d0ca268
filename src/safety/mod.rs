//! Static checks on generated transformation code.
//!
//! Two gates run before any code reaches the sandbox:
//! 1. a case-insensitive denylist of constructs that reach outside the data
//!    frame (file and process access, dynamic evaluation, dunder access);
//! 2. an import allowlist: every `import` / `from ... import` statement,
//!    including ones chained after `;`, may only name pandas or numpy (or
//!    their submodules).
//!
//! Code that passes is normalized: missing `import pandas as pd` /
//! `import numpy as np` lines are prepended and reported.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// Modules generated code may import by default.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &["pandas", "numpy"];

const PANDAS_IMPORT: &str = "import pandas as pd";
const NUMPY_IMPORT: &str = "import numpy as np";

/// Denylisted patterns with the label reported on a match.
static DENYLIST: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\bimport\s+(os|sys)\b", "import of os/sys"),
        (r"\bfrom\s+(os|sys)\b", "import of os/sys"),
        (r"\bos\s*\.", "os."),
        (r"\bsys\s*\.", "sys."),
        (r"\bopen\s*\(", "open("),
        (r"subprocess", "subprocess"),
        (r"\beval\s*\(", "eval("),
        (r"\bexec\s*\(", "exec("),
        (r"__", "dunder access"),
        (r"shutil", "shutil"),
        (r"pathlib", "pathlib"),
    ]
    .into_iter()
    .map(|(pattern, label)| {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("Invalid denylist regex");
        (re, label)
    })
    .collect()
});

// Matched against single statements, not whole lines.
static IMPORT_STMT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^import[ \t]+([^#]+)").expect("Invalid regex for import statements")
});

static FROM_IMPORT_STMT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^from[ \t]+([A-Za-z_][\w.]*)[ \t]+import\b")
        .expect("Invalid regex for from-import statements")
});

static HAS_PANDAS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(import[ \t]+pandas\b|from[ \t]+pandas\b)")
        .expect("Invalid regex for pandas import")
});

static HAS_NUMPY_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(import[ \t]+numpy\b|from[ \t]+numpy\b)")
        .expect("Invalid regex for numpy import")
});

/// Why a piece of code was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("forbidden pattern '{pattern}' found in: {snippet}")]
    ForbiddenPattern { pattern: String, snippet: String },

    #[error("unsafe import '{line}': only {allowed} may be imported")]
    DisallowedImport { line: String, allowed: String },
}

/// Code that passed validation, with the imports that had to be added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCode {
    pub code: String,
    pub injected_imports: Vec<&'static str>,
}

/// Denylist and import-allowlist checker.
#[derive(Debug, Clone)]
pub struct SafetyValidator {
    allowed_modules: Vec<String>,
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self {
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

impl SafetyValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks `code` and, when it passes, returns it with missing imports
    /// injected.
    pub fn validate(&self, code: &str) -> Result<ValidatedCode, SafetyViolation> {
        self.check_denylist(code)?;
        self.check_imports(code)?;
        Ok(normalize_imports(code))
    }

    fn check_denylist(&self, code: &str) -> Result<(), SafetyViolation> {
        for (re, label) in DENYLIST.iter() {
            if let Some(m) = re.find(code) {
                return Err(SafetyViolation::ForbiddenPattern {
                    pattern: label.to_string(),
                    snippet: line_containing(code, m.start()).to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_imports(&self, code: &str) -> Result<(), SafetyViolation> {
        for line in code.lines() {
            for statement in line.split(';').map(str::trim) {
                if let Some(targets) = IMPORT_STMT.captures(statement).and_then(|c| c.get(1)) {
                    // `import a, b.c as d`
                    for target in targets.as_str().split(',') {
                        let module = target.split_whitespace().next().unwrap_or_default();
                        if !self.is_allowed(module) {
                            return Err(self.disallowed(line));
                        }
                    }
                } else if let Some(module) =
                    FROM_IMPORT_STMT.captures(statement).and_then(|c| c.get(1))
                {
                    if !self.is_allowed(module.as_str()) {
                        return Err(self.disallowed(line));
                    }
                }
            }
        }
        Ok(())
    }

    fn is_allowed(&self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or_default();
        self.allowed_modules.iter().any(|m| m == root)
    }

    fn disallowed(&self, line: &str) -> SafetyViolation {
        SafetyViolation::DisallowedImport {
            line: line.trim().to_string(),
            allowed: self.allowed_modules.join(" and "),
        }
    }
}

/// Prepends `import pandas as pd` / `import numpy as np` when absent.
pub fn normalize_imports(code: &str) -> ValidatedCode {
    let mut injected = Vec::new();
    if !HAS_PANDAS_IMPORT.is_match(code) {
        injected.push(PANDAS_IMPORT);
    }
    if !HAS_NUMPY_IMPORT.is_match(code) {
        injected.push(NUMPY_IMPORT);
    }

    let code = if injected.is_empty() {
        code.to_string()
    } else {
        format!("{}\n{}", injected.join("\n"), code)
    };

    ValidatedCode {
        code,
        injected_imports: injected,
    }
}

fn line_containing(code: &str, offset: usize) -> &str {
    let start = code[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let end = code[offset..]
        .find('\n')
        .map(|i| offset + i)
        .unwrap_or(code.len());
    code[start..end].trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected_pattern(code: &str) -> String {
        match SafetyValidator::new().validate(code) {
            Err(SafetyViolation::ForbiddenPattern { pattern, .. }) => pattern,
            other => panic!("expected forbidden pattern, got {:?}", other),
        }
    }

    #[test]
    fn test_import_os_is_rejected() {
        assert_eq!(rejected_pattern("import os\ndf['a'] = 1"), "import of os/sys");
        assert_eq!(rejected_pattern("from sys import argv"), "import of os/sys");
    }

    #[test]
    fn test_denylist_patterns() {
        assert_eq!(rejected_pattern("x = OS.getcwd()"), "os.");
        assert_eq!(rejected_pattern("open ('f.txt')"), "open(");
        assert_eq!(rejected_pattern("eval('1+1')"), "eval(");
        assert_eq!(rejected_pattern("df.__class__"), "dunder access");
        assert_eq!(rejected_pattern("import shutil"), "shutil");
        assert_eq!(rejected_pattern("p = pathlib.Path('.')"), "pathlib");
        assert_eq!(rejected_pattern("subprocess.run(['ls'])"), "subprocess");
    }

    #[test]
    fn test_identifiers_containing_os_are_fine() {
        let code = "df.loc[df['costs'] > 0, 'pos'] = df['photos'].fillna(0)";
        assert!(SafetyValidator::new().validate(code).is_ok());
    }

    #[test]
    fn test_import_allowlist() {
        let validator = SafetyValidator::new();
        assert!(validator
            .validate("import pandas as pd\nimport numpy.linalg as la\nfrom pandas.api import types")
            .is_ok());

        let err = validator.validate("import pandas as pd, json").unwrap_err();
        assert_eq!(
            err,
            SafetyViolation::DisallowedImport {
                line: "import pandas as pd, json".to_string(),
                allowed: "pandas and numpy".to_string(),
            }
        );

        assert!(matches!(
            validator.validate("from collections import Counter"),
            Err(SafetyViolation::DisallowedImport { .. })
        ));
    }

    #[test]
    fn test_imports_chained_after_semicolon_are_checked() {
        let validator = SafetyValidator::new();
        assert_eq!(
            validator.validate("import pandas as pd; import json\ndf['a'] = 1"),
            Err(SafetyViolation::DisallowedImport {
                line: "import pandas as pd; import json".to_string(),
                allowed: "pandas and numpy".to_string(),
            })
        );
        assert!(matches!(
            validator.validate("df['a'] = 1; import socket"),
            Err(SafetyViolation::DisallowedImport { .. })
        ));
        assert!(matches!(
            validator.validate("df['a'] = 1;from collections import Counter"),
            Err(SafetyViolation::DisallowedImport { .. })
        ));
        assert!(validator
            .validate("import pandas as pd; import numpy as np\ndf['a;b'] = 1")
            .is_ok());
    }

    #[test]
    fn test_missing_imports_are_injected_and_reported() {
        let validated = SafetyValidator::new()
            .validate("df.loc[:, 'inv_cost'] *= 1.1")
            .expect("passes");
        assert_eq!(validated.injected_imports, vec![PANDAS_IMPORT, NUMPY_IMPORT]);
        assert_eq!(
            validated.code,
            "import pandas as pd\nimport numpy as np\ndf.loc[:, 'inv_cost'] *= 1.1"
        );
    }

    #[test]
    fn test_present_imports_are_kept() {
        let code = "import pandas as pd\nimport numpy as np\ndf = df.dropna()";
        let validated = SafetyValidator::new().validate(code).expect("passes");
        assert!(validated.injected_imports.is_empty());
        assert_eq!(validated.code, code);
    }
}
