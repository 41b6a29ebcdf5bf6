//! Secret scanning for API descriptions.
//!
//! Matches are reported by pattern class and position only. The matched text
//! never leaves this module except inside the original input.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::orchestration::{AgentInput, AgentOutput, Capability, CapabilityProvider, ProviderError};
use crate::{Error, Result};

/// One entry of the built-in pattern catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternDef {
    pub class: &'static str,
    pub regex: &'static str,
    /// Blocking classes fail the scan unless allowed in config.
    pub blocking: bool,
    /// Suggested replacement written into the redacted text.
    pub placeholder: &'static str,
}

pub static DEFAULT_PATTERNS: &[PatternDef] = &[
    PatternDef {
        class: "aws_access_key",
        regex: r"AKIA[0-9A-Z]{16}",
        blocking: true,
        placeholder: "${AWS_ACCESS_KEY_ID}",
    },
    PatternDef {
        class: "private_key",
        regex: r"-----BEGIN (?:RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----",
        blocking: true,
        placeholder: "${PRIVATE_KEY}",
    },
    PatternDef {
        class: "github_token",
        regex: r"gh[pousr]_[A-Za-z0-9]{36}",
        blocking: true,
        placeholder: "${GITHUB_TOKEN}",
    },
    PatternDef {
        class: "slack_token",
        regex: r"xox[baprs]-[A-Za-z0-9-]{10,}",
        blocking: true,
        placeholder: "${SLACK_TOKEN}",
    },
    PatternDef {
        class: "gcp_api_key",
        regex: r"AIza[0-9A-Za-z_-]{35}",
        blocking: true,
        placeholder: "${GCP_API_KEY}",
    },
    PatternDef {
        class: "jwt",
        regex: r"eyJ[A-Za-z0-9_-]*\.eyJ[A-Za-z0-9_-]*\.[A-Za-z0-9_-]*",
        blocking: false,
        placeholder: "${JWT}",
    },
    PatternDef {
        class: "bearer_token",
        regex: r"Bearer [A-Za-z0-9._-]{20,}",
        blocking: false,
        placeholder: "Bearer ${API_TOKEN}",
    },
    PatternDef {
        class: "password_assignment",
        regex: r#"(?i)password["']?\s*[:=]\s*["']?[^\s"',{}\[\]]{6,}"#,
        blocking: false,
        placeholder: "password: ${PASSWORD}",
    },
    PatternDef {
        class: "generic_api_key",
        regex: r#"(?i)api[_-]?key["']?\s*[:=]\s*["']?[A-Za-z0-9_-]{16,}"#,
        blocking: false,
        placeholder: "api_key: ${API_KEY}",
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// 1-based.
    pub line: usize,
    /// 1-based, in characters.
    pub column: usize,
    pub pattern_class: String,
    pub placeholder: String,
    pub blocking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub findings: Vec<Finding>,
    pub redacted: String,
}

impl ScanReport {
    pub fn blocking(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.blocking)
    }

    pub fn is_clean(&self) -> bool {
        self.blocking().next().is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SecretScanner {
    patterns: Vec<(PatternDef, Regex)>,
    allowed: HashSet<String>,
}

impl SecretScanner {
    /// Compile the built-in catalog. Classes in `allow` never block.
    pub fn new(allow: &[String]) -> Result<Self> {
        let known: HashSet<&str> = DEFAULT_PATTERNS.iter().map(|p| p.class).collect();
        for class in allow {
            if !known.contains(class.as_str()) {
                return Err(Error::Validation(format!(
                    "scan.allow names unknown pattern class '{}'",
                    class
                )));
            }
        }
        let patterns = DEFAULT_PATTERNS
            .iter()
            .map(|def| {
                Regex::new(def.regex)
                    .map(|re| (*def, re))
                    .map_err(|e| Error::Validation(format!("pattern {} failed to compile: {}", def.class, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns,
            allowed: allow.iter().cloned().collect(),
        })
    }

    fn is_blocking(&self, def: &PatternDef) -> bool {
        def.blocking && !self.allowed.contains(def.class)
    }

    pub fn scan(&self, text: &str) -> ScanReport {
        let mut findings = Vec::new();
        let mut redacted_lines = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let mut redacted = line.to_string();
            for (def, re) in &self.patterns {
                for m in re.find_iter(line) {
                    findings.push(Finding {
                        line: index + 1,
                        column: line[..m.start()].chars().count() + 1,
                        pattern_class: def.class.to_string(),
                        placeholder: def.placeholder.to_string(),
                        blocking: self.is_blocking(def),
                    });
                }
                // Placeholders contain `$`, so they must not be read as group references.
                redacted = re
                    .replace_all(&redacted, regex::NoExpand(def.placeholder))
                    .into_owned();
            }
            redacted_lines.push(redacted);
        }
        findings.sort_by_key(|f| (f.line, f.column));

        let mut redacted = redacted_lines.join("\n");
        if text.ends_with('\n') {
            redacted.push('\n');
        }
        ScanReport { findings, redacted }
    }
}

/// Provider for [`Capability::SecurityScan`].
pub struct ScannerProvider {
    scanner: SecretScanner,
}

impl ScannerProvider {
    pub fn new(scanner: SecretScanner) -> Self {
        Self { scanner }
    }
}

fn violation(report: &ScanReport) -> Option<ProviderError> {
    let mut blocking = report.blocking();
    let first = blocking.next()?;
    let others = blocking.count();
    let mut guidance = format!(
        "replace the value at line {}, column {} with {}",
        first.line, first.column, first.placeholder
    );
    if others > 0 {
        guidance.push_str(&format!(" ({} more blocking finding(s))", others));
    }
    Some(ProviderError::PolicyViolation {
        pattern_class: first.pattern_class.clone(),
        guidance,
    })
}

#[async_trait]
impl CapabilityProvider for ScannerProvider {
    fn capability(&self) -> Capability {
        Capability::SecurityScan
    }

    async fn invoke(&self, input: &AgentInput) -> std::result::Result<AgentOutput, ProviderError> {
        let path = &input.config.spec_path;
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProviderError::InvalidInput(format!("cannot read {}: {}", path.display(), e))
        })?;
        let report = self.scanner.scan(&text);

        if let Some(err) = violation(&report) {
            warn!(
                project = %input.project_id,
                findings = report.findings.len(),
                "blocking secret pattern found"
            );
            return Err(err);
        }

        info!(
            project = %input.project_id,
            findings = report.findings.len(),
            "security scan passed"
        );
        let payload = serde_json::to_value(&report).map_err(|e| ProviderError::Other(e.to_string()))?;
        Ok(AgentOutput::new(payload))
    }
}
