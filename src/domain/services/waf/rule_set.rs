//! Versioned WAF signature rule sets.
//!
//! Rule ids follow the OWASP CRS numbering so matches can be correlated
//! with upstream documentation. Each rule is introduced in a given
//! rule-set version and stays active in every later version.

use regex::Regex;

/// Versions this gateway ships rule sets for, oldest first.
pub const SUPPORTED_VERSIONS: &[&str] = &["3.0", "3.1", "3.2"];

/// Part of the request a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectionTarget {
    /// Path plus query string
    Uri,
    /// User-Agent, Referer and Cookie
    Headers,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackCategory {
    PathTraversal,
    CommandInjection,
    Xss,
    SqlInjection,
    ScannerDetection,
    ProtocolViolation,
    Ssrf,
    JavaAttack,
}

impl AttackCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PathTraversal => "path_traversal",
            Self::CommandInjection => "command_injection",
            Self::Xss => "xss",
            Self::SqlInjection => "sql_injection",
            Self::ScannerDetection => "scanner_detection",
            Self::ProtocolViolation => "protocol_violation",
            Self::Ssrf => "ssrf",
            Self::JavaAttack => "java_attack",
        }
    }
}

/// A compiled signature rule.
#[derive(Debug, Clone)]
pub struct WafRule {
    pub id: &'static str,
    pub category: AttackCategory,
    pub description: &'static str,
    pub targets: &'static [InspectionTarget],
    pattern: Regex,
}

impl WafRule {
    pub fn is_match(&self, input: &str) -> bool {
        self.pattern.is_match(input)
    }

    pub fn inspects(&self, target: InspectionTarget) -> bool {
        self.targets.contains(&target)
    }
}

struct RuleDef {
    id: &'static str,
    since: &'static str,
    category: AttackCategory,
    description: &'static str,
    targets: &'static [InspectionTarget],
    pattern: &'static str,
}

use InspectionTarget::{Body, Headers, Uri};

const ALL: &[InspectionTarget] = &[Uri, Headers, Body];
const URI_BODY: &[InspectionTarget] = &[Uri, Body];
const URI_ONLY: &[InspectionTarget] = &[Uri];
const HEADERS_ONLY: &[InspectionTarget] = &[Headers];
const BODY_ONLY: &[InspectionTarget] = &[Body];

const RULES: &[RuleDef] = &[
    RuleDef {
        id: "913100",
        since: "3.0",
        category: AttackCategory::ScannerDetection,
        description: "Security scanner user agent",
        targets: HEADERS_ONLY,
        pattern: r"(?i)(sqlmap|nikto|nmap|masscan|acunetix|nessus|dirbuster|wpscan)",
    },
    RuleDef {
        id: "930100",
        since: "3.0",
        category: AttackCategory::PathTraversal,
        description: "Path traversal attack (../)",
        targets: ALL,
        pattern: r"(?i)(\.\./|\.\.\\|%2e%2e(%2f|%5c|/|\\)|%252e%252e)",
    },
    RuleDef {
        id: "930120",
        since: "3.0",
        category: AttackCategory::PathTraversal,
        description: "OS file access attempt",
        targets: URI_BODY,
        pattern: r"(?i)(/etc/(passwd|shadow|hosts)|boot\.ini|win\.ini|/proc/self/)",
    },
    RuleDef {
        id: "932100",
        since: "3.0",
        category: AttackCategory::CommandInjection,
        description: "Unix command injection",
        targets: URI_BODY,
        pattern: r"(?i)(;|\||&&)\s*(ls|cat|id|whoami|uname|nc|curl|wget|bash|sh|chmod|rm)\b",
    },
    RuleDef {
        id: "932130",
        since: "3.1",
        category: AttackCategory::CommandInjection,
        description: "Unix shell expression",
        targets: URI_BODY,
        pattern: r"(\$\([^)]*\)|`[^`]+`|\$\{IFS\})",
    },
    RuleDef {
        id: "941100",
        since: "3.0",
        category: AttackCategory::Xss,
        description: "XSS script tag",
        targets: ALL,
        pattern: r"(?i)(<|%3c)\s*script",
    },
    RuleDef {
        id: "941110",
        since: "3.0",
        category: AttackCategory::Xss,
        description: "XSS event handler attribute",
        targets: ALL,
        pattern: r"(?i)\bon(error|load|click|mouseover|focus|submit)\s*=",
    },
    RuleDef {
        id: "941170",
        since: "3.0",
        category: AttackCategory::Xss,
        description: "javascript: URI",
        targets: ALL,
        pattern: r"(?i)javascript\s*:",
    },
    RuleDef {
        id: "942100",
        since: "3.0",
        category: AttackCategory::SqlInjection,
        description: "SQL injection keywords",
        targets: ALL,
        pattern: r"(?i)\b(union(\s|\+|%20)+(all(\s|\+|%20)+)?select|insert\s+into|delete\s+from|drop\s+(table|database))\b",
    },
    RuleDef {
        id: "942130",
        since: "3.0",
        category: AttackCategory::SqlInjection,
        description: "SQL tautology",
        targets: ALL,
        pattern: r#"(?i)('|"|%27)\s*(or|and)(\s|\+|%20)+('|"|%27)?\w+('|"|%27)?\s*(=|%3d)"#,
    },
    RuleDef {
        id: "942160",
        since: "3.1",
        category: AttackCategory::SqlInjection,
        description: "Blind SQL injection timing function",
        targets: URI_BODY,
        pattern: r"(?i)\b(sleep|benchmark|pg_sleep)\s*\(|waitfor\s+delay",
    },
    RuleDef {
        id: "942190",
        since: "3.1",
        category: AttackCategory::SqlInjection,
        description: "SQL statement chaining",
        targets: URI_BODY,
        pattern: r"(?i)(;|--|/\*)\s*(drop|select|insert|update|delete|shutdown)\b",
    },
    RuleDef {
        id: "920270",
        since: "3.2",
        category: AttackCategory::ProtocolViolation,
        description: "Null byte in request URI",
        targets: URI_ONLY,
        pattern: r"(%00|\x00)",
    },
    RuleDef {
        id: "934110",
        since: "3.2",
        category: AttackCategory::Ssrf,
        description: "Cloud metadata endpoint access",
        targets: URI_BODY,
        pattern: r"(?i)(169\.254\.169\.254|metadata\.google\.internal|100\.100\.100\.200)",
    },
    RuleDef {
        id: "944100",
        since: "3.2",
        category: AttackCategory::JavaAttack,
        description: "Java process execution",
        targets: BODY_ONLY,
        pattern: r"(?i)java\.lang\.(runtime|processbuilder)",
    },
];

/// An immutable, compiled signature set for one rule-set version.
#[derive(Debug, Clone)]
pub struct RuleSet {
    version: String,
    rules: Vec<WafRule>,
}

impl RuleSet {
    pub fn is_supported(version: &str) -> bool {
        SUPPORTED_VERSIONS.contains(&version)
    }

    /// Build the rule set for a version, `None` if unsupported.
    pub fn for_version(version: &str) -> Option<Self> {
        let rank = SUPPORTED_VERSIONS.iter().position(|v| *v == version)?;

        let rules = RULES
            .iter()
            .filter(|def| {
                SUPPORTED_VERSIONS
                    .iter()
                    .position(|v| *v == def.since)
                    .is_some_and(|since| since <= rank)
            })
            .filter_map(|def| match Regex::new(def.pattern) {
                Ok(pattern) => Some(WafRule {
                    id: def.id,
                    category: def.category,
                    description: def.description,
                    targets: def.targets,
                    pattern,
                }),
                Err(e) => {
                    tracing::error!("Invalid WAF rule {}: {}", def.id, e);
                    None
                }
            })
            .collect();

        Some(Self {
            version: version.to_string(),
            rules,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn rules(&self) -> &[WafRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_patterns_compile() {
        for def in RULES {
            assert!(Regex::new(def.pattern).is_ok(), "rule {} failed", def.id);
            assert!(RuleSet::is_supported(def.since));
        }
    }

    #[test]
    fn test_newer_versions_are_supersets() {
        let v30 = RuleSet::for_version("3.0").unwrap();
        let v31 = RuleSet::for_version("3.1").unwrap();
        let v32 = RuleSet::for_version("3.2").unwrap();

        assert!(v30.len() < v31.len());
        assert!(v31.len() < v32.len());
        assert_eq!(v32.len(), RULES.len());
        for rule in v30.rules() {
            assert!(v32.rules().iter().any(|r| r.id == rule.id));
        }
    }

    #[test]
    fn test_unsupported_version() {
        assert!(RuleSet::for_version("2.2.9").is_none());
        assert!(!RuleSet::is_supported("4.0"));
    }

    #[test]
    fn test_version_specific_rule() {
        let v30 = RuleSet::for_version("3.0").unwrap();
        assert!(!v30.rules().iter().any(|r| r.id == "920270"));
        let v32 = RuleSet::for_version("3.2").unwrap();
        assert!(v32.rules().iter().any(|r| r.id == "920270"));
    }

    #[test]
    fn test_sql_injection_patterns() {
        let set = RuleSet::for_version("3.2").unwrap();
        let sqli = |input: &str| {
            set.rules()
                .iter()
                .filter(|r| r.category == AttackCategory::SqlInjection)
                .any(|r| r.is_match(input))
        };
        assert!(sqli("id=1 UNION SELECT password FROM users"));
        assert!(sqli("name=' OR '1'='1"));
        assert!(sqli("q=1; DROP TABLE users"));
        assert!(!sqli("q=selecting the union representative"));
    }
}
