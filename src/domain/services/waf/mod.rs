//! WAF Filter
//!
//! Request inspection against a versioned signature rule set, plus the
//! resource-protection size limits that apply regardless of mode.

mod rule_set;

pub use rule_set::{AttackCategory, InspectionTarget, RuleSet, WafRule, SUPPORTED_VERSIONS};

use crate::domain::entities::{GatewayRequest, WafPolicy};
use crate::domain::value_objects::WafMode;
use std::sync::atomic::{AtomicU8, Ordering};

/// Status returned for signature blocks.
pub const BLOCK_STATUS: u16 = 403;
/// Status returned for size limit violations.
pub const OVERSIZED_STATUS: u16 = 413;
/// Body of every block response. Never carries backend details.
pub const BLOCK_BODY: &str = "Request blocked by web application firewall";

/// Headers inspected by [`InspectionTarget::Headers`] rules.
const INSPECTED_HEADERS: &[&str] = &["user-agent", "referer", "cookie"];

/// A single rule hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule_id: &'static str,
    pub category: AttackCategory,
    pub target: InspectionTarget,
}

/// Which size limit a request violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeLimit {
    RequestBody,
    FileUpload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WafVerdict {
    Allow,
    /// Detection mode: matches recorded, request continues
    Detected(Vec<RuleMatch>),
    /// Prevention mode: request rejected
    Blocked(Vec<RuleMatch>),
    /// Size limit exceeded, rejected in both modes
    Oversized {
        limit: SizeLimit,
        max: usize,
        actual: usize,
    },
}

impl WafVerdict {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Blocked(_) | Self::Oversized { .. })
    }

    /// Status code of the rejection response, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Blocked(_) => Some(BLOCK_STATUS),
            Self::Oversized { .. } => Some(OVERSIZED_STATUS),
            _ => None,
        }
    }

    pub fn matches(&self) -> &[RuleMatch] {
        match self {
            Self::Detected(m) | Self::Blocked(m) => m,
            _ => &[],
        }
    }
}

fn mode_to_u8(mode: WafMode) -> u8 {
    match mode {
        WafMode::Detection => 0,
        WafMode::Prevention => 1,
    }
}

fn mode_from_u8(raw: u8) -> WafMode {
    if raw == 1 {
        WafMode::Prevention
    } else {
        WafMode::Detection
    }
}

/// Process-wide enforcement mode.
///
/// Every request evaluated after a `set` observes the new mode.
#[derive(Debug)]
pub struct WafModeSwitch {
    mode: AtomicU8,
}

impl WafModeSwitch {
    pub fn new(mode: WafMode) -> Self {
        Self {
            mode: AtomicU8::new(mode_to_u8(mode)),
        }
    }

    pub fn get(&self) -> WafMode {
        mode_from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Switch the mode and return the previous one.
    pub fn set(&self, mode: WafMode) -> WafMode {
        mode_from_u8(self.mode.swap(mode_to_u8(mode), Ordering::AcqRel))
    }
}

/// Compiled firewall for one policy: signature rules plus size limits.
#[derive(Debug, Clone)]
pub struct WafFilter {
    rule_set: RuleSet,
    max_request_body_bytes: usize,
    file_upload_limit_bytes: usize,
    inspect_body: bool,
}

impl WafFilter {
    /// Build a filter from a policy, `None` if the rule-set version is unknown.
    pub fn from_policy(policy: &WafPolicy) -> Option<Self> {
        let rule_set = RuleSet::for_version(&policy.rule_set_version)?;
        Some(Self {
            rule_set,
            max_request_body_bytes: policy.max_request_body_bytes,
            file_upload_limit_bytes: policy.file_upload_limit_bytes,
            inspect_body: policy.inspect_body,
        })
    }

    pub fn rule_set(&self) -> &RuleSet {
        &self.rule_set
    }

    pub fn max_request_body_bytes(&self) -> usize {
        self.max_request_body_bytes
    }

    pub fn file_upload_limit_bytes(&self) -> usize {
        self.file_upload_limit_bytes
    }

    /// Size limit applying to a body of `content_type`. Multipart form
    /// uploads get the file upload limit, everything else the body limit.
    pub fn body_limit_for(&self, content_type: Option<&str>) -> (SizeLimit, usize) {
        let is_upload = content_type
            .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
            .unwrap_or(false);
        if is_upload {
            (SizeLimit::FileUpload, self.file_upload_limit_bytes)
        } else {
            (SizeLimit::RequestBody, self.max_request_body_bytes)
        }
    }

    /// Evaluate a request under `mode`.
    pub fn evaluate(&self, request: &GatewayRequest, mode: WafMode) -> WafVerdict {
        if let Some(oversized) = self.check_size(request) {
            return oversized;
        }

        let matches = self.inspect(request);
        if matches.is_empty() {
            return WafVerdict::Allow;
        }

        match mode {
            WafMode::Detection => WafVerdict::Detected(matches),
            WafMode::Prevention => WafVerdict::Blocked(matches),
        }
    }

    fn check_size(&self, request: &GatewayRequest) -> Option<WafVerdict> {
        let (limit, max) = self.body_limit_for(request.header("content-type"));

        if request.body_len > max {
            Some(WafVerdict::Oversized {
                limit,
                max,
                actual: request.body_len,
            })
        } else {
            None
        }
    }

    /// Signature matches for a request. Independent of the mode.
    pub fn inspect(&self, request: &GatewayRequest) -> Vec<RuleMatch> {
        let uri = request.path_and_query();
        let decoded_uri = url_decode(&uri);
        let headers: Vec<&str> = request
            .headers
            .iter()
            .filter(|(name, _)| INSPECTED_HEADERS.contains(&name.as_str()))
            .map(|(_, value)| value.as_str())
            .collect();

        let body = if self.inspect_body && !request.body.is_empty() {
            let end = request.body.len().min(self.max_request_body_bytes);
            Some(String::from_utf8_lossy(&request.body[..end]))
        } else {
            None
        };

        let mut matches = Vec::new();
        for rule in self.rule_set.rules() {
            let target = if rule.inspects(InspectionTarget::Uri)
                && (rule.is_match(&uri) || rule.is_match(&decoded_uri))
            {
                Some(InspectionTarget::Uri)
            } else if rule.inspects(InspectionTarget::Headers)
                && headers.iter().any(|h| rule.is_match(h))
            {
                Some(InspectionTarget::Headers)
            } else if rule.inspects(InspectionTarget::Body)
                && body.as_deref().is_some_and(|b| rule.is_match(b))
            {
                Some(InspectionTarget::Body)
            } else {
                None
            };

            if let Some(target) = target {
                matches.push(RuleMatch {
                    rule_id: rule.id,
                    category: rule.category,
                    target,
                });
            }
        }
        matches
    }
}

/// Percent-decode a URI for inspection, `+` read as a space.
fn url_decode(raw: &str) -> std::borrow::Cow<'_, str> {
    if !raw.contains(['%', '+']) {
        return std::borrow::Cow::Borrowed(raw);
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    std::borrow::Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}
