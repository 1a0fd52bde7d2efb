//! Descriptor document parser.
//!
//! A descriptor is a text document opening with a `---`-delimited YAML header:
//!
//! ```text
//! ---
//! id: code-reviewer
//! domain: review
//! token-budget: 4000
//! timeout: 90s
//! required-capabilities: [may-read-files]
//! forbidden-callees: [project-orchestrator]
//! ---
//! Free-form body.
//! ```
//!
//! Unknown header keys are ignored; `id`, `domain`, `token-budget` and
//! `timeout` are required.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::descriptor::{Capability, SpecialistDescriptor};
use crate::domain::error::{OrchestrationError, Result};
use crate::domain::task::ResourceClaim;

const FENCE: &str = "---";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Header {
    id: Option<String>,
    domain: Option<String>,
    token_budget: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default)]
    required_capabilities: Vec<Capability>,
    #[serde(default)]
    forbidden_callees: Vec<String>,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    parallel_safe: Option<bool>,
    #[serde(default)]
    mandatory: bool,
    #[serde(default)]
    resources: Vec<String>,
    instances: Option<usize>,
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    command: Vec<String>,
}

/// Split a document into its header text and body.
fn split_front_matter(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start_matches('\u{feff}');
    let rest = text.trim_start().strip_prefix(FENCE)?;
    let rest = rest.strip_prefix('\r').unwrap_or(rest);
    let rest = rest.strip_prefix('\n')?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FENCE {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((header, body));
        }
        offset += line.len();
    }
    None
}

fn required<T>(origin: &str, field: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| {
        OrchestrationError::invalid_descriptor(origin, format!("missing required field: {field}"))
    })
}

/// Parse one descriptor document. `origin` names it in error messages.
pub fn parse_descriptor(origin: &str, text: &str) -> Result<SpecialistDescriptor> {
    let (header_text, body) = split_front_matter(text)
        .ok_or_else(|| OrchestrationError::invalid_descriptor(origin, "missing `---` header block"))?;

    let header: Header = serde_yaml::from_str(header_text)
        .map_err(|e| OrchestrationError::invalid_descriptor(origin, e.to_string()))?;

    let id = required(origin, "id", header.id)?;
    if id.trim().is_empty() {
        return Err(OrchestrationError::invalid_descriptor(origin, "id must not be empty"));
    }
    let domain = required(origin, "domain", header.domain)?;
    let token_budget = required(origin, "token-budget", header.token_budget)?;
    let timeout = required(origin, "timeout", header.timeout)?;

    if header.instances == Some(0) {
        return Err(OrchestrationError::invalid_descriptor(origin, "instances must be at least 1"));
    }

    let resources = header
        .resources
        .iter()
        .map(|r| r.parse::<ResourceClaim>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| OrchestrationError::invalid_descriptor(origin, e))?;

    Ok(SpecialistDescriptor {
        id: id.trim().to_string(),
        domain: domain.trim().to_string(),
        inputs: header.inputs,
        outputs: header.outputs,
        token_budget,
        timeout,
        parallel_safe: header.parallel_safe.unwrap_or(true),
        forbidden_callees: header.forbidden_callees.into_iter().collect::<BTreeSet<_>>(),
        required_capabilities: header.required_capabilities.into_iter().collect(),
        mandatory: header.mandatory,
        resources,
        instances: header.instances,
        max_retries: header.max_retries,
        command: header.command,
        body: body.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;

    const REVIEWER: &str = "---
id: code-reviewer
domain: review
token-budget: 4000
timeout: 90s
required-capabilities: [may-read-files]
forbidden-callees: [project-orchestrator, orchestration-auditor]
resources: [\"fs:/repo/src\", \"fs:/out/review:exclusive\"]
color: blue
---
Reviews code for defects.
";

    #[test]
    fn test_parses_full_header() {
        let d = parse_descriptor("reviewer.md", REVIEWER).unwrap();
        assert_eq!(d.id, "code-reviewer");
        assert_eq!(d.domain, "review");
        assert_eq!(d.token_budget, 4000);
        assert_eq!(d.timeout, Duration::from_secs(90));
        assert!(d.has_capability(Capability::MayReadFiles));
        assert!(d.forbids("project-orchestrator"));
        assert_eq!(d.resources.len(), 2);
        assert!(d.resources.contains(&ResourceClaim::exclusive("fs:/out/review")));
        assert!(d.parallel_safe);
        assert_eq!(d.body, "Reviews code for defects.");
    }

    #[test]
    fn test_missing_required_field_is_invalid_descriptor() {
        let doc = "---\nid: x\ndomain: review\ntimeout: 10s\n---\n";
        let err = parse_descriptor("x.md", doc).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
        assert!(err.to_string().contains("token-budget"), "got {err}");
    }

    #[test]
    fn test_capabilities_and_callees_default_to_empty() {
        let doc = "---\nid: scout\ndomain: research\ntoken-budget: 500\ntimeout: 5s\nparallel-safe: false\n---\n";
        let d = parse_descriptor("scout.md", doc).unwrap();
        assert!(d.required_capabilities.is_empty());
        assert!(d.forbidden_callees.is_empty());
        assert!(!d.parallel_safe);
        assert_eq!(d.default_claims(), vec![ResourceClaim::exclusive("agent:scout")]);
    }

    #[test]
    fn test_missing_header_is_invalid_descriptor() {
        let err = parse_descriptor("plain.md", "# just prose\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);

        let err = parse_descriptor("open.md", "---\nid: x\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
    }

    #[test]
    fn test_bad_timeout_is_invalid_descriptor() {
        let doc = "---\nid: x\ndomain: d\ntoken-budget: 10\ntimeout: soon\n---\n";
        assert_eq!(parse_descriptor("x.md", doc).unwrap_err().kind(), ErrorKind::InvalidDescriptor);
    }

    #[test]
    fn test_crlf_documents() {
        let doc = "---\r\nid: x\r\ndomain: d\r\ntoken-budget: 10\r\ntimeout: 1s\r\n---\r\nbody\r\n";
        let d = parse_descriptor("x.md", doc).unwrap();
        assert_eq!(d.id, "x");
        assert_eq!(d.body, "body");
    }
}
