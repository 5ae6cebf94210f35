//! Security policy loading. Policies are read once at startup and shared
//! read-only behind an `Arc`.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::classifier::{PolicySpec, SecurityPolicy};

pub const DEFAULT_POLICY: &str = include_str!("../../policy/default.toml");

/// Parse and validate a policy document.
pub fn parse_policy(raw: &str) -> Result<PolicySpec> {
    let spec: PolicySpec = toml::from_str(raw).context("parse policy toml")?;
    let errors = spec.validate();
    if !errors.is_empty() {
        return Err(anyhow!("invalid policy:\n- {}", errors.join("\n- ")));
    }
    Ok(spec)
}

/// Load the policy at `path`, or the embedded default when `None`.
#[instrument(skip_all, fields(path = ?path))]
pub fn load_policy(path: Option<&Path>) -> Result<Arc<SecurityPolicy>> {
    let spec = match path {
        Some(path) => {
            let raw =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            parse_policy(&raw).with_context(|| format!("load policy {}", path.display()))?
        }
        None => parse_policy(DEFAULT_POLICY).context("load embedded default policy")?,
    };
    debug!(
        deny = spec.deny.len(),
        categories = spec.allow.len(),
        heuristics = spec.heuristics.len(),
        "policy loaded"
    );
    let policy = SecurityPolicy::from_spec(&spec).map_err(|err| anyhow!(err))?;
    Ok(Arc::new(policy))
}
