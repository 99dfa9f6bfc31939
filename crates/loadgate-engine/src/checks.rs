//! Named response checks.

use crate::transport::TransportResponse;
use loadgate_core::CheckSpec;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Programmatic check over a response and its parsed JSON body, if any.
pub type CheckFn = Arc<dyn Fn(&TransportResponse, Option<&Value>) -> bool + Send + Sync>;

/// The configured checks of a scenario, evaluated on every main response.
#[derive(Clone, Default)]
pub struct CheckSet {
    checks: Vec<CheckSpec>,
    custom: Vec<(String, CheckFn)>,
}

impl std::fmt::Debug for CheckSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckSet")
            .field("checks", &self.checks)
            .field("custom", &self.custom.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish()
    }
}

impl CheckSet {
    pub fn new(checks: Vec<CheckSpec>) -> Self {
        Self {
            checks,
            custom: Vec::new(),
        }
    }

    /// Add a named predicate. A name already in use is replaced.
    pub fn with_custom<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&TransportResponse, Option<&Value>) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        self.checks.retain(|spec| spec.name() != name);
        self.custom.retain(|(existing, _)| *existing != name);
        self.custom.push((name, Arc::new(check)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty() && self.custom.is_empty()
    }

    /// Whether any configured check reads the body as JSON.
    pub fn needs_json_body(&self) -> bool {
        self.checks.iter().any(CheckSpec::needs_json_body)
    }

    /// Whether a closure is registered. Closures see the parsed body whenever
    /// it parses, whatever the content type says.
    pub fn has_custom(&self) -> bool {
        !self.custom.is_empty()
    }

    /// Evaluate every check.
    ///
    /// Without a response (transport failure) every check fails. `json` is the
    /// parsed body when it parsed.
    pub fn evaluate(
        &self,
        response: Option<&TransportResponse>,
        json: Option<&Value>,
    ) -> BTreeMap<String, bool> {
        let configured = self.checks.iter().map(|check| {
            let passed = response
                .map(|r| evaluate_one(check, r, json))
                .unwrap_or(false);
            (check.name().to_string(), passed)
        });

        let custom = self.custom.iter().map(|(name, check)| {
            let passed = response.map(|r| check(r, json)).unwrap_or(false);
            (name.clone(), passed)
        });

        configured.chain(custom).collect()
    }
}

fn evaluate_one(check: &CheckSpec, response: &TransportResponse, json: Option<&Value>) -> bool {
    match check {
        CheckSpec::StatusEquals { status, .. } => response.status == *status,
        CheckSpec::ContentTypeContains { substring, .. } => response
            .content_type()
            .map(|ct| ct.to_ascii_lowercase().contains(&substring.to_ascii_lowercase()))
            .unwrap_or(false),
        CheckSpec::BodyHasAnyField { fields, .. } => match json {
            Some(Value::Object(map)) => fields.iter().any(|f| map.contains_key(f)),
            _ => false,
        },
        CheckSpec::BodyFieldIsNumber { field, .. } => {
            lookup(json, field).map(Value::is_number).unwrap_or(false)
        }
        CheckSpec::BodyFieldEquals { field, value, .. } => {
            lookup(json, field).map(|v| v == value).unwrap_or(false)
        }
    }
}

/// Find a field by dotted path, e.g. `result.score`.
pub(crate) fn lookup<'a>(json: Option<&'a Value>, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(json?, |value, segment| value.get(segment))
}
