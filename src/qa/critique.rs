//! Critic response parsing.
//!
//! A critique is accepted only when every required key is present and in
//! range. Nothing is defaulted: a response that does not parse is a
//! [`CritiqueParseError`], never a synthetic critique.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;

use crate::errors::CritiqueParseError;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Pass,
    Rework,
    Fail,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pass => "PASS",
            Decision::Rework => "REWORK",
            Decision::Fail => "FAIL",
        }
    }

    fn from_literal(value: &str) -> Option<Self> {
        match value {
            "PASS" => Some(Decision::Pass),
            "REWORK" => Some(Decision::Rework),
            "FAIL" => Some(Decision::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    fn from_literal(value: &str) -> Option<Self> {
        match value {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blocker {
    pub severity: Severity,
    pub description: String,
}

/// One critic evaluation of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QaCritique {
    pub decision: Decision,
    pub score: u8,
    pub gate: String,
    pub attempt: u32,
    pub blockers: Vec<Blocker>,
    pub prescriptive_fixes: Vec<String>,
    pub confidence: f64,
}

impl QaCritique {
    /// Parses raw critic output. The JSON record may be wrapped in prose or
    /// a fenced code block.
    pub fn parse(raw: &str) -> Result<Self, CritiqueParseError> {
        let json = extract_json(raw).ok_or(CritiqueParseError::NoJson)?;
        let value: Value = serde_json::from_str(json).map_err(CritiqueParseError::Malformed)?;
        let obj = value.as_object().ok_or(CritiqueParseError::NotAnObject)?;
        Self::from_object(obj)
    }

    fn from_object(obj: &Map<String, Value>) -> Result<Self, CritiqueParseError> {
        let decision_raw = required_str(obj, "decision")?;
        let decision = Decision::from_literal(decision_raw)
            .ok_or_else(|| CritiqueParseError::UnknownDecision(decision_raw.to_string()))?;

        let score = required_int(obj, "score")?;
        if !(0..=100).contains(&score) {
            return Err(CritiqueParseError::ScoreOutOfRange(score));
        }

        let gate = required_str(obj, "gate")?;
        if gate.trim().is_empty() {
            return Err(CritiqueParseError::EmptyGate);
        }

        let attempt = required_int(obj, "attempt")?;
        if attempt < 1 || attempt > i64::from(u32::MAX) {
            return Err(CritiqueParseError::InvalidAttempt(attempt));
        }

        let blockers = required_array(obj, "blockers")?
            .iter()
            .map(parse_blocker)
            .collect::<Result<Vec<_>, _>>()?;

        let prescriptive_fixes = required_array(obj, "prescriptive_fixes")?
            .iter()
            .map(|fix| {
                fix.as_str()
                    .map(str::to_string)
                    .ok_or(CritiqueParseError::WrongType {
                        field: "prescriptive_fixes",
                        expected: "array of strings",
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let confidence = obj
            .get("confidence")
            .ok_or(CritiqueParseError::MissingField("confidence"))?
            .as_f64()
            .ok_or(CritiqueParseError::WrongType {
                field: "confidence",
                expected: "number",
            })?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(CritiqueParseError::ConfidenceOutOfRange(confidence));
        }

        Ok(Self {
            decision,
            score: score as u8,
            gate: gate.to_string(),
            attempt: attempt as u32,
            blockers,
            prescriptive_fixes,
            confidence,
        })
    }
}

fn extract_json(raw: &str) -> Option<&str> {
    if let Some(found) = FENCED_JSON.captures(raw).and_then(|c| c.get(1)) {
        return Some(found.as_str());
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn required_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, CritiqueParseError> {
    obj.get(field)
        .ok_or(CritiqueParseError::MissingField(field))?
        .as_str()
        .ok_or(CritiqueParseError::WrongType {
            field,
            expected: "string",
        })
}

fn required_int(obj: &Map<String, Value>, field: &'static str) -> Result<i64, CritiqueParseError> {
    obj.get(field)
        .ok_or(CritiqueParseError::MissingField(field))?
        .as_i64()
        .ok_or(CritiqueParseError::WrongType {
            field,
            expected: "integer",
        })
}

fn required_array<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a Vec<Value>, CritiqueParseError> {
    obj.get(field)
        .ok_or(CritiqueParseError::MissingField(field))?
        .as_array()
        .ok_or(CritiqueParseError::WrongType {
            field,
            expected: "array",
        })
}

fn parse_blocker(value: &Value) -> Result<Blocker, CritiqueParseError> {
    let obj = value.as_object().ok_or(CritiqueParseError::WrongType {
        field: "blockers",
        expected: "array of objects",
    })?;
    let severity_raw = obj
        .get("severity")
        .ok_or(CritiqueParseError::MissingField("blockers.severity"))?
        .as_str()
        .ok_or(CritiqueParseError::WrongType {
            field: "blockers.severity",
            expected: "string",
        })?;
    let severity = Severity::from_literal(severity_raw)
        .ok_or_else(|| CritiqueParseError::UnknownSeverity(severity_raw.to_string()))?;
    let description = obj
        .get("description")
        .ok_or(CritiqueParseError::MissingField("blockers.description"))?
        .as_str()
        .ok_or(CritiqueParseError::WrongType {
            field: "blockers.description",
            expected: "string",
        })?;
    Ok(Blocker {
        severity,
        description: description.to_string(),
    })
}
