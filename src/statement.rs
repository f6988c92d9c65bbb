//! xAPI statement, query and state-document shapes.
//!
//! Only the structure needed to reject malformed requests before they are
//! queued is checked here; vocabulary semantics are left to the LRS.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

/// Inverse functional identifiers that identify an Agent.
const AGENT_IDENTIFIERS: &[&str] = &["mbox", "mbox_sha1sum", "openid", "account"];

/// `objectType` values accepted for a statement object without an `id`.
const NON_ACTIVITY_OBJECT_TYPES: &[&str] = &["Agent", "Group", "StatementRef", "SubStatement"];

/// A learning-activity statement.
///
/// `actor`, `verb` and `object` are optional at the type level so that a
/// statement missing one of them can be represented and rejected with a
/// [`ValidationError`] rather than failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verb: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Any further statement properties, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Statement {
    pub fn new(actor: Value, verb: Value, object: Value) -> Self {
        Self {
            actor: Some(actor),
            verb: Some(verb),
            object: Some(object),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Fill defaults and check shape, yielding the statement to transmit.
    ///
    /// A missing actor is taken from `default_actor`; a missing id is
    /// generated. The returned statement always carries an id, which stays
    /// fixed for every retry of the request it is sent in.
    pub fn prepare(mut self, default_actor: Option<&Value>) -> Result<Statement, ValidationError> {
        if self.actor.is_none() {
            self.actor = default_actor.cloned();
        }
        self.validate()?;

        if self.id.is_none() {
            self.id = Some(Uuid::new_v4());
        }
        Ok(self)
    }

    /// Check the required fields are present and well formed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let actor = self
            .actor
            .as_ref()
            .ok_or_else(|| ValidationError::for_field("actor", "statement requires an actor"))?;
        validate_agent(actor, "actor")?;

        let verb = self
            .verb
            .as_ref()
            .ok_or_else(|| ValidationError::for_field("verb", "statement requires a verb"))?;
        if non_empty_str(verb, "id").is_none() {
            return Err(ValidationError::for_field("verb", "verb must be an object with a non-empty id"));
        }

        let object = self
            .object
            .as_ref()
            .ok_or_else(|| ValidationError::for_field("object", "statement requires an object"))?;
        validate_object(object)?;

        for (field, value) in [("result", &self.result), ("context", &self.context)] {
            if matches!(value, Some(v) if !v.is_object()) {
                return Err(ValidationError::for_field(field, "must be a JSON object"));
            }
        }

        Ok(())
    }
}

fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// An Agent carries exactly one inverse functional identifier; a Group may
/// instead list its members.
pub(crate) fn validate_agent(agent: &Value, field: &str) -> Result<(), ValidationError> {
    let obj = agent
        .as_object()
        .ok_or_else(|| ValidationError::for_field(field, "must be a JSON object"))?;

    let identifiers = AGENT_IDENTIFIERS
        .iter()
        .filter(|key| obj.contains_key(**key))
        .count();

    let is_group = obj.get("objectType").and_then(Value::as_str) == Some("Group");
    let has_members = obj.get("member").map_or(false, Value::is_array);

    match identifiers {
        1 => Ok(()),
        0 if is_group && has_members => Ok(()),
        0 => Err(ValidationError::for_field(
            field,
            "agent requires an identifier (mbox, mbox_sha1sum, openid or account)",
        )),
        _ => Err(ValidationError::for_field(
            field,
            "agent must carry exactly one identifier",
        )),
    }
}

fn validate_object(object: &Value) -> Result<(), ValidationError> {
    if !object.is_object() {
        return Err(ValidationError::for_field("object", "must be a JSON object"));
    }

    match object.get("objectType").and_then(Value::as_str) {
        Some("Agent") | Some("Group") => validate_agent(object, "object"),
        Some(kind) if NON_ACTIVITY_OBJECT_TYPES.contains(&kind) => Ok(()),
        Some("Activity") | None if non_empty_str(object, "id").is_some() => Ok(()),
        Some("Activity") | None => Err(ValidationError::for_field(
            "object",
            "activity object requires a non-empty id",
        )),
        Some(other) => Err(ValidationError::for_field(
            "object",
            format!("unknown objectType '{}'", other),
        )),
    }
}

/// Representation requested from `GET /statements`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementFormat {
    Ids,
    Exact,
    Canonical,
}

impl StatementFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementFormat::Ids => "ids",
            StatementFormat::Exact => "exact",
            StatementFormat::Canonical => "canonical",
        }
    }
}

/// Filter parameters for `GET /statements`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementQuery {
    pub statement_id: Option<Uuid>,
    pub voided_statement_id: Option<Uuid>,
    pub agent: Option<Value>,
    pub verb: Option<String>,
    pub activity: Option<String>,
    pub registration: Option<Uuid>,
    pub related_activities: Option<bool>,
    pub related_agents: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub format: Option<StatementFormat>,
    pub attachments: Option<bool>,
    pub ascending: Option<bool>,
}

impl StatementQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query for a single statement by id.
    pub fn by_id(id: Uuid) -> Self {
        Self {
            statement_id: Some(id),
            ..Self::default()
        }
    }

    pub fn agent(mut self, agent: Value) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn verb(mut self, verb: impl Into<String>) -> Self {
        self.verb = Some(verb.into());
        self
    }

    pub fn activity(mut self, activity: impl Into<String>) -> Self {
        self.activity = Some(activity.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn format(mut self, format: StatementFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn ascending(mut self, ascending: bool) -> Self {
        self.ascending = Some(ascending);
        self
    }

    fn has_filters(&self) -> bool {
        self.agent.is_some()
            || self.verb.is_some()
            || self.activity.is_some()
            || self.registration.is_some()
            || self.related_activities.is_some()
            || self.related_agents.is_some()
            || self.since.is_some()
            || self.until.is_some()
            || self.limit.is_some()
            || self.ascending.is_some()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.statement_id.is_some() && self.voided_statement_id.is_some() {
            return Err(ValidationError::for_field(
                "statementId",
                "statementId and voidedStatementId cannot be combined",
            ));
        }
        if (self.statement_id.is_some() || self.voided_statement_id.is_some()) && self.has_filters() {
            return Err(ValidationError::for_field(
                "statementId",
                "single-statement lookups only accept format and attachments",
            ));
        }
        if let Some(agent) = &self.agent {
            validate_agent(agent, "agent")?;
        }
        for (field, value) in [("verb", &self.verb), ("activity", &self.activity)] {
            if matches!(value, Some(v) if v.trim().is_empty()) {
                return Err(ValidationError::for_field(field, "must not be empty"));
            }
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(ValidationError::for_field("since", "since must not be after until"));
            }
        }
        Ok(())
    }

    /// Query-string pairs in xAPI parameter names.
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();

        if let Some(id) = self.statement_id {
            pairs.push(("statementId", id.to_string()));
        }
        if let Some(id) = self.voided_statement_id {
            pairs.push(("voidedStatementId", id.to_string()));
        }
        if let Some(agent) = &self.agent {
            pairs.push(("agent", agent.to_string()));
        }
        if let Some(verb) = &self.verb {
            pairs.push(("verb", verb.clone()));
        }
        if let Some(activity) = &self.activity {
            pairs.push(("activity", activity.clone()));
        }
        if let Some(registration) = self.registration {
            pairs.push(("registration", registration.to_string()));
        }
        if let Some(flag) = self.related_activities {
            pairs.push(("related_activities", flag.to_string()));
        }
        if let Some(flag) = self.related_agents {
            pairs.push(("related_agents", flag.to_string()));
        }
        if let Some(since) = self.since {
            pairs.push(("since", since.to_rfc3339()));
        }
        if let Some(until) = self.until {
            pairs.push(("until", until.to_rfc3339()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(format) = self.format {
            pairs.push(("format", format.as_str().to_string()));
        }
        if let Some(flag) = self.attachments {
            pairs.push(("attachments", flag.to_string()));
        }
        if let Some(flag) = self.ascending {
            pairs.push(("ascending", flag.to_string()));
        }

        pairs
    }
}

/// Addresses one document in the Activity State resource.
#[derive(Debug, Clone, PartialEq)]
pub struct StateKey {
    pub activity_id: String,
    pub agent: Value,
    pub state_id: String,
    pub registration: Option<Uuid>,
}

impl StateKey {
    pub fn new(activity_id: impl Into<String>, agent: Value, state_id: impl Into<String>) -> Self {
        Self {
            activity_id: activity_id.into(),
            agent,
            state_id: state_id.into(),
            registration: None,
        }
    }

    pub fn with_registration(mut self, registration: Uuid) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.activity_id.trim().is_empty() {
            return Err(ValidationError::for_field("activityId", "must not be empty"));
        }
        if self.state_id.trim().is_empty() {
            return Err(ValidationError::for_field("stateId", "must not be empty"));
        }
        validate_agent(&self.agent, "agent")
    }

    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("activityId", self.activity_id.clone()),
            ("agent", self.agent.to_string()),
            ("stateId", self.state_id.clone()),
        ];
        if let Some(registration) = self.registration {
            pairs.push(("registration", registration.to_string()));
        }
        pairs
    }
}
