//! Rule groups and match conditions.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// How results are combined: keywords within a condition, or conditions within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

impl FromStr for Logic {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            _ => Err(RuleError::Unsupported {
                what: "logic".into(),
                value: s.into(),
            }),
        }
    }
}

/// Message attribute a condition reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Subject,
    /// The sender address.
    From,
    To,
    Cc,
    /// The plain-text content.
    Body,
    AttachmentName,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subject => "subject",
            Self::From => "from",
            Self::To => "to",
            Self::Cc => "cc",
            Self::Body => "body",
            Self::AttachmentName => "attachment_name",
        }
    }
}

impl FromStr for Field {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "subject" => Ok(Self::Subject),
            "from" => Ok(Self::From),
            "to" => Ok(Self::To),
            "cc" => Ok(Self::Cc),
            "body" => Ok(Self::Body),
            "attachment_name" => Ok(Self::AttachmentName),
            _ => Err(RuleError::Unsupported {
                what: "field".into(),
                value: s.into(),
            }),
        }
    }
}

/// Keyword comparison. `Equals` and `Regex` are case-sensitive; the rest ignore case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    NotContains,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::Contains => "contains",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::Regex => "regex",
            Self::NotContains => "notContains",
        }
    }
}

impl FromStr for Operator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "equals" => Ok(Self::Equals),
            "contains" => Ok(Self::Contains),
            "startsWith" => Ok(Self::StartsWith),
            "endsWith" => Ok(Self::EndsWith),
            "regex" => Ok(Self::Regex),
            "notContains" => Ok(Self::NotContains),
            _ => Err(RuleError::Unsupported {
                what: "operator".into(),
                value: s.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Active,
    Inactive,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("active") {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

/// One condition of a rule group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCondition {
    pub id: i64,
    pub rule_group_id: i64,
    pub field: Field,
    pub operator: Operator,
    /// Comma-separated; blanks are ignored.
    pub keywords: String,
    pub keyword_logic: Logic,
    pub priority: i32,
    pub status: RuleStatus,
}

impl MatchCondition {
    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    /// Trimmed, non-empty keywords in declaration order.
    pub fn keyword_list(&self) -> Vec<&str> {
        self.keywords
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .collect()
    }
}

/// A named set of conditions bound to one mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleGroup {
    pub id: i64,
    pub name: String,
    pub mailbox_id: i64,
    pub logic: Logic,
    pub priority: i32,
    pub status: RuleStatus,
    #[serde(default)]
    pub conditions: Vec<MatchCondition>,
}

impl RuleGroup {
    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }
}
