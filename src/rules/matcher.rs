//! Rule evaluation.
//!
//! Pure functions over an [`EmailMessage`] and its mailbox's rule groups. No
//! I/O, no shared state; regexes are compiled per evaluation.

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::model::{Field, Logic, MatchCondition, Operator, RuleGroup};
use crate::error::RuleError;
use crate::mail::EmailMessage;

/// Outcome of one condition.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionResult {
    pub condition_id: i64,
    pub field: Field,
    pub matched: bool,
    pub matched_keywords: Vec<String>,
    pub reason: String,
}

/// Outcome of one rule group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupMatch {
    pub group_id: i64,
    pub group_name: String,
    pub mailbox_id: i64,
    pub priority: i32,
    pub matched: bool,
    pub matched_count: usize,
    pub total_count: usize,
    pub logic: Logic,
    pub reason: String,
    /// Set when a condition could not be evaluated (e.g. an invalid regex).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub conditions: Vec<ConditionResult>,
}

/// Evaluate every active group, highest priority first (ties by id).
pub fn match_groups(email: &EmailMessage, groups: &[RuleGroup]) -> Vec<GroupMatch> {
    let mut active: Vec<&RuleGroup> = groups.iter().filter(|g| g.is_active()).collect();
    active.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    active.into_iter().map(|g| match_group(email, g)).collect()
}

/// Evaluate one group. A condition error leaves the group unmatched with the error as reason.
pub fn match_group(email: &EmailMessage, group: &RuleGroup) -> GroupMatch {
    let mut result = GroupMatch {
        group_id: group.id,
        group_name: group.name.clone(),
        mailbox_id: group.mailbox_id,
        priority: group.priority,
        matched: false,
        matched_count: 0,
        total_count: 0,
        logic: group.logic,
        reason: String::new(),
        error: None,
        conditions: Vec::new(),
    };

    let conditions: Vec<&MatchCondition> =
        group.conditions.iter().filter(|c| c.is_active()).collect();
    result.total_count = conditions.len();
    if conditions.is_empty() {
        result.reason = "rule group has no active conditions".to_string();
        return result;
    }

    for condition in conditions {
        match match_condition(email, condition) {
            Ok(outcome) => result.conditions.push(outcome),
            Err(e) => {
                debug!(group_id = group.id, condition_id = condition.id, error = %e, "Condition failed");
                result.reason = format!("condition {} failed: {e}", condition.id);
                result.error = Some(e.to_string());
                return result;
            }
        }
    }

    let matched_count = result.conditions.iter().filter(|c| c.matched).count();
    let total = result.total_count;
    result.matched_count = matched_count;
    (result.matched, result.reason) = match group.logic {
        Logic::And if matched_count == total => {
            (true, format!("all {total} conditions matched (and)"))
        }
        Logic::And => (
            false,
            format!("only {matched_count}/{total} conditions matched, and requires all"),
        ),
        Logic::Or if matched_count > 0 => {
            (true, format!("{matched_count}/{total} conditions matched (or)"))
        }
        Logic::Or => (false, "no condition matched".to_string()),
    };
    result
}

/// Evaluate one condition against its field.
pub fn match_condition(
    email: &EmailMessage,
    condition: &MatchCondition,
) -> Result<ConditionResult, RuleError> {
    let mut result = ConditionResult {
        condition_id: condition.id,
        field: condition.field,
        matched: false,
        matched_keywords: Vec::new(),
        reason: String::new(),
    };

    let Some(content) = field_value(email, condition.field) else {
        result.reason = format!("field {} is empty", condition.field.as_str());
        return Ok(result);
    };

    let keywords = condition.keyword_list();
    if keywords.is_empty() {
        result.reason = "no keywords".to_string();
        return Ok(result);
    }

    for keyword in &keywords {
        if match_keyword(&content, keyword, condition.operator)? {
            result.matched_keywords.push((*keyword).to_string());
        }
    }

    let hits = result.matched_keywords.join(", ");
    (result.matched, result.reason) = match condition.keyword_logic {
        Logic::And if result.matched_keywords.len() == keywords.len() => {
            (true, format!("all keywords matched: [{hits}]"))
        }
        Logic::And => (
            false,
            format!("only some keywords matched: [{hits}], and requires all"),
        ),
        Logic::Or if !result.matched_keywords.is_empty() => {
            (true, format!("matched keywords: [{hits}]"))
        }
        Logic::Or => (false, "no keyword matched".to_string()),
    };
    Ok(result)
}

/// Compare one keyword against field content.
pub fn match_keyword(content: &str, keyword: &str, operator: Operator) -> Result<bool, RuleError> {
    let lower = || (content.to_lowercase(), keyword.to_lowercase());
    Ok(match operator {
        Operator::Equals => content == keyword,
        Operator::Contains => {
            let (c, k) = lower();
            c.contains(&k)
        }
        Operator::StartsWith => {
            let (c, k) = lower();
            c.starts_with(&k)
        }
        Operator::EndsWith => {
            let (c, k) = lower();
            c.ends_with(&k)
        }
        Operator::NotContains => {
            let (c, k) = lower();
            !c.contains(&k)
        }
        Operator::Regex => {
            let re = Regex::new(keyword).map_err(|e| RuleError::InvalidRegex {
                pattern: keyword.to_string(),
                reason: e.to_string(),
            })?;
            re.is_match(content)
        }
    })
}

/// Field content used for matching. Multi-value fields join with ", " and are
/// `None` when empty.
pub fn field_value(email: &EmailMessage, field: Field) -> Option<String> {
    let joined = |values: &[String]| (!values.is_empty()).then(|| values.join(", "));
    match field {
        Field::Subject => Some(email.subject.clone()),
        Field::From => Some(email.sender.clone()),
        Field::Body => Some(email.content.clone()),
        Field::To => joined(&email.to),
        Field::Cc => joined(&email.cc),
        Field::AttachmentName => joined(&email.attachment_names),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::RuleStatus;

    fn email() -> EmailMessage {
        EmailMessage {
            uid: 1,
            subject: "System Error detected".into(),
            sender: "other@y.com".into(),
            to: vec!["ops@x.com".into(), "dev@x.com".into()],
            content: "disk usage at 97%".into(),
            ..Default::default()
        }
    }

    fn cond(id: i64, field: Field, operator: Operator, keywords: &str, logic: Logic) -> MatchCondition {
        MatchCondition {
            id,
            rule_group_id: 1,
            field,
            operator,
            keywords: keywords.into(),
            keyword_logic: logic,
            priority: 0,
            status: RuleStatus::Active,
        }
    }

    fn group(id: i64, logic: Logic, priority: i32, conditions: Vec<MatchCondition>) -> RuleGroup {
        RuleGroup {
            id,
            name: format!("g{id}"),
            mailbox_id: 1,
            logic,
            priority,
            status: RuleStatus::Active,
            conditions,
        }
    }

    #[test]
    fn case_sensitivity_per_operator() {
        assert!(match_keyword("System ERROR", "error", Operator::Contains).unwrap());
        assert!(match_keyword("System ERROR", "system", Operator::StartsWith).unwrap());
        assert!(match_keyword("System ERROR", "Error", Operator::EndsWith).unwrap());
        assert!(!match_keyword("System ERROR", "error", Operator::NotContains).unwrap());
        assert!(!match_keyword("Alert", "alert", Operator::Equals).unwrap());
        assert!(match_keyword("Alert", "Alert", Operator::Equals).unwrap());
        assert!(!match_keyword("Alert", "^alert$", Operator::Regex).unwrap());
        assert!(match_keyword("Alert 42", r"^Alert \d+$", Operator::Regex).unwrap());
    }

    #[test]
    fn invalid_regex_is_an_error() {
        let err = match_keyword("x", "(unclosed", Operator::Regex).unwrap_err();
        assert!(matches!(err, RuleError::InvalidRegex { .. }));
    }

    #[test]
    fn keyword_logic_and_or() {
        let e = email();
        let and = cond(1, Field::Subject, Operator::Contains, "error,system", Logic::And);
        assert!(match_condition(&e, &and).unwrap().matched);

        let and_partial = cond(2, Field::Subject, Operator::Contains, "error,timeout", Logic::And);
        let r = match_condition(&e, &and_partial).unwrap();
        assert!(!r.matched);
        assert_eq!(r.matched_keywords, vec!["error"]);

        let or = cond(3, Field::Subject, Operator::Contains, "timeout, error", Logic::Or);
        assert!(match_condition(&e, &or).unwrap().matched);

        let or_none = cond(4, Field::Subject, Operator::Contains, "timeout,oom", Logic::Or);
        assert!(!match_condition(&e, &or_none).unwrap().matched);
    }

    #[test]
    fn blank_keywords_never_match() {
        let c = cond(1, Field::Subject, Operator::NotContains, " , ,", Logic::Or);
        let r = match_condition(&email(), &c).unwrap();
        assert!(!r.matched);
        assert_eq!(r.reason, "no keywords");
    }

    #[test]
    fn multi_value_fields_join_and_empty_never_match() {
        let e = email();
        assert_eq!(field_value(&e, Field::To).as_deref(), Some("ops@x.com, dev@x.com"));
        assert_eq!(field_value(&e, Field::Cc), None);

        let c = cond(1, Field::Cc, Operator::NotContains, "boss", Logic::Or);
        assert!(!match_condition(&e, &c).unwrap().matched);

        let to = cond(2, Field::To, Operator::Contains, "dev@", Logic::Or);
        assert!(match_condition(&e, &to).unwrap().matched);
    }

    #[test]
    fn group_logic_and_or_and_empty() {
        let e = email();
        let hit = || cond(1, Field::Subject, Operator::Contains, "error", Logic::Or);
        let miss = || cond(2, Field::From, Operator::Equals, "alerts@x.com", Logic::Or);

        let and = match_group(&e, &group(1, Logic::And, 0, vec![hit(), miss()]));
        assert!(!and.matched);
        assert_eq!((and.matched_count, and.total_count), (1, 2));

        let or = match_group(&e, &group(2, Logic::Or, 0, vec![hit(), miss()]));
        assert!(or.matched);

        let and_all = match_group(&e, &group(3, Logic::And, 0, vec![hit()]));
        assert!(and_all.matched);

        let empty = match_group(&e, &group(4, Logic::Or, 0, vec![]));
        assert!(!empty.matched);
        assert_eq!(empty.total_count, 0);
    }

    #[test]
    fn inactive_conditions_are_ignored() {
        let mut miss = cond(2, Field::From, Operator::Equals, "alerts@x.com", Logic::Or);
        miss.status = RuleStatus::Inactive;
        let hit = cond(1, Field::Subject, Operator::Contains, "error", Logic::Or);

        let r = match_group(&email(), &group(1, Logic::And, 0, vec![hit, miss]));
        assert!(r.matched);
        assert_eq!(r.total_count, 1);

        let mut only_inactive = cond(3, Field::Subject, Operator::Contains, "error", Logic::Or);
        only_inactive.status = RuleStatus::Inactive;
        assert!(!match_group(&email(), &group(2, Logic::Or, 0, vec![only_inactive])).matched);
    }

    #[test]
    fn condition_error_fails_group() {
        let bad = cond(7, Field::Body, Operator::Regex, "([", Logic::Or);
        let hit = cond(1, Field::Subject, Operator::Contains, "error", Logic::Or);
        let r = match_group(&email(), &group(1, Logic::Or, 0, vec![hit, bad]));
        assert!(!r.matched);
        assert!(r.reason.starts_with("condition 7 failed"));
    }

    #[test]
    fn groups_ordered_by_priority_and_inactive_skipped() {
        let hit = || cond(1, Field::Subject, Operator::Contains, "error", Logic::Or);
        let mut inactive = group(4, Logic::Or, 100, vec![hit()]);
        inactive.status = RuleStatus::Inactive;
        let groups = vec![
            group(3, Logic::Or, 1, vec![hit()]),
            group(2, Logic::Or, 5, vec![hit()]),
            group(1, Logic::Or, 1, vec![hit()]),
            inactive,
        ];
        let ids: Vec<i64> = match_groups(&email(), &groups)
            .iter()
            .map(|m| m.group_id)
            .collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn or_scenario_matches_on_subject_alone() {
        let g = group(
            1,
            Logic::Or,
            0,
            vec![
                cond(1, Field::Subject, Operator::Contains, "error", Logic::Or),
                cond(2, Field::From, Operator::Equals, "alerts@x.com", Logic::Or),
            ],
        );
        let e = EmailMessage {
            subject: "system error detected".into(),
            sender: "other@y.com".into(),
            ..Default::default()
        };
        let results = match_groups(&e, &[g]);
        assert_eq!(results.len(), 1);
        assert!(results[0].matched);
        assert_eq!(results[0].matched_count, 1);
    }
}
