//! Rule groups and their evaluation against incoming mail.

pub mod matcher;
pub mod model;

pub use matcher::{ConditionResult, GroupMatch, match_groups};
pub use model::{Field, Logic, MatchCondition, Operator, RuleGroup, RuleStatus};
