//! Deterministic question parsing: column resolution, conditions,
//! aggregations and the financial idioms that run ahead of them.

pub mod aggregation_planner;
pub mod column_resolver;
pub mod condition_parser;
pub mod special_cases;

pub use aggregation_planner::{clamp_limit, AggregationPlan, AggregationPlanner};
pub use column_resolver::{
    ColumnMatch, ColumnResolver, MatchMethod, Resolution, UnresolvedPhrase, ValueMention,
};
pub use condition_parser::{ConditionParser, ParsedConditions};
pub use special_cases::{match_special_cases, IdiomContext, IdiomMatch};
