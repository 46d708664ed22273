//! 认知层：Planner（决策）、Critic 与 Review 路由、过程事件

pub mod critic;
pub mod events;
pub mod planner;
pub mod router;

pub use critic::Critic;
pub use events::WorkflowEvent;
pub use planner::{parse_decision, Planner, PlannerOutput, SupervisorDecision};
pub use router::{
    GenerativeClassifier, OutcomeClassifier, ReviewVerdict, Route, RouteClassifier, RouteDecision,
};
