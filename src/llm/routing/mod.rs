//! Request classification and model selection.
//!
//! # Architecture
//!
//! ```text
//! Prompt
//!    │
//!    ▼
//! ┌──────────────────┐
//! │    Gatekeeper    │  ← length, keywords, domain terms (+ optional scorer)
//! └────────┬─────────┘
//!          │ RoutingContext
//!          ▼
//! ┌──────────────────┐
//! │   Policy Store   │  ← first matching policy wins
//! └────────┬─────────┘
//!          │ tier (economy downgrade applied)
//!          ▼
//! ┌──────────────────┐
//! │      Router      │  ← specialized → generic → fallback
//! └────────┬─────────┘
//!          │
//!          ▼
//!    Candidate chain
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use arbitrage::llm::routing::{BudgetState, Gatekeeper, GatekeeperConfig, Router};
//!
//! let gatekeeper = Gatekeeper::new(&GatekeeperConfig::default())?;
//! let context = gatekeeper.classify("Hi, are you there?");
//! let decision = router.select(&context, BudgetState::full())?;
//!
//! println!("Tier: {}", decision.tier);
//! println!("Candidates: {:?}", decision.model_ids());
//! ```

pub mod condition;
mod gatekeeper;
mod policy;
mod router;

pub use condition::{Condition, PolicyInput};
pub use gatekeeper::{
    ComplexityScorer, DomainRule, Gatekeeper, GatekeeperConfig, HeuristicScore, RoutingContext,
};
pub use policy::{PolicyConfig, PolicyStore, RoutingPolicy, default_policies};
pub use router::{BudgetState, Router, RouterConfig, RoutingDecision, SpecializedTieBreak};
