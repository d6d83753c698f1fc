//! SOW Review
//!
//! Draft model and the deterministic grounding & policy validator.
//!
//! - [`Draft`] / [`DraftSection`]: section text with per-paragraph clause and
//!   intake-fact mappings
//! - [`ReviewPolicy`]: forbidden terms, absolute-obligation markers, tracked
//!   figures and risk terms
//! - [`GroundingValidator`]: emits [`Finding`]s; never rewrites

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod draft;
mod finding;
mod policy;
mod validator;

pub use draft::{Draft, DraftParagraph, DraftSection, DraftStatus};
pub use finding::{sort_findings, Finding, FindingCategory, Location, Severity};
pub use policy::{NumericKey, ReviewPolicy, RiskTerm};
pub use validator::{GroundingValidator, ReviewError, ReviewInput, SectionContext};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
