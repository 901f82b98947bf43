pub mod intersect;
pub mod matcher;
pub mod session;

pub use intersect::{Intersection, IntersectingQuery, SubPattern};
pub use matcher::{is_match, KeyMatcher, MatchKind, MatchRule};
pub use session::{IndexProvider, IndexSession, IndexSessionCache, SessionIndex};
