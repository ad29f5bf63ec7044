pub mod bouncer;
pub mod cache;
pub mod hash;
pub mod naming;
pub mod paths;

pub use bouncer::Bouncer;
pub use cache::TtlCache;
