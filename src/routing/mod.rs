pub mod router;

pub use router::{EndpointLease, Router, Selection};
