//! Connection routing: access strategy resolution and the connect façade.

mod resolver;
mod router;

pub use resolver::{AccessResolver, ConnectionPlan, ResolverSettings, RouteError};
pub use router::{Connection, ConnectionRouter, RouterSettings};
