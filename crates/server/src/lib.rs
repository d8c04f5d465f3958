//! HTTP host for tenantry: tenant routing middleware, operation and audit routes,
//! platform health endpoints and application bootstrap.

pub mod bootstrap;
pub mod health;
pub mod middleware;
pub mod routes;
