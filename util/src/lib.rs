//! Operator tooling around the service-graph format.
