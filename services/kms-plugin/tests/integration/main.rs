//! End-to-end tests: real gRPC servers on a unix socket backed by the
//! in-memory vault.

mod deadlines;
mod grpc_flow;
mod health;
mod support;
