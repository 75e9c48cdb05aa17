//! Core of the DynaKube operator.
//!
//! The [`DynaKube`](crd::DynaKube) custom resource describes how a cluster is monitored by
//! Dynatrace. This crate holds everything the operator and its admission webhook decide on:
//! the tenant API client, the connection-info reconcile, admission validation of DynaKubes and
//! the mutation of workload pods.

pub mod cli;
pub mod connection_info;
pub mod crd;
pub mod dtclient;
pub mod feature_flags;
pub mod logging;
pub mod mutation;
pub mod selector;
pub mod validation;
pub mod validator;
pub mod yaml;

// External re-exports
pub use k8s_openapi;
pub use kube;
