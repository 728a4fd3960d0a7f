pub mod argocd;
pub mod bundle;
pub mod config;
pub mod git;
pub mod manifests;
pub mod profile;
pub mod reconcile;
pub mod repoctx;
pub mod store;
pub mod template;
pub mod types;
