//! Core error types for netlab
//!
//! This module contains the main NetlabError enum with all error variants
//! and the associated Result alias.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for every netlab operation
///
/// Variants fall into four groups:
///
/// - **Pre-flight errors**: registry and dependency-graph problems that abort
///   a run before any node unit starts (duplicate kind, unknown kind, cycle).
/// - **Phase errors**: a node hook failed; the node is marked failed and the
///   error is kept in the deployment report.
/// - **Wiring errors**: a link could not be wired; reported per link.
/// - **Ambient errors**: configuration, runtime, IO and serialization failures.
#[derive(Error, Debug)]
pub enum NetlabError {
    // Kind registry
    #[error("node kind {kind:?} already registered")]
    DuplicateKind { kind: String },

    #[error("kind {kind:?} is not supported. Supported kinds are {supported:?}")]
    UnknownKind {
        kind: String,
        supported: Vec<String>,
    },

    // Dependency graph
    #[error("dependency cycle detected between nodes {nodes:?}")]
    CycleDetected { nodes: Vec<String> },

    #[error("node {node:?} waits for unknown node {target:?}")]
    UnknownWaitForTarget { node: String, target: String },

    #[error("unknown stage {stage:?}, expected one of create, create-links, configure, healthy, exit")]
    UnknownStage { stage: String },

    // Node phases
    #[error("deployment conditions not met for node {node}: {source}")]
    ConditionCheckFailed {
        node: String,
        #[source]
        source: Box<NetlabError>,
    },

    #[error("pre-deploy failed for node {node}: {source}")]
    PreDeploy {
        node: String,
        #[source]
        source: Box<NetlabError>,
    },

    #[error("deploy failed for node {node}: {source}")]
    Deploy {
        node: String,
        #[source]
        source: Box<NetlabError>,
    },

    #[error("post-deploy failed for node {node}: {source}")]
    PostDeploy {
        node: String,
        #[source]
        source: Box<NetlabError>,
    },

    #[error("node {node} did not become ready within {timeout:?}: {last_error}")]
    ReadinessTimeout {
        node: String,
        timeout: Duration,
        last_error: String,
    },

    #[error("node {node} failed in strict mode, run aborted: {source}")]
    StrictAbort {
        node: String,
        #[source]
        source: Arc<NetlabError>,
    },

    // Link wiring
    #[error("network namespace {path} of node {node} no longer exists")]
    NamespaceGone { node: String, path: String },

    #[error("wiring link {link} failed (errno {errno}): {source}")]
    Wiring {
        link: String,
        errno: i32,
        #[source]
        source: Box<NetlabError>,
    },

    #[error("link {link} has already been wired")]
    AlreadyWired { link: String },

    #[error("node {node}: interface name {interface:?} is invalid: {reason}")]
    InterfaceNameInvalid {
        node: String,
        interface: String,
        reason: String,
    },

    #[error("netlink {operation} failed (errno {errno}): {message}")]
    Netlink {
        operation: String,
        errno: i32,
        message: String,
    },

    // Runtime and exec
    #[error("runtime operation '{operation}' failed: {details}")]
    Runtime { operation: String, details: String },

    #[error("exec of {cmd:?} in {container} returned {return_code}: {stderr}")]
    Exec {
        container: String,
        cmd: String,
        return_code: i32,
        stderr: String,
    },

    #[error("saving configuration of node {node} failed: {message}")]
    SaveConfig { node: String, message: String },

    #[error("template {template} failed to render: {message}")]
    Template { template: String, message: String },

    // Configuration
    #[error("Configuration error in {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("operation '{operation}' was cancelled")]
    Cancelled { operation: String },

    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // Serialization & IO
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for netlab operations
pub type NetlabResult<T> = Result<T, NetlabError>;
