//! Rich diagnostic error types for the vendorfx engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so users know what went wrong and what
//! to do next (usually: learn the toggle, or re-run elevated).

use miette::Diagnostic;
use thiserror::Error;

use crate::config::ConfigError;
use crate::paths::PathError;
use crate::store::Scope;

/// Top-level error type for the vendorfx engine.
#[derive(Debug, Error, Diagnostic)]
pub enum FxError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    RuleFile(#[from] RuleFileError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Toggle(#[from] ToggleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Learn(#[from] LearnError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] PathError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors raised by persistent store adapters.
///
/// These never leave the engine API: the applier and learner convert them
/// into [`ToggleError`] / [`LearnError`] outcomes at the adapter boundary.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("write to {scope} section \"{location}\" was denied")]
    #[diagnostic(
        code(vendorfx::store::permission_denied),
        help("The machine scope usually requires an elevated (administrator) process.")
    )]
    PermissionDenied { scope: Scope, location: String },

    #[error("{scope} section \"{location}\" does not exist for this endpoint")]
    #[diagnostic(
        code(vendorfx::store::section_missing),
        help(
            "The engine only writes into sections the driver already created. \
             Toggle the feature once in the OS settings so the driver creates them."
        )
    )]
    SectionMissing { scope: Scope, location: String },

    #[error("store I/O error: {path}")]
    #[diagnostic(
        code(vendorfx::store::io),
        help("Check that the store file exists and is readable and writable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store document is invalid: {path}: {message}")]
    #[diagnostic(
        code(vendorfx::store::parse),
        help("The store file must be a JSON document written by vendorfx.")
    )]
    Parse { path: String, message: String },
}

// ---------------------------------------------------------------------------
// Rule file errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RuleFileError {
    #[error("failed to read rule file: {path}")]
    #[diagnostic(
        code(vendorfx::rules::read),
        help("Ensure the rule file is readable, or remove it to start with an empty database.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write rule file: {path}")]
    #[diagnostic(
        code(vendorfx::rules::write),
        help(
            "Ensure the directory is writable. Rule files next to a system-wide install \
             may need --rules pointing at a per-user location."
        )
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A single section could not be interpreted. Loading never fails with
    /// this; the section is skipped, logged, and preserved verbatim on save.
    #[error("malformed rule [{section}]: {message}")]
    #[diagnostic(
        code(vendorfx::rules::malformed),
        help("Fix or remove the section by hand; other rules keep working meanwhile.")
    )]
    MalformedRule { section: String, message: String },
}

// ---------------------------------------------------------------------------
// Toggle errors (matching, reading, applying)
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ToggleError {
    #[error("not an endpoint handle: \"{handle}\"")]
    #[diagnostic(
        code(vendorfx::toggle::invalid_endpoint),
        help("Pass a full endpoint id ending in \".{{guid}}\" or the bare \"{{guid}}\".")
    )]
    InvalidEndpoint { handle: String },

    #[error("no {kind} rule matches endpoint {endpoint}")]
    #[diagnostic(
        code(vendorfx::toggle::no_matching_rule),
        help("This endpoint is unsupported until the toggle is learned: run `vendorfx learn`.")
    )]
    NoMatchingRule { endpoint: String, kind: String },

    #[error("every scope refused the write for rule [{rule}] ({scopes})")]
    #[diagnostic(
        code(vendorfx::toggle::permission_denied),
        help("Re-run from an elevated prompt, or reorder the rule's hives to prefer HKCU.")
    )]
    WritePermissionDenied { rule: String, scopes: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    RuleFile(#[from] RuleFileError),
}

// ---------------------------------------------------------------------------
// Learning errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum LearnError {
    #[error("no stable record flipped for endpoint {endpoint}")]
    #[diagnostic(
        code(vendorfx::learn::no_stable_candidate),
        help(
            "Repeat the capture and toggle only the requested control, waiting a moment \
             before each capture. Some drivers store the setting outside the endpoint."
        )
    )]
    LearningNoStableCandidate { endpoint: String },

    #[error("{count} different records flipped while learning the main switch: {records}")]
    #[diagnostic(
        code(vendorfx::learn::ambiguous_main),
        help(
            "Something else changed during capture. Close other audio tools and retry, \
             or learn it as a named effect with --fx to keep every record."
        )
    )]
    AmbiguousMainSwitch { count: usize, records: String },

    #[error("learning aborted before {phase}")]
    #[diagnostic(
        code(vendorfx::learn::aborted),
        help("No rule was written. Start the learn again when ready.")
    )]
    Aborted { phase: String },

    #[error("learn session is in phase {actual}, expected {expected}")]
    #[diagnostic(
        code(vendorfx::learn::out_of_order),
        help("Capture steps must run in order: A1, B1, A2, B2.")
    )]
    OutOfOrder { expected: String, actual: String },

    #[error("learn session state is invalid: {message}")]
    #[diagnostic(
        code(vendorfx::learn::session),
        help("Discard the saved session file and start a new learn.")
    )]
    Session { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    RuleFile(#[from] RuleFileError),
}

/// Convenience alias for functions returning vendorfx results.
pub type FxResult<T> = std::result::Result<T, FxError>;
