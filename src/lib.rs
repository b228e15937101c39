// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Podlease
//!
//! Lease a disposable `RunPod` GPU pod, tunnel to it, and make sure it is
//! terminated when you are done.
//!
//! ## Overview
//!
//! A `deploy` run is a straight line:
//!
//! 1. **Selection**: fetch offerings and pick the cheapest GPU that meets
//!    the VRAM and cost limits
//! 2. **Provisioning**: create the pod and poll until it exposes SSH
//! 3. **Tunnels**: open one `ssh -L` forward per configured port
//! 4. **Hold**: block until Ctrl+C, SIGTERM, or every tunnel exits
//! 5. **Cleanup**: stop the tunnels, then terminate the pod, exactly once
//!
//! Cleanup runs whatever stage the run stopped at, so an interrupted
//! provisioning step does not leave a billed pod behind.
//!
//! ## Modules
//!
//! - [`config`]: `.env` loading and validation
//! - [`capacity`]: the backend trait the orchestrator talks to
//! - [`runpod`]: `RunPod` REST and GraphQL client
//! - [`selector`]: GPU ranking
//! - [`lifecycle`]: pod state machine and readiness polling
//! - [`tunnel`]: SSH port forwarding
//! - [`cleanup`]: signal handling and single-shot teardown
//! - [`orchestrator`]: the `deploy` and `stop` sequences
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```text
//! $ podlease init --api-key rpa_XXXX
//! $ podlease offerings --spot
//! $ podlease deploy --min-vram 24
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod capacity;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod retry;
pub mod runpod;
pub mod selector;
pub mod tunnel;

// ============================================================================
// Re-exports
// ============================================================================

pub use capacity::{CapacityBackend, GpuOffering, InstanceRequest, InstanceSnapshot, Market};
pub use cleanup::{CleanupCoordinator, CleanupReport, SignalSource};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, Settings};
pub use error::{PodleaseError, Result, Stage, StageError};
pub use lifecycle::{InstanceState, LifecycleManager, PollSettings, TerminationOutcome};
pub use orchestrator::{DeployOutcome, DeployPlan, Orchestrator, ReadyReport, StopReason};
pub use retry::RetryPolicy;
pub use runpod::RunPodClient;
pub use selector::{Candidate, SelectionConstraint};
pub use tunnel::{SshAuth, TunnelManager, TunnelSpec};
