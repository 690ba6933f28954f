//! `telelink-kernel` – Rules & State
//!
//! Pure logic with no I/O. Every outbound command and inbound record passes
//! through here, and every operating-mode change is decided here.
//!
//! # Modules
//!
//! - [`command_schema`] – [`CommandSchema`][command_schema::CommandSchema]:
//!   validation and serialization of every [`OutboundCommand`][telelink_types::OutboundCommand]
//!   and validation of inbound envelopes, telemetry, pose and obstacle
//!   records. Extra deployment rules plug in through
//!   [`CommandRule`][command_schema::CommandRule].
//! - [`state_machine`] – [`OperatingStateMachine`][state_machine::OperatingStateMachine]:
//!   the total transition table over [`OperatingMode`][telelink_types::OperatingMode].
//! - [`navigation_tracker`] – [`NavigationTracker`][navigation_tracker::NavigationTracker]:
//!   pose bookkeeping and arrival detection for an active navigation target.

pub mod command_schema;
pub mod navigation_tracker;
pub mod state_machine;

pub use command_schema::{
    CommandRule, CommandSchema, InboundMessage, NavFrame, SerializedCommand, SpeedCapRule,
    parse_inbound, validate_envelope, validate_inbound_telemetry, validate_nav_frame,
    validate_outbound, validate_pose,
};
pub use navigation_tracker::{ARRIVAL_THRESHOLD, NavigationTracker, PoseOutcome};
pub use state_machine::{OperatingStateMachine, Transition};
