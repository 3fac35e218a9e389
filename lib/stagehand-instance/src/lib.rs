//! Supervision of isolated service instances for integration testing.
//!
//! An [`Instance`] owns one copy of the service under test: a private state directory holding its configuration, logs,
//! and transport endpoints, and, once started, the service process itself. Starting an instance blocks until the
//! service answers on its control channel, and the process is guaranteed to be stopped when the `Instance` is dropped.
//!
//! Running instances can be suspended and resumed, with each transition confirmed by observing the scheduling state
//! of the process, which makes it possible to exercise client behavior against an unresponsive service.
#![deny(warnings)]
#![deny(missing_docs)]

mod control;
pub use self::control::{ControlChannel, ControlError, JsonControlChannel, TransportAddress};

mod error;
pub use self::error::{InstanceError, Phase};

mod instance;
pub use self::instance::{CommandOutput, Instance};

mod layout;
pub use self::layout::{named_pipe_for, InstanceLayout, LayoutStrategy};

mod options;
pub use self::options::InstanceOptions;

pub mod poll;

mod readiness;
pub use self::readiness::ReadinessProbe;

mod service_config;
pub use self::service_config::ServiceConfig;

mod shared;
pub use self::shared::SharedInstance;

mod suspend;
pub use self::suspend::SuspendController;

pub use process_control::{Pid, SchedulingState};
