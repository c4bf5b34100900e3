//! OAuth gating of execution: token checks, consent, and authorization flows.

mod device;
mod gate;

pub use device::{run_device_flow, DeviceFlowError, DeviceFlowResult};
pub use gate::{
    AuthorizationRequest, AuthorizeEndpoint, GateError, GateReport, GateResult, GateState,
    OAuthGate,
};
