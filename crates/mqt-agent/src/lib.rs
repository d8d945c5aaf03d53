//! mqt-agent: Session and routing engine for mqtunnel
//!
//! The agent owns the single broker session and bridges byte streams over
//! broker topics. Inbound publications are routed either to the control
//! protocol handler or to the tunnel registered for their topic; tunnels
//! publish outbound bytes back through the same session.

pub mod adapter;
pub mod broker;
pub mod control;
pub mod orchestrator;
pub mod router;
pub mod tunnel;

pub use adapter::{bridge, BridgeEnd};
pub use broker::{BrokerEvent, ConnectionManager, InboundMessage};
pub use control::{ControlHandler, ControlOutcome, OpenedTunnel};
pub use orchestrator::{SessionEvent, SessionOrchestrator};
pub use router::{Dispatch, OpenOutcome, RouterSettings, TopicRouter};
pub use tunnel::{Delivery, Tunnel, TunnelHandle, TunnelSpec, TunnelStatus};
