pub mod config;
pub mod gateway;
pub mod inference;
pub mod messages;
pub mod session;
mod server;
mod socket;
pub mod store;

pub use config::*;
pub use gateway::{ArtifactAddress, ArtifactGateway, ForwardedHeaders, GatewayError, UpstreamReply};
pub use inference::*;
pub use server::{ApiState, ServerError, build_api_router, build_app_router, serve};
pub use session::{SessionCoordinator, SessionError, SessionOutcome, SessionState, progress_percent};
pub use store::*;
