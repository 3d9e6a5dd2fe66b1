//! Courier agent runtime.
//!
//! An [`Agent`] binds to transports, resolves destination addresses and runs
//! every inbound message through a middleware chain. The request/reply,
//! RPC and pattern layers are modules installed into that chain.

pub mod agent;
pub mod config;
pub mod correlation;
pub mod local;
pub mod middleware;
pub mod module;
pub mod pattern;
pub mod registry;
pub mod request;
pub mod rpc;

pub use agent::{Agent, MethodFn};
pub use config::load_config;
pub use local::{LocalConnection, LocalTransport, LOCAL_TRANSPORT};
pub use middleware::{Layer, Middleware, Next, ReceiveHandler};
pub use module::{Module, ModuleRegistry};
pub use pattern::{Pattern, PatternCallback, PatternLayer, PatternOptions};
pub use registry::{TransportFactory, TransportRegistry};
pub use request::{RequestLayer, RequestOptions};
pub use rpc::{RpcFunctions, RpcLayer, RpcOptions};
