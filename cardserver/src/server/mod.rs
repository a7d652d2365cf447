//! Card server front, worker and transports.

pub mod active_stream;
pub mod extensions;
pub mod guide;
pub mod host;
pub mod implementation;
pub mod in_memory;
pub mod remote;
pub mod scan;
pub mod session;

pub use crate::pipeline::PipelineExtension;
pub use extensions::{ActionContext, CustomAction, ExtensionFactory, ExtensionRegistry, IdleHook};
pub use host::serve;
pub use implementation::{AsyncHandle, Completion, FromResponse, Outcome, ServerBackend, ServerImplementation};
pub use in_memory::InMemoryCardServer;
pub use remote::OutOfProcessCardServer;
