pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use echo::EchoWorker;
pub use executor::{CallOutcome, DispatchError, TaskDispatcher, WorkerCall};
pub use registry::{RegistryError, Worker, WorkerDescriptor, WorkerRegistry};
pub use schema::{schema_title, schema_value};
