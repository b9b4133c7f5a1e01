//! Service layer: port arbitration, process supervision, test execution,
//! and the file-backed case/result adapters

pub mod case_source;
pub mod executor;
pub mod launchers;
pub mod port_allocator;
pub mod results_sink;
pub mod supervisor;

pub use case_source::JsonCaseSource;
pub use executor::TestExecutor;
pub use launchers::{FastChatLauncher, MockStackLauncher};
pub use port_allocator::{PortAllocator, PortOwner};
pub use results_sink::JsonResultsSink;
pub use supervisor::StackSupervisor;
