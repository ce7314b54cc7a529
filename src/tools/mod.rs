//! Tool adapters: everything an agent can invoke behind one descriptor
//! shape.

pub mod descriptor;
pub mod local;
pub mod sub_instance;

pub use descriptor::{ToolDescriptor, ToolHandler, ToolOutput};
pub use local::{LocalToolRegistry, ToolManifest, load_local_tools};
pub use sub_instance::{SubInstanceArgs, SubInstanceTool, create_sub_instance_tools};
