pub mod builder;
pub mod toolset;

pub use builder::{
    build_set_auth_tool, build_tools, detect_auth, sanitize_tool_name, Endpoint, ParamIn,
    ParamInfo,
};
pub use toolset::{ToolSet, ToolSetError, TOOLSET_VERSION};
