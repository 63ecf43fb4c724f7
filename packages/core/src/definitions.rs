use crate::submodule;

submodule!(admin);
submodule!(capabilities);
submodule!(frame_type);
submodule!(function_type);
submodule!(node_id);
submodule!(protocol_info);
submodule!(transmit);
